//! The metrics registry and the Elasticsearch metrics poller.
//!
//! The registry is a small labelled gauge/counter store rendered as
//! Prometheus-style text. The poller queries the search backend once a
//! second, updates the gauges, and writes the rendered payload into the
//! KV store, where the `/metrics` endpoint serves it from; the two halves
//! never talk to each other directly.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use crate::ingest::IngestContext;

pub const METRICS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<Mutex<MetricsInner>>,
}

#[derive(Default)]
struct MetricsInner {
    gauges: BTreeMap<String, BTreeMap<String, f64>>,
    counters: BTreeMap<String, BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner
            .gauges
            .entry(name.to_string())
            .or_default()
            .insert(label_string(labels), value);
    }

    pub fn inc_counter(&self, name: &str, labels: &[(&str, &str)], by: u64) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        *inner
            .counters
            .entry(name.to_string())
            .or_default()
            .entry(label_string(labels))
            .or_insert(0) += by;
    }

    /// Render every series as `name{labels} value` lines with TYPE
    /// comments, in stable order.
    pub fn render(&self) -> Vec<u8> {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let mut out = String::new();
        for (name, series) in &inner.counters {
            out.push_str(&format!("# TYPE {} counter\n", name));
            for (labels, value) in series {
                out.push_str(&format!("{}{} {}\n", name, labels, value));
            }
        }
        for (name, series) in &inner.gauges {
            out.push_str(&format!("# TYPE {} gauge\n", name));
            for (labels, value) in series {
                out.push_str(&format!("{}{} {}\n", name, labels, value));
            }
        }
        out.into_bytes()
    }
}

fn label_string(labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let rendered: Vec<String> = labels
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", key, value))
        .collect();
    format!("{{{}}}", rendered.join(","))
}

/// One pass of the poller, run forever under the restart wrapper. The
/// searchable total is required; the remaining gauges are each skipped
/// when the backend cannot answer for them.
pub async fn poll_metrics(ctx: Arc<IngestContext>) -> Result<()> {
    loop {
        debug!("polling metrics...");
        let searchable = ctx.es.searchable_total().await?;
        ctx.metrics.set_gauge(
            "elasticsearch_activities_total",
            &[("status", "searchable")],
            searchable,
        );

        if let Ok(nonsearchable) = ctx.es.nonsearchable_total().await {
            ctx.metrics.set_gauge(
                "elasticsearch_activities_total",
                &[("status", "nonsearchable")],
                nonsearchable,
            );
        }

        if let Ok(age) = ctx.es.min_verification_age().await {
            ctx.metrics.set_gauge(
                "elasticsearch_activities_age_minimum_seconds",
                &[("status", "verification")],
                age,
            );
        }

        for feed in &ctx.feeds {
            let feed_id = feed.unique_id();
            if let Ok((searchable, nonsearchable)) = ctx.es.feed_activities_total(feed_id).await {
                ctx.metrics.set_gauge(
                    "elasticsearch_feed_activities_total",
                    &[("feed", feed_id), ("status", "searchable")],
                    searchable,
                );
                ctx.metrics.set_gauge(
                    "elasticsearch_feed_activities_total",
                    &[("feed", feed_id), ("status", "nonsearchable")],
                    nonsearchable,
                );
            }
        }

        debug!("polling metrics: done, saving to redis");
        ctx.kv.cache_metrics(&ctx.metrics.render()).await?;

        tokio::time::sleep(METRICS_INTERVAL).await;
    }
}
