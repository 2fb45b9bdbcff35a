//! The outgoing ingestion supervisor.
//!
//! Every feed gets its own task performing endless full rebuilds: delete
//! abandoned indices, create a fresh one, walk the feed's pages into it,
//! refresh, swap the alias, mark the feed healthy, sleep, start over.
//! Tasks that fail are restarted after a fixed interval; tasks that
//! finish cleanly are also restarted, loudly, because none of them is
//! supposed to finish. Indices belonging to feeds that are no longer
//! configured are deleted when the supervisor starts.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::elasticsearch::{
    indexes_matching_feeds, indexes_matching_no_feeds, new_index_name, EsClient,
};
use crate::feeds::Feed;
use crate::kv::KvStore;
use crate::metrics::Metrics;

pub const EXCEPTION_INTERVAL: Duration = Duration::from_secs(60);

/// Extra seconds of validity on a feed's GREEN flag beyond its idle gap,
/// so a healthy feed does not flicker RED between rebuild cycles.
const FEED_STATUS_SLACK_SECONDS: u64 = 120;

/// Everything the outgoing side needs, created once at startup.
pub struct IngestContext {
    pub es: EsClient,
    pub kv: KvStore,
    pub http: reqwest::Client,
    pub feeds: Vec<Feed>,
    pub metrics: Metrics,
}

/// Run a task forever. Errors are logged and reported, clean completions
/// are logged as anomalous, and either way the task is restarted after
/// the given interval. Cancellation (dropping this future at shutdown)
/// is the only way out.
pub async fn repeat_until_cancelled<F, Fut>(title: &'static str, interval: Duration, task: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        match task().await {
            Ok(()) => warn!(
                task = title,
                "finished without error; this is not expected, it should run forever"
            ),
            Err(error) => {
                error!(task = title, error = format!("{:#}", error), "task failed");
                sentry::integrations::anyhow::capture_anyhow(&error);
            }
        }
        warn!(
            task = title,
            seconds = interval.as_secs(),
            "waiting before restarting"
        );
        tokio::time::sleep(interval).await;
    }
}

/// One supervisor pass: garbage-collect indices of unconfigured feeds,
/// then run every per-feed ingester concurrently. The per-feed tasks run
/// forever, each under its own restart wrapper.
pub async fn ingest_feeds(ctx: Arc<IngestContext>) -> Result<()> {
    let feed_ids: Vec<String> = ctx
        .feeds
        .iter()
        .map(|feed| feed.unique_id().to_string())
        .collect();

    let (without_alias, with_alias) = ctx.es.get_old_index_names().await?;
    let mut all_names = without_alias;
    all_names.extend(with_alias);
    let to_delete = indexes_matching_no_feeds(&all_names, &feed_ids);
    if !to_delete.is_empty() {
        info!(indexes = ?to_delete, "deleting indexes of unconfigured feeds");
        ctx.es.delete_indexes(&to_delete).await?;
    }

    let mut tasks = JoinSet::new();
    for feed in ctx.feeds.clone() {
        let ctx = ctx.clone();
        tasks.spawn(repeat_until_cancelled("polling feed", EXCEPTION_INTERVAL, move || {
            ingest_feed(ctx.clone(), feed.clone())
        }));
    }
    while let Some(joined) = tasks.join_next().await {
        joined.context("feed ingestion task panicked")?;
    }
    bail!("all feed ingestion tasks stopped")
}

/// Endless full rebuilds of one feed, separated by its seed interval.
async fn ingest_feed(ctx: Arc<IngestContext>, feed: Feed) -> Result<()> {
    loop {
        let started = Instant::now();
        full_ingest(&ctx, &feed).await?;
        ctx.metrics.set_gauge(
            "ingest_feed_duration_seconds",
            &[("feed", feed.unique_id())],
            started.elapsed().as_secs_f64(),
        );
        tokio::time::sleep(feed.polling_seed_interval()).await;
    }
}

/// One full rebuild. Reads keep hitting the previous aliased index until
/// the atomic swap at the end.
async fn full_ingest(ctx: &IngestContext, feed: &Feed) -> Result<()> {
    let feed_id = feed.unique_id();
    debug!(feed = feed_id, "full ingest...");

    let (without_alias, _) = ctx.es.get_old_index_names().await?;
    let abandoned = indexes_matching_feeds(&without_alias, &[feed_id.to_string()]);
    if !abandoned.is_empty() {
        debug!(feed = feed_id, indexes = ?abandoned, "deleting abandoned indexes");
        ctx.es.delete_indexes(&abandoned).await?;
    }

    let index_name = new_index_name(feed_id);
    debug!(feed = feed_id, index = index_name.as_str(), "creating index");
    ctx.es.create_index(&index_name).await?;
    ctx.es.create_mapping(&index_name).await?;

    let mut href = Some(feed.seed().to_string());
    while let Some(url) = href {
        debug!(feed = feed_id, url = url.as_str(), "polling");
        let page = fetch_page(&ctx.http, feed, &url).await?;
        let items = feed.convert_to_bulk(&page, &index_name)?;
        debug!(feed = feed_id, items = items.len(), "ingesting into elasticsearch");
        ctx.metrics.inc_counter(
            "ingest_activities_nonunique_total",
            &[("feed", feed_id)],
            items.len() as u64,
        );
        ctx.es.bulk(&items).await?;

        href = feed.next_href(&page);
        if href.is_some() {
            debug!(feed = feed_id, "will poll next page in feed");
            tokio::time::sleep(feed.polling_page_interval()).await;
        }
    }

    debug!(feed = feed_id, index = index_name.as_str(), "refreshing index");
    ctx.es.refresh(&index_name).await?;
    debug!(feed = feed_id, index = index_name.as_str(), "changing alias");
    ctx.es
        .add_remove_aliases_atomically(&index_name, feed_id)
        .await?;

    let status_ttl = feed.polling_seed_interval().as_secs() + FEED_STATUS_SLACK_SECONDS;
    ctx.kv.mark_feed_green(feed_id, status_ttl).await?;

    debug!(feed = feed_id, "full ingest: done");
    Ok(())
}

/// Fetch and parse one page of a feed with the feed's own auth. Anything
/// other than a 200 raises, which fails the cycle and leaves the restart
/// wrapper to retry with a fresh index.
pub async fn fetch_page(http: &reqwest::Client, feed: &Feed, url: &str) -> Result<Value> {
    let mut request = http.get(url);
    for (name, value) in feed.auth_headers(url)? {
        request = request.header(&name, &value);
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("fetching feed page {} failed", url))?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let text = response.text().await.unwrap_or_default();
        bail!("feed page {} returned {}: {}", url, status, text);
    }
    response
        .json()
        .await
        .with_context(|| format!("feed page {} is not valid JSON", url))
}
