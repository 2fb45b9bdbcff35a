//! The signed Elasticsearch client.
//!
//! Every request is signed with AWS SigV4. Index lifecycle follows the
//! full-rebuild protocol: a fresh index per ingest cycle, bulk upload,
//! refresh, then one atomic alias update that moves the `activities`
//! alias from the previous generation to the new one. Readers only ever
//! change generation at that swap.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use rand::Rng;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::signing::{self, AwsCredentials};

/// The alias read queries go through.
pub const ALIAS: &str = "activities";

pub const SEARCH_PATH: &str = "/activities/_search";
pub const SCROLL_PATH: &str = "/_search/scroll";
pub const SCROLL_KEEPALIVE: &str = "15s";

/// TTL on the public-to-private scroll id mapping.
pub const PAGINATION_EXPIRE: u64 = 10;

/// Signalled when a metrics query cannot be answered, so the poller can
/// skip the specific gauge instead of crashing.
#[derive(Debug, Error)]
#[error("elasticsearch metrics unavailable")]
pub struct MetricsUnavailable;

#[derive(Debug, Clone)]
pub struct EsEndpoint {
    pub protocol: String,
    pub host: String,
    pub port: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_key: String,
}

impl EsEndpoint {
    pub fn from_config(config: &common::EsConfig) -> Self {
        Self {
            protocol: config.protocol.clone(),
            host: config.host.clone(),
            port: config.port.clone(),
            region: config.region.clone(),
            access_key_id: config.aws_access_key_id.clone(),
            secret_key: config.aws_secret_access_key.clone(),
        }
    }

    fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    /// The value the Host header will carry, which is what must be signed.
    fn signing_host(&self) -> String {
        match (self.protocol.as_str(), self.port.as_str()) {
            ("http", "80") | ("https", "443") => self.host.clone(),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    fn credentials(&self) -> AwsCredentials {
        AwsCredentials {
            access_key_id: self.access_key_id.clone(),
            secret_key: self.secret_key.clone(),
            region: self.region.clone(),
        }
    }
}

#[derive(Clone)]
pub struct EsClient {
    http: reqwest::Client,
    endpoint: EsEndpoint,
}

impl EsClient {
    pub fn new(http: reqwest::Client, endpoint: EsEndpoint) -> Self {
        Self { http, endpoint }
    }

    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<reqwest::Response> {
        let headers = signing::aws_sigv4_headers(
            &self.endpoint.credentials(),
            method.as_str(),
            &self.endpoint.signing_host(),
            path,
            &signing::canonical_query_string(query),
            content_type,
            &body,
            Utc::now(),
        );

        let mut url = format!("{}{}", self.endpoint.base_url(), path);
        if !query.is_empty() {
            let encoded: Vec<String> = query
                .iter()
                .map(|(k, v)| format!("{}={}", signing::uri_encode(k), signing::uri_encode(v)))
                .collect();
            url.push('?');
            url.push_str(&encoded.join("&"));
        }

        let mut request = self
            .http
            .request(method, &url)
            .header("Content-Type", content_type)
            .body(body);
        for (name, value) in headers {
            request = request.header(&name, &value);
        }
        request
            .send()
            .await
            .with_context(|| format!("elasticsearch request to {} failed", path))
    }

    /// Create an index. A 4xx reporting the index already exists is fine;
    /// any other failure raises.
    pub async fn create_index(&self, name: &str) -> Result<()> {
        let response = self
            .signed_request(
                Method::PUT,
                &format!("/{}", name),
                &[],
                b"{}".to_vec(),
                "application/json",
            )
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        if status.is_client_error() && text.contains("resource_already_exists_exception") {
            debug!(index = name, "index already exists");
            return Ok(());
        }
        bail!("creating index {} failed: {}: {}", name, status, text)
    }

    /// Install the mapping: `published` is a date, `type` and
    /// `object.type` are keywords.
    pub async fn create_mapping(&self, name: &str) -> Result<()> {
        let mapping = json!({
            "properties": {
                "published": {"type": "date"},
                "type": {"type": "keyword"},
                "object.type": {"type": "keyword"},
            }
        });
        let response = self
            .signed_request(
                Method::PUT,
                &format!("/{}/_mapping/_doc", name),
                &[],
                to_vec(&mapping),
                "application/json",
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("creating mapping for {} failed: {}: {}", name, status, text)
        }
        Ok(())
    }

    /// Bulk-insert action/source pairs as NDJSON. A page with no items is
    /// a no-op rather than an empty `_bulk` request.
    pub async fn bulk(&self, items: &[BulkItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let response = self
            .signed_request(
                Method::POST,
                "/_bulk",
                &[],
                bulk_payload(items),
                "application/x-ndjson",
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("bulk insert failed: {}: {}", status, text)
        }
        Ok(())
    }

    /// Force the index searchable before its alias flip.
    pub async fn refresh(&self, name: &str) -> Result<()> {
        let response = self
            .signed_request(
                Method::POST,
                &format!("/{}/_refresh", name),
                &[],
                Vec::new(),
                "application/json",
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("refreshing index {} failed: {}: {}", name, status, text)
        }
        Ok(())
    }

    /// List `activities_*` indices, partitioned into those without and
    /// with the `activities` alias.
    pub async fn get_old_index_names(&self) -> Result<(Vec<String>, Vec<String>)> {
        #[derive(Deserialize)]
        struct IndexAliases {
            #[serde(default)]
            aliases: BTreeMap<String, Value>,
        }

        let response = self
            .signed_request(Method::GET, "/_aliases", &[], Vec::new(), "application/json")
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("listing aliases failed: {}: {}", status, text)
        }
        let indexes: BTreeMap<String, IndexAliases> = response
            .json()
            .await
            .context("alias listing is not valid JSON")?;

        let mut without_alias = Vec::new();
        let mut with_alias = Vec::new();
        for (name, details) in indexes {
            if !name.starts_with("activities_") {
                continue;
            }
            if details.aliases.is_empty() {
                without_alias.push(name);
            } else {
                with_alias.push(name);
            }
        }
        Ok((without_alias, with_alias))
    }

    /// In one `_aliases` request: point `activities` at the new index and
    /// drop it from every pre-existing aliased index of this feed. This
    /// is the single moment readers change generation.
    pub async fn add_remove_aliases_atomically(
        &self,
        new_index: &str,
        feed_id: &str,
    ) -> Result<()> {
        let (_, with_alias) = self.get_old_index_names().await?;
        let feed = vec![feed_id.to_string()];
        let mut actions: Vec<Value> = indexes_matching_feeds(&with_alias, &feed)
            .into_iter()
            .filter(|name| name != new_index)
            .map(|name| json!({"remove": {"index": name, "alias": ALIAS}}))
            .collect();
        actions.push(json!({"add": {"index": new_index, "alias": ALIAS}}));

        let response = self
            .signed_request(
                Method::POST,
                "/_aliases",
                &[],
                to_vec(&json!({ "actions": actions })),
                "application/json",
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("alias swap to {} failed: {}: {}", new_index, status, text)
        }
        Ok(())
    }

    pub async fn delete_indexes(&self, names: &[String]) -> Result<()> {
        for name in names {
            debug!(index = name.as_str(), "deleting index");
            let response = self
                .signed_request(
                    Method::DELETE,
                    &format!("/{}", name),
                    &[],
                    Vec::new(),
                    "application/json",
                )
                .await?;
            let status = response.status();
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                let text = response.text().await.unwrap_or_default();
                bail!("deleting index {} failed: {}: {}", name, status, text)
            }
        }
        Ok(())
    }

    /// Proxy a search request and return the backend's status and body
    /// untouched. Shaping into the public collection form happens on top
    /// of this, only for 200 replies.
    pub async fn search_raw(
        &self,
        path: &str,
        query: &[(String, String)],
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let response = self
            .signed_request(Method::GET, path, query, body, content_type)
            .await?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .context("failed reading search response body")?;
        Ok((status, bytes.to_vec()))
    }

    // -- metric queries -------------------------------------------------

    async fn count(&self, path: &str) -> Result<f64, MetricsUnavailable> {
        let response = self
            .signed_request(Method::GET, path, &[], Vec::new(), "application/json")
            .await
            .map_err(|_| MetricsUnavailable)?;
        if !response.status().is_success() {
            return Err(MetricsUnavailable);
        }
        let reply: Value = response.json().await.map_err(|_| MetricsUnavailable)?;
        reply["count"].as_f64().ok_or(MetricsUnavailable)
    }

    async fn count_indexes(&self, names: &[String]) -> Result<f64, MetricsUnavailable> {
        if names.is_empty() {
            return Ok(0.0);
        }
        self.count(&format!("/{}/_count", names.join(","))).await
    }

    /// Documents reachable through the `activities` alias.
    pub async fn searchable_total(&self) -> Result<f64, MetricsUnavailable> {
        self.count("/activities/_count").await
    }

    /// Documents in activity indices not (yet) behind the alias.
    pub async fn nonsearchable_total(&self) -> Result<f64, MetricsUnavailable> {
        let total = self.count("/activities__*/_count").await?;
        let searchable = self.searchable_total().await?;
        Ok((total - searchable).max(0.0))
    }

    /// Per-feed `(searchable, nonsearchable)` document counts, scoped by
    /// the feed marker embedded in index names.
    pub async fn feed_activities_total(
        &self,
        feed_id: &str,
    ) -> Result<(f64, f64), MetricsUnavailable> {
        let (without_alias, with_alias) = self
            .get_old_index_names()
            .await
            .map_err(|_| MetricsUnavailable)?;
        let feed = vec![feed_id.to_string()];
        let searchable = self
            .count_indexes(&indexes_matching_feeds(&with_alias, &feed))
            .await?;
        let nonsearchable = self
            .count_indexes(&indexes_matching_feeds(&without_alias, &feed))
            .await?;
        Ok((searchable, nonsearchable))
    }

    /// Seconds since the newest verification-feed activity was published.
    /// The feed publishes continuously, so a small age proves the whole
    /// pipeline end to end.
    pub async fn min_verification_age(&self) -> Result<f64, MetricsUnavailable> {
        let query = json!({
            "size": 0,
            "aggs": {
                "verifications_over_time": {
                    "filter": {
                        "term": {
                            "object.type": "dit:activityStreamVerificationFeed:Verification",
                        }
                    },
                    "aggs": {
                        "max_published": {"max": {"field": "published"}}
                    }
                }
            }
        });
        let response = self
            .signed_request(
                Method::GET,
                SEARCH_PATH,
                &[],
                to_vec(&query),
                "application/json",
            )
            .await
            .map_err(|_| MetricsUnavailable)?;
        if !response.status().is_success() {
            return Err(MetricsUnavailable);
        }
        let reply: Value = response.json().await.map_err(|_| MetricsUnavailable)?;
        let max_published_millis = reply["aggregations"]["verifications_over_time"]["max_published"]
            ["value"]
            .as_f64()
            .ok_or(MetricsUnavailable)?;
        let now_millis = Utc::now().timestamp_millis() as f64;
        Ok((now_millis - max_published_millis) / 1000.0)
    }
}

/// One bulk operation: the action/metadata header line plus the document.
#[derive(Debug, Clone)]
pub struct BulkItem {
    pub action_and_metadata: Value,
    pub source: Value,
}

impl BulkItem {
    pub fn index_into(index_name: &str, activity_id: &str, source: Value) -> Self {
        Self {
            action_and_metadata: json!({
                "index": {
                    "_index": index_name,
                    "_type": "_doc",
                    "_id": activity_id,
                }
            }),
            source,
        }
    }
}

/// Serialise bulk items as NDJSON. Keys serialise in stable (sorted)
/// order, and the payload always ends with a single newline.
pub fn bulk_payload(items: &[BulkItem]) -> Vec<u8> {
    let mut payload = Vec::new();
    for item in items {
        payload.extend_from_slice(&to_vec(&item.action_and_metadata));
        payload.push(b'\n');
        payload.extend_from_slice(&to_vec(&item.source));
        payload.push(b'\n');
    }
    payload
}

fn to_vec(value: &Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("a JSON value always serialises")
}

/// Mint a fresh index name for a feed. The `__feed_id__<id>__` marker
/// makes substring lookup exact, and the timestamp plus random suffix
/// makes each name unique.
pub fn new_index_name(feed_id: &str) -> String {
    const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| SUFFIX_ALPHABET[rng.gen_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect();
    format!(
        "{}__feed_id__{}__date__{}__{}",
        ALIAS,
        feed_id,
        Utc::now().format("%Y%m%dt%H%M%S"),
        suffix
    )
}

fn feed_marker(feed_id: &str) -> String {
    format!("__feed_id__{}__", feed_id)
}

/// The index names belonging to any of the given feeds.
pub fn indexes_matching_feeds(index_names: &[String], feed_ids: &[String]) -> Vec<String> {
    let markers: Vec<String> = feed_ids.iter().map(|id| feed_marker(id)).collect();
    index_names
        .iter()
        .filter(|name| markers.iter().any(|marker| name.contains(marker.as_str())))
        .cloned()
        .collect()
}

/// The index names belonging to none of the given feeds: garbage left by
/// feeds that are no longer configured.
pub fn indexes_matching_no_feeds(index_names: &[String], feed_ids: &[String]) -> Vec<String> {
    let markers: Vec<String> = feed_ids.iter().map(|id| feed_marker(id)).collect();
    index_names
        .iter()
        .filter(|name| !markers.iter().any(|marker| name.contains(marker.as_str())))
        .cloned()
        .collect()
}

/// The query for a page-one search: the caller's query plus the scroll
/// keepalive.
pub fn new_scroll_query(mut caller_query: Vec<(String, String)>) -> Vec<(String, String)> {
    caller_query.push(("scroll".to_string(), SCROLL_KEEPALIVE.to_string()));
    caller_query
}

/// The body for a scroll continuation request.
pub fn scroll_continuation_body(private_scroll_id: &str) -> Vec<u8> {
    to_vec(&json!({
        "scroll": SCROLL_KEEPALIVE,
        "scroll_id": private_scroll_id,
    }))
}

pub fn private_scroll_id_of(reply: &Value) -> Option<&str> {
    reply["_scroll_id"].as_str()
}

pub fn reply_has_hits(reply: &Value) -> bool {
    reply["hits"]["hits"]
        .as_array()
        .map(|hits| !hits.is_empty())
        .unwrap_or(false)
}

/// Shape a 200 search reply into the public collection form.
pub fn activities_collection(reply: &Value, next_url: Option<String>) -> Value {
    let ordered_items: Vec<Value> = reply["hits"]["hits"]
        .as_array()
        .map(|hits| hits.iter().map(|hit| hit["_source"].clone()).collect())
        .unwrap_or_default();
    let mut collection = json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            {"dit": "https://www.trade.gov.uk/ns/activitystreams/v1"},
        ],
        "type": "Collection",
        "orderedItems": ordered_items,
    });
    if let Some(next) = next_url {
        collection["next"] = Value::String(next);
    }
    collection
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_names_embed_the_feed_marker_and_differ_each_time() {
        let first = new_index_name("first_feed");
        let second = new_index_name("first_feed");
        assert!(first.starts_with("activities__feed_id__first_feed__date__"));
        assert!(first.contains("__feed_id__first_feed__"));
        assert_ne!(first, second);
    }

    #[test]
    fn feed_matching_is_exact_on_the_marker() {
        let names = vec![
            "activities__feed_id__first_feed__date__20180412t000000__abcd1234".to_string(),
            "activities__feed_id__first_feed_2__date__20180412t000000__abcd1234".to_string(),
            "activities__feed_id__other__date__20180412t000000__abcd1234".to_string(),
        ];
        let feeds = vec!["first_feed".to_string()];
        assert_eq!(
            indexes_matching_feeds(&names, &feeds),
            vec![names[0].clone()]
        );
        assert_eq!(
            indexes_matching_no_feeds(&names, &feeds),
            vec![names[1].clone(), names[2].clone()]
        );
    }

    #[test]
    fn bulk_payload_is_ndjson_with_stable_keys_and_trailing_newline() {
        let items = vec![
            BulkItem::index_into(
                "activities__feed_id__f__date__x__y",
                "dit:exportOpportunities:Enquiry:49863:Create",
                json!({"published": "2018-04-12T12:48:13+00:00", "id": "one"}),
            ),
            BulkItem::index_into(
                "activities__feed_id__f__date__x__y",
                "dit:exportOpportunities:Enquiry:49862:Create",
                json!({"published": "2018-03-23T17:06:53+00:00", "id": "two"}),
            ),
        ];
        let payload = bulk_payload(&items);
        let text = String::from_utf8(payload).unwrap();
        assert!(text.ends_with('\n'));
        assert!(!text.ends_with("\n\n"));

        let lines: Vec<&str> = text.trim_end_matches('\n').split('\n').collect();
        assert_eq!(lines.len(), 4);
        // Keys come out sorted, making the payload byte-stable.
        assert_eq!(
            lines[0],
            r#"{"index":{"_id":"dit:exportOpportunities:Enquiry:49863:Create","_index":"activities__feed_id__f__date__x__y","_type":"_doc"}}"#
        );
        assert_eq!(
            lines[1],
            r#"{"id":"one","published":"2018-04-12T12:48:13+00:00"}"#
        );
        assert_eq!(
            lines[3],
            r#"{"id":"two","published":"2018-03-23T17:06:53+00:00"}"#
        );
    }

    #[test]
    fn empty_bulk_payload_is_empty() {
        assert!(bulk_payload(&[]).is_empty());
    }

    #[test]
    fn collections_carry_ordered_items_in_reply_order() {
        let reply = json!({
            "_scroll_id": "private-id",
            "hits": {"hits": [
                {"_source": {"id": "dit:exportOpportunities:Enquiry:49863:Create"}},
                {"_source": {"id": "dit:exportOpportunities:Enquiry:49862:Create"}},
            ]},
        });
        let collection =
            activities_collection(&reply, Some("http://example.com/v1/abc123-_".to_string()));
        assert_eq!(collection["type"], "Collection");
        assert_eq!(
            collection["orderedItems"][0]["id"],
            "dit:exportOpportunities:Enquiry:49863:Create"
        );
        assert_eq!(
            collection["orderedItems"][1]["id"],
            "dit:exportOpportunities:Enquiry:49862:Create"
        );
        assert_eq!(collection["next"], "http://example.com/v1/abc123-_");
        assert!(reply_has_hits(&reply));
        assert_eq!(private_scroll_id_of(&reply), Some("private-id"));
    }

    #[test]
    fn empty_reply_shapes_to_an_empty_collection_without_next() {
        let reply = json!({"_scroll_id": "private-id", "hits": {"hits": []}});
        let collection = activities_collection(&reply, None);
        assert_eq!(collection["orderedItems"], json!([]));
        assert!(collection.get("next").is_none());
        assert!(!reply_has_hits(&reply));
    }

    #[test]
    fn new_scroll_query_appends_the_keepalive() {
        let query = new_scroll_query(vec![("size".to_string(), "1".to_string())]);
        assert_eq!(
            query,
            vec![
                ("size".to_string(), "1".to_string()),
                ("scroll".to_string(), "15s".to_string()),
            ]
        );
    }

    #[test]
    fn scroll_continuation_body_carries_the_private_id() {
        let body = scroll_continuation_body("private-id");
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["scroll_id"], "private-id");
        assert_eq!(parsed["scroll"], "15s");
    }
}
