//! Upstream feed adapters.
//!
//! Each variant knows its seed URL, how to authenticate against its own
//! upstream, how to pull the next-page link out of a parsed page, and how
//! to turn a page into normalised activity records ready for bulk upload.
//! The variant is decided once, at config-parse time.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::elasticsearch::BulkItem;
use crate::signing::{self, HawkCredentials};

#[derive(Debug, Clone)]
pub enum Feed {
    ActivityStream(ActivityStreamFeed),
    Zendesk(ZendeskFeed),
}

/// An upstream publishing pages of already-normalised activities under
/// `orderedItems`, authenticated with the Hawk MAC scheme.
#[derive(Debug, Clone)]
pub struct ActivityStreamFeed {
    pub unique_id: String,
    pub seed: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// The Zendesk incremental ticket export, authenticated with HTTP Basic
/// using the `<email>/token:<api_key>` convention.
#[derive(Debug, Clone)]
pub struct ZendeskFeed {
    pub unique_id: String,
    pub seed: String,
    pub api_email: String,
    pub api_key: String,
}

impl Feed {
    pub fn from_config(config: &common::FeedConfig) -> Self {
        match config {
            common::FeedConfig::ActivityStream {
                unique_id,
                seed,
                access_key_id,
                secret_access_key,
            } => Feed::ActivityStream(ActivityStreamFeed {
                unique_id: unique_id.clone(),
                seed: seed.clone(),
                access_key_id: access_key_id.clone(),
                secret_access_key: secret_access_key.clone(),
            }),
            common::FeedConfig::Zendesk {
                unique_id,
                seed,
                api_email,
                api_key,
            } => Feed::Zendesk(ZendeskFeed {
                unique_id: unique_id.clone(),
                seed: seed.clone(),
                api_email: api_email.clone(),
                api_key: api_key.clone(),
            }),
        }
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Feed::ActivityStream(feed) => &feed.unique_id,
            Feed::Zendesk(feed) => &feed.unique_id,
        }
    }

    pub fn seed(&self) -> &str {
        match self {
            Feed::ActivityStream(feed) => &feed.seed,
            Feed::Zendesk(feed) => &feed.seed,
        }
    }

    /// Wait between pages within one pass of the feed.
    pub fn polling_page_interval(&self) -> Duration {
        match self {
            Feed::ActivityStream(_) => Duration::from_secs(0),
            Feed::Zendesk(_) => Duration::from_secs(30),
        }
    }

    /// Wait after exhausting pagination before re-polling the seed.
    pub fn polling_seed_interval(&self) -> Duration {
        match self {
            Feed::ActivityStream(_) => Duration::from_secs(60),
            Feed::Zendesk(_) => Duration::from_secs(60 * 15),
        }
    }

    pub fn auth_headers(&self, url: &str) -> Result<Vec<(String, String)>> {
        match self {
            Feed::ActivityStream(feed) => {
                let header = signing::hawk_auth_header_now(
                    HawkCredentials {
                        id: &feed.access_key_id,
                        key: &feed.secret_access_key,
                    },
                    "GET",
                    url,
                    b"",
                    "",
                )
                .with_context(|| format!("failed to sign feed request to {}", url))?;
                Ok(vec![("Authorization".to_string(), header)])
            }
            Feed::Zendesk(feed) => {
                let token = base64::encode(format!("{}/token:{}", feed.api_email, feed.api_key));
                Ok(vec![(
                    "Authorization".to_string(),
                    format!("Basic {}", token),
                )])
            }
        }
    }

    pub fn next_href(&self, page: &Value) -> Option<String> {
        let key = match self {
            Feed::ActivityStream(_) => "next",
            Feed::Zendesk(_) => "next_page",
        };
        page[key].as_str().map(str::to_string)
    }

    pub fn convert_to_bulk(&self, page: &Value, index_name: &str) -> Result<Vec<BulkItem>> {
        match self {
            Feed::ActivityStream(_) => activity_stream_bulk(page, index_name),
            Feed::Zendesk(_) => zendesk_bulk(page, index_name),
        }
    }
}

fn activity_stream_bulk(page: &Value, index_name: &str) -> Result<Vec<BulkItem>> {
    let items = page["orderedItems"]
        .as_array()
        .context("feed page has no orderedItems")?;
    items
        .iter()
        .map(|item| {
            let activity_id = item["id"]
                .as_str()
                .context("feed activity has no string id")?;
            Ok(BulkItem::index_into(index_name, activity_id, item.clone()))
        })
        .collect()
}

fn zendesk_bulk(page: &Value, index_name: &str) -> Result<Vec<BulkItem>> {
    let tickets = page["tickets"]
        .as_array()
        .context("zendesk page has no tickets")?;
    tickets
        .iter()
        .map(|ticket| {
            let id = ticket["id"]
                .as_u64()
                .context("zendesk ticket has no numeric id")?;
            let created_at = ticket["created_at"]
                .as_str()
                .context("zendesk ticket has no created_at")?;
            let ticket_id = format!("dit:zendesk:Ticket:{}", id);
            let activity_id = format!("{}:Create", ticket_id);
            let source = serde_json::json!({
                "type": "Create",
                "id": activity_id,
                "published": created_at,
                "dit:application": "zendesk",
                "actor": {
                    "type": ["Organization", "dit:company"],
                    "dit:zendeskOrganizationId": ticket["organization_id"],
                },
                "object": {
                    "type": ["Document", "dit:zendesk:Ticket"],
                    "id": ticket_id,
                },
            });
            Ok(BulkItem::index_into(index_name, &activity_id, source))
        })
        .collect()
}
