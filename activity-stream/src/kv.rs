//! Thin wrapper around the Redis connection.
//!
//! Everything transient lives here: the replay-nonce cache, the public
//! scroll-id mapping, the distributed ingestion lock, per-feed health
//! flags and the cached metrics payload. The connection is long-lived;
//! when an operation fails the calling task errors out and is restarted
//! by its supervisor.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;

const METRICS_KEY: &str = "metrics";
const REDIS_CHECK_KEY: &str = "redis-check";

#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
}

impl KvStore {
    pub async fn connect(uri: &str) -> Result<Self> {
        let client = redis::Client::open(uri).context("invalid redis URI")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }

    /// `SET key 1 EX ttl NX`. Returns true when the key was absent and is
    /// now set, false when it already existed.
    pub async fn set_nx_ex(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(1)
            .arg("EX")
            .arg(ttl_seconds)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis SET NX EX failed for {}", key))?;
        Ok(reply.as_deref() == Some("OK"))
    }

    /// `EXPIRE key ttl`. Returns true when the key existed and its TTL
    /// was refreshed.
    pub async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis EXPIRE failed for {}", key))?;
        Ok(reply == 1)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis GET failed for {}", key))
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis GET failed for {}", key))
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis SET failed for {}", key))
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("redis SET EX failed for {}", key))
    }

    /// Map a freshly minted public scroll id to the backend's private one.
    pub async fn store_private_scroll_id(
        &self,
        public_id: &str,
        private_id: &str,
        ttl_seconds: u64,
    ) -> Result<()> {
        self.set_ex(&private_scroll_key(public_id), private_id, ttl_seconds)
            .await
    }

    pub async fn private_scroll_id(&self, public_id: &str) -> Result<Option<String>> {
        self.get(&private_scroll_key(public_id)).await
    }

    /// Record that a feed completed a full ingest cycle. Read back by the
    /// health endpoint; the TTL must outlive the feed's idle gap between
    /// cycles or a healthy feed shows RED.
    pub async fn mark_feed_green(&self, feed_id: &str, ttl_seconds: u64) -> Result<()> {
        self.set_ex(&feed_status_key(feed_id), "GREEN", ttl_seconds)
            .await
    }

    pub async fn feed_status(&self, feed_id: &str) -> Result<Option<String>> {
        self.get(&feed_status_key(feed_id)).await
    }

    pub async fn cache_metrics(&self, payload: &[u8]) -> Result<()> {
        self.set(METRICS_KEY, payload).await
    }

    pub async fn cached_metrics(&self) -> Result<Vec<u8>> {
        Ok(self.get_bytes(METRICS_KEY).await?.unwrap_or_default())
    }

    /// Round-trip a short-lived value to prove the connection is healthy.
    pub async fn ping(&self) -> Result<bool> {
        self.set_ex(REDIS_CHECK_KEY, "GREEN", 1).await?;
        Ok(self.get(REDIS_CHECK_KEY).await?.as_deref() == Some("GREEN"))
    }
}

pub fn nonce_key(key_id: &str, nonce: &str) -> String {
    format!("nonce-{}-{}", key_id, nonce)
}

fn private_scroll_key(public_id: &str) -> String {
    format!("private-scroll-id-{}", public_id)
}

fn feed_status_key(feed_id: &str) -> String {
    format!("feed-status-{}", feed_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_keys_bind_key_id_and_nonce() {
        assert_eq!(
            nonce_key("incoming-some-id-1", "c29tZX"),
            "nonce-incoming-some-id-1-c29tZX"
        );
    }

    #[test]
    fn scroll_and_status_keys_are_namespaced() {
        assert_eq!(private_scroll_key("abc123-_"), "private-scroll-id-abc123-_");
        assert_eq!(feed_status_key("zendesk_1"), "feed-status-zendesk_1");
    }
}
