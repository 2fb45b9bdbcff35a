//! The cross-process ingestion lock.
//!
//! One ingester may be active at a time across rolling deploys. The lock
//! is a single well-known key with a short TTL that the holder keeps
//! refreshing; it expires by itself when the holding process dies. The
//! lock is never re-acquired after loss: losing it means this process
//! blocked for longer than the TTL, and that should be visible to an
//! operator rather than papered over.

use anyhow::{bail, Result};
use std::time::Duration;
use tracing::debug;

use crate::kv::KvStore;

const LOCK_KEY: &str = "lock";
const LOCK_TTL_SECONDS: u64 = 2;
const ACQUIRE_INTERVAL: Duration = Duration::from_secs(1);
const EXTEND_INTERVAL: Duration = Duration::from_secs(1);

/// Block until this process holds the lock.
pub async fn acquire(kv: &KvStore) -> Result<()> {
    loop {
        debug!("acquiring lock...");
        if kv.set_nx_ex(LOCK_KEY, LOCK_TTL_SECONDS).await? {
            debug!("acquiring lock: success");
            return Ok(());
        }
        debug!("acquiring lock: failure, sleeping");
        tokio::time::sleep(ACQUIRE_INTERVAL).await;
    }
}

/// Keep the lock's TTL refreshed. Only ever returns with an error: a
/// refresh that finds the key gone means the lock was lost, which is
/// fatal for the process.
pub async fn extend_forever(kv: &KvStore) -> Result<()> {
    loop {
        tokio::time::sleep(EXTEND_INTERVAL).await;
        if !kv.expire(LOCK_KEY, LOCK_TTL_SECONDS).await? {
            bail!("ingestion lock has been lost");
        }
    }
}
