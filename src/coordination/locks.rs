use std::time::Duration;

use anyhow::{Context, Result};
use fred::interfaces::{KeysInterface, LuaInterface};
use tracing::{debug, warn};

use crate::module::fmt_mod_ver;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Fleet-wide mutual exclusion keyed by string.
///
/// Implemented over KeyDB for production; tests substitute an in-memory
/// double.
#[async_trait::async_trait]
pub trait DistributedLock: Send + Sync {
    /// `true` if `owner` now holds `key`.
    async fn acquire(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool>;

    /// Release `key` if `owner` still holds it.
    async fn release(&self, key: &str, owner: &str) -> Result<()>;

    /// Wait for `key` to be released.  `false` means `timeout` elapsed first.
    async fn wait_released(&self, key: &str, timeout: Duration) -> Result<bool>;
}

#[async_trait::async_trait]
impl DistributedLock for fred::clients::Pool {
    async fn acquire(&self, key: &str, owner: &str, ttl_secs: u64) -> Result<bool> {
        acquire_lock(self, key, owner, ttl_secs).await
    }

    async fn release(&self, key: &str, owner: &str) -> Result<()> {
        release_lock(self, key, owner).await
    }

    async fn wait_released(&self, key: &str, timeout: Duration) -> Result<bool> {
        wait_for_lock(self, key, timeout, LOCK_POLL_INTERVAL).await
    }
}

/// KeyDB key of the fleet-wide stash lock for one module version.
pub fn stash_lock_key(module: &str, version: &str) -> String {
    format!("modcache:lock:stash:{}", fmt_mod_ver(module, version))
}

/// Attempt to acquire a distributed lock using SET NX EX.
///
/// Returns `true` if this node now holds the lock, `false` if another node
/// already does.
pub async fn acquire_lock(
    pool: &fred::clients::Pool,
    key: &str,
    node_id: &str,
    ttl_secs: u64,
) -> Result<bool> {
    let value = format!("{node_id}:{}", chrono::Utc::now().timestamp());
    let result: Option<String> = pool
        .set(
            key,
            value.as_str(),
            Some(fred::types::Expiration::EX(ttl_secs as i64)),
            Some(fred::types::SetOptions::NX),
            false,
        )
        .await
        .with_context(|| format!("SET NX {key}"))?;
    let acquired = result.is_some();
    debug!(%key, %node_id, acquired, "acquire_lock");
    Ok(acquired)
}

/// Release a lock only if it is still owned by `node_id`.
///
/// The owner check and the delete run in one Lua script so a lock that
/// expired and was re-acquired by another node is left alone.
pub async fn release_lock(pool: &fred::clients::Pool, key: &str, node_id: &str) -> Result<()> {
    let script = r#"
        local val = redis.call('GET', KEYS[1])
        if val and string.find(val, ARGV[1] .. ":", 1, true) == 1 then
            redis.call('DEL', KEYS[1])
            return 1
        end
        return 0
    "#;
    let released: i64 = pool
        .eval(script, vec![key.to_string()], vec![node_id.to_string()])
        .await
        .context("lock release script failed")?;
    if released == 1 {
        debug!(%key, %node_id, "lock released");
    } else {
        warn!(%key, %node_id, "lock release: key missing or owned by another node");
    }
    Ok(())
}

/// Poll until the lock at `key` disappears or `timeout` elapses.
///
/// Returns `true` if the lock was released before the timeout.
pub async fn wait_for_lock(
    pool: &fred::clients::Pool,
    key: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<bool> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let exists: bool = pool.exists(key).await?;
        if !exists {
            debug!(%key, "wait_for_lock: lock released");
            return Ok(true);
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(poll_interval.min(remaining)).await;
    }

    warn!(%key, ?timeout, "wait_for_lock: timed out waiting for lock release");
    Ok(false)
}
