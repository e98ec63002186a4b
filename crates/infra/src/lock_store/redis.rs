//! Redis-backed lock store.
//!
//! - `set_if_absent` → `SET key value NX PX ttl`
//! - `expire` → `PEXPIRE key ttl`
//! - `delete` → `DEL key`
//!
//! Commands go through one multiplexed connection shared by the worker.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::instrument;

use super::{LockStore, LockStoreError};

#[derive(Clone)]
pub struct RedisLockStore {
    conn: MultiplexedConnection,
}

impl std::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore").finish_non_exhaustive()
    }
}

impl RedisLockStore {
    /// Connect to Redis (e.g. "redis://localhost:6379").
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, LockStoreError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockStoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| LockStoreError::Connection(e.to_string()))?;
        Ok(Self { conn })
    }
}

/// Redis rejects a zero expiry; round sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockStore for RedisLockStore {
    #[instrument(skip(self, value), err)]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        // Nil reply means the key already exists.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(format!("SET NX failed: {}", e)))?;
        Ok(reply.is_some())
    }

    #[instrument(skip(self), err)]
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(format!("PEXPIRE failed: {}", e)))?;
        Ok(updated == 1)
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockStoreError::Command(format!("DEL failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(600)), 600_000);
    }
}
