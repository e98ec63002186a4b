//! Shared lock store boundary.
//!
//! A key/value store exposing the three atomic primitives the lock manager
//! is built on. The application never reads-then-writes a key; every
//! mutation is a single conditional or unconditional command.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use in_memory::InMemoryLockStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockStore;

/// Lock store error (connectivity or protocol failures).
#[derive(Debug, Clone, thiserror::Error)]
pub enum LockStoreError {
    #[error("lock store connection error: {0}")]
    Connection(String),

    #[error("lock store command error: {0}")]
    Command(String),

    #[error("lock store unavailable")]
    Unavailable,
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Set `key` to `value` with `ttl` only if it is absent.
    ///
    /// Returns `true` when the key was set.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, LockStoreError>;

    /// Reset the remaining time-to-live of `key`.
    ///
    /// Returns `false` if the key no longer exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LockStoreError>;

    /// Remove `key` unconditionally.
    async fn delete(&self, key: &str) -> Result<(), LockStoreError>;
}

#[async_trait]
impl<S> LockStore for Arc<S>
where
    S: LockStore + ?Sized,
{
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        (**self).set_if_absent(key, value, ttl).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        (**self).expire(key, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        (**self).delete(key).await
    }
}
