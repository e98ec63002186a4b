//! Distributed lock manager with an optional lease-renewing watchdog.
//!
//! Locks are plain keys in the shared lock store, set only if absent and
//! expiring after a TTL. A held lock is represented by a [`LockGuard`]:
//!
//! - with the watchdog, a background task renews the TTL every `T/2` until
//!   the guard is released, so long executions keep exclusivity
//! - without it, the key simply expires after `T`; an execution running
//!   longer than that silently loses exclusivity
//!
//! Release always deletes the key (the value is informational only).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relay_infra::{LockStore, LockStoreError};

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LockStore>,
    holder: String,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    /// `holder` is stored as the lock value (the worker's consumer name).
    pub fn new(store: Arc<dyn LockStore>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to take `key`. `Ok(false)` means someone else holds it.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        self.store.set_if_absent(key, &self.holder, ttl).await
    }

    /// Reset the TTL of `key`. `Ok(false)` means the key is gone.
    pub async fn renew(&self, key: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        self.store.expire(key, ttl).await
    }

    pub async fn release(&self, key: &str) -> Result<(), LockStoreError> {
        self.store.delete(key).await
    }

    /// Acquire `key` and return a guard, or `None` if it is held elsewhere.
    pub async fn lock(
        &self,
        key: impl Into<String>,
        ttl: Duration,
        watchdog: bool,
    ) -> Result<Option<LockGuard>, LockStoreError> {
        let key = key.into();
        if !self.acquire(&key, ttl).await? {
            return Ok(None);
        }

        let cancel = CancellationToken::new();
        let watchdog = watchdog.then(|| {
            tokio::spawn(run_watchdog(
                self.clone(),
                key.clone(),
                ttl,
                cancel.clone(),
            ))
        });

        Ok(Some(LockGuard {
            manager: self.clone(),
            key,
            cancel,
            watchdog,
            released: false,
        }))
    }
}

/// Renew `key` every `ttl / 2` until `cancel` fires.
async fn run_watchdog(manager: LockManager, key: String, ttl: Duration, cancel: CancellationToken) {
    let period = (ttl / 2).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match manager.renew(&key, ttl).await {
                Ok(true) => debug!(key = %key, "lock renewed"),
                Ok(false) => {
                    warn!(key = %key, "lock expired before renewal; exclusivity lost");
                    break;
                }
                Err(e) => warn!(key = %key, error = %e, "lock renewal failed"),
            },
        }
    }
}

/// A held lock. Call [`LockGuard::release`]; dropping an unreleased guard
/// stops the watchdog and deletes the key in the background.
pub struct LockGuard {
    manager: LockManager,
    key: String,
    cancel: CancellationToken,
    watchdog: Option<JoinHandle<()>>,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("watchdog", &self.watchdog.is_some())
            .finish()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn has_watchdog(&self) -> bool {
        self.watchdog.is_some()
    }

    /// Stop the watchdog (waiting for it to exit) and delete the key.
    pub async fn release(mut self) -> Result<(), LockStoreError> {
        self.released = true;
        self.cancel.cancel();
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.await;
        }
        self.manager.release(&self.key).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.cancel.cancel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let manager = self.manager.clone();
        let key = std::mem::take(&mut self.key);
        runtime.spawn(async move {
            if let Err(e) = manager.release(&key).await {
                warn!(key = %key, error = %e, "failed to release dropped lock");
            }
        });
    }
}
