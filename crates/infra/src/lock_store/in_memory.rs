//! In-memory lock store for tests/dev.
//!
//! Expiry uses `tokio::time`, so paused-clock tests see keys lapse exactly
//! when the virtual clock passes their deadline.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{LockStore, LockStoreError};

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// Process-local lock store.
///
/// Share one instance (behind an `Arc`) between several lock managers to
/// model several workers contending for the same keys.
#[derive(Debug)]
pub struct InMemoryLockStore {
    entries: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going away (every command fails) or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Current holder of `key`, if it is set and not expired.
    pub fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.value.clone())
    }

    fn check_available(&self) -> Result<(), LockStoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockStoreError::Unavailable)
        }
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, LockStoreError> {
        self.entries
            .lock()
            .map_err(|_| LockStoreError::Command("lock table poisoned".to_string()))
    }
}

impl Default for InMemoryLockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, LockStoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries()?;

        if let Some(existing) = entries.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, LockStoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries()?;

        match entries.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), LockStoreError> {
        self.check_available()?;
        self.entries()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_if_absent_is_exclusive_until_expiry() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(2);

        assert!(store.set_if_absent("k", "a", ttl).await.unwrap());
        assert!(!store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.holder("k").as_deref(), Some("a"));

        tokio::time::advance(Duration::from_millis(2001)).await;
        assert_eq!(store.holder("k"), None);
        assert!(store.set_if_absent("k", "b", ttl).await.unwrap());
        assert_eq!(store.holder("k").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_extends_live_keys_only() {
        let store = InMemoryLockStore::new();
        let ttl = Duration::from_secs(2);
        store.set_if_absent("k", "a", ttl).await.unwrap();

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(store.expire("k", ttl).await.unwrap());

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(store.holder("k").as_deref(), Some("a"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!store.expire("k", ttl).await.unwrap());
        assert!(!store.expire("missing", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_unconditional() {
        let store = InMemoryLockStore::new();
        store
            .set_if_absent("k", "a", Duration::from_secs(60))
            .await
            .unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        assert_eq!(store.holder("k"), None);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = InMemoryLockStore::new();
        store.set_available(false);
        assert!(matches!(
            store.set_if_absent("k", "a", Duration::from_secs(1)).await,
            Err(LockStoreError::Unavailable)
        ));
        store.set_available(true);
        assert!(store.set_if_absent("k", "a", Duration::from_secs(1)).await.unwrap());
    }
}
