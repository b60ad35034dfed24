//! In-process implementation of [`DistributedLock`].

use super::{DistributedLock, LockHandle, LockOptions};
use crate::core::Result;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// Expiring locks kept in a `DashMap`.
///
/// Only excludes holders inside one process. Uses the tokio clock, so tests
/// with a paused runtime can drive expiry.
#[derive(Debug, Default)]
pub struct InMemoryLock {
    leases: DashMap<String, Lease>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `key` is currently held by anyone.
    pub fn is_locked(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }

    fn try_acquire(&self, key: &str, ttl: Duration) -> Option<LockHandle> {
        let now = Instant::now();
        let token = Uuid::new_v4().to_string();
        let lease = Lease {
            token: token.clone(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return None;
                }
                occupied.insert(lease);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
            }
        }
        Some(LockHandle::new(key, token))
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, options: &LockOptions) -> Result<Option<LockHandle>> {
        for attempt in 0..=options.retry_count {
            if let Some(handle) = self.try_acquire(key, options.ttl) {
                return Ok(Some(handle));
            }
            if attempt < options.retry_count {
                tokio::time::sleep(options.retry_delay).await;
            }
        }
        debug!(
            "Lock {} still held after {} attempt(s)",
            key,
            options.retry_count + 1
        );
        Ok(None)
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool> {
        let removed = self
            .leases
            .remove_if(&handle.key, |_, lease| lease.token == handle.token);
        Ok(removed.is_some())
    }

    async fn refresh(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.leases.get_mut(&handle.key) {
            Some(mut lease) if lease.token == handle.token && lease.expires_at > now => {
                lease.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn supports_refresh(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let lock = InMemoryLock::new();
        let options = LockOptions::new(Duration::from_secs(30));

        let first = lock.acquire("job", &options).await.unwrap().unwrap();
        assert!(lock.acquire("job", &options).await.unwrap().is_none());
        assert!(lock.is_locked("job"));

        assert!(lock.release(&first).await.unwrap());
        assert!(!lock.release(&first).await.unwrap());
        assert!(lock.acquire("job", &options).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_release_requires_matching_token() {
        let lock = InMemoryLock::new();
        let handle = lock
            .acquire("job", &LockOptions::default())
            .await
            .unwrap()
            .unwrap();
        let forged = LockHandle::new("job", "not-the-token");

        assert!(!lock.release(&forged).await.unwrap());
        assert!(!lock.refresh(&forged, Duration::from_secs(1)).await.unwrap());
        assert!(lock.refresh(&handle, Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken_over() {
        let lock = InMemoryLock::new();
        let options = LockOptions::new(Duration::from_secs(5));
        let stale = lock.acquire("job", &options).await.unwrap().unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!lock.refresh(&stale, Duration::from_secs(5)).await.unwrap());
        let fresh = lock.acquire("job", &options).await.unwrap().unwrap();
        assert_ne!(fresh.token, stale.token);
        assert!(!lock.release(&stale).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_retries_until_released() {
        let lock = std::sync::Arc::new(InMemoryLock::new());
        let held = lock
            .acquire("job", &LockOptions::new(Duration::from_secs(30)))
            .await
            .unwrap()
            .unwrap();

        let releaser = std::sync::Arc::clone(&lock);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            releaser.release(&held).await.unwrap();
        });

        let options =
            LockOptions::new(Duration::from_secs(30)).with_retry(10, Duration::from_millis(100));
        assert!(lock.acquire("job", &options).await.unwrap().is_some());
    }
}
