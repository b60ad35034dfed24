//! Distributed lock interface.
//!
//! The engine never implements cross-process locking itself: hosts plug in
//! a [`DistributedLock`] backed by whatever they run (Redis, a database row,
//! etcd). [`InMemoryLock`] covers tests and single-process deployments.

mod memory;

pub use memory::InMemoryLock;

use crate::core::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Proof of ownership returned by [`DistributedLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
}

impl LockHandle {
    pub fn new(key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            token: token.into(),
        }
    }
}

/// Acquisition parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    /// How long the lock is held if never refreshed or released.
    pub ttl: Duration,
    /// Extra attempts after the first one fails.
    pub retry_count: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl LockOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Self::default()
        }
    }

    pub fn with_retry(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            retry_count: 0,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// A mutually exclusive, expiring lock shared by a fleet of processes.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Tries to take `key`. `Ok(None)` means another holder kept it through
    /// every retry.
    async fn acquire(&self, key: &str, options: &LockOptions) -> Result<Option<LockHandle>>;

    /// Releases a held lock. Returns false if the handle no longer owns it.
    async fn release(&self, handle: &LockHandle) -> Result<bool>;

    /// Extends a held lock to `ttl` from now. Returns false if the handle no
    /// longer owns it.
    ///
    /// Only meaningful when [`supports_refresh`](Self::supports_refresh)
    /// returns true; the default reports the lock as lost.
    async fn refresh(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        let _ = (handle, ttl);
        Ok(false)
    }

    fn supports_refresh(&self) -> bool {
        false
    }
}

#[async_trait]
impl<L: DistributedLock + ?Sized> DistributedLock for Arc<L> {
    async fn acquire(&self, key: &str, options: &LockOptions) -> Result<Option<LockHandle>> {
        (**self).acquire(key, options).await
    }

    async fn release(&self, handle: &LockHandle) -> Result<bool> {
        (**self).release(handle).await
    }

    async fn refresh(&self, handle: &LockHandle, ttl: Duration) -> Result<bool> {
        (**self).refresh(handle, ttl).await
    }

    fn supports_refresh(&self) -> bool {
        (**self).supports_refresh()
    }
}
