//! Distributed lock held for the duration of a chatflow run.

use super::config::ConversationLockConfig;
use crate::core::{Error, Result};
use crate::lock::{DistributedLock, LockHandle, LockOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct Refresher {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Refresher {
    fn spawn(
        lock: Arc<dyn DistributedLock>,
        lease: LockHandle,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = token.cancelled() => break,

                    _ = tokio::time::sleep(interval) => {
                        match lock.refresh(&lease, ttl).await {
                            Ok(true) => debug!("Refreshed conversation lock {}", lease.key),
                            Ok(false) => {
                                warn!("Conversation lock {} was lost while held", lease.key);
                                break;
                            }
                            Err(e) => warn!(
                                "Failed to refresh conversation lock {}: {}",
                                lease.key, e
                            ),
                        }
                    }
                }
            }
        });
        Self {
            cancellation_token,
            handle,
        }
    }

    async fn stop(self) {
        self.cancellation_token.cancel();
        if let Err(e) = self.handle.await {
            warn!("Conversation lock refresher ended abnormally: {}", e);
        }
    }
}

/// A held conversation lock, refreshed in the background.
///
/// Call [`release`](Self::release) on every normal exit path. If the holder
/// is dropped instead (a cancelled future), the release is spawned onto
/// the runtime.
pub(crate) struct HeldLock {
    lock: Arc<dyn DistributedLock>,
    lease: Option<LockHandle>,
    refresher: Option<Refresher>,
}

impl HeldLock {
    pub(crate) async fn acquire(
        lock: &Arc<dyn DistributedLock>,
        conversation_id: &str,
        config: &ConversationLockConfig,
    ) -> Result<Self> {
        let key = config.lock_key(conversation_id);
        let options =
            LockOptions::new(config.ttl).with_retry(config.retry_count, config.retry_delay);

        let Some(lease) = lock.acquire(&key, &options).await? else {
            warn!(
                "Could not acquire conversation lock {} after {} attempt(s)",
                key,
                config.retry_count + 1
            );
            return Err(Error::state(format!(
                "conversation '{}' is locked by another worker",
                conversation_id
            )));
        };

        let refresher = match config.refresh_interval {
            Some(interval) if lock.supports_refresh() => Some(Refresher::spawn(
                Arc::clone(lock),
                lease.clone(),
                interval,
                config.ttl,
            )),
            _ => None,
        };

        Ok(Self {
            lock: Arc::clone(lock),
            lease: Some(lease),
            refresher,
        })
    }

    pub(crate) async fn release(mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.stop().await;
        }
        if let Some(lease) = self.lease.take() {
            match self.lock.release(&lease).await {
                Ok(true) => debug!("Released conversation lock {}", lease.key),
                Ok(false) => warn!("Conversation lock {} expired before release", lease.key),
                Err(e) => warn!("Failed to release conversation lock {}: {}", lease.key, e),
            }
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.cancellation_token.cancel();
        }
        let Some(lease) = self.lease.take() else {
            return;
        };
        let lock = Arc::clone(&self.lock);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = lock.release(&lease).await {
                    warn!("Failed to release conversation lock {}: {}", lease.key, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLock;

    fn config() -> ConversationLockConfig {
        ConversationLockConfig::default()
            .with_ttl(Duration::from_secs(3))
            .with_retry(0, Duration::from_millis(10))
            .with_refresh_interval(Some(Duration::from_secs(1)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_lock_past_ttl() {
        let memory = Arc::new(InMemoryLock::new());
        let lock: Arc<dyn DistributedLock> = Arc::clone(&memory) as Arc<dyn DistributedLock>;

        let held = HeldLock::acquire(&lock, "c1", &config()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(memory.is_locked("conversation:c1"));

        let contended = HeldLock::acquire(&lock, "c1", &config()).await;
        assert!(matches!(contended, Err(Error::State(_))));

        held.release().await;
        assert!(!memory.is_locked("conversation:c1"));
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let memory = Arc::new(InMemoryLock::new());
        let lock: Arc<dyn DistributedLock> = Arc::clone(&memory) as Arc<dyn DistributedLock>;

        let held = HeldLock::acquire(&lock, "c2", &config()).await.unwrap();
        drop(held);
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(!memory.is_locked("conversation:c2"));
    }
}
