//! Leader-elected cron scheduling.
//!
//! Every process in a fleet runs a [`LeaderScheduler`], but only the one
//! holding the leader lock runs its inner scheduler. The leader refreshes
//! the lock periodically; a failed refresh demotes it and it goes back to
//! competing for the lock after `retry_delay`.
//!
//! With a lock that cannot be refreshed, the leader steps down and releases
//! the lock before its lease would expire, then competes again like any
//! follower.

use super::scheduler::{CronScheduler, JobHandler};
use crate::core::Result;
use crate::lock::{DistributedLock, LockHandle, LockOptions};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default lock key shared by the fleet.
pub const DEFAULT_LEADER_KEY: &str = "cadence:cron:leader";

/// Leader election settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    pub lock_key: String,
    pub lock_ttl: Duration,
    /// How often the leader extends its lock. Keep below `lock_ttl`.
    pub refresh_interval: Duration,
    /// Pause between acquisition attempts by followers.
    pub retry_delay: Duration,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            lock_key: DEFAULT_LEADER_KEY.to_string(),
            lock_ttl: Duration::from_secs(30),
            refresh_interval: Duration::from_secs(10),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl LeaderConfig {
    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = key.into();
        self
    }

    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

struct Election {
    instance_id: String,
    inner: Arc<dyn CronScheduler>,
    lock: Arc<dyn DistributedLock>,
    config: LeaderConfig,
    is_leader: AtomicBool,
    held: Mutex<Option<LockHandle>>,
    /// When the held lease runs out unless refreshed.
    lease_ends: Mutex<Option<Instant>>,
}

impl Election {
    fn held(&self) -> std::sync::MutexGuard<'_, Option<LockHandle>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One acquisition attempt. On success the inner scheduler is running.
    async fn try_lead(&self) -> bool {
        let options = LockOptions::new(self.config.lock_ttl);
        let handle = match self.lock.acquire(&self.config.lock_key, &options).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                debug!("Instance {} is following; leader lock is held", self.instance_id);
                return false;
            }
            Err(e) => {
                warn!(
                    "Instance {} failed to acquire leader lock: {}",
                    self.instance_id, e
                );
                return false;
            }
        };

        if let Err(e) = self.inner.start().await {
            error!(
                "Instance {} won leadership but scheduler failed to start: {}",
                self.instance_id, e
            );
            self.release(&handle).await;
            return false;
        }

        *self.held() = Some(handle);
        self.extend_lease();
        self.is_leader.store(true, Ordering::SeqCst);
        info!("Instance {} became cron leader", self.instance_id);
        true
    }

    fn lease_ends(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.lease_ends.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn extend_lease(&self) {
        *self.lease_ends() = Some(Instant::now() + self.config.lock_ttl);
    }

    /// Extends the lock. A lock without refresh support is kept only while
    /// its lease outlives the next check.
    async fn keep_leading(&self) -> bool {
        if !self.lock.supports_refresh() {
            let next_check = Instant::now() + self.config.refresh_interval;
            let keep = self.lease_ends().is_some_and(|ends| next_check < ends);
            if !keep {
                info!(
                    "Instance {} leader lease ends before the next check, stepping down",
                    self.instance_id
                );
            }
            return keep;
        }
        let Some(handle) = self.held().clone() else {
            return false;
        };
        match self.lock.refresh(&handle, self.config.lock_ttl).await {
            Ok(true) => {
                self.extend_lease();
                true
            }
            Ok(false) => {
                warn!("Instance {} lost the leader lock", self.instance_id);
                false
            }
            Err(e) => {
                warn!("Instance {} failed to refresh leader lock: {}", self.instance_id, e);
                false
            }
        }
    }

    async fn step_down(&self) {
        let was_leader = self.is_leader.swap(false, Ordering::SeqCst);
        if let Err(e) = self.inner.stop().await {
            error!("Instance {} failed to stop scheduler: {}", self.instance_id, e);
        }
        *self.lease_ends() = None;
        let handle = self.held().take();
        if let Some(handle) = handle {
            self.release(&handle).await;
        }
        if was_leader {
            info!("Instance {} stepped down as cron leader", self.instance_id);
        }
    }

    async fn release(&self, handle: &LockHandle) {
        match self.lock.release(handle).await {
            Ok(true) => {}
            Ok(false) => debug!("Leader lock {} was already gone", handle.key),
            Err(e) => warn!("Failed to release leader lock {}: {}", handle.key, e),
        }
    }
}

async fn election_loop(election: Arc<Election>, mut leading: bool, token: CancellationToken) {
    loop {
        let pause = if leading {
            election.config.refresh_interval
        } else {
            election.config.retry_delay
        };

        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            _ = tokio::time::sleep(pause) => {
                if leading {
                    if !election.keep_leading().await {
                        election.step_down().await;
                        leading = false;
                    }
                } else {
                    leading = election.try_lead().await;
                }
            }
        }
    }
    debug!("Leader election loop for {} stopped", election.instance_id);
}

struct ElectionLoop {
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

/// Runs an inner [`CronScheduler`] only while this process holds the leader
/// lock.
///
/// Job registration is forwarded to the inner scheduler on every instance,
/// so a newly elected leader already knows every job.
pub struct LeaderScheduler {
    election: Arc<Election>,
    election_loop: tokio::sync::Mutex<Option<ElectionLoop>>,
}

impl LeaderScheduler {
    pub fn new(inner: Arc<dyn CronScheduler>, lock: Arc<dyn DistributedLock>) -> Self {
        Self::with_config(inner, lock, LeaderConfig::default())
    }

    pub fn with_config(
        inner: Arc<dyn CronScheduler>,
        lock: Arc<dyn DistributedLock>,
        config: LeaderConfig,
    ) -> Self {
        Self {
            election: Arc::new(Election {
                instance_id: Uuid::new_v4().to_string(),
                inner,
                lock,
                config,
                is_leader: AtomicBool::new(false),
                held: Mutex::new(None),
                lease_ends: Mutex::new(None),
            }),
            election_loop: tokio::sync::Mutex::new(None),
        }
    }

    /// Identifier used in logs for this instance.
    pub fn instance_id(&self) -> &str {
        &self.election.instance_id
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &LeaderConfig {
        &self.election.config
    }
}

#[async_trait]
impl CronScheduler for LeaderScheduler {
    async fn start(&self) -> Result<()> {
        let mut slot = self.election_loop.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let leading = self.election.try_lead().await;
        let cancellation_token = CancellationToken::new();
        let handle = tokio::spawn(election_loop(
            Arc::clone(&self.election),
            leading,
            cancellation_token.clone(),
        ));
        *slot = Some(ElectionLoop {
            handle,
            cancellation_token,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(running) = self.election_loop.lock().await.take() else {
            return Ok(());
        };
        running.cancellation_token.cancel();
        if let Err(e) = running.handle.await {
            error!("Leader election loop ended abnormally: {}", e);
        }
        self.election.step_down().await;
        Ok(())
    }

    fn add_job(
        &self,
        id: &str,
        expression: &str,
        handler: JobHandler,
        name: Option<&str>,
    ) -> Result<()> {
        self.election.inner.add_job(id, expression, handler, name)
    }

    fn remove_job(&self, id: &str) -> bool {
        self.election.inner.remove_job(id)
    }

    fn is_job_scheduled(&self, id: &str) -> bool {
        self.election.inner.is_job_scheduled(id)
    }
}

impl fmt::Debug for LeaderScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderScheduler")
            .field("instance_id", &self.election.instance_id)
            .field("config", &self.election.config)
            .field("is_leader", &self.is_leader())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::{job_handler, MinuteScheduler};
    use crate::lock::InMemoryLock;

    fn config() -> LeaderConfig {
        LeaderConfig::default()
            .with_lock_ttl(Duration::from_secs(3))
            .with_refresh_interval(Duration::from_secs(1))
            .with_retry_delay(Duration::from_secs(2))
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_instance_leads() {
        let lock: Arc<dyn DistributedLock> = Arc::new(InMemoryLock::new());
        let instance = || {
            LeaderScheduler::with_config(
                Arc::new(MinuteScheduler::new()),
                Arc::clone(&lock),
                config(),
            )
        };
        let first = instance();
        let second = instance();

        first.start().await.unwrap();
        second.start().await.unwrap();
        assert!(first.is_leader());
        assert!(!second.is_leader());

        // Refreshes keep the first leader in place well past the TTL.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(first.is_leader());
        assert!(!second.is_leader());

        first.stop().await.unwrap();
        assert!(!first.is_leader());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(second.is_leader());
        second.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_lock_demotes_leader() {
        let lock = Arc::new(InMemoryLock::new());
        let leader = LeaderScheduler::with_config(
            Arc::new(MinuteScheduler::new()),
            Arc::clone(&lock) as Arc<dyn DistributedLock>,
            config(),
        );
        leader.start().await.unwrap();
        assert!(leader.is_leader());

        // Steal the lock out from under the leader.
        let handle = leader.election.held().clone().unwrap();
        assert!(lock.release(&handle).await.unwrap());
        let thief = lock
            .acquire(DEFAULT_LEADER_KEY, &LockOptions::new(Duration::from_secs(60)))
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!leader.is_leader());

        lock.release(&thief).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(leader.is_leader());
        leader.stop().await.unwrap();
    }

    /// Shares an [`InMemoryLock`] but cannot extend a lease.
    struct FixedLease(Arc<InMemoryLock>);

    #[async_trait]
    impl DistributedLock for FixedLease {
        async fn acquire(&self, key: &str, options: &LockOptions) -> Result<Option<LockHandle>> {
            self.0.acquire(key, options).await
        }

        async fn release(&self, handle: &LockHandle) -> Result<bool> {
            self.0.release(handle).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_lease_never_has_two_leaders() {
        let shared = Arc::new(InMemoryLock::new());
        let instances: Vec<LeaderScheduler> = (0..2)
            .map(|_| {
                LeaderScheduler::new(
                    Arc::new(MinuteScheduler::new()),
                    Arc::new(FixedLease(Arc::clone(&shared))),
                )
            })
            .collect();

        for instance in &instances {
            instance.start().await.unwrap();
        }
        assert!(instances[0].is_leader());
        assert!(!instances[1].is_leader());

        // Sample well past several 30s leases.
        let mut leaders_seen = 0;
        for _ in 0..120 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let leading = instances.iter().filter(|i| i.is_leader()).count();
            assert!(leading <= 1, "two instances lead at once");
            leaders_seen += leading;
        }
        assert!(leaders_seen > 0);

        for instance in &instances {
            instance.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_jobs_forward_to_inner_scheduler() {
        let inner = Arc::new(MinuteScheduler::new());
        let leader = LeaderScheduler::new(
            Arc::clone(&inner) as Arc<dyn CronScheduler>,
            Arc::new(InMemoryLock::new()),
        );

        leader
            .add_job("nightly", "0 2 * * *", job_handler(|| async { Ok(()) }), None)
            .unwrap();
        assert!(inner.is_job_scheduled("nightly"));
        assert!(leader.is_job_scheduled("nightly"));
        assert!(leader.remove_job("nightly"));
        assert!(!inner.is_job_scheduled("nightly"));
    }
}
