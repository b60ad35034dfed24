//! Cron scheduler interface and the minute-boundary implementation.
//!
//! [`MinuteScheduler`] sleeps until the next minute boundary (or a fixed
//! interval if configured), then evaluates every job against the current
//! time. A job fires at most once per wall-clock minute: its last-fired
//! minute is remembered, so a slow or early tick can never double-fire it.
//! Handlers run concurrently on a `TaskTracker`, which `stop()` drains.

use super::expression::CronExpression;
use crate::core::{panic_message, BoxError, BoxFuture, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::{self, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Async cron job callback.
pub type JobHandler =
    Arc<dyn Fn() -> BoxFuture<std::result::Result<(), BoxError>> + Send + Sync>;

/// Wraps an async closure into a [`JobHandler`].
pub fn job_handler<F, Fut>(handler: F) -> JobHandler
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
{
    Arc::new(move || Box::pin(handler()))
}

/// Pluggable cron scheduler used by the orchestrator.
#[async_trait]
pub trait CronScheduler: Send + Sync {
    /// Starts firing jobs. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Stops firing jobs and waits for running handlers. Idempotent.
    async fn stop(&self) -> Result<()>;

    /// Registers a job. Fails with `InvalidArgument` for a bad expression
    /// and `Conflict` if `id` is taken.
    fn add_job(
        &self,
        id: &str,
        expression: &str,
        handler: JobHandler,
        name: Option<&str>,
    ) -> Result<()>;

    /// Removes a job. Returns false if it was not registered.
    fn remove_job(&self, id: &str) -> bool;

    fn is_job_scheduled(&self, id: &str) -> bool;
}

/// Tick configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fixed tick interval. `None` ticks on every minute boundary.
    pub tick_interval: Option<Duration>,
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = Some(interval);
        self
    }
}

struct CronJob {
    id: String,
    name: Option<String>,
    expression: CronExpression,
    handler: JobHandler,
    /// Minute (seconds since epoch / 60) of the last firing.
    last_fired: Option<i64>,
}

struct SchedulerState {
    jobs: Mutex<HashMap<String, CronJob>>,
    tracker: TaskTracker,
}

struct TickLoop {
    handle: JoinHandle<()>,
    cancellation_token: CancellationToken,
}

/// Fires cron jobs on minute boundaries.
///
/// # Example
///
/// ```no_run
/// use cadence::cron::{job_handler, CronScheduler, MinuteScheduler};
///
/// # async fn example() -> cadence::Result<()> {
/// let scheduler = MinuteScheduler::new();
/// scheduler.add_job(
///     "cleanup",
///     "*/5 * * * *",
///     job_handler(|| async { Ok(()) }),
///     Some("Cleanup"),
/// )?;
/// scheduler.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct MinuteScheduler {
    config: SchedulerConfig,
    state: Arc<SchedulerState>,
    tick_loop: tokio::sync::Mutex<Option<TickLoop>>,
}

impl Default for MinuteScheduler {
    fn default() -> Self {
        Self::with_config(SchedulerConfig::default())
    }
}

impl MinuteScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            config,
            state: Arc::new(SchedulerState {
                jobs: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
            }),
            tick_loop: tokio::sync::Mutex::new(None),
        }
    }

    /// Ids of every registered job, sorted.
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.jobs().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// True while the tick loop is active.
    pub async fn is_running(&self) -> bool {
        self.tick_loop
            .lock()
            .await
            .as_ref()
            .is_some_and(|tick_loop| !tick_loop.handle.is_finished())
    }

    /// Fires every job due at `now` that has not fired this minute.
    ///
    /// This is the body of each tick. Returns the number of handlers
    /// launched; they keep running in the background.
    pub fn fire_due(&self, now: DateTime<Utc>) -> usize {
        self.state.fire_due(now)
    }

    #[cfg(test)]
    pub(crate) async fn wait_for_handlers(&self) {
        self.state.tracker.close();
        self.state.tracker.wait().await;
        self.state.tracker.reopen();
    }
}

impl SchedulerState {
    fn jobs(&self) -> std::sync::MutexGuard<'_, HashMap<String, CronJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire_due(&self, now: DateTime<Utc>) -> usize {
        let minute = now.timestamp().div_euclid(60);
        let due: Vec<(String, JobHandler)> = self
            .jobs()
            .values_mut()
            .filter(|job| job.last_fired != Some(minute) && job.expression.matches(&now))
            .map(|job| {
                job.last_fired = Some(minute);
                let label = job.name.clone().unwrap_or_else(|| job.id.clone());
                (label, Arc::clone(&job.handler))
            })
            .collect();

        let fired = due.len();
        for (label, handler) in due {
            self.tracker.spawn(async move {
                debug!("Cron job {} fired", label);
                let invocation = AssertUnwindSafe(future::lazy(|_| handler()).flatten());
                match invocation.catch_unwind().await {
                    Ok(Ok(())) => debug!("Cron job {} finished", label),
                    Ok(Err(e)) => warn!("Cron job {} failed: {}", label, e),
                    Err(panic) => error!(
                        "Cron job {} panicked: {}",
                        label,
                        panic_message(panic.as_ref())
                    ),
                }
            });
        }
        fired
    }
}

/// Time until the next minute boundary after `now`, and that boundary.
fn next_minute_boundary(now: DateTime<Utc>) -> (Duration, DateTime<Utc>) {
    let into_minute = now.timestamp_millis().rem_euclid(60_000);
    let wait_ms = 60_000 - into_minute;
    (
        Duration::from_millis(wait_ms as u64),
        now + ChronoDuration::milliseconds(wait_ms),
    )
}

async fn tick_loop(state: Arc<SchedulerState>, config: SchedulerConfig, token: CancellationToken) {
    info!("Cron scheduler started");
    loop {
        let (delay, boundary) = match config.tick_interval {
            Some(interval) => (interval, None),
            None => {
                let (delay, boundary) = next_minute_boundary(Utc::now());
                (delay, Some(boundary))
            }
        };

        tokio::select! {
            biased;

            _ = token.cancelled() => break,

            _ = tokio::time::sleep(delay) => {
                // A timer that wakes a hair early must still count as the
                // minute it was aiming for.
                let now = match boundary {
                    Some(boundary) => Utc::now().max(boundary),
                    None => Utc::now(),
                };
                let fired = state.fire_due(now);
                if fired > 0 {
                    debug!("Cron tick at {} fired {} job(s)", now, fired);
                }
            }
        }
    }
    info!("Cron scheduler tick loop stopped");
}

#[async_trait]
impl CronScheduler for MinuteScheduler {
    async fn start(&self) -> Result<()> {
        let mut tick = self.tick_loop.lock().await;
        if tick.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Ok(());
        }

        self.state.tracker.reopen();
        let cancellation_token = CancellationToken::new();
        let handle = tokio::spawn(tick_loop(
            Arc::clone(&self.state),
            self.config,
            cancellation_token.clone(),
        ));
        *tick = Some(TickLoop {
            handle,
            cancellation_token,
        });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let Some(tick) = self.tick_loop.lock().await.take() else {
            return Ok(());
        };
        tick.cancellation_token.cancel();
        if let Err(e) = tick.handle.await {
            error!("Cron tick loop ended abnormally: {}", e);
        }

        let in_flight = self.state.tracker.len();
        if in_flight > 0 {
            info!("Cron scheduler waiting for {} in-flight job(s)", in_flight);
        }
        self.state.tracker.close();
        self.state.tracker.wait().await;
        info!("Cron scheduler stopped");
        Ok(())
    }

    fn add_job(
        &self,
        id: &str,
        expression: &str,
        handler: JobHandler,
        name: Option<&str>,
    ) -> Result<()> {
        let expression = CronExpression::parse(expression)?;
        let mut jobs = self.state.jobs();
        if jobs.contains_key(id) {
            return Err(Error::conflict(format!("cron job '{}' is already scheduled", id)));
        }
        debug!("Scheduling cron job {} ({})", id, expression);
        jobs.insert(
            id.to_string(),
            CronJob {
                id: id.to_string(),
                name: name.map(str::to_string),
                expression,
                handler,
                last_fired: None,
            },
        );
        Ok(())
    }

    fn remove_job(&self, id: &str) -> bool {
        self.state.jobs().remove(id).is_some()
    }

    fn is_job_scheduled(&self, id: &str) -> bool {
        self.state.jobs().contains_key(id)
    }
}

impl fmt::Debug for MinuteScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MinuteScheduler")
            .field("config", &self.config)
            .field("jobs", &self.job_ids())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_job(counter: &Arc<AtomicUsize>) -> JobHandler {
        let counter = Arc::clone(counter);
        job_handler(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[test]
    fn test_next_minute_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 30).unwrap();
        let (delay, boundary) = next_minute_boundary(now);
        assert_eq!(delay, Duration::from_secs(30));
        assert_eq!(boundary, Utc.with_ymd_and_hms(2024, 1, 1, 0, 8, 0).unwrap());

        let on_boundary = Utc.with_ymd_and_hms(2024, 1, 1, 0, 8, 0).unwrap();
        assert_eq!(next_minute_boundary(on_boundary).0, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_fire_due_deduplicates_within_minute() {
        let scheduler = MinuteScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_job("q", "*/15 * * * *", counting_job(&count), None)
            .unwrap();

        let at_15 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 15, 0).unwrap();
        assert_eq!(scheduler.fire_due(at_15), 1);
        assert_eq!(scheduler.fire_due(at_15 + ChronoDuration::seconds(20)), 0);
        assert_eq!(scheduler.fire_due(at_15 + ChronoDuration::minutes(1)), 0);
        assert_eq!(scheduler.fire_due(at_15 + ChronoDuration::minutes(15)), 1);

        scheduler.wait_for_handlers().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_affect_siblings() {
        let scheduler = MinuteScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_job("bad", "* * * * *", job_handler(|| async { Err("nope".into()) }), None)
            .unwrap();
        scheduler
            .add_job("panics", "* * * * *", job_handler(|| async { panic!("boom") }), None)
            .unwrap();
        scheduler
            .add_job("good", "* * * * *", counting_job(&count), Some("Good"))
            .unwrap();

        assert_eq!(scheduler.fire_due(Utc::now()), 3);
        scheduler.wait_for_handlers().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    fn panics_before_future() -> future::Ready<std::result::Result<(), BoxError>> {
        panic!("no future for you")
    }

    #[tokio::test]
    async fn test_job_panicking_before_future_does_not_affect_siblings() {
        let scheduler = MinuteScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .add_job("a", "* * * * *", job_handler(panics_before_future), None)
            .unwrap();
        scheduler
            .add_job("b", "* * * * *", counting_job(&count), None)
            .unwrap();

        let midnight = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(scheduler.fire_due(midnight), 2);
        scheduler.wait_for_handlers().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Later ticks still fire both jobs.
        assert_eq!(scheduler.fire_due(midnight + ChronoDuration::minutes(1)), 2);
        scheduler.wait_for_handlers().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_job_registry() {
        let scheduler = MinuteScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));

        assert!(matches!(
            scheduler.add_job("x", "bad", counting_job(&count), None),
            Err(Error::InvalidArgument(_))
        ));
        scheduler.add_job("x", "* * * * *", counting_job(&count), None).unwrap();
        assert!(matches!(
            scheduler.add_job("x", "* * * * *", counting_job(&count), None),
            Err(Error::Conflict(_))
        ));
        assert!(scheduler.is_job_scheduled("x"));
        assert_eq!(scheduler.job_ids(), vec!["x".to_string()]);
        assert!(scheduler.remove_job("x"));
        assert!(!scheduler.remove_job("x"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks_and_stop_drains() {
        let config = SchedulerConfig::default().with_tick_interval(Duration::from_millis(10));
        let scheduler = MinuteScheduler::with_config(config);
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);
        scheduler
            .add_job(
                "slow",
                "* * * * *",
                job_handler(move || {
                    let done = Arc::clone(&done);
                    async move {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
                None,
            )
            .unwrap();

        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();
        assert!(scheduler.is_running().await);

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.stop().await.unwrap();

        assert!(!scheduler.is_running().await);
        // Ticks fire in wall-clock minutes, so a boundary crossing may add one.
        let fired = finished.load(Ordering::SeqCst);
        assert!((1..=2).contains(&fired));
        assert!(scheduler.state.tracker.is_empty());
        scheduler.stop().await.unwrap();
    }
}
