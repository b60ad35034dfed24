use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by an orchestrator.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub(crate) events_published: AtomicU64,
    pub(crate) events_processed: AtomicU64,
    pub(crate) events_acked: AtomicU64,
    pub(crate) events_nacked: AtomicU64,
    pub(crate) ack_errors: AtomicU64,
    pub(crate) dispatch_errors: AtomicU64,
    pub(crate) workflow_runs_started: AtomicU64,
    pub(crate) workflow_runs_succeeded: AtomicU64,
    pub(crate) workflow_runs_failed: AtomicU64,
    pub(crate) cron_firings: AtomicU64,
    pub(crate) run_store_errors: AtomicU64,
}

impl Metrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            events_published: read(&self.events_published),
            events_processed: read(&self.events_processed),
            events_acked: read(&self.events_acked),
            events_nacked: read(&self.events_nacked),
            ack_errors: read(&self.ack_errors),
            dispatch_errors: read(&self.dispatch_errors),
            workflow_runs_started: read(&self.workflow_runs_started),
            workflow_runs_succeeded: read(&self.workflow_runs_succeeded),
            workflow_runs_failed: read(&self.workflow_runs_failed),
            cron_firings: read(&self.cron_firings),
            run_store_errors: read(&self.run_store_errors),
        }
    }
}

/// Point-in-time copy of the orchestrator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_acked: u64,
    pub events_nacked: u64,
    /// Ack or nack callbacks that failed.
    pub ack_errors: u64,
    /// Subscriber failures.
    pub dispatch_errors: u64,
    pub workflow_runs_started: u64,
    pub workflow_runs_succeeded: u64,
    /// Runs that failed or could not start.
    pub workflow_runs_failed: u64,
    pub cron_firings: u64,
    pub run_store_errors: u64,
}
