//! Callbacks invoked while a run progresses.

use serde_json::Value;
use std::time::Duration;

/// Receives per-node lifecycle callbacks during a run.
///
/// Every method has an empty default so implementations only override what
/// they care about. Callbacks run on the node's task and must not block.
pub trait RunObserver: Send + Sync {
    /// An attempt is about to invoke the handler.
    fn on_node_start(&self, run_id: &str, node_id: &str, attempt: u32) {
        let _ = (run_id, node_id, attempt);
    }

    /// The handler succeeded.
    fn on_node_complete(&self, run_id: &str, node_id: &str, attempt: u32, output: &Value) {
        let _ = (run_id, node_id, attempt, output);
    }

    /// The handler failed and will be retried after `delay`.
    fn on_node_retry(
        &self,
        run_id: &str,
        node_id: &str,
        attempt: u32,
        delay: Duration,
        error: &(dyn std::error::Error + Send + Sync),
    ) {
        let _ = (run_id, node_id, attempt, delay, error);
    }

    /// The node failed permanently.
    fn on_node_error(
        &self,
        run_id: &str,
        node_id: &str,
        attempt: u32,
        error: &(dyn std::error::Error + Send + Sync),
    ) {
        let _ = (run_id, node_id, attempt, error);
    }
}

/// An observer that ignores every callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl RunObserver for NoopObserver {}
