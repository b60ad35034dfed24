//! Run results and the timeline of a run.

use crate::core::{Memory, SharedError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Final status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// One entry of the append-only run timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TimelineEvent {
    RunStart {
        at: DateTime<Utc>,
    },
    NodeStart {
        #[serde(rename = "nodeId")]
        node_id: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    NodeRetry {
        #[serde(rename = "nodeId")]
        node_id: String,
        attempt: u32,
        #[serde(rename = "delayMs")]
        delay_ms: u64,
        error: String,
        at: DateTime<Utc>,
    },
    NodeError {
        #[serde(rename = "nodeId")]
        node_id: String,
        attempt: u32,
        error: String,
        at: DateTime<Utc>,
    },
    NodeComplete {
        #[serde(rename = "nodeId")]
        node_id: String,
        attempt: u32,
        at: DateTime<Utc>,
    },
    RunComplete {
        status: RunStatus,
        at: DateTime<Utc>,
    },
}

impl TimelineEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TimelineEvent::RunStart { at }
            | TimelineEvent::NodeStart { at, .. }
            | TimelineEvent::NodeRetry { at, .. }
            | TimelineEvent::NodeError { at, .. }
            | TimelineEvent::NodeComplete { at, .. }
            | TimelineEvent::RunComplete { at, .. } => *at,
        }
    }

    /// Node the entry refers to, if any.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            TimelineEvent::NodeStart { node_id, .. }
            | TimelineEvent::NodeRetry { node_id, .. }
            | TimelineEvent::NodeError { node_id, .. }
            | TimelineEvent::NodeComplete { node_id, .. } => Some(node_id),
            TimelineEvent::RunStart { .. } | TimelineEvent::RunComplete { .. } => None,
        }
    }

    /// Tag used in the serialized form.
    pub fn kind(&self) -> &'static str {
        match self {
            TimelineEvent::RunStart { .. } => "run_start",
            TimelineEvent::NodeStart { .. } => "node_start",
            TimelineEvent::NodeRetry { .. } => "node_retry",
            TimelineEvent::NodeError { .. } => "node_error",
            TimelineEvent::NodeComplete { .. } => "node_complete",
            TimelineEvent::RunComplete { .. } => "run_complete",
        }
    }
}

/// Outcome of a single [`WorkflowRunner::run`](super::WorkflowRunner::run).
///
/// Node failures are reported here rather than as an `Err` from `run`.
#[derive(Debug, Clone)]
pub struct WorkflowRunResult {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    /// Output of every node that succeeded.
    pub results: HashMap<String, Value>,
    /// Final error of every node that failed or was cancelled.
    pub errors: HashMap<String, SharedError>,
    /// Number of attempts started per node.
    pub attempts: HashMap<String, u32>,
    pub timeline: Vec<TimelineEvent>,
    pub conversation_id: Option<String>,
    /// Memory after the run (chatflow only).
    pub memory: Option<Memory>,
}

impl WorkflowRunResult {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    pub fn result(&self, node_id: &str) -> Option<&Value> {
        self.results.get(node_id)
    }

    pub fn error(&self, node_id: &str) -> Option<&SharedError> {
        self.errors.get(node_id)
    }

    /// Position of the first timeline entry of `kind` for `node_id`.
    pub fn timeline_position(&self, kind: &str, node_id: &str) -> Option<usize> {
        self.timeline
            .iter()
            .position(|event| event.kind() == kind && event.node_id() == Some(node_id))
    }
}
