//! Serializable run records.

use crate::core::{Error, Memory};
use crate::executor::{RunStatus, TimelineEvent, WorkflowRunResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error as StdError;

/// Deepest cause chain kept in an [`ErrorRecord`].
const MAX_CAUSE_DEPTH: usize = 16;

/// A node failure flattened into plain data.
///
/// `name` is the error kind for engine errors (`"RuntimeError"`,
/// `"CancellationError"`, ...) and `"Error"` for anything else. Rust errors
/// carry no stack trace, so `stack` holds the debug representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorRecord>>,
}

impl ErrorRecord {
    pub fn from_error(error: &(dyn StdError + 'static)) -> Self {
        Self::build(error, 0)
    }

    fn build(error: &(dyn StdError + 'static), depth: usize) -> Self {
        let name = match error.downcast_ref::<Error>() {
            Some(engine) => engine.kind_name().to_string(),
            None => "Error".to_string(),
        };
        let cause = match error.source() {
            Some(source) if depth < MAX_CAUSE_DEPTH => {
                Some(Box::new(Self::build(source, depth + 1)))
            }
            _ => None,
        };
        Self {
            name,
            message: error.to_string(),
            stack: Some(format!("{:?}", error)),
            cause,
        }
    }
}

/// The persisted form of a [`WorkflowRunResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: HashMap<String, Value>,
    pub errors: HashMap<String, ErrorRecord>,
    pub attempts: HashMap<String, u32>,
    pub timeline: Vec<TimelineEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Memory>,
}

impl RunRecord {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

impl From<&WorkflowRunResult> for RunRecord {
    fn from(result: &WorkflowRunResult) -> Self {
        let errors = result
            .errors
            .iter()
            .map(|(node_id, error)| {
                let error: &(dyn StdError + 'static) = &**error;
                (node_id.clone(), ErrorRecord::from_error(error))
            })
            .collect();

        Self {
            run_id: result.run_id.clone(),
            workflow_id: result.workflow_id.clone(),
            status: result.status,
            started_at: result.started_at,
            finished_at: result.finished_at,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            results: result.results.clone(),
            errors,
            attempts: result.attempts.clone(),
            timeline: result.timeline.clone(),
            conversation_id: result.conversation_id.clone(),
            memory: result.memory.clone(),
        }
    }
}

/// Query for [`RunStore::list`](super::RunStore::list). Unset fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunFilter {
    pub workflow_id: Option<String>,
    pub status: Option<RunStatus>,
    pub conversation_id: Option<String>,
    pub limit: Option<usize>,
}

impl RunFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True if `record` passes every set criterion. `limit` is not checked
    /// here.
    pub fn matches(&self, record: &RunRecord) -> bool {
        self.workflow_id
            .as_deref()
            .map_or(true, |id| record.workflow_id == id)
            && self.status.map_or(true, |status| record.status == status)
            && self
                .conversation_id
                .as_deref()
                .map_or(true, |id| record.conversation_id.as_deref() == Some(id))
    }
}
