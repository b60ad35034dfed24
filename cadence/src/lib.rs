//! Cadence: dependency-ordered workflow execution with event triggers,
//! cron scheduling and conversation memory.
//!
//! A [`Workflow`] is a set of async [`Node`]s connected by dependencies.
//! The [`WorkflowRunner`] executes it as a DAG: independent nodes run
//! concurrently up to a bound, failed nodes are retried with exponential
//! backoff, and with fail-fast a failure cancels the rest of the run.
//!
//! The [`Orchestrator`] sits on top and decides *when* workflows run:
//! on matching [`Event`]s pulled from a queue, on cron schedules, or on
//! demand. Chatflows carry memory between runs of the same conversation,
//! serialized per conversation id.
//!
//! # Quick Start
//!
//! ```no_run
//! use cadence::prelude::*;
//! use serde_json::{json, Value};
//!
//! #[tokio::main]
//! async fn main() -> cadence::Result<()> {
//!     let workflow = Workflow::new("report", "Nightly report")
//!         .with_node(Node::new("fetch", |_ctx| async { Ok(json!([1, 2, 3])) }))?
//!         .with_node(
//!             Node::new("sum", |ctx: NodeContext| async move {
//!                 let rows = ctx.get_result("fetch").unwrap_or(Value::Null);
//!                 let total: i64 = rows
//!                     .as_array()
//!                     .into_iter()
//!                     .flatten()
//!                     .filter_map(Value::as_i64)
//!                     .sum();
//!                 Ok(json!(total))
//!             })
//!             .depends_on(["fetch"]),
//!         )?;
//!
//!     let result = WorkflowRunner::new().run(&workflow, RunOptions::new()).await?;
//!     assert_eq!(result.result("sum"), Some(&json!(6)));
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`core`]: errors, retry policy and shared aliases
//! - [`graph`]: workflow definitions and execution planning
//! - [`executor`]: the DAG runner
//! - [`events`]: events, matchers, queues and the dispatcher
//! - [`cron`]: cron expressions, the minute scheduler and leader election
//! - [`lock`]: distributed lock abstraction
//! - [`storage`]: conversation and run stores
//! - [`orchestrator`]: triggers, the drain loop and conversation handling

pub mod core;
pub mod cron;
pub mod events;
pub mod executor;
pub mod graph;
pub mod lock;
pub mod orchestrator;
pub mod storage;

pub use core::{BoxError, Error, Memory, Result, RetryPolicy, SharedError};

pub use cron::{
    CronExpression, CronScheduler, LeaderConfig, LeaderScheduler, MinuteScheduler,
    SchedulerConfig,
};

pub use events::{
    DispatchReport, Event, EventDispatcher, EventMatcher, EventQueue, InMemoryEventQueue,
    SubscribeOptions,
};

pub use executor::{
    NodeContext, RunObserver, RunOptions, RunStatus, TimelineEvent, WorkflowRunResult,
    WorkflowRunner,
};

pub use graph::{ExecutionPlan, Node, Workflow, WorkflowType};

pub use lock::{DistributedLock, InMemoryLock, LockHandle, LockOptions};

pub use orchestrator::{
    AckPolicy, EventTrigger, Orchestrator, OrchestratorBuilder, OrchestratorConfig,
    OrchestratorMode, Trigger,
};

pub use storage::{
    ConversationStore, DeltaConversationStore, InMemoryConversationStore, InMemoryRunStore,
    RunRecord, RunStore, StorageError,
};

// Re-exported so callers build payloads with the same serde_json version.
pub use serde_json;
pub use tokio;

/// Prelude module for convenient glob imports
///
/// # Example
///
/// ```
/// use cadence::prelude::*;
/// ```
pub mod prelude {
    pub use crate::core::{BoxError, Error, Memory, Result, RetryPolicy};
    pub use crate::cron::{CronExpression, CronScheduler, MinuteScheduler};
    pub use crate::events::{Event, EventMatcher, EventQueue, InMemoryEventQueue};
    pub use crate::executor::{NodeContext, RunOptions, WorkflowRunResult, WorkflowRunner};
    pub use crate::graph::{Node, Workflow};
    pub use crate::lock::{DistributedLock, InMemoryLock};
    pub use crate::orchestrator::{
        EventTrigger, Orchestrator, OrchestratorConfig, OrchestratorMode, Trigger,
    };
    pub use crate::storage::{ConversationStore, InMemoryConversationStore, RunStore};

    pub use std::sync::Arc;
}
