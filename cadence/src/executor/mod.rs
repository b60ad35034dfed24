//! Workflow execution.
//!
//! - [`WorkflowRunner`]: runs a [`Workflow`](crate::Workflow) as a DAG with
//!   bounded concurrency, per-node retries and fail-fast cancellation
//! - [`NodeContext`]: what a node handler sees on each attempt
//! - [`WorkflowRunResult`]: results, errors, attempt counts and the timeline
//! - [`RunObserver`]: start/complete/retry/error callbacks

mod context;
mod observer;
mod result;
mod runner;

pub use context::NodeContext;
pub use observer::{NoopObserver, RunObserver};
pub use result::{RunStatus, TimelineEvent, WorkflowRunResult};
pub use runner::{
    RunOptions, WorkflowRunner, DEFAULT_CHATFLOW_CONCURRENCY, DEFAULT_CONCURRENCY,
};
