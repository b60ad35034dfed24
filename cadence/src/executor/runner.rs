//! Workflow Runner - bounded-concurrency DAG execution.
//!
//! # How It Works
//!
//! 1. The dependency graph is built and planned up front, so a missing
//!    dependency or a cycle is reported before any handler runs
//! 2. Nodes with no dependencies seed the ready queue
//! 3. Up to `concurrency` ready nodes run at once on a `JoinSet`
//! 4. Each completion decrements the in-degree of its dependents; those
//!    reaching zero join the ready queue
//! 5. With fail-fast on, the first permanent failure cancels the run token:
//!    in-flight nodes unwind with a cancellation error and nothing new
//!    is scheduled
//!
//! Each node runs its own retry state machine
//! (`pending → running → {succeeded | retry-wait → running | failed}`),
//! driven by the node's [`RetryPolicy`](crate::RetryPolicy).

use super::context::{NodeContext, SharedMemory};
use super::observer::RunObserver;
use super::result::{RunStatus, TimelineEvent, WorkflowRunResult};
use crate::core::{panic_message, Error, Memory, Result, SharedError};
use crate::graph::{Node, Workflow};
use chrono::Utc;
use futures::future::{self, FutureExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default number of nodes running at once for a plain workflow.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Chatflows run one node at a time unless told otherwise.
pub const DEFAULT_CHATFLOW_CONCURRENCY: usize = 1;

/// Options for a single run.
///
/// Every field is optional so that options registered with a workflow can be
/// layered under per-call options with [`RunOptions::merged_over`].
#[derive(Clone, Default)]
pub struct RunOptions {
    pub run_id: Option<String>,
    pub input: Option<Value>,
    pub context: Option<Value>,
    pub concurrency: Option<usize>,
    /// Cancel the run on the first permanent node failure. Default: true.
    pub fail_fast: Option<bool>,
    /// Required for chatflows.
    pub conversation_id: Option<String>,
    /// Initial memory for a chatflow run.
    pub memory: Option<Memory>,
    pub observer: Option<Arc<dyn RunObserver>>,
    /// Parent token; cancelling it aborts the run.
    pub cancellation: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = Some(fail_fast);
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Fills every unset field from `defaults`.
    pub fn merged_over(self, defaults: &RunOptions) -> RunOptions {
        RunOptions {
            run_id: self.run_id.or_else(|| defaults.run_id.clone()),
            input: self.input.or_else(|| defaults.input.clone()),
            context: self.context.or_else(|| defaults.context.clone()),
            concurrency: self.concurrency.or(defaults.concurrency),
            fail_fast: self.fail_fast.or(defaults.fail_fast),
            conversation_id: self
                .conversation_id
                .or_else(|| defaults.conversation_id.clone()),
            memory: self.memory.or_else(|| defaults.memory.clone()),
            observer: self.observer.or_else(|| defaults.observer.clone()),
            cancellation: self.cancellation.or_else(|| defaults.cancellation.clone()),
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("run_id", &self.run_id)
            .field("input", &self.input)
            .field("context", &self.context)
            .field("concurrency", &self.concurrency)
            .field("fail_fast", &self.fail_fast)
            .field("conversation_id", &self.conversation_id)
            .field("memory", &self.memory)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

/// Executes workflows. Stateless apart from its defaults, so one runner can
/// serve any number of concurrent runs.
#[derive(Debug, Clone)]
pub struct WorkflowRunner {
    default_concurrency: usize,
    chatflow_concurrency: usize,
}

impl Default for WorkflowRunner {
    fn default() -> Self {
        Self {
            default_concurrency: DEFAULT_CONCURRENCY,
            chatflow_concurrency: DEFAULT_CHATFLOW_CONCURRENCY,
        }
    }
}

type NodeResult = std::result::Result<Value, SharedError>;

impl WorkflowRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency.max(1);
        self
    }

    pub fn with_chatflow_concurrency(mut self, concurrency: usize) -> Self {
        self.chatflow_concurrency = concurrency.max(1);
        self
    }

    /// Runs `workflow` to completion.
    ///
    /// Validation failures (missing dependency, cycle, missing conversation
    /// id) are returned as `Err` before any node starts. Node failures are
    /// reported through the result's `status` and `errors`.
    pub async fn run(&self, workflow: &Workflow, options: RunOptions) -> Result<WorkflowRunResult> {
        let graph = workflow.dependency_graph()?;

        let conversation_id = match options.conversation_id {
            Some(id) if !id.is_empty() => Some(id),
            _ if workflow.is_chatflow() => {
                return Err(Error::invalid_argument(format!(
                    "chatflow '{}' requires a non-empty conversation id",
                    workflow.id()
                )));
            }
            _ => None,
        };

        // Proactive cycle check; the post-hoc guard below stays as a backstop.
        graph.plan()?;

        let concurrency = options
            .concurrency
            .unwrap_or(if workflow.is_chatflow() {
                self.chatflow_concurrency
            } else {
                self.default_concurrency
            })
            .max(1);
        let fail_fast = options.fail_fast.unwrap_or(true);
        let run_id = options
            .run_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancellation = options
            .cancellation
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let memory: Option<SharedMemory> = workflow
            .is_chatflow()
            .then(|| Arc::new(Mutex::new(options.memory.unwrap_or_default())));

        let state = Arc::new(RunState {
            workflow_id: Arc::from(workflow.id()),
            run_id: Arc::from(run_id.as_str()),
            input: Arc::new(options.input.unwrap_or(Value::Null)),
            context: Arc::new(options.context.unwrap_or(Value::Null)),
            conversation_id: conversation_id.as_deref().map(Arc::from),
            results: Arc::new(Mutex::new(HashMap::new())),
            attempts: Mutex::new(HashMap::new()),
            timeline: Mutex::new(Vec::new()),
            memory,
            observer: options.observer,
            cancellation,
        });

        let started_at = Utc::now();
        let clock = Instant::now();
        state.record(TimelineEvent::RunStart { at: started_at });
        info!(
            "Starting run {} of workflow {} ({} nodes, concurrency {})",
            run_id,
            workflow.id(),
            workflow.len(),
            concurrency
        );

        let mut in_degrees = graph.in_degrees();
        let mut ready: VecDeque<String> = graph.roots().into();
        let mut in_flight: JoinSet<(String, NodeResult)> = JoinSet::new();
        let mut errors: HashMap<String, SharedError> = HashMap::new();
        let mut lost_tasks = 0usize;
        let mut completed = 0usize;

        loop {
            while in_flight.len() < concurrency && !state.cancellation.is_cancelled() {
                let Some(id) = ready.pop_front() else {
                    break;
                };
                let Some(node) = workflow.node(&id).cloned() else {
                    continue;
                };
                let task_state = Arc::clone(&state);
                let guard_state = Arc::clone(&state);
                in_flight.spawn(
                    AssertUnwindSafe(execute_node(task_state, node))
                        .catch_unwind()
                        .map(move |outcome| {
                            let result = match outcome {
                                Ok(result) => result,
                                Err(panic) => Err(guard_state
                                    .node_panicked(&id, panic_message(panic.as_ref()))),
                            };
                            (id, result)
                        }),
                );
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };

            match joined {
                Ok((id, Ok(_))) => {
                    completed += 1;
                    for dependent in graph.successors(&id) {
                        if let Some(degree) = in_degrees.get_mut(dependent) {
                            *degree -= 1;
                            if *degree == 0 {
                                ready.push_back(dependent.clone());
                            }
                        }
                    }
                }
                Ok((id, Err(error))) => {
                    debug!("Node {} of run {} failed: {}", id, run_id, error);
                    errors.insert(id, error);
                    if fail_fast && !state.cancellation.is_cancelled() {
                        info!("Run {} failing fast, cancelling in-flight nodes", run_id);
                        state.cancellation.cancel();
                    }
                }
                Err(join_error) => {
                    error!("Node task of run {} was lost: {}", run_id, join_error);
                    lost_tasks += 1;
                    if fail_fast {
                        state.cancellation.cancel();
                    }
                }
            }
        }

        let status = if errors.is_empty() && lost_tasks == 0 && !state.cancellation.is_cancelled()
        {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };

        if status == RunStatus::Succeeded && completed < workflow.len() {
            let unresolved = graph
                .node_ids()
                .filter(|id| in_degrees.get(*id).copied().unwrap_or(0) > 0)
                .map(str::to_string)
                .collect();
            return Err(Error::cyclic(workflow.id(), unresolved));
        }

        let finished_at = Utc::now();
        state.record(TimelineEvent::RunComplete {
            status,
            at: finished_at,
        });
        info!(
            "Run {} of workflow {} {} in {:?} ({} completed, {} failed)",
            run_id,
            workflow.id(),
            status,
            clock.elapsed(),
            completed,
            errors.len()
        );

        let result = WorkflowRunResult {
            run_id,
            workflow_id: workflow.id().to_string(),
            status,
            started_at,
            finished_at,
            duration: clock.elapsed(),
            results: state.results.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            errors,
            attempts: state.attempts.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            timeline: state.timeline.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            conversation_id,
            memory: state.snapshot_memory(),
        };
        Ok(result)
    }
}

/// State shared by every node task of one run.
struct RunState {
    workflow_id: Arc<str>,
    run_id: Arc<str>,
    input: Arc<Value>,
    context: Arc<Value>,
    conversation_id: Option<Arc<str>>,
    results: Arc<Mutex<HashMap<String, Value>>>,
    attempts: Mutex<HashMap<String, u32>>,
    timeline: Mutex<Vec<TimelineEvent>>,
    memory: Option<SharedMemory>,
    observer: Option<Arc<dyn RunObserver>>,
    cancellation: CancellationToken,
}

impl RunState {
    fn record(&self, event: TimelineEvent) {
        self.timeline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn context_for(&self, node_id: &Arc<str>, attempt: u32) -> NodeContext {
        NodeContext::new(
            Arc::clone(&self.workflow_id),
            Arc::clone(&self.run_id),
            Arc::clone(node_id),
            attempt,
            Arc::clone(&self.input),
            Arc::clone(&self.context),
            self.conversation_id.clone(),
            Arc::clone(&self.results),
            self.memory.clone(),
            self.cancellation.clone(),
        )
    }

    fn snapshot_memory(&self) -> Option<Memory> {
        self.memory
            .as_ref()
            .map(|memory| memory.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn cancelled_error(&self, node_id: &str) -> SharedError {
        Arc::new(Error::cancelled(format!(
            "run {} aborted while node '{}' was pending",
            self.run_id, node_id
        )))
    }

    /// Turns a panic that escaped the node's retry loop into its error.
    fn node_panicked(&self, node_id: &str, message: String) -> SharedError {
        let error: SharedError = Arc::new(Error::runtime(format!(
            "node '{}' panicked: {}",
            node_id, message
        )));
        let attempt = self
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .copied()
            .unwrap_or(1);
        self.record_node_error(node_id, attempt, &error);
        error
    }

    fn record_node_error(&self, node_id: &str, attempt: u32, error: &SharedError) {
        self.record(TimelineEvent::NodeError {
            node_id: node_id.to_string(),
            attempt,
            error: error.to_string(),
            at: Utc::now(),
        });
    }
}

fn is_cancellation(error: &SharedError) -> bool {
    error
        .downcast_ref::<Error>()
        .is_some_and(Error::is_cancellation)
}

/// Runs one node through its retry state machine.
async fn execute_node(state: Arc<RunState>, node: Node) -> NodeResult {
    let node_id: Arc<str> = Arc::from(node.id());
    let policy = *node.retry_policy();
    let handler = node.handler();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        if state.cancellation.is_cancelled() {
            let error = state.cancelled_error(&node_id);
            state.record_node_error(&node_id, attempt, &error);
            return Err(error);
        }

        state
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.to_string(), attempt);
        state.record(TimelineEvent::NodeStart {
            node_id: node_id.to_string(),
            attempt,
            at: Utc::now(),
        });
        if let Some(observer) = &state.observer {
            observer.on_node_start(&state.run_id, &node_id, attempt);
        }

        // The handler runs inside the guard so a panic before it returns a
        // future is caught like one raised while polling it.
        let context = state.context_for(&node_id, attempt);
        let invocation =
            AssertUnwindSafe(future::lazy(|_| handler(context)).flatten()).catch_unwind();
        let outcome: NodeResult = tokio::select! {
            biased;

            _ = state.cancellation.cancelled() => Err(state.cancelled_error(&node_id)),

            outcome = invocation => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(SharedError::from(error)),
                Err(panic) => Err(Arc::new(Error::runtime(format!(
                    "node '{}' panicked: {}",
                    node_id,
                    panic_message(panic.as_ref())
                )))),
            },
        };

        let error = match outcome {
            Ok(value) => {
                state
                    .results
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(node_id.to_string(), value.clone());
                state.record(TimelineEvent::NodeComplete {
                    node_id: node_id.to_string(),
                    attempt,
                    at: Utc::now(),
                });
                if let Some(observer) = &state.observer {
                    observer.on_node_complete(&state.run_id, &node_id, attempt, &value);
                }
                debug!("Node {} completed on attempt {}", node_id, attempt);
                return Ok(value);
            }
            Err(error) => error,
        };

        if state.cancellation.is_cancelled() || is_cancellation(&error) {
            state.record_node_error(&node_id, attempt, &error);
            return Err(error);
        }

        if !policy.should_retry(attempt) {
            state.record_node_error(&node_id, attempt, &error);
            if let Some(observer) = &state.observer {
                observer.on_node_error(&state.run_id, &node_id, attempt, error.as_ref());
            }
            warn!(
                "Node {} failed after {} attempt(s): {}",
                node_id, attempt, error
            );
            return Err(error);
        }

        let delay = policy.delay_for_attempt(attempt);
        state.record(TimelineEvent::NodeRetry {
            node_id: node_id.to_string(),
            attempt,
            delay_ms: delay.as_millis().min(u64::MAX as u128) as u64,
            error: error.to_string(),
            at: Utc::now(),
        });
        if let Some(observer) = &state.observer {
            observer.on_node_retry(&state.run_id, &node_id, attempt, delay, error.as_ref());
        }
        warn!(
            "Node {} attempt {}/{} failed: {}. Retrying in {:?}",
            node_id, attempt, policy.max_attempts, error, delay
        );

        tokio::select! {
            biased;

            _ = state.cancellation.cancelled() => {
                let error = state.cancelled_error(&node_id);
                state.record_node_error(&node_id, attempt, &error);
                return Err(error);
            }

            _ = tokio::time::sleep(delay) => {}
        }
    }
}
