//! The orchestrator: event intake, dispatch, triggers, cron and
//! conversation-scoped execution on top of the [`WorkflowRunner`].
//!
//! # Flow
//!
//! 1. `publish` enqueues an event and kicks the drain loop
//! 2. the drain loop pulls up to `max_concurrent_events` events at a time
//! 3. each event is dispatched to subscribers, then every workflow whose
//!    trigger accepts it runs (at most `workflow_concurrency` at once)
//! 4. the event is acked or nacked according to the [`AckPolicy`]
//!
//! Chatflow runs are serialized per conversation id: first by an in-process
//! gate, then by the optional [`DistributedLock`]. Memory is loaded from the
//! [`ConversationStore`] before the run and written back after it.
//!
//! # Example
//!
//! ```no_run
//! use cadence::prelude::*;
//! use serde_json::json;
//!
//! # async fn example() -> cadence::Result<()> {
//! let orchestrator = Orchestrator::new();
//!
//! let workflow = Workflow::new("welcome", "Send welcome mail")
//!     .with_node(Node::new("send", |ctx| async move { Ok(ctx.input().clone()) }))?;
//! orchestrator.register_workflow(workflow, Trigger::on("user.created"), RunOptions::new())?;
//!
//! orchestrator.start().await?;
//! orchestrator.publish(Event::new("user.created", json!({"id": 1}))?).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod conversation;
mod index;
mod metrics;
mod registry;
mod trigger;

pub use config::{AckPolicy, ConversationLockConfig, OrchestratorConfig, OrchestratorMode};
pub use metrics::MetricsSnapshot;
pub use registry::RegisteredWorkflow;
pub use trigger::{EventMapper, EventTrigger, Trigger, TriggerFilter};

use crate::core::{panic_message, BoxError, Error, KeyedGate, Result, SharedError};
use crate::cron::{job_handler, CronScheduler};
use crate::events::{
    DispatchReport, Delivery, Event, EventDispatcher, EventMatcher, EventQueue, InMemoryEventQueue,
    SubscribeOptions,
};
use crate::executor::{RunOptions, WorkflowRunResult, WorkflowRunner};
use crate::graph::Workflow;
use crate::lock::DistributedLock;
use crate::storage::{ConversationStore, RunRecord, RunStore};
use conversation::HeldLock;
use futures::future::{self, FutureExt};
use futures::stream::{self, StreamExt};
use metrics::Metrics;
use registry::Registry;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Called when a triggered or cron run fails. Errors it returns are logged
/// and dropped.
pub type WorkflowErrorHandler =
    Arc<dyn Fn(&WorkflowFailure) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Called when the run store rejects a record. With a handler installed the
/// failure no longer reaches the caller.
pub type RunStoreErrorHandler =
    Arc<dyn Fn(&Error, &RunRecord) -> std::result::Result<(), BoxError> + Send + Sync>;

/// What started a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunSource {
    Manual,
    Event { event_id: String, event_type: String },
    Cron { job_id: String },
}

impl RunSource {
    fn event(event: &Event) -> Self {
        RunSource::Event {
            event_id: event.id().to_string(),
            event_type: event.event_type().to_string(),
        }
    }
}

/// A failed run reported to the workflow error handler.
#[derive(Debug, Clone)]
pub struct WorkflowFailure {
    pub workflow_id: String,
    pub source: RunSource,
    pub error: SharedError,
    /// Present when the run executed and finished with status failed.
    pub result: Option<WorkflowRunResult>,
}

/// Result of processing one event.
#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub event_id: String,
    pub dispatch: DispatchReport,
    pub runs: Vec<WorkflowRunResult>,
    /// Runs that failed or could not start.
    pub workflow_failures: usize,
}

impl EventOutcome {
    pub fn is_success(&self) -> bool {
        self.dispatch.is_success() && self.workflow_failures == 0
    }

    fn nack_reason(&self) -> String {
        format!(
            "{} dispatch error(s), {} workflow failure(s)",
            self.dispatch.errors.len(),
            self.workflow_failures
        )
    }
}

/// Builder for [`Orchestrator`].
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    runner: Option<WorkflowRunner>,
    queue: Option<Arc<dyn EventQueue>>,
    scheduler: Option<Arc<dyn CronScheduler>>,
    lock: Option<Arc<dyn DistributedLock>>,
    conversation_store: Option<Arc<dyn ConversationStore>>,
    run_store: Option<Arc<dyn RunStore>>,
    on_workflow_error: Option<WorkflowErrorHandler>,
    on_run_store_error: Option<RunStoreErrorHandler>,
}

impl OrchestratorBuilder {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_runner(mut self, runner: WorkflowRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Defaults to an [`InMemoryEventQueue`].
    pub fn with_queue(mut self, queue: Arc<dyn EventQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn CronScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Lock used to serialize chatflow conversations across processes.
    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_conversation_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.conversation_store = Some(store);
        self
    }

    pub fn with_run_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.run_store = Some(store);
        self
    }

    pub fn on_workflow_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&WorkflowFailure) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_workflow_error = Some(Arc::new(handler));
        self
    }

    pub fn on_run_store_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error, &RunRecord) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.on_run_store_error = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            inner: Arc::new(Inner {
                config: self.config,
                runner: self.runner.unwrap_or_default(),
                queue: self
                    .queue
                    .unwrap_or_else(|| Arc::new(InMemoryEventQueue::new())),
                dispatcher: EventDispatcher::new(),
                registry: RwLock::new(Registry::default()),
                scheduler: self.scheduler,
                lock: self.lock,
                conversation_store: self.conversation_store,
                run_store: self.run_store,
                on_workflow_error: self.on_workflow_error,
                on_run_store_error: self.on_run_store_error,
                conversations: KeyedGate::default(),
                metrics: Metrics::default(),
                running: AtomicBool::new(false),
                kick_pending: AtomicBool::new(false),
                drain_lock: tokio::sync::Mutex::new(()),
                lifecycle: tokio::sync::Mutex::new(()),
                tasks: TaskTracker::new(),
            }),
        }
    }
}

struct Inner {
    config: OrchestratorConfig,
    runner: WorkflowRunner,
    queue: Arc<dyn EventQueue>,
    dispatcher: EventDispatcher,
    registry: RwLock<Registry>,
    scheduler: Option<Arc<dyn CronScheduler>>,
    lock: Option<Arc<dyn DistributedLock>>,
    conversation_store: Option<Arc<dyn ConversationStore>>,
    run_store: Option<Arc<dyn RunStore>>,
    on_workflow_error: Option<WorkflowErrorHandler>,
    on_run_store_error: Option<RunStoreErrorHandler>,
    conversations: KeyedGate,
    metrics: Metrics,
    running: AtomicBool,
    /// Set by every kick; cleared by the drain loop before each pass.
    kick_pending: AtomicBool,
    /// Held by whichever drain loop is active.
    drain_lock: tokio::sync::Mutex<()>,
    lifecycle: tokio::sync::Mutex<()>,
    tasks: TaskTracker,
}

/// Event-driven and cron-driven workflow execution surface.
///
/// Cheap to share: wrap it in an `Arc` or call methods through a reference.
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    /// An orchestrator with default config and an in-memory queue.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn mode(&self) -> OrchestratorMode {
        self.inner.config.mode
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.inner.dispatcher
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn queue_size(&self) -> Result<usize> {
        self.inner.queue.size().await
    }

    // ===== Workflow registry =====

    /// Registers a workflow with its trigger and default run options.
    ///
    /// The dependency graph is validated here. `options.run_id` only
    /// applies to manual runs.
    pub fn register_workflow(
        &self,
        workflow: Workflow,
        trigger: impl Into<Trigger>,
        options: RunOptions,
    ) -> Result<()> {
        workflow.execution_plan()?;
        let trigger = trigger.into();
        debug!("Registering workflow {} ({:?})", workflow.id(), trigger);
        self.inner.registry_mut().insert(RegisteredWorkflow {
            workflow: Arc::new(workflow),
            trigger,
            options,
        })
    }

    pub fn unregister_workflow(&self, workflow_id: &str) -> bool {
        self.inner.registry_mut().remove(workflow_id)
    }

    pub fn has_workflow(&self, workflow_id: &str) -> bool {
        self.inner.registry().contains(workflow_id)
    }

    /// Registered workflow ids, sorted.
    pub fn workflow_ids(&self) -> Vec<String> {
        self.inner.registry().ids()
    }

    pub fn registered_workflow(&self, workflow_id: &str) -> Option<RegisteredWorkflow> {
        self.inner.registry().get(workflow_id)
    }

    // ===== Subscribers =====

    pub fn subscribe<M, F, Fut>(&self, matcher: M, handler: F) -> String
    where
        M: Into<EventMatcher>,
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.inner.dispatcher.subscribe(matcher, handler)
    }

    pub fn subscribe_with<M, F, Fut>(
        &self,
        matcher: M,
        options: SubscribeOptions,
        handler: F,
    ) -> String
    where
        M: Into<EventMatcher>,
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.inner.dispatcher.subscribe_with(matcher, options, handler)
    }

    pub fn unsubscribe(&self, subscriber_id: &str) -> bool {
        self.inner.dispatcher.unsubscribe(subscriber_id)
    }

    // ===== Lifecycle =====

    /// Starts the drain loop and, unless in worker mode, the cron
    /// scheduler. Idempotent.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.inner.config.mode.schedules() {
            if let Some(scheduler) = &self.inner.scheduler {
                scheduler.start().await?;
            }
        }
        self.inner.tasks.reopen();
        self.inner.running.store(true, Ordering::SeqCst);
        info!("Orchestrator started in {} mode", self.inner.config.mode);

        // Pick up anything published while stopped.
        self.inner.kick();
        Ok(())
    }

    /// Stops the cron scheduler and waits for in-flight event processing.
    /// Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let scheduler_stopped = match &self.inner.scheduler {
            Some(scheduler) if self.inner.config.mode.schedules() => scheduler.stop().await,
            _ => Ok(()),
        };

        let in_flight = self.inner.tasks.len();
        if in_flight > 0 {
            info!("Orchestrator waiting for {} in-flight task(s)", in_flight);
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Orchestrator stopped");
        scheduler_stopped
    }

    // ===== Events =====

    /// Enqueues an event and wakes the drain loop.
    pub async fn publish(&self, event: Event) -> Result<()> {
        self.inner.publish(event).await
    }

    /// Builds and publishes an event. Returns its id.
    pub async fn emit(&self, event_type: impl Into<String>, payload: Value) -> Result<String> {
        let event = Event::new(event_type, payload)?;
        let id = event.id().to_string();
        self.publish(event).await?;
        Ok(id)
    }

    /// Processes everything queued, even while stopped. Returns the number
    /// of events processed.
    ///
    /// Fails with `State` in producer mode.
    pub async fn drain(&self) -> Result<usize> {
        if !self.inner.config.mode.consumes() {
            return Err(Error::state("cannot drain the queue in producer mode"));
        }
        let processed = {
            let _active = self.inner.drain_lock.lock().await;
            self.inner.drain_queue(true).await
        };
        if self.inner.kick_pending.load(Ordering::SeqCst) {
            self.inner.kick();
        }
        Ok(processed)
    }

    /// Dispatches `event` and runs its triggered workflows right away,
    /// bypassing the queue and ack handling.
    pub async fn process_event(&self, event: &Event) -> EventOutcome {
        self.inner.process_event(event).await
    }

    // ===== Runs =====

    /// Runs a registered workflow. `options` are merged over the
    /// registration defaults.
    ///
    /// Validation failures, a busy conversation lock and, without an
    /// `on_run_store_error` handler, run store failures are returned as
    /// errors. Node failures are not: they show up in the result.
    pub async fn run_workflow(
        &self,
        workflow_id: &str,
        options: RunOptions,
    ) -> Result<WorkflowRunResult> {
        let registered = self.inner.registered(workflow_id)?;
        let options = options.merged_over(&registered.options);
        self.inner.execute(&registered, options).await
    }

    // ===== Cron =====

    /// Schedules an arbitrary async job.
    pub fn register_cron_job<F, Fut>(
        &self,
        job_id: &str,
        expression: &str,
        handler: F,
    ) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        let scheduler = self.inner.scheduler()?;
        let weak = Arc::downgrade(&self.inner);
        let job = job_id.to_string();
        scheduler.add_job(
            job_id,
            expression,
            job_handler(move || {
                count_firing(&weak);
                match std::panic::catch_unwind(AssertUnwindSafe(&handler)) {
                    Ok(invocation) => invocation.left_future(),
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        let error = Error::runtime(format!(
                            "cron job '{}' panicked: {}",
                            job, message
                        ));
                        future::ready(Err(BoxError::from(error))).right_future()
                    }
                }
            }),
            Some(job_id),
        )
    }

    /// Schedules publishing an event of `event_type` with `payload`.
    pub fn register_cron_event(
        &self,
        job_id: &str,
        expression: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<()> {
        let scheduler = self.inner.scheduler()?;
        Event::new(event_type, Value::Null)?;

        let weak = Arc::downgrade(&self.inner);
        let event_type = event_type.to_string();
        let source = format!("cron:{}", job_id);
        scheduler.add_job(
            job_id,
            expression,
            job_handler(move || {
                let weak = Weak::clone(&weak);
                let event = Event::new(event_type.as_str(), payload.clone())
                    .map(|event| event.with_source(source.as_str()));
                async move {
                    let inner = upgrade(&weak)?;
                    Metrics::incr(&inner.metrics.cron_firings);
                    inner.publish(event?).await?;
                    Ok::<(), BoxError>(())
                }
            }),
            Some(job_id),
        )
    }

    /// Schedules runs of a registered workflow.
    ///
    /// Chatflows are rejected with `InvalidArgument`: a cron tick has no
    /// conversation id to run them under.
    pub fn register_cron_workflow(
        &self,
        job_id: &str,
        expression: &str,
        workflow_id: &str,
        options: RunOptions,
    ) -> Result<()> {
        let scheduler = self.inner.scheduler()?;
        let registered = self.inner.registered(workflow_id)?;
        if registered.workflow.is_chatflow() {
            return Err(Error::invalid_argument(format!(
                "chatflow '{}' cannot be scheduled by cron",
                workflow_id
            )));
        }

        let weak = Arc::downgrade(&self.inner);
        let workflow_id = workflow_id.to_string();
        let job = job_id.to_string();
        scheduler.add_job(
            job_id,
            expression,
            job_handler(move || {
                let weak = Weak::clone(&weak);
                let workflow_id = workflow_id.clone();
                let job_id = job.clone();
                let options = options.clone();
                async move {
                    let inner = upgrade(&weak)?;
                    Metrics::incr(&inner.metrics.cron_firings);
                    inner.run_cron_workflow(&job_id, &workflow_id, options).await?;
                    Ok::<(), BoxError>(())
                }
            }),
            Some(job_id),
        )
    }

    pub fn unregister_cron_job(&self, job_id: &str) -> Result<bool> {
        Ok(self.inner.scheduler()?.remove_job(job_id))
    }

    pub fn is_cron_job_scheduled(&self, job_id: &str) -> Result<bool> {
        Ok(self.inner.scheduler()?.is_job_scheduled(job_id))
    }
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.inner.config)
            .field("running", &self.is_running())
            .field("workflows", &self.workflow_ids())
            .field("scheduler", &self.inner.scheduler.is_some())
            .field("lock", &self.inner.lock.is_some())
            .finish_non_exhaustive()
    }
}

fn upgrade(weak: &Weak<Inner>) -> std::result::Result<Arc<Inner>, BoxError> {
    weak.upgrade()
        .ok_or_else(|| Error::state("orchestrator has been dropped").into())
}

fn count_firing(weak: &Weak<Inner>) {
    if let Some(inner) = weak.upgrade() {
        Metrics::incr(&inner.metrics.cron_firings);
    }
}

/// Error describing a run that finished with status failed, caused by the
/// first node that failed.
fn failure_error(result: &WorkflowRunResult) -> SharedError {
    let mut failed: Vec<&str> = result
        .timeline
        .iter()
        .filter(|event| event.kind() == "node_error")
        .filter_map(|event| event.node_id())
        .collect();
    if failed.is_empty() {
        failed = result.errors.keys().map(String::as_str).collect();
        failed.sort_unstable();
    }

    let message = format!(
        "workflow '{}' failed at node(s): {}",
        result.workflow_id,
        failed.join(", ")
    );
    let error = match failed.first().and_then(|id| result.errors.get(*id)) {
        Some(cause) => Error::runtime_with(message, Arc::clone(cause)),
        None => Error::runtime(message),
    };
    Arc::new(error)
}

impl Inner {
    fn registry(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn registered(&self, workflow_id: &str) -> Result<RegisteredWorkflow> {
        self.registry()
            .get(workflow_id)
            .ok_or_else(|| {
                Error::not_found(format!("workflow '{}' is not registered", workflow_id))
            })
    }

    fn scheduler(&self) -> Result<&Arc<dyn CronScheduler>> {
        self.scheduler
            .as_ref()
            .ok_or_else(|| Error::state("no cron scheduler configured"))
    }

    async fn publish(self: &Arc<Self>, event: Event) -> Result<()> {
        let event_id = event.id().to_string();
        self.queue.enqueue(event).await?;
        Metrics::incr(&self.metrics.events_published);
        debug!("Published event {}", event_id);
        self.kick();
        Ok(())
    }

    // ===== Drain loop =====

    /// Wakes the drain loop. At most one loop runs; a kick that arrives
    /// while it is busy makes it go around again.
    fn kick(self: &Arc<Self>) {
        if !self.config.mode.consumes() || !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.kick_pending.store(true, Ordering::SeqCst);
        let inner = Arc::clone(self);
        self.tasks.spawn(async move { inner.drain_while_kicked().await });
    }

    async fn drain_while_kicked(&self) {
        loop {
            let Ok(active) = self.drain_lock.try_lock() else {
                return;
            };
            while self.running.load(Ordering::SeqCst)
                && self.kick_pending.swap(false, Ordering::SeqCst)
            {
                let processed = self.drain_queue(false).await;
                if processed > 0 {
                    debug!("Drain pass processed {} event(s)", processed);
                }
            }
            drop(active);

            // A kick that lost the race for the drain lock.
            if !self.running.load(Ordering::SeqCst) || !self.kick_pending.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Processes queued events until the queue is empty, or until stopped
    /// unless `force` is set.
    async fn drain_queue(&self, force: bool) -> usize {
        let max_concurrent = self.config.max_concurrent_events.max(1);
        let deliveries = stream::unfold((), move |()| async move {
            if !force && !self.running.load(Ordering::SeqCst) {
                return None;
            }
            match self.queue.dequeue().await {
                Ok(Some(delivery)) => Some((delivery, ())),
                Ok(None) => None,
                Err(e) => {
                    warn!("Failed to dequeue event: {}", e);
                    None
                }
            }
        })
        .boxed();

        deliveries
            .map(|delivery| self.handle_delivery(delivery))
            .buffer_unordered(max_concurrent)
            .count()
            .await
    }

    async fn handle_delivery(&self, delivery: Delivery) {
        let outcome = self.process_event(delivery.event()).await;
        Metrics::incr(&self.metrics.events_processed);

        let ack = match self.config.ack_policy {
            AckPolicy::Always => true,
            AckPolicy::OnSuccess => outcome.is_success(),
        };
        let (verb, settled) = if ack {
            Metrics::incr(&self.metrics.events_acked);
            ("ack", AssertUnwindSafe(delivery.ack()).catch_unwind().await)
        } else {
            Metrics::incr(&self.metrics.events_nacked);
            let reason = outcome.nack_reason();
            debug!("Nacking event {}: {}", outcome.event_id, reason);
            ("nack", AssertUnwindSafe(delivery.nack(&reason)).catch_unwind().await)
        };

        let failure = match settled {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(panic) => Some(panic_message(panic.as_ref())),
        };
        if let Some(failure) = failure {
            Metrics::incr(&self.metrics.ack_errors);
            warn!("Failed to {} event {}: {}", verb, outcome.event_id, failure);
        }
    }

    async fn process_event(&self, event: &Event) -> EventOutcome {
        let dispatch = self.dispatcher.dispatch(event).await;
        Metrics::add(&self.metrics.dispatch_errors, dispatch.errors.len());

        let targets = self.registry().matching(event);
        if !targets.is_empty() {
            debug!(
                "Event {} ({}) triggers {} workflow(s)",
                event.id(),
                event.event_type(),
                targets.len()
            );
        }

        let outcomes: Vec<Result<WorkflowRunResult>> = stream::iter(targets)
            .map(|registered| async move {
                let triggered = registered
                    .trigger
                    .event_trigger()
                    .map(|trigger| trigger.options_for(event))
                    .unwrap_or_default();
                let mut options = triggered.merged_over(&registered.options);
                options.run_id = None;
                self.run_reported(&registered, options, RunSource::event(event))
                    .await
            })
            .buffer_unordered(self.config.workflow_concurrency.max(1))
            .collect()
            .await;

        let mut runs = Vec::with_capacity(outcomes.len());
        let mut workflow_failures = 0;
        for outcome in outcomes {
            match outcome {
                Ok(result) => {
                    if !result.succeeded() {
                        workflow_failures += 1;
                    }
                    runs.push(result);
                }
                Err(_) => workflow_failures += 1,
            }
        }

        EventOutcome {
            event_id: event.id().to_string(),
            dispatch,
            runs,
            workflow_failures,
        }
    }

    async fn run_cron_workflow(
        &self,
        job_id: &str,
        workflow_id: &str,
        options: RunOptions,
    ) -> Result<()> {
        let registered = self.registered(workflow_id)?;
        if registered.workflow.is_chatflow() {
            return Err(Error::invalid_argument(format!(
                "chatflow '{}' cannot be scheduled by cron",
                workflow_id
            )));
        }
        let mut options = options.merged_over(&registered.options);
        options.run_id = None;

        let source = RunSource::Cron {
            job_id: job_id.to_string(),
        };
        let result = self.run_reported(&registered, options, source).await?;
        if result.succeeded() {
            Ok(())
        } else {
            Err(Error::runtime_with(
                format!("cron job '{}' run {} failed", job_id, result.run_id),
                failure_error(&result),
            ))
        }
    }

    // ===== Execution =====

    /// Executes and reports failures to the workflow error handler.
    async fn run_reported(
        &self,
        registered: &RegisteredWorkflow,
        options: RunOptions,
        source: RunSource,
    ) -> Result<WorkflowRunResult> {
        let workflow_id = registered.workflow.id().to_string();
        match self.execute(registered, options).await {
            Ok(result) => {
                if !result.succeeded() {
                    self.report_failure(WorkflowFailure {
                        workflow_id,
                        source,
                        error: failure_error(&result),
                        result: Some(result.clone()),
                    });
                }
                Ok(result)
            }
            Err(e) => {
                self.report_failure(WorkflowFailure {
                    workflow_id,
                    source,
                    error: Arc::new(e.clone()),
                    result: None,
                });
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        registered: &RegisteredWorkflow,
        options: RunOptions,
    ) -> Result<WorkflowRunResult> {
        Metrics::incr(&self.metrics.workflow_runs_started);
        let workflow = &registered.workflow;
        let outcome = if workflow.is_chatflow() {
            self.run_conversation(workflow, options).await
        } else {
            self.runner.run(workflow, options).await
        };

        match &outcome {
            Ok(result) if result.succeeded() => {
                Metrics::incr(&self.metrics.workflow_runs_succeeded)
            }
            _ => Metrics::incr(&self.metrics.workflow_runs_failed),
        }

        let result = outcome?;
        self.persist_run(&result).await?;
        Ok(result)
    }

    async fn run_conversation(
        &self,
        workflow: &Workflow,
        options: RunOptions,
    ) -> Result<WorkflowRunResult> {
        let conversation_id = match options.conversation_id.as_deref() {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => {
                return Err(Error::invalid_argument(format!(
                    "chatflow '{}' requires a conversation id",
                    workflow.id()
                )))
            }
        };
        let store = self.conversation_store.as_ref().ok_or_else(|| {
            Error::state(format!(
                "chatflow '{}' requires a conversation store",
                workflow.id()
            ))
        })?;

        let _pass = self.conversations.enter(&conversation_id).await;
        let held = match &self.lock {
            Some(lock) => {
                let config = &self.config.conversation_lock;
                Some(HeldLock::acquire(lock, &conversation_id, config).await?)
            }
            None => None,
        };

        let outcome = self
            .run_with_memory(store.as_ref(), workflow, options, &conversation_id)
            .await;

        if let Some(held) = held {
            held.release().await;
        }
        outcome
    }

    async fn run_with_memory(
        &self,
        store: &dyn ConversationStore,
        workflow: &Workflow,
        mut options: RunOptions,
        conversation_id: &str,
    ) -> Result<WorkflowRunResult> {
        let mut memory = store.get(conversation_id).await?.unwrap_or_default();
        if let Some(overrides) = options.memory.take() {
            memory.extend(overrides);
        }

        let result = self
            .runner
            .run(workflow, options.with_memory(memory.clone()))
            .await?;

        let latest = result.memory.as_ref().unwrap_or(&memory);
        store.set(conversation_id, latest).await?;
        Ok(result)
    }

    async fn persist_run(&self, result: &WorkflowRunResult) -> Result<()> {
        let Some(store) = &self.run_store else {
            return Ok(());
        };
        let record = RunRecord::from(result);
        let Err(e) = store.save(&record).await else {
            return Ok(());
        };

        Metrics::incr(&self.metrics.run_store_errors);
        let error = Error::from(e);
        let Some(handler) = &self.on_run_store_error else {
            error!("Failed to persist run {}: {}", record.run_id, error);
            return Err(error);
        };

        warn!("Failed to persist run {}: {}", record.run_id, error);
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&error, &record))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Run store error handler failed: {}", e),
            Err(panic) => error!(
                "Run store error handler panicked: {}",
                panic_message(panic.as_ref())
            ),
        }
        Ok(())
    }

    fn report_failure(&self, failure: WorkflowFailure) {
        warn!(
            "Workflow {} failed ({:?}): {}",
            failure.workflow_id, failure.source, failure.error
        );
        let Some(handler) = &self.on_workflow_error else {
            return;
        };
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&failure))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Workflow error handler failed: {}", e),
            Err(panic) => error!(
                "Workflow error handler panicked: {}",
                panic_message(panic.as_ref())
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::MinuteScheduler;
    use crate::events::Acknowledge;
    use crate::executor::NodeContext;
    use crate::graph::Node;
    use crate::lock::InMemoryLock;
    use crate::storage::{InMemoryConversationStore, InMemoryRunStore, StorageError};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    fn echo(id: &str) -> Workflow {
        Workflow::new(id, id)
            .with_node(Node::new("echo", |ctx: NodeContext| async move { Ok(ctx.input().clone()) }))
            .unwrap()
    }

    fn failing(id: &str) -> Workflow {
        Workflow::new(id, id)
            .with_node(Node::new("boom", |_ctx: NodeContext| async move {
                Err::<Value, BoxError>("boom".into())
            }))
            .unwrap()
    }

    /// Chatflow that increments `count` in memory and echoes it.
    fn counter(id: &str) -> Workflow {
        Workflow::chatflow(id, id)
            .with_node(Node::new("count", |ctx: NodeContext| async move {
                let count = ctx.get_memory("count").and_then(|v| v.as_i64()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                ctx.set_memory("count", json!(count + 1))?;
                Ok::<Value, BoxError>(json!(count + 1))
            }))
            .unwrap()
    }

    #[tokio::test]
    async fn test_triggered_workflow_runs_on_drain() {
        let orchestrator = Orchestrator::new();
        orchestrator
            .register_workflow(echo("wf"), Trigger::on("order.created"), RunOptions::new())
            .unwrap();

        orchestrator.emit("order.created", json!({"id": 7})).await.unwrap();
        orchestrator.emit("order.deleted", json!({"id": 8})).await.unwrap();
        assert_eq!(orchestrator.queue_size().await.unwrap(), 2);

        assert_eq!(orchestrator.drain().await.unwrap(), 2);
        let metrics = orchestrator.metrics();
        assert_eq!(metrics.events_published, 2);
        assert_eq!(metrics.events_processed, 2);
        assert_eq!(metrics.events_acked, 2);
        assert_eq!(metrics.workflow_runs_succeeded, 1);
    }

    #[tokio::test]
    async fn test_process_event_uses_payload_as_input() {
        let orchestrator = Orchestrator::new();
        orchestrator
            .register_workflow(echo("wf"), Trigger::on("*"), RunOptions::new().with_run_id("fixed"))
            .unwrap();

        let event = Event::new("anything", json!({"x": 1})).unwrap();
        let outcome = orchestrator.process_event(&event).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.runs.len(), 1);
        assert_eq!(outcome.runs[0].result("echo"), Some(&json!({"x": 1})));
        assert_ne!(outcome.runs[0].run_id, "fixed");
    }

    #[tokio::test]
    async fn test_registry_operations() {
        let orchestrator = Orchestrator::new();
        orchestrator.register_workflow(echo("a"), Trigger::manual(), RunOptions::new()).unwrap();
        let duplicate =
            orchestrator.register_workflow(echo("a"), Trigger::manual(), RunOptions::new());
        assert!(matches!(duplicate, Err(Error::Conflict(_))));

        assert!(orchestrator.has_workflow("a"));
        assert!(orchestrator.unregister_workflow("a"));
        assert!(!orchestrator.unregister_workflow("a"));

        let missing = orchestrator.run_workflow("a", RunOptions::new()).await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_chatflow_memory_round_trips_through_store() {
        let store = Arc::new(InMemoryConversationStore::new());
        let orchestrator = Orchestrator::builder()
            .with_conversation_store(store.clone())
            .build();
        orchestrator
            .register_workflow(counter("chat"), Trigger::manual(), RunOptions::new())
            .unwrap();

        let options = || RunOptions::new().with_conversation_id("c1");
        orchestrator.run_workflow("chat", options()).await.unwrap();
        let second = orchestrator.run_workflow("chat", options()).await.unwrap();
        assert_eq!(second.result("count"), Some(&json!(2)));

        let mut overrides = crate::core::Memory::new();
        overrides.insert("count".into(), json!(10));
        let third = orchestrator
            .run_workflow("chat", options().with_memory(overrides))
            .await
            .unwrap();
        assert_eq!(third.result("count"), Some(&json!(11)));

        let saved = store.get("c1").await.unwrap().unwrap();
        assert_eq!(saved.get("count"), Some(&json!(11)));
    }

    #[tokio::test]
    async fn test_chatflow_preconditions() {
        let without_store = Orchestrator::new();
        without_store
            .register_workflow(counter("chat"), Trigger::manual(), RunOptions::new())
            .unwrap();
        let missing_store = without_store
            .run_workflow("chat", RunOptions::new().with_conversation_id("c"))
            .await;
        assert!(matches!(missing_store, Err(Error::State(_))));

        let missing_id = without_store.run_workflow("chat", RunOptions::new()).await;
        assert!(matches!(missing_id, Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_same_conversation_runs_are_serialized() {
        let lock = Arc::new(InMemoryLock::new());
        let orchestrator = Arc::new(
            Orchestrator::builder()
                .with_conversation_store(Arc::new(InMemoryConversationStore::new()))
                .with_lock(lock.clone())
                .build(),
        );
        orchestrator
            .register_workflow(counter("chat"), Trigger::manual(), RunOptions::new())
            .unwrap();

        let runs = (0..5).map(|_| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .run_workflow("chat", RunOptions::new().with_conversation_id("shared"))
                    .await
            })
        });
        let mut counts: Vec<i64> = Vec::new();
        for run in futures::future::join_all(runs).await {
            let result = run.unwrap().unwrap();
            counts.push(result.result("count").and_then(Value::as_i64).unwrap());
        }
        counts.sort_unstable();
        assert_eq!(counts, vec![1, 2, 3, 4, 5]);
        assert!(!lock.is_locked("conversation:shared"));
    }

    struct RecordingQueue {
        inner: InMemoryEventQueue,
        nacks: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingAck(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Acknowledge for RecordingAck {
        async fn ack(&self) -> Result<()> {
            Ok(())
        }

        async fn nack(&self, reason: &str) -> Result<()> {
            self.0.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    #[async_trait]
    impl EventQueue for RecordingQueue {
        async fn enqueue(&self, event: Event) -> Result<()> {
            self.inner.enqueue(event).await
        }

        async fn dequeue(&self) -> Result<Option<Delivery>> {
            let delivery = self.inner.dequeue().await?;
            Ok(delivery.map(|d| {
                let ack = Arc::new(RecordingAck(self.nacks.clone()));
                Delivery::with_acknowledger(d.into_event(), ack)
            }))
        }

        async fn size(&self) -> Result<usize> {
            self.inner.size().await
        }
    }

    #[tokio::test]
    async fn test_on_success_policy_nacks_failed_events() {
        let nacks = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(RecordingQueue {
            inner: InMemoryEventQueue::new(),
            nacks: nacks.clone(),
        });
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = failures.clone();
        let orchestrator = Orchestrator::builder()
            .with_config(OrchestratorConfig::default().with_ack_policy(AckPolicy::OnSuccess))
            .with_queue(queue)
            .on_workflow_error(move |failure| {
                assert!(matches!(failure.source, RunSource::Event { .. }));
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();
        orchestrator
            .register_workflow(failing("bad"), Trigger::on("job"), RunOptions::new())
            .unwrap();

        orchestrator.emit("job", json!(null)).await.unwrap();
        orchestrator.emit("other", json!(null)).await.unwrap();
        orchestrator.drain().await.unwrap();

        assert_eq!(
            *nacks.lock().unwrap(),
            vec!["0 dispatch error(s), 1 workflow failure(s)".to_string()]
        );
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        let metrics = orchestrator.metrics();
        assert_eq!((metrics.events_acked, metrics.events_nacked), (1, 1));
    }

    #[tokio::test]
    async fn test_started_orchestrator_drains_on_publish() {
        let orchestrator = Orchestrator::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        orchestrator.subscribe("ping", move |event: Event| {
            let tx = tx.clone();
            async move {
                tx.send(event.id().to_string()).map_err(|e| Box::new(e) as BoxError)
            }
        });

        orchestrator.start().await.unwrap();
        orchestrator.start().await.unwrap();
        let id = orchestrator.emit("ping", json!(1)).await.unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(received, Some(id));

        orchestrator.stop().await.unwrap();
        orchestrator.stop().await.unwrap();
        assert!(!orchestrator.is_running());
    }

    #[tokio::test]
    async fn test_producer_mode_only_enqueues() {
        let orchestrator = Orchestrator::builder()
            .with_config(OrchestratorConfig::default().with_mode(OrchestratorMode::Producer))
            .build();
        orchestrator.start().await.unwrap();
        orchestrator.emit("ping", json!(1)).await.unwrap();
        tokio::task::yield_now().await;

        assert_eq!(orchestrator.queue_size().await.unwrap(), 1);
        assert!(matches!(orchestrator.drain().await, Err(Error::State(_))));
        orchestrator.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cron_requires_scheduler_and_rejects_chatflows() {
        let orchestrator = Orchestrator::new();
        orchestrator.register_workflow(echo("wf"), Trigger::manual(), RunOptions::new()).unwrap();
        let missing =
            orchestrator.register_cron_workflow("job", "* * * * *", "wf", RunOptions::new());
        assert!(matches!(missing, Err(Error::State(_))));
        assert!(matches!(orchestrator.is_cron_job_scheduled("job"), Err(Error::State(_))));

        let scheduled = Orchestrator::builder()
            .with_scheduler(Arc::new(MinuteScheduler::new()))
            .with_conversation_store(Arc::new(InMemoryConversationStore::new()))
            .build();
        scheduled
            .register_workflow(counter("chat"), Trigger::manual(), RunOptions::new())
            .unwrap();
        let chatflow =
            scheduled.register_cron_workflow("job", "* * * * *", "chat", RunOptions::new());
        assert!(matches!(chatflow, Err(Error::InvalidArgument(_))));

        let unknown =
            scheduled.register_cron_workflow("job", "* * * * *", "nope", RunOptions::new());
        assert!(matches!(unknown, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cron_workflow_and_event_fire() {
        let scheduler = Arc::new(MinuteScheduler::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let orchestrator = Orchestrator::builder()
            .with_scheduler(scheduler.clone())
            .with_run_store(runs.clone())
            .build();
        orchestrator.register_workflow(echo("wf"), Trigger::manual(), RunOptions::new()).unwrap();
        orchestrator
            .register_cron_workflow(
                "nightly",
                "0 0 * * *",
                "wf",
                RunOptions::new().with_input(json!("tick")),
            )
            .unwrap();
        orchestrator
            .register_cron_event("beacon", "0 0 * * *", "beacon", json!({"ok": true}))
            .unwrap();
        assert!(orchestrator.is_cron_job_scheduled("nightly").unwrap());

        let midnight = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(scheduler.fire_due(midnight), 2);
        scheduler.wait_for_handlers().await;

        assert_eq!(runs.len(), 1);
        assert_eq!(orchestrator.queue_size().await.unwrap(), 1);
        assert_eq!(orchestrator.metrics().cron_firings, 2);
        assert!(orchestrator.unregister_cron_job("nightly").unwrap());
    }

    /// Keeps job handlers so a test can invoke them directly.
    #[derive(Default)]
    struct CapturingScheduler {
        jobs: Mutex<Vec<(String, crate::cron::JobHandler)>>,
    }

    #[async_trait]
    impl CronScheduler for CapturingScheduler {
        async fn start(&self) -> Result<()> {
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        fn add_job(
            &self,
            id: &str,
            _expression: &str,
            handler: crate::cron::JobHandler,
            _name: Option<&str>,
        ) -> Result<()> {
            self.jobs.lock().unwrap().push((id.to_string(), handler));
            Ok(())
        }

        fn remove_job(&self, _id: &str) -> bool {
            false
        }

        fn is_job_scheduled(&self, id: &str) -> bool {
            self.jobs.lock().unwrap().iter().any(|(job, _)| job == id)
        }
    }

    fn panicking_job() -> future::Ready<std::result::Result<(), BoxError>> {
        panic!("no future for you")
    }

    fn panicking_subscriber(_event: Event) -> future::Ready<std::result::Result<(), BoxError>> {
        panic!("no future for you")
    }

    #[tokio::test]
    async fn test_cron_job_panicking_before_future_becomes_error() {
        let scheduler = Arc::new(CapturingScheduler::default());
        let orchestrator = Orchestrator::builder()
            .with_scheduler(scheduler.clone())
            .build();
        orchestrator
            .register_cron_job("eager", "* * * * *", panicking_job)
            .unwrap();

        let handler = Arc::clone(&scheduler.jobs.lock().unwrap()[0].1);
        let error = handler().await.unwrap_err();
        assert!(error.to_string().contains("cron job 'eager' panicked"));
        assert_eq!(orchestrator.metrics().cron_firings, 1);
    }

    #[tokio::test]
    async fn test_drain_survives_subscriber_panicking_before_future() {
        let orchestrator = Orchestrator::new();
        orchestrator.subscribe("ping", panicking_subscriber);
        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();
        orchestrator.subscribe("ping", move |_event| {
            seen.fetch_add(1, Ordering::SeqCst);
            future::ready(Ok::<(), BoxError>(()))
        });

        orchestrator.emit("ping", json!(1)).await.unwrap();
        orchestrator.emit("ping", json!(2)).await.unwrap();
        assert_eq!(orchestrator.drain().await.unwrap(), 2);

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
        let metrics = orchestrator.metrics();
        assert_eq!(metrics.dispatch_errors, 2);
        assert_eq!(metrics.events_acked, 2);
        assert_eq!(orchestrator.queue_size().await.unwrap(), 0);
    }

    struct BrokenRunStore;

    #[async_trait]
    impl RunStore for BrokenRunStore {
        async fn save(&self, _record: &RunRecord) -> crate::storage::Result<()> {
            Err(StorageError::Unsupported("read-only".into()))
        }

        async fn get(&self, _run_id: &str) -> crate::storage::Result<Option<RunRecord>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_run_store_failures() {
        let strict = Orchestrator::builder().with_run_store(Arc::new(BrokenRunStore)).build();
        strict.register_workflow(echo("wf"), Trigger::manual(), RunOptions::new()).unwrap();
        assert!(matches!(
            strict.run_workflow("wf", RunOptions::new()).await,
            Err(Error::Runtime { .. })
        ));

        let reported = Arc::new(AtomicUsize::new(0));
        let count = reported.clone();
        let lenient = Orchestrator::builder()
            .with_run_store(Arc::new(BrokenRunStore))
            .on_run_store_error(move |_error, record| {
                assert_eq!(record.workflow_id, "wf");
                count.fetch_add(1, Ordering::SeqCst);
                Err("handler failures are swallowed".into())
            })
            .build();
        lenient.register_workflow(echo("wf"), Trigger::manual(), RunOptions::new()).unwrap();
        assert!(lenient.run_workflow("wf", RunOptions::new()).await.is_ok());
        assert_eq!(reported.load(Ordering::SeqCst), 1);
        assert_eq!(lenient.metrics().run_store_errors, 1);
    }

    #[tokio::test]
    async fn test_failure_error_names_failed_nodes() {
        let result = WorkflowRunner::new()
            .run(&failing("bad"), RunOptions::new())
            .await
            .unwrap();
        let error = failure_error(&result);
        assert!(error.to_string().contains("boom"));
        assert!(std::error::Error::source(error.as_ref()).is_some());
    }
}
