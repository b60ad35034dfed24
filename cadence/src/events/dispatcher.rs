//! Pub/sub dispatcher.
//!
//! Subscribers register a matcher and an async handler. `dispatch` delivers
//! an event to every matching subscriber concurrently and collects failures
//! instead of propagating them: one broken subscriber never prevents the
//! others from seeing the event.

use super::event::Event;
use super::matcher::EventMatcher;
use crate::core::{panic_message, BoxError, BoxFuture, Error, SharedError};
use futures::future::{self, join_all, FutureExt};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Async subscriber callback.
pub type EventHandler =
    Arc<dyn Fn(Event) -> BoxFuture<std::result::Result<(), BoxError>> + Send + Sync>;

/// Synchronous predicate applied after the type matcher.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Optional subscription settings.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    pub name: Option<String>,
    /// Remove the subscriber after its first successful delivery.
    pub once: bool,
    pub filter: Option<EventFilter>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn once(mut self) -> Self {
        self.once = true;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

struct Subscriber {
    id: String,
    name: Option<String>,
    matcher: EventMatcher,
    once: bool,
    filter: Option<EventFilter>,
    handler: EventHandler,
    /// Claimed by the dispatch delivering to a `once` subscriber.
    claimed: AtomicBool,
}

impl Subscriber {
    fn accepts(&self, event: &Event) -> bool {
        self.matcher.matches(event.event_type())
            && self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// A subscriber failure collected during dispatch.
#[derive(Debug, Clone)]
pub struct DispatchFailure {
    pub subscriber_id: String,
    pub subscriber_name: Option<String>,
    pub error: SharedError,
}

/// Summary of one `dispatch` call.
#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    /// Subscribers whose matcher and filter accepted the event.
    pub matched: usize,
    /// Subscribers whose handler succeeded.
    pub delivered: usize,
    pub errors: Vec<DispatchFailure>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Routes events to subscribers.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to events accepted by `matcher`. Returns the
    /// subscriber id.
    pub fn subscribe<M, F, Fut>(&self, matcher: M, handler: F) -> String
    where
        M: Into<EventMatcher>,
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.subscribe_with(matcher, SubscribeOptions::default(), handler)
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
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.add(matcher.into(), options, handler)
    }

    /// Subscribes an already type-erased handler.
    pub fn add(
        &self,
        matcher: EventMatcher,
        options: SubscribeOptions,
        handler: EventHandler,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let label = options.name.as_deref().unwrap_or(&id);
        debug!("Subscribing {} to {}", label, matcher);
        self.write().push(Arc::new(Subscriber {
            id: id.clone(),
            name: options.name,
            matcher,
            once: options.once,
            filter: options.filter,
            handler,
            claimed: AtomicBool::new(false),
        }));
        id
    }

    /// Removes a subscriber. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut subscribers = self.write();
        let before = subscribers.len();
        subscribers.retain(|subscriber| subscriber.id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    /// Delivers `event` to every matching subscriber concurrently.
    pub async fn dispatch(&self, event: &Event) -> DispatchReport {
        let targets: Vec<Arc<Subscriber>> = self
            .read()
            .iter()
            .filter(|subscriber| subscriber.accepts(event))
            .filter(|subscriber| {
                !subscriber.once
                    || subscriber
                        .claimed
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
            })
            .cloned()
            .collect();

        let mut report = DispatchReport {
            matched: targets.len(),
            ..DispatchReport::default()
        };

        let deliveries = targets.iter().map(|subscriber| {
            let handler = Arc::clone(&subscriber.handler);
            let event = event.clone();
            AssertUnwindSafe(future::lazy(move |_| handler(event)).flatten()).catch_unwind()
        });
        let outcomes = join_all(deliveries).await;

        for (subscriber, outcome) in targets.iter().zip(outcomes) {
            let error: Option<SharedError> = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(SharedError::from(error)),
                Err(panic) => Some(Arc::new(Error::runtime(format!(
                    "subscriber '{}' panicked: {}",
                    subscriber.label(),
                    panic_message(panic.as_ref())
                )))),
            };

            match error {
                None => {
                    report.delivered += 1;
                    if subscriber.once {
                        self.unsubscribe(&subscriber.id);
                    }
                }
                Some(error) => {
                    warn!(
                        "Subscriber {} failed on event {} ({}): {}",
                        subscriber.label(),
                        event.id(),
                        event.event_type(),
                        error
                    );
                    if subscriber.once {
                        subscriber.claimed.store(false, Ordering::Release);
                    }
                    report.errors.push(DispatchFailure {
                        subscriber_id: subscriber.id.clone(),
                        subscriber_name: subscriber.name.clone(),
                        error,
                    });
                }
            }
        }

        report
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
