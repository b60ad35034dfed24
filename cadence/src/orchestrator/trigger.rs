//! How registered workflows are started.

use crate::events::{Event, EventMatcher};
use crate::executor::RunOptions;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;

/// Predicate evaluated after the trigger's type matcher.
pub type TriggerFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Derives a run parameter from the triggering event.
pub type EventMapper<T> = Arc<dyn Fn(&Event) -> T + Send + Sync>;

/// A workflow trigger.
#[derive(Clone, Default)]
pub enum Trigger {
    /// Only started by `run_workflow` or cron.
    #[default]
    Manual,
    /// Started for every queued event the trigger accepts.
    Event(EventTrigger),
}

impl Trigger {
    pub fn manual() -> Self {
        Trigger::Manual
    }

    /// Shorthand for `EventTrigger::new(matcher).into()`.
    pub fn on(matcher: impl Into<EventMatcher>) -> Self {
        Trigger::Event(EventTrigger::new(matcher))
    }

    pub fn event_trigger(&self) -> Option<&EventTrigger> {
        match self {
            Trigger::Manual => None,
            Trigger::Event(trigger) => Some(trigger),
        }
    }
}

impl From<EventTrigger> for Trigger {
    fn from(trigger: EventTrigger) -> Self {
        Trigger::Event(trigger)
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Manual => f.write_str("Manual"),
            Trigger::Event(trigger) => f.debug_tuple("Event").field(trigger).finish(),
        }
    }
}

/// Event-driven trigger: a type matcher, an optional filter and optional
/// mappers from the event to run parameters.
///
/// Without mappers, a run gets the event payload as input and
/// `{"event": <event>}` as context.
#[derive(Clone)]
pub struct EventTrigger {
    matcher: EventMatcher,
    filter: Option<TriggerFilter>,
    map_input: Option<EventMapper<Value>>,
    map_context: Option<EventMapper<Value>>,
    map_conversation_id: Option<EventMapper<Option<String>>>,
}

impl EventTrigger {
    pub fn new(matcher: impl Into<EventMatcher>) -> Self {
        Self {
            matcher: matcher.into(),
            filter: None,
            map_input: None,
            map_context: None,
            map_conversation_id: None,
        }
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn map_input<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Event) -> Value + Send + Sync + 'static,
    {
        self.map_input = Some(Arc::new(mapper));
        self
    }

    pub fn map_context<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Event) -> Value + Send + Sync + 'static,
    {
        self.map_context = Some(Arc::new(mapper));
        self
    }

    /// Picks the conversation id for chatflow runs.
    pub fn map_conversation_id<F>(mut self, mapper: F) -> Self
    where
        F: Fn(&Event) -> Option<String> + Send + Sync + 'static,
    {
        self.map_conversation_id = Some(Arc::new(mapper));
        self
    }

    pub fn matcher(&self) -> &EventMatcher {
        &self.matcher
    }

    /// Matcher and filter both accept `event`.
    pub fn accepts(&self, event: &Event) -> bool {
        self.matcher.matches(event.event_type())
            && self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Run options derived from `event`, to be merged over the
    /// registration defaults.
    pub(crate) fn options_for(&self, event: &Event) -> RunOptions {
        let input = match &self.map_input {
            Some(mapper) => mapper(event),
            None => event.payload().clone(),
        };
        let context = match &self.map_context {
            Some(mapper) => mapper(event),
            None => json!({ "event": event }),
        };

        let mut options = RunOptions::new().with_input(input).with_context(context);
        let conversation_id = self
            .map_conversation_id
            .as_ref()
            .and_then(|mapper| mapper(event));
        if let Some(conversation_id) = conversation_id {
            options = options.with_conversation_id(conversation_id);
        }
        options
    }
}

impl fmt::Debug for EventTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTrigger")
            .field("matcher", &self.matcher)
            .field("filter", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_use_payload_and_event() {
        let trigger = EventTrigger::new("order.created");
        let event = Event::new("order.created", json!({"id": 7})).unwrap();

        let options = trigger.options_for(&event);
        assert_eq!(options.input, Some(json!({"id": 7})));
        assert_eq!(options.context.unwrap()["event"]["type"], "order.created");
        assert!(options.conversation_id.is_none());
    }

    #[test]
    fn test_mappers_and_filter() {
        let trigger = EventTrigger::new("chat.message")
            .with_filter(|event| event.payload()["text"].is_string())
            .map_input(|event| event.payload()["text"].clone())
            .map_conversation_id(|event| event.payload()["chat"].as_str().map(str::to_string));

        let event = Event::new("chat.message", json!({"text": "hi", "chat": "c9"})).unwrap();
        assert!(trigger.accepts(&event));
        assert!(!trigger.accepts(&Event::new("chat.message", json!({})).unwrap()));

        let options = trigger.options_for(&event);
        assert_eq!(options.input, Some(json!("hi")));
        assert_eq!(options.conversation_id.as_deref(), Some("c9"));
    }
}
