//! Event record.

use crate::core::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Tracing metadata carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// An immutable event.
///
/// Built with [`Event::new`] and the `with_*` methods; there are no setters
/// once the event is handed to a queue or dispatcher.
///
/// # Example
///
/// ```
/// use cadence::Event;
/// use serde_json::json;
///
/// let event = Event::new("order.created", json!({"id": 42}))
///     .unwrap()
///     .with_source("checkout")
///     .with_correlation_id("req-1");
///
/// assert_eq!(event.event_type(), "order.created");
/// assert_eq!(event.metadata().source.as_deref(), Some("checkout"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    metadata: EventMetadata,
}

impl Event {
    /// Creates an event with a fresh id and the current time.
    ///
    /// Returns `InvalidArgument` if `event_type` is empty.
    pub fn new(event_type: impl Into<String>, payload: Value) -> Result<Self> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(Error::invalid_argument("event type must be a non-empty string"));
        }
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            event_type,
            payload,
            timestamp: Utc::now(),
            metadata: EventMetadata::default(),
        })
    }

    /// Creates an event caused by `parent`: same correlation id (or the
    /// parent's id if it had none), causation pointing at the parent.
    pub fn caused_by(
        parent: &Event,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Result<Self> {
        let correlation = parent
            .metadata
            .correlation_id
            .clone()
            .unwrap_or_else(|| parent.id.clone());
        Ok(Self::new(event_type, payload)?
            .with_correlation_id(correlation)
            .with_causation_id(parent.id.clone()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.metadata.causation_id = Some(id.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.metadata.source = Some(source.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}
