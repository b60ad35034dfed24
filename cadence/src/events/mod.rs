//! Events, queues and pub/sub.
//!
//! - [`Event`]: immutable record with a non-empty type
//! - [`EventMatcher`]: exact / any-of / wildcard / regex type matching,
//!   shared by subscribers and workflow triggers
//! - [`EventQueue`]: pluggable FIFO, with [`InMemoryEventQueue`] as the
//!   in-process implementation
//! - [`EventDispatcher`]: routes events to subscribers

mod dispatcher;
mod event;
mod matcher;
mod queue;

pub use dispatcher::{
    DispatchFailure, DispatchReport, EventDispatcher, EventFilter, EventHandler, SubscribeOptions,
};
pub use event::{Event, EventMetadata};
pub use matcher::{EventMatcher, WILDCARD};
pub use queue::{Acknowledge, Delivery, EventQueue, InMemoryEventQueue};
