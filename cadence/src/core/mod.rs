//! Core types shared by every cadence component.
//!
//! # Error Handling
//! - [`Error`]: the error-kind taxonomy (invalid argument, not found,
//!   conflict, state, dependency, cyclic dependency, runtime, cancellation)
//! - [`Result<T>`]: Type alias for Results using [`Error`]
//! - [`BoxError`] / [`SharedError`]: how user handler failures travel
//!
//! # Retry Behavior
//! - [`RetryPolicy`]: attempts, exponential backoff and jitter for nodes
//!
//! # Memory
//! - [`Memory`]: the key/value mapping carried by chatflow conversations

mod error;
mod gate;
pub mod retry;

pub use error::{BoxError, Error, Result, SharedError};
pub(crate) use gate::KeyedGate;
pub use retry::RetryPolicy;

/// Conversation memory: an opaque JSON object keyed by string.
pub type Memory = serde_json::Map<String, serde_json::Value>;

/// Boxed, sendable future used for every user-supplied async callback.
pub type BoxFuture<T> = futures::future::BoxFuture<'static, T>;

/// Converts a caught panic payload into an error message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}
