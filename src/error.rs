//! Captured handler and task failures.
//!
//! Failures never propagate out of the dispatch loop; they are captured as
//! a [`DispatchError`] record which rides on `error` / `{name}_failure`
//! events and marks the event's value.

use std::any::Any;

use serde::Serialize;

/// A failure captured from a handler or a suspended task.
///
/// `message` is the top-level description; `chain` holds the full context
/// chain, outermost first.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{message}")]
pub struct DispatchError {
    /// Top-level failure description.
    pub message: String,
    /// Full cause chain, outermost first.
    pub chain: Vec<String>,
}

impl DispatchError {
    /// Capture an `anyhow::Error` with its context chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            chain: err.chain().map(|cause| cause.to_string()).collect(),
        }
    }
}

/// Best-effort extraction of a panic payload's message.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
