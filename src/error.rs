//! Error kinds surfaced by the driver and its backends.

use std::io;

use thiserror::Error;

use crate::callback::CallbackId;

/// Boxed error type that user callbacks may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Everything that can go wrong inside the loop.
///
/// Errors produced by user callbacks and by dispatch itself are routed to
/// the installed error handler; with no handler installed they abort
/// [`run`](crate::Driver::run). Lookup failures on `enable`/`reference`
/// surface directly to the caller.
#[derive(Debug, Error)]
pub enum LoopError {
    /// The id does not refer to a live callback record.
    ///
    /// The trace fields are populated when the failing call went through a
    /// [`TracingDriver`](crate::TracingDriver).
    #[error("invalid callback identifier: {id}")]
    InvalidCallback {
        id: CallbackId,
        creation_trace: Option<String>,
        cancellation_trace: Option<String>,
    },

    /// The backend or platform lacks the requested capability.
    #[error("unsupported feature: {feature}")]
    Unsupported { feature: &'static str },

    /// OS-level failure while arming registrations or dispatching.
    #[error("backend failure: {message}")]
    Backend {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// Misuse of the loop or of a suspension: `run` re-entered, a
    /// suspension resumed twice, the scheduler context suspended.
    #[error("{0}")]
    Lifecycle(String),

    /// An error returned by a user callback or microtask.
    #[error("callback {} failed", display_id(.id))]
    Callback {
        id: Option<CallbackId>,
        #[source]
        source: BoxError,
    },
}

fn display_id(id: &Option<CallbackId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "<microtask>".to_string(),
    }
}

impl LoopError {
    pub(crate) fn invalid(id: CallbackId) -> Self {
        LoopError::InvalidCallback {
            id,
            creation_trace: None,
            cancellation_trace: None,
        }
    }

    pub(crate) fn backend(message: impl Into<String>, source: io::Error) -> Self {
        LoopError::Backend {
            message: message.into(),
            source: Some(source),
        }
    }

    pub(crate) fn lifecycle(message: impl Into<String>) -> Self {
        LoopError::Lifecycle(message.into())
    }

    /// The callback id the error concerns, when there is one.
    pub fn callback_id(&self) -> Option<CallbackId> {
        match self {
            LoopError::InvalidCallback { id, .. } => Some(*id),
            LoopError::Callback { id, .. } => *id,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_the_id() {
        let err = LoopError::invalid(CallbackId(7));
        assert_eq!(err.to_string(), "invalid callback identifier: cb#7");
    }

    #[test]
    fn test_callback_id_lookup() {
        let err = LoopError::Callback {
            id: Some(CallbackId(3)),
            source: "boom".into(),
        };
        assert_eq!(err.callback_id(), Some(CallbackId(3)));
        assert_eq!(
            LoopError::Unsupported { feature: "signals" }.callback_id(),
            None
        );
    }
}
