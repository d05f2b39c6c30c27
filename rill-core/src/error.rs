// Copyright 2025 the rill project developers
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Error types for the rill reactive runtime.
//!
//! All failures that travel through a flow terminate it and arrive at the
//! consumer through `on_error` exactly once. [`FlowError`] is the single
//! root type for those signals; variants follow the engine's error taxonomy
//! (protocol violations, user callback failures, overflow, timeout,
//! composites collected during recovery).
//!
//! `FlowError` is `Clone`: retry and replay deliver the same terminal error
//! to several subscribers, so user causes are shared behind an [`Arc`].

use std::sync::Arc;
use std::time::Duration;

/// Root error type for all rill flows.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    /// The reactive-streams contract was broken: a non-positive request, a
    /// second `subscribe` on a single-subscriber stage, or a signal after a
    /// terminal.
    #[error("protocol violation: {context}")]
    Protocol {
        /// Which rule was broken, and by whom.
        context: String,
    },

    /// A user-provided callback (mapper, predicate, emitter body) failed.
    #[error("user callback error: {0}")]
    User(Arc<dyn std::error::Error + Send + Sync>),

    /// A bounded buffer could not accept another element and the configured
    /// policy was [`Error`](crate::queue::QueueFactory).
    #[error("buffer overflow: {context}")]
    Overflow {
        /// Which stage overflowed.
        context: String,
    },

    /// A watchdog fired before the awaited element arrived.
    #[error("timed out after {after:?}")]
    Timeout {
        /// The watchdog duration.
        after: Duration,
    },

    /// Several errors were collected while inner streams kept draining
    /// (`delay_error` merges, retry companions that fail during recovery).
    #[error("{count} errors occurred")]
    Composite {
        /// Number of collected errors.
        count: usize,
        /// The individual causes, in collection order.
        errors: Vec<FlowError>,
    },

    /// General stream-processing failure that fits no other category.
    #[error("{context}")]
    Stream {
        /// Description of what went wrong.
        context: String,
    },
}

impl FlowError {
    /// General stream-processing error with the given context.
    pub fn stream(context: impl Into<String>) -> Self {
        Self::Stream {
            context: context.into(),
        }
    }

    /// Protocol-violation error with the given context.
    pub fn protocol(context: impl Into<String>) -> Self {
        Self::Protocol {
            context: context.into(),
        }
    }

    /// The canonical error for `request(0)`.
    pub fn bad_request() -> Self {
        Self::protocol("request amount must be positive")
    }

    /// Overflow error naming the stage that could not buffer.
    pub fn overflow(context: impl Into<String>) -> Self {
        Self::Overflow {
            context: context.into(),
        }
    }

    /// Timeout error carrying the watchdog duration.
    pub fn timeout(after: Duration) -> Self {
        Self::Timeout { after }
    }

    /// Wraps a user error.
    pub fn user(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::User(Arc::new(error))
    }

    /// Wraps a plain message as a user error.
    pub fn user_message(message: impl Into<String>) -> Self {
        Self::User(Arc::new(MessageError(message.into())))
    }

    /// Collapses a set of collected errors into one terminal signal.
    ///
    /// A single cause is returned as itself; an empty set degenerates to a
    /// stream error (the caller believed errors were pending).
    pub fn composite(mut errors: Vec<FlowError>) -> Self {
        match errors.len() {
            0 => Self::stream("composite error with no recorded causes"),
            1 => errors.remove(0),
            count => Self::Composite { count, errors },
        }
    }

    /// `true` for terminal conditions the retry operators may resubscribe
    /// after. Protocol violations are never retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Protocol { .. })
    }
}

/// Specialized result type for rill operations.
pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug)]
struct MessageError(String);

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MessageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_of_one_is_the_cause() {
        let e = FlowError::composite(vec![FlowError::stream("boom")]);
        assert!(matches!(e, FlowError::Stream { .. }));
    }

    #[test]
    fn composite_keeps_count_and_order() {
        let e = FlowError::composite(vec![
            FlowError::stream("first"),
            FlowError::timeout(Duration::from_millis(5)),
        ]);
        match e {
            FlowError::Composite { count, errors } => {
                assert_eq!(count, 2);
                assert!(matches!(errors[0], FlowError::Stream { .. }));
                assert!(matches!(errors[1], FlowError::Timeout { .. }));
            }
            other => panic!("expected composite, got {other:?}"),
        }
    }

    #[test]
    fn protocol_violations_are_not_retryable() {
        assert!(!FlowError::bad_request().is_retryable());
        assert!(FlowError::stream("transient").is_retryable());
    }

    #[test]
    fn user_error_displays_cause() {
        let e = FlowError::user_message("division by zero");
        assert!(e.to_string().contains("division by zero"));
    }
}
