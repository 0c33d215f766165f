//! Error types shared by resolution, injection, transactions and the
//! reactive engine.
//!
//! `CoreError` is `Clone` because a single failed computation can be observed
//! by several waiters of the same cached node.

use std::fmt::Display;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Errors raised by the request core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// No handler matched a `query` or `mutate` path.
    #[error("no handler found for: {path}")]
    NoHandler {
        /// Dotted request path.
        path: String,
    },

    /// No injectable was registered under the requested path.
    #[error("no injectable found for: {path}")]
    NoInjectable {
        /// Dotted injectable path.
        path: String,
    },

    /// An injectable was found but has a different type than requested.
    #[error("injectable at {path} is not a {expected}")]
    InjectableType {
        /// Dotted injectable path.
        path: String,
        /// Requested Rust type.
        expected: &'static str,
    },

    /// A disposed reactive node was read by a non-effect consumer.
    #[error("reactive node has been disposed")]
    Disposed,

    /// An ambient-only operation ran outside of any request context.
    #[error("{operation} called outside of a request context")]
    NoContext {
        /// The operation that needed a context.
        operation: &'static str,
    },

    /// A handler argument was missing or could not be decoded.
    #[error("invalid argument {index}: {message}")]
    Argument {
        /// Zero-based argument position.
        index: usize,
        /// Decoder message.
        message: String,
    },

    /// A value could not be converted to or from JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A handler body reported a failure.
    #[error("handler failed: {0}")]
    Handler(String),

    /// Follow-up work queued on a transaction panicked or was cancelled.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl CoreError {
    /// Build a handler failure from any displayable error.
    pub fn handler(err: impl Display) -> Self {
        Self::Handler(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}
