//! Unified error type for the storage layer
//!
//! Every [`Call`](crate::call::Call) fails with a [`DataError`]. The variants
//! separate database failures (surfaced, never retried here) from validation
//! errors raised before a call is built, and expose a dedicated overload
//! predicate so callers can drive admission control.

use thiserror::Error;

/// Unified error type for storage operations
#[derive(Error, Debug)]
pub enum DataError {
    /// The database rejected or failed the statement
    #[error("Database error on {backend}: {message}")]
    Database {
        backend: &'static str,
        message: String,
    },

    /// The database did not answer in time
    #[error("Query timeout after {timeout_ms}ms on {backend}")]
    Timeout {
        backend: &'static str,
        timeout_ms: u64,
    },

    /// The database is shedding load (capacity / backpressure)
    #[error("Backend {backend} is overloaded: {reason}")]
    Overloaded {
        backend: &'static str,
        reason: String,
    },

    /// Backend not available
    #[error("Backend {backend} is not available: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    /// The call was canceled before it completed
    #[error("Canceled")]
    Canceled,

    /// A call was executed or enqueued a second time
    #[error("Already executed: {0}")]
    AlreadyExecuted(String),

    /// Malformed request, raised before any call is built
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation needs a capability the schema or backend lacks
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Span blob could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// The backend returned rows of a different shape than the statement implies
    #[error("Unexpected result from {backend}: expected {expected}")]
    UnexpectedRows {
        backend: &'static str,
        expected: &'static str,
    },

    /// `enqueue` was called outside a Tokio runtime
    #[error("No async runtime available to run {0}")]
    NoRuntime(String),

    /// Storage was used after close
    #[error("Storage is closed")]
    Closed,
}

impl DataError {
    /// Create a database error
    pub fn database(backend: &'static str, message: impl Into<String>) -> Self {
        Self::Database {
            backend,
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(backend: &'static str, timeout_ms: u64) -> Self {
        Self::Timeout {
            backend,
            timeout_ms,
        }
    }

    /// Create an overload error
    pub fn overloaded(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::Overloaded {
            backend,
            reason: reason.into(),
        }
    }

    /// Create a backend unavailable error
    pub fn backend_unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Create a validation error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Create an unsupported-operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported(message.into())
    }

    /// True when the database signalled it is over capacity.
    ///
    /// Collectors use this to push back on their own producers instead of
    /// treating the failure like any other write error.
    pub fn is_overloaded(&self) -> bool {
        matches!(self, Self::Overloaded { .. })
    }

    /// Check if this is a failure that might succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Overloaded { .. } | Self::BackendUnavailable { .. }
        )
    }

    /// True when the call ended because it was canceled
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Get the backend name that generated this error
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Database { backend, .. } => backend,
            Self::Timeout { backend, .. } => backend,
            Self::Overloaded { backend, .. } => backend,
            Self::BackendUnavailable { backend, .. } => backend,
            Self::UnexpectedRows { backend, .. } => backend,
            Self::Canceled
            | Self::AlreadyExecuted(_)
            | Self::InvalidArgument(_)
            | Self::Unsupported(_)
            | Self::Codec(_)
            | Self::NoRuntime(_)
            | Self::Closed => "unknown",
        }
    }
}
