//! Error types for pool construction and pooled calls

use std::time::Duration;

use thiserror::Error;

/// Boxed error produced by caller-supplied work.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for pool operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the registry, the pools and the dispatcher.
#[derive(Error, Debug)]
pub enum Error {
    /// Pool name was empty.
    #[error("pool name is empty")]
    EmptyName,

    /// No connect options were supplied.
    #[error("connect options are empty")]
    EmptyOptions,

    /// Worker count below one.
    #[error("invalid worker count {count}, must be at least 1")]
    InvalidWorkerCount {
        /// The rejected value
        count: usize,
    },

    /// Queue capacity below one.
    #[error("invalid queue capacity {capacity}, must be at least 1")]
    InvalidQueueCapacity {
        /// The rejected value
        capacity: usize,
    },

    /// Connect timeout outside the accepted window.
    #[error("timeout {timeout:?} is outside [{min:?}, {max:?}]")]
    InvalidTimeout {
        /// The rejected timeout
        timeout: Duration,
        /// Lower bound (inclusive)
        min: Duration,
        /// Upper bound (inclusive)
        max: Duration,
    },

    /// A pool with the same (case-normalised) name already exists.
    #[error("pool '{name}' is already initialized")]
    AlreadyInitialized {
        /// The normalised pool name
        name: String,
    },

    /// No pool is registered under this name.
    #[error("pool '{name}' not found")]
    NotFound {
        /// The normalised pool name
        name: String,
    },

    /// The call did not complete within the pool's call timeout.
    #[error("operation on pool '{pool}' timed out after {timeout_ms}ms")]
    OperationTimeout {
        /// The pool name
        pool: String,
        /// The call timeout in milliseconds
        timeout_ms: u64,
    },

    /// Dialling the backing resource failed.
    #[error("connect failed for pool '{pool}': {reason}")]
    Connect {
        /// The pool name
        pool: String,
        /// The failure reason
        reason: String,
        /// The underlying error
        #[source]
        source: Option<BoxError>,
    },

    /// The pool or dispatcher has been torn down.
    #[error("pool '{pool}' is closed")]
    Closed {
        /// The pool name
        pool: String,
    },

    /// The work function panicked while holding a session.
    #[error("work on pool '{pool}' panicked: {message}")]
    Panicked {
        /// The pool name
        pool: String,
        /// The panic payload, when it was a string
        message: String,
    },

    /// Error returned by the caller's work function, passed through as-is.
    #[error("{0}")]
    Work(BoxError),
}

impl Error {
    /// Create a connect error from any error source.
    pub fn connect<E>(pool: impl Into<String>, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        let source = source.into();
        Self::Connect {
            pool: pool.into(),
            reason: source.to_string(),
            source: Some(source),
        }
    }

    /// Wrap a caller error.
    pub fn work<E>(source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::Work(source.into())
    }

    /// Whether retrying the same call later could succeed.
    ///
    /// Only a timed-out call qualifies; the pool never retries on its own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OperationTimeout { .. })
    }

    /// Whether this error came from construction-time validation.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyName
                | Self::EmptyOptions
                | Self::InvalidWorkerCount { .. }
                | Self::InvalidQueueCapacity { .. }
                | Self::InvalidTimeout { .. }
        )
    }

    /// Borrow the caller's original error if it has type `E`.
    #[must_use]
    pub fn downcast_work<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            Self::Work(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}
