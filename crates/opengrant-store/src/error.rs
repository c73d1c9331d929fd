//! Store error types.
//!
//! This module defines all error types that can occur during store
//! operations, from argument validation through backend failures.

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A required argument was missing, empty, or malformed.
    ///
    /// Raised synchronously, before any I/O is attempted.
    #[error("Invalid argument: {message}")]
    Argument {
        /// Description of the invalid argument.
        message: String,
    },

    /// An optimistic write observed a stale concurrency token.
    ///
    /// The persisted row was modified or deleted by another caller since it
    /// was loaded. The in-memory tracked state has been reset, so the caller
    /// can reload and retry safely.
    #[error("Concurrency conflict: {message}")]
    Concurrency {
        /// Description of the conflicting write.
        message: String,
    },

    /// A new entity could not be instantiated by its factory.
    #[error("Construction failed: {message}")]
    Construction {
        /// Description of the construction failure.
        message: String,
    },

    /// One or more row-level failures were collected during a batch
    /// revoke or prune.
    ///
    /// Row failures never abort the remaining rows of a batch; they are
    /// gathered here together with the count of rows that did succeed
    /// before the failure set was finalized.
    #[error("{} row(s) failed after {succeeded} succeeded", .causes.len())]
    Aggregate {
        /// Rows successfully mutated before the error set was raised.
        succeeded: u64,
        /// Every underlying row-level cause.
        causes: Vec<StoreError>,
    },

    /// A requested capability is unsupported by the backend or
    /// administratively disabled.
    #[error("Capability unavailable: {message}")]
    Capability {
        /// Description of the missing capability.
        message: String,
    },

    /// Scope or property JSON could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend rejected the operation; the cause surfaces unmodified.
    #[error("Backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
        /// Underlying backend error, when available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl StoreError {
    // -------------------------------------------------------------------------
    // Constructor Methods
    // -------------------------------------------------------------------------

    /// Create an `Argument` error.
    #[must_use]
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument {
            message: message.into(),
        }
    }

    /// Create a `Concurrency` error.
    #[must_use]
    pub fn concurrency(message: impl Into<String>) -> Self {
        Self::Concurrency {
            message: message.into(),
        }
    }

    /// Create a `Construction` error.
    #[must_use]
    pub fn construction(message: impl Into<String>) -> Self {
        Self::Construction {
            message: message.into(),
        }
    }

    /// Create an `Aggregate` error from collected row failures.
    #[must_use]
    pub fn aggregate(succeeded: u64, causes: Vec<StoreError>) -> Self {
        Self::Aggregate { succeeded, causes }
    }

    /// Create a `Capability` error.
    #[must_use]
    pub fn capability(message: impl Into<String>) -> Self {
        Self::Capability {
            message: message.into(),
        }
    }

    /// Create a `Backend` error from a message only.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            source: None,
        }
    }

    /// Create a `Backend` error wrapping an underlying cause.
    #[must_use]
    pub fn backend_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    // -------------------------------------------------------------------------
    // Predicate Methods
    // -------------------------------------------------------------------------

    /// Returns `true` if this is an `Argument` error.
    #[must_use]
    pub fn is_argument(&self) -> bool {
        matches!(self, Self::Argument { .. })
    }

    /// Returns `true` if this is a `Concurrency` error.
    #[must_use]
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }

    /// Returns `true` if this is a `Construction` error.
    #[must_use]
    pub fn is_construction(&self) -> bool {
        matches!(self, Self::Construction { .. })
    }

    /// Returns `true` if this is an `Aggregate` error.
    #[must_use]
    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Aggregate { .. })
    }

    /// Returns `true` if this is a `Capability` error.
    #[must_use]
    pub fn is_capability(&self) -> bool {
        matches!(self, Self::Capability { .. })
    }

    /// Returns `true` if this is a `Backend` error.
    #[must_use]
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }

    /// Returns `true` if the operation can be retried after reloading
    /// fresh state.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency { .. })
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
