//! Error types for cache store operations

use thiserror::Error;

/// Errors surfaced by cache stores and pools.
///
/// A missing entry is never an error: lookups return `Ok(None)` instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Stored payload or characteristics could not be decoded.
    ///
    /// This is a data-integrity signal and is never swallowed; callers
    /// should treat the affected entry (or store) as damaged.
    #[error("cache store corrupted: {reason}")]
    CorruptedStore { reason: String },

    /// The underlying backend failed for a reason that is neither a
    /// missing table nor a retryable deadlock.
    #[error("cache operation failed: {reason}")]
    OperationFailed { reason: String },

    /// The backend cannot provide the requested capability.
    ///
    /// Protocol adapters translate this into a `false` result instead of
    /// propagating it, so callers can degrade gracefully.
    #[error("{store} does not support {operation}")]
    Unsupported {
        store: &'static str,
        operation: &'static str,
    },

    /// The store was used in a way that breaks its ownership rules, such
    /// as asking it to manage a transaction the caller already opened.
    /// A usage error: it fails fast and is never retried.
    #[error("illegal state: {reason}")]
    IllegalState { reason: String },

    /// A protocol adapter rejected a key before touching the store.
    #[error("invalid cache key: {key:?}")]
    InvalidKey { key: String },
}

/// Result type alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
