use std::error::Error as StdError;
use std::sync::Arc;

/// Boxed error returned by recomputation functions.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Error type for cache operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// A store operation failed.
    #[error("[{store}] store error for key '{key}': {message}")]
    Operation {
        store: String,
        key: String,
        message: String,
    },

    /// The value stored at a key is not a valid cache entry.
    #[error("corrupt cache entry for key '{key}': {message}")]
    Decode { key: String, message: String },

    /// The recomputation function returned an error. Displayed verbatim.
    #[error(transparent)]
    Recompute(Arc<dyn StdError + Send + Sync + 'static>),

    /// The recomputation function panicked.
    #[error("recompute for key '{key}' panicked: {message}")]
    RecomputePanic { key: String, message: String },

    /// Fewer replicas than requested acknowledged an invalidation in time.
    ///
    /// The invalidation itself was applied on the primary.
    #[error(
        "wait replicas for key '{key}' failed: requested {requested}, acknowledged {achieved}"
    )]
    ReplicationTimeout {
        key: String,
        requested: u32,
        achieved: u32,
    },

    /// Invalid client options.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Gave up waiting for another owner's lease.
    #[error("gave up waiting for lease on key '{key}' after {waited_ms}ms")]
    LockWait { key: String, waited_ms: u64 },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Create a new operation error.
    pub fn operation(
        store: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        CacheError::Operation {
            store: store.into(),
            key: key.into(),
            message: message.into(),
        }
    }

    pub(crate) fn decode(key: impl Into<String>, message: impl Into<String>) -> Self {
        CacheError::Decode {
            key: key.into(),
            message: message.into(),
        }
    }

    pub(crate) fn recompute(err: impl Into<BoxError>) -> Self {
        CacheError::Recompute(Arc::from(err.into()))
    }

    /// Returns the recomputation error if it is of type `E`.
    ///
    /// ```ignore
    /// if let Some(e) = err.downcast_recompute::<sqlx::Error>() { ... }
    /// ```
    pub fn downcast_recompute<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            CacheError::Recompute(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// True for errors raised by the caller's recomputation function.
    pub fn is_recompute(&self) -> bool {
        matches!(
            self,
            CacheError::Recompute(_) | CacheError::RecomputePanic { .. }
        )
    }
}
