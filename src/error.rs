use thiserror::Error;

/// Provider-specific error types
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Malformed LoadBalancer spec. Not retried beyond the queue's standard
    /// policy; the resource stays in this state until corrected.
    #[error("invalid LoadBalancer spec: {0}")]
    Validation(String),

    /// Transient object-store failure; retried via queue backoff.
    #[error("object store error: {0}")]
    Store(#[from] kube::Error),

    /// The LoadBalancer that triggered the pass no longer exists with the
    /// expected identity. Treated as success-path abandonment.
    #[error("LoadBalancer {namespace}/{name} is gone: got uid {actual}, wanted {expected}")]
    OwnerReplaced {
        namespace: String,
        name: String,
        expected: String,
        actual: String,
    },

    /// The cache reported an object gone that the API server still has.
    /// Retried via queue backoff until the cache catches up.
    #[error("cache lagging behind API server for LoadBalancer {namespace}/{name}")]
    StaleRead { namespace: String, name: String },
}

impl ProviderError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        ProviderError::Validation(msg.into())
    }

    /// True for outcomes the engine treats as successful abandonment rather
    /// than a retryable failure.
    pub fn is_abandonment(&self) -> bool {
        matches!(self, ProviderError::OwnerReplaced { .. })
    }
}

/// Result type for provider operations
pub type Result<T> = std::result::Result<T, ProviderError>;
