//! Cloud error types.
//!
//! Every failure path in scopes and reconcilers returns a [`CloudError`].
//! The orchestrating loop decides retry cadence from the classification
//! helpers rather than from the variant itself.

use thiserror::Error;

/// Errors that can occur while reconciling infrastructure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloudError {
    /// Network failure, timeout or 5xx from the backend.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// Backend asked us to slow down.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Backend resource is still being torn down.
    #[error("deletion of {0} still in progress")]
    DeletionInProgress(String),

    /// The desired spec can not be satisfied as written.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Quota exhausted in a way that will not heal on its own.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Bootstrap secret or config is not available yet.
    #[error("bootstrap data unavailable for {0}")]
    BootstrapDataUnavailable(String),

    /// Attempt to move an already-set control-plane endpoint.
    #[error("control plane endpoint already set to {current}, refusing {requested}")]
    EndpointConflict { current: String, requested: String },

    /// Attempt to replace an already-recorded provider ID.
    #[error("provider id already set to {current}, refusing {requested}")]
    ProviderIdConflict { current: String, requested: String },

    /// Instance status transition not allowed by the state machine.
    #[error("invalid instance status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation completed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Backend resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend resource already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl CloudError {
    /// Whether re-invoking the operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CloudError::Transient(_)
                | CloudError::RateLimited(_)
                | CloudError::DeletionInProgress(_)
                | CloudError::BootstrapDataUnavailable(_)
                | CloudError::Cancelled
                | CloudError::DeadlineExceeded
        )
    }

    /// Configuration errors that must be surfaced on the resource and not
    /// fast-retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CloudError::InvalidConfiguration(_) | CloudError::QuotaExceeded(_)
        )
    }

    /// Programming errors: a caller tried to break a scope invariant.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            CloudError::EndpointConflict { .. }
                | CloudError::ProviderIdConflict { .. }
                | CloudError::InvalidTransition { .. }
        )
    }

    /// Data the resource depends on is not ready yet.
    pub fn is_not_ready(&self) -> bool {
        matches!(self, CloudError::BootstrapDataUnavailable(_))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, CloudError::Cancelled | CloudError::DeadlineExceeded)
    }
}

/// Result type for cloud operations.
pub type Result<T> = std::result::Result<T, CloudError>;
