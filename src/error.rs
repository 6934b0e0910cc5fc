//! Central error types for the Redis Sentinel operator
//!
//! Uses `thiserror` for ergonomic, type-safe error handling with
//! automatic `Display` and `Error` trait implementations.
//!
//! Every error maps onto one [`ErrorCategory`], which drives both the
//! requeue policy and the `lastErrorCategory` field of the resource status.

use std::fmt;

use thiserror::Error;

/// Central error type for the Redis Sentinel operator
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error from kube-rs
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Finalizer-related error during cleanup
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// The desired state is invalid; no actions may be derived from it
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A platform call failed in a way that is expected to clear up
    #[error("Transient platform error: {0}")]
    RetryableError(String),

    /// Not enough sentinels agreed on a master
    #[error("Sentinel quorum uncertain: {0}")]
    QuorumUncertain(String),

    /// The platform refused a specific action as invalid or over quota
    #[error("Action {action} rejected: {reason}")]
    ActionRejected { action: String, reason: String },

    /// Network failure while talking to a sentinel
    #[error("Sentinel query failed for {address}: {message}")]
    SentinelQueryError { address: String, message: String },

    /// Malformed reply from a sentinel
    #[error("Unexpected sentinel reply: {0}")]
    ProtocolError(String),

    /// The reconciliation pass was interrupted between actions
    #[error("Reconciliation aborted: {0}")]
    Aborted(String),
}

/// Result type alias for operator operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse error classes surfaced in the resource status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid desired state; fatal for the cycle
    Configuration,
    /// Platform call failed transiently; cycle re-run after backoff
    Retryable,
    /// Observer could not get a majority view
    QuorumUncertain,
    /// Platform refused one action; the rest of the plan still applies
    ActionRejected,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Configuration => "ConfigurationError",
            ErrorCategory::Retryable => "RetryableError",
            ErrorCategory::QuorumUncertain => "QuorumUncertain",
            ErrorCategory::ActionRejected => "ActionRejected",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error for status reporting and requeue decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ConfigurationError(_) | Error::SerializationError(_) => {
                ErrorCategory::Configuration
            }
            Error::QuorumUncertain(_) => ErrorCategory::QuorumUncertain,
            Error::ActionRejected { .. } => ErrorCategory::ActionRejected,
            Error::KubeError(_)
            | Error::FinalizerError(_)
            | Error::RetryableError(_)
            | Error::SentinelQueryError { .. }
            | Error::ProtocolError(_)
            | Error::Aborted(_) => ErrorCategory::Retryable,
        }
    }

    /// Check if this error type should trigger a retry
    pub fn is_retriable(&self) -> bool {
        self.category() == ErrorCategory::Retryable
    }

    /// Convert to a human-readable message for status updates
    pub fn status_message(&self) -> String {
        match self {
            Error::KubeError(e) => format!("Kubernetes error: {}", e),
            Error::ConfigurationError(msg) => format!("Invalid configuration: {}", msg),
            Error::ActionRejected { action, reason } => {
                format!("Platform rejected {}: {}", action, reason)
            }
            Error::SentinelQueryError { address, message } => {
                format!("Sentinel {} unreachable: {}", address, message)
            }
            _ => self.to_string(),
        }
    }
}

// Implement From for kube::runtime::finalizer::Error to enable ? operator
impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        match e {
            kube::runtime::finalizer::Error::ApplyFailed(inner)
            | kube::runtime::finalizer::Error::CleanupFailed(inner) => inner,
            other => Error::FinalizerError(other.to_string()),
        }
    }
}
