//! Error types for the flowgrid Kubernetes Operator

use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Desired state violates a static invariant; retrying is pointless
    /// until the spec itself changes
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced secret, certificate or broker credential could not be
    /// resolved; retryable
    #[error("credential resolution failed: {0}")]
    Resolution(String),

    /// Pipeline graph assembly violated an internal invariant; a programming
    /// defect, surfaced as-is
    #[error("pipeline build error: {0}")]
    Build(String),

    /// Best-effort cleanup failed; logged by the caller, never escalated to
    /// a cycle failure
    #[error("cleanup failed: {0}")]
    Cleanup(String),

    /// The reconciliation context was cancelled; a newer cycle supersedes
    /// this one
    #[error("reconciliation cancelled")]
    Cancelled,

    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Reconciliation failed in the host harness
    #[error("reconciliation failed: {0}")]
    ReconcileFailed(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OperatorError::Resolution(_)
                | OperatorError::Kube(_)
                | OperatorError::ReconcileFailed(_)
        )
    }

    /// Get a suggested requeue delay for retryable errors
    pub fn requeue_delay(&self) -> Option<std::time::Duration> {
        if self.is_retryable() {
            Some(std::time::Duration::from_secs(30))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::Resolution("secret default/broker-ca not found".to_string());
        assert!(err.to_string().contains("credential resolution failed"));
        assert!(err.to_string().contains("broker-ca"));
    }

    #[test]
    fn test_retryable_errors() {
        let resolution = OperatorError::Resolution("unreachable".to_string());
        assert!(resolution.is_retryable());

        let validation = OperatorError::Validation("reserved port".to_string());
        assert!(!validation.is_retryable());

        let build = OperatorError::Build("disconnected stage".to_string());
        assert!(!build.is_retryable());

        assert!(!OperatorError::Cancelled.is_retryable());
    }

    #[test]
    fn test_requeue_delay() {
        let retryable = OperatorError::Resolution("timeout".to_string());
        assert!(retryable.requeue_delay().is_some());

        let not_retryable = OperatorError::Validation("reserved port".to_string());
        assert!(not_retryable.requeue_delay().is_none());
    }
}
