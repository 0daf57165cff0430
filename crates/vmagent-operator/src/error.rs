//! Error types for the VMAgent operator

use std::time::Duration;
use thiserror::Error;

/// Base delay for retryable errors
const BASE_REQUEUE_SECONDS: u64 = 30;

/// Upper bound for exponential backoff
const MAX_REQUEUE_SECONDS: u64 = 600;

/// Errors that can occur while synthesizing or converging a VMAgent
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A selected target definition is structurally invalid
    #[error("Malformed target {object}: {reason}")]
    MalformedTarget { object: String, reason: String },

    /// One or more secret/config references could not be read
    #[error("Unresolved references: {}", references.join(", "))]
    UnresolvedReference { references: Vec<String> },

    /// Synthesis produced an irreconcilable duplicate
    #[error("Configuration conflict: {0}")]
    Conflict(String),

    /// Mutating the workload failed
    #[error("Apply failed: {0}")]
    ApplyError(String),

    /// The VMAgent spec failed field validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Finalizer error
    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    /// An external call exceeded its attempt timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Shorthand for a malformed target error
    pub fn malformed(object: impl Into<String>, reason: impl Into<String>) -> Self {
        OperatorError::MalformedTarget {
            object: object.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Malformed user input only clears with a spec change, so it is
    /// reported and left alone.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OperatorError::MalformedTarget { .. }
                | OperatorError::Conflict(_)
                | OperatorError::InvalidConfig(_)
        )
    }

    /// Get the requeue delay after `retries` consecutive failures
    ///
    /// 30s → 60s → 120s → 240s → 480s → 600s (capped). Returns `None`
    /// for errors that must wait for a spec change.
    pub fn requeue_delay(&self, retries: u32) -> Option<Duration> {
        if !self.is_retryable() {
            return None;
        }
        let exp = retries.saturating_sub(1).min(5);
        let delay = Duration::from_secs(BASE_REQUEUE_SECONDS) * 2u32.pow(exp);
        Some(delay.min(Duration::from_secs(MAX_REQUEUE_SECONDS)))
    }

    /// Short machine-readable reason used in status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::KubeError(_) => "KubernetesError",
            OperatorError::MalformedTarget { .. } => "MalformedTarget",
            OperatorError::UnresolvedReference { .. } => "UnresolvedReference",
            OperatorError::Conflict(_) => "Conflict",
            OperatorError::ApplyError(_) => "ApplyFailed",
            OperatorError::InvalidConfig(_) => "InvalidConfig",
            OperatorError::SerializationError(_) | OperatorError::YamlError(_) => {
                "SerializationFailed"
            }
            OperatorError::FinalizerError(_) => "FinalizerFailed",
            OperatorError::Timeout(_) => "Timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OperatorError::malformed("VMServiceScrape/default/web", "TLS cert without key");
        assert!(err.to_string().contains("VMServiceScrape/default/web"));
        assert!(err.to_string().contains("TLS cert without key"));

        let err = OperatorError::UnresolvedReference {
            references: vec!["secret/ns1/a/token".into(), "secret/ns1/b/token".into()],
        };
        assert_eq!(
            err.to_string(),
            "Unresolved references: secret/ns1/a/token, secret/ns1/b/token"
        );
    }

    #[test]
    fn test_retryable_errors() {
        assert!(OperatorError::Timeout("test".to_string()).is_retryable());
        assert!(OperatorError::ApplyError("quota".to_string()).is_retryable());
        assert!(OperatorError::UnresolvedReference { references: vec![] }.is_retryable());

        assert!(!OperatorError::Conflict("dup".to_string()).is_retryable());
        assert!(!OperatorError::InvalidConfig("bad".to_string()).is_retryable());
        assert!(!OperatorError::malformed("x", "y").is_retryable());
    }

    #[test]
    fn test_requeue_delay_backoff() {
        let err = OperatorError::ApplyError("test".to_string());
        assert_eq!(err.requeue_delay(1), Some(Duration::from_secs(30)));
        assert_eq!(err.requeue_delay(2), Some(Duration::from_secs(60)));
        assert_eq!(err.requeue_delay(5), Some(Duration::from_secs(480)));
        assert_eq!(err.requeue_delay(6), Some(Duration::from_secs(600)));
        assert_eq!(err.requeue_delay(40), Some(Duration::from_secs(600)));

        let fatal = OperatorError::Conflict("test".to_string());
        assert!(fatal.requeue_delay(1).is_none());
    }

    #[test]
    fn test_reason() {
        assert_eq!(OperatorError::Conflict("x".into()).reason(), "Conflict");
        assert_eq!(
            OperatorError::UnresolvedReference { references: vec![] }.reason(),
            "UnresolvedReference"
        );
    }
}
