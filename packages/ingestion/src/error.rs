//! Typed errors for the ingestion pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can match
//! on failure kinds and apply the retry policy.

use thiserror::Error;

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Input argument had the wrong type or shape
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// Foreign-key, range, or unique constraint violated
    #[error("constraint violation: {reason}")]
    Constraint { reason: String },

    /// LLM provider call failed
    #[error("LLM provider error: {0}")]
    Provider(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// LLM provider rejected the call due to rate limiting
    #[error("LLM provider rate limited")]
    RateLimited,

    /// LLM call exceeded the client's timeout
    #[error("LLM call timed out")]
    ProviderTimeout,

    /// LLM response could not be decoded into the expected shape
    #[error("failed to parse LLM response: {reason}")]
    Parse { reason: String },

    /// Parallel analysis results failed count/ID validation
    #[error("Parallel analysis validation failed: {issues}")]
    AnalysisValidation { issues: String },

    /// Processing accounting mismatch; the batch must abort
    #[error("{0}")]
    Integrity(String),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Connection lost, invalid config, or other unrecoverable state
    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

impl PipelineError {
    /// Whether the provider signalled rate limiting.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, PipelineError::RateLimited)
    }

    /// Whether the provider call timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::ProviderTimeout)
    }

    /// Whether the whole chunk is worth retrying at the job level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Provider(_)
                | PipelineError::RateLimited
                | PipelineError::ProviderTimeout
                | PipelineError::Parse { .. }
                | PipelineError::Storage(_)
        )
    }

    /// Convenience constructor for storage failures.
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        PipelineError::Storage(Box::new(err))
    }

    /// Convenience constructor for provider failures.
    pub fn provider(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        PipelineError::Provider(Box::new(err))
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_shape() {
        let err = PipelineError::AnalysisValidation {
            issues: "Content count mismatch: expected 3, got 2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Parallel analysis validation failed: Content count mismatch: expected 3, got 2"
        );
    }

    #[test]
    fn test_retry_classification() {
        assert!(PipelineError::RateLimited.is_rate_limit());
        assert!(PipelineError::ProviderTimeout.is_timeout());
        assert!(PipelineError::ProviderTimeout.is_retryable());
        assert!(!PipelineError::Integrity("mismatch".into()).is_retryable());
        assert!(!PipelineError::InvalidInput {
            reason: "not an array".into()
        }
        .is_retryable());
    }
}
