//! Error taxonomy for the orchestration engine.
//!
//! Client-level errors ([`QueueError`], [`FleetError`]) convert into this
//! taxonomy at the reconciler boundary, which decides per class whether a
//! failure is retried, walked to a fallback candidate, or aborts the record.

use std::time::Duration;

use thiserror::Error;

use crate::fleet::FleetError;
use crate::labels::ValidationError;
use crate::queue::QueueError;
use crate::selector::UnsatisfiableRequest;

/// Classified failure for one reconciliation step.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Malformed request labels. Operator error, never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No allow-listed instance type satisfies the request. Never retried.
    #[error("unsatisfiable request: {0}")]
    Unsatisfiable(String),

    /// Temporary remote failure. Retried with backoff, bounded.
    #[error("transient failure: {message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Provider cannot supply capacity within the request's constraints.
    #[error("capacity unavailable: {0}")]
    Capacity(String),

    /// Internal consistency violation. Fatal to the affected record only.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl OrchestratorError {
    /// Server-provided wait hint, when the failure carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether another attempt can change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Capacity(_))
    }
}

impl From<ValidationError> for OrchestratorError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<UnsatisfiableRequest> for OrchestratorError {
    fn from(err: UnsatisfiableRequest) -> Self {
        Self::Unsatisfiable(err.to_string())
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::RateLimited { retry_after } => Self::Transient {
                message: "job queue rate limited".to_string(),
                retry_after,
            },
            other => Self::Transient {
                message: other.to_string(),
                retry_after: None,
            },
        }
    }
}

impl From<FleetError> for OrchestratorError {
    fn from(err: FleetError) -> Self {
        match err {
            FleetError::InsufficientCapacity(message) => Self::Capacity(message),
            FleetError::PriceExceeded(message) => Self::Capacity(message),
            FleetError::RateLimited { retry_after } => Self::Transient {
                message: "fleet API rate limited".to_string(),
                retry_after,
            },
            other => Self::Transient {
                message: other.to_string(),
                retry_after: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_hint_survives_conversion() {
        let err: OrchestratorError = QueueError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        }
        .into();

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_capacity_errors_classify_as_capacity() {
        let err: OrchestratorError =
            FleetError::InsufficientCapacity("no spot capacity".to_string()).into();
        assert!(matches!(err, OrchestratorError::Capacity(_)));

        let err: OrchestratorError = FleetError::PriceExceeded("floor above bid".to_string()).into();
        assert!(matches!(err, OrchestratorError::Capacity(_)));
    }
}
