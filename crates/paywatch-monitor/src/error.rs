//! Error types for monitoring operations.
//!
//! Covers storage failures surfaced from the ledger, collaborator failures
//! (intent source, provider status query, notifier), per-attempt timeouts and
//! configuration problems. Errors are categorized so periodic cycles can decide
//! whether the next tick should simply try again.

use std::{fmt, time::Duration};

use paywatch_core::CoreError;
use thiserror::Error;

/// Result type alias for monitoring operations.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Error conditions raised by the gate, the periodic stages and the engine.
#[derive(Debug, Clone, Error)]
pub enum MonitorError {
    /// Ledger or state store operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Error message from the storage layer
        message: String,
    },

    /// Referenced record does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// Description of the missing record
        message: String,
    },

    /// Request rejected by a domain rule.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Rule that was violated
        message: String,
    },

    /// External collaborator could not be reached.
    #[error("collaborator unavailable: {message}")]
    Collaborator {
        /// Transport error message
        message: String,
    },

    /// External collaborator answered with a non-success status.
    #[error("collaborator error: HTTP {status_code}")]
    CollaboratorStatus {
        /// HTTP status code
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// Bounded operation exceeded its time budget.
    #[error("operation timed out after {timeout_seconds}s")]
    Timeout {
        /// Budget that was exceeded
        timeout_seconds: u64,
    },

    /// Invalid engine or provider configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Engine shutdown requested.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Engine tasks did not finish within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A supervised engine task panicked.
    #[error("engine task panicked: {message}")]
    TaskPanic {
        /// Join error message
        message: String,
    },
}

impl MonitorError {
    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Creates a collaborator transport error.
    pub fn collaborator(message: impl Into<String>) -> Self {
        Self::Collaborator { message: message.into() }
    }

    /// Creates a collaborator status error.
    pub fn collaborator_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::CollaboratorStatus { status_code, body: body.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the failure is transient and the next cycle may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage { .. } | Self::Collaborator { .. } | Self::Timeout { .. } => true,
            Self::CollaboratorStatus { status_code, .. } => *status_code >= 500,
            Self::NotFound { .. }
            | Self::InvalidInput { .. }
            | Self::Configuration { .. }
            | Self::ShutdownRequested
            | Self::ShutdownTimeout { .. }
            | Self::TaskPanic { .. } => false,
        }
    }
}

impl From<CoreError> for MonitorError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::NotFound(message) => Self::NotFound { message },
            CoreError::InvalidInput(message) => Self::InvalidInput { message },
            CoreError::Database(message) | CoreError::ConstraintViolation(message) => {
                Self::Storage { message }
            },
        }
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(error: reqwest::Error) -> Self {
        match error.status() {
            Some(status) => Self::collaborator_status(status.as_u16(), error.to_string()),
            None => Self::collaborator(error.to_string()),
        }
    }
}

/// Category of monitoring error for structured logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Ledger and state store.
    Storage,
    /// Caller-side problems.
    Request,
    /// Intent source, status query and notifier.
    Collaborator,
    /// Time budget exceeded.
    Timeout,
    /// Engine lifecycle and configuration.
    Internal,
}

impl From<&MonitorError> for ErrorCategory {
    fn from(error: &MonitorError) -> Self {
        match error {
            MonitorError::Storage { .. } => Self::Storage,
            MonitorError::NotFound { .. } | MonitorError::InvalidInput { .. } => Self::Request,
            MonitorError::Collaborator { .. } | MonitorError::CollaboratorStatus { .. } => {
                Self::Collaborator
            },
            MonitorError::Timeout { .. } => Self::Timeout,
            MonitorError::Configuration { .. }
            | MonitorError::ShutdownRequested
            | MonitorError::ShutdownTimeout { .. }
            | MonitorError::TaskPanic { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage => write!(f, "storage"),
            Self::Request => write!(f, "request"),
            Self::Collaborator => write!(f, "collaborator"),
            Self::Timeout => write!(f, "timeout"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(MonitorError::storage("connection lost").is_retryable());
        assert!(MonitorError::collaborator("connection refused").is_retryable());
        assert!(MonitorError::timeout(30).is_retryable());
        assert!(MonitorError::collaborator_status(503, "unavailable").is_retryable());

        assert!(!MonitorError::collaborator_status(404, "missing").is_retryable());
        assert!(!MonitorError::invalid_input("duplicate").is_retryable());
        assert!(!MonitorError::configuration("no windows").is_retryable());
        assert!(!MonitorError::ShutdownRequested.is_retryable());
    }

    #[test]
    fn core_errors_keep_their_meaning() {
        let not_found: MonitorError = CoreError::NotFound("alert".into()).into();
        assert!(matches!(not_found, MonitorError::NotFound { .. }));

        let invalid: MonitorError = CoreError::InvalidInput("dup".into()).into();
        assert!(matches!(invalid, MonitorError::InvalidInput { .. }));

        let db: MonitorError = CoreError::Database("down".into()).into();
        assert_eq!(ErrorCategory::from(&db), ErrorCategory::Storage);
    }

    #[test]
    fn error_display_format() {
        assert_eq!(MonitorError::timeout(30).to_string(), "operation timed out after 30s");
        assert_eq!(
            MonitorError::collaborator_status(502, "bad gateway").to_string(),
            "collaborator error: HTTP 502"
        );
    }
}
