//! HTTP request handlers for the paywatch API.
//!
//! Handlers are grouped by functionality:
//! - `deliveries` - ingest gate entry point and post-processing updates
//! - `views` - read-only provider health, alert and event views plus
//!   operator acknowledgments
//! - `stats` - processing time, alert and provider statistics over a look-back
//! - `health` - liveness, readiness and health checks
//!
//! Every failure is rendered as `{"error": {"code", "message"}}` where the
//! code is the error category.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use paywatch_monitor::{error::ErrorCategory, MonitorError};
use serde::Serialize;
use tracing::{error, warn};

pub mod deliveries;
pub mod health;
pub mod stats;
pub mod views;

pub use deliveries::{record_delivery, update_processing};
pub use health::{health_check, liveness_check, readiness_check};
pub use views::{acknowledge_alert, acknowledge_event, list_alerts, list_events, provider_health};

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error category, e.g. `request` or `storage`
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Handler error carrying the monitor error it came from.
#[derive(Debug)]
pub struct ApiError(pub MonitorError);

impl ApiError {
    /// Rejects a malformed request before it reaches the monitor.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self(MonitorError::invalid_input(message))
    }

    fn status(&self) -> StatusCode {
        match &self.0 {
            MonitorError::NotFound { .. } => StatusCode::NOT_FOUND,
            MonitorError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
            MonitorError::Storage { .. } => StatusCode::SERVICE_UNAVAILABLE,
            MonitorError::Collaborator { .. } | MonitorError::CollaboratorStatus { .. } => {
                StatusCode::BAD_GATEWAY
            },
            MonitorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<MonitorError> for ApiError {
    fn from(error: MonitorError) -> Self {
        Self(error)
    }
}

impl From<paywatch_core::CoreError> for ApiError {
    fn from(error: paywatch_core::CoreError) -> Self {
        Self(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, status = status.as_u16(), "request failed");
        } else {
            warn!(error = %self.0, status = status.as_u16(), "request rejected");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: ErrorCategory::from(&self.0).to_string(),
                message: self.0.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}
