//! Liveness, readiness and health of the paywatch process.
//!
//! Provider health lives under `/v1/providers/health`. These checks only
//! say whether this instance can reach its delivery ledger.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use paywatch_monitor::MonitorStorage;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Body of `/health` and `/ready`.
#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    /// `healthy` when the ledger answered.
    pub status: ServiceStatus,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Dependency checks.
    pub checks: DependencyChecks,
    /// Crate version.
    pub version: &'static str,
}

/// Process status reported to orchestrators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Ledger reachable.
    Healthy,
    /// Ledger unreachable; ingestion would fail.
    Unhealthy,
}

/// Dependencies checked.
#[derive(Debug, Serialize)]
pub struct DependencyChecks {
    /// Delivery ledger round trip.
    pub ledger: LedgerCheck,
}

/// Outcome of the ledger round trip.
#[derive(Debug, Serialize)]
pub struct LedgerCheck {
    /// `up` or `down`.
    pub status: LedgerStatus,
    /// Storage error, when down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Round trip time.
    pub response_time_ms: u64,
}

/// Reachability of the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    /// Answered.
    Up,
    /// Failed to answer.
    Down,
}

async fn check_ledger(state: &AppState) -> ServiceHealth {
    let started = state.clock.instant();
    let outcome = MonitorStorage::health_check(state.storage.as_ref()).await;
    let response_time_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (status, message) = match outcome {
        Ok(()) => (LedgerStatus::Up, None),
        Err(e) => {
            error!(error = %e, "ledger unreachable");
            (LedgerStatus::Down, Some(format!("ledger unreachable: {e}")))
        },
    };

    ServiceHealth {
        status: match status {
            LedgerStatus::Up => ServiceStatus::Healthy,
            LedgerStatus::Down => ServiceStatus::Unhealthy,
        },
        timestamp: state.clock.now(),
        checks: DependencyChecks { ledger: LedgerCheck { status, message, response_time_ms } },
        version: env!("CARGO_PKG_VERSION"),
    }
}

/// Ledger-backed health check. Answers 503 while the ledger is down.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let health = check_ledger(&state).await;
    let code = match health.status {
        ServiceStatus::Healthy => StatusCode::OK,
        ServiceStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    debug!(status = ?health.status, "health check answered");
    (code, Json(health)).into_response()
}

/// Ready when deliveries can be recorded, i.e. the ledger answers.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    health_check(State(state)).await
}

/// Liveness check. Never touches the ledger.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "status": "alive",
        "timestamp": state.clock.now(),
        "service": "paywatch"
    });
    (StatusCode::OK, Json(body)).into_response()
}
