//! Read-only dashboard views and operator acknowledgments.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use paywatch_core::models::{
    AlertId, HealthEvent, HealthEventId, HealthStatus, MissingConfirmationAlert,
    MonitoringConfig, ProviderHealthSnapshot, ProviderName,
};
use paywatch_monitor::aggregator::window_start;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use super::ApiError;
use crate::AppState;

/// Minutes after a window closes before its snapshot is expected to exist.
pub const SNAPSHOT_GRACE_MINUTES: i64 = 2;

/// Default look-back of the events view in hours.
pub const DEFAULT_EVENT_HOURS: i64 = 24;

/// Longest look-back of the events view in hours.
pub const MAX_EVENT_HOURS: i64 = 168;

const DEFAULT_EVENT_LIMIT: i64 = 200;
const MAX_EVENT_LIMIT: i64 = 1000;

/// Current health of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthView {
    /// Provider the view describes.
    pub provider: ProviderName,
    /// Reported status. Missing or stale data never reads as healthy.
    pub status: HealthStatus,
    /// Score of the latest snapshot, if any.
    pub health_score: Option<f64>,
    /// Whether the latest snapshot is older than the window expected by now.
    pub stale: bool,
    /// Whether the provider is currently monitored.
    pub monitoring_enabled: bool,
    /// Unresolved missing-confirmation alerts for the provider.
    pub open_alerts: usize,
    /// Latest scoring-window snapshot.
    pub snapshot: Option<ProviderHealthSnapshot>,
}

/// Builds the view for a provider from its latest scoring snapshot.
///
/// The expected snapshot is the latest scoring window that closed at least
/// [`SNAPSHOT_GRACE_MINUTES`] ago. A missing or older snapshot degrades the
/// status.
pub fn provider_view(
    config: &MonitoringConfig,
    snapshot: Option<ProviderHealthSnapshot>,
    open_alerts: usize,
    now: DateTime<Utc>,
) -> ProviderHealthView {
    let grace = Duration::minutes(SNAPSHOT_GRACE_MINUTES);
    let expected_end = window_start(now - grace, config.scoring_window_minutes);
    let stale = snapshot.as_ref().map_or(true, |s| s.window_end < expected_end);

    let status = match &snapshot {
        Some(s) if stale => s.health_status.max(HealthStatus::Degraded),
        Some(s) => s.health_status,
        None => HealthStatus::Degraded,
    };

    ProviderHealthView {
        provider: config.provider.clone(),
        status,
        health_score: snapshot.as_ref().map(|s| s.health_score),
        stale,
        monitoring_enabled: config.monitoring_enabled,
        open_alerts,
        snapshot,
    }
}

/// Lists current health for every configured provider.
///
/// # Errors
///
/// Returns 503 when the stores cannot be read.
#[instrument(name = "provider_health", skip(state))]
pub async fn provider_health(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProviderHealthView>>, ApiError> {
    let now = state.clock.now();
    let configs = state.storage.list_configs().await?;
    let open = state.storage.list_open_alerts(None).await?;

    let mut views = Vec::with_capacity(configs.len());
    for config in configs {
        let snapshot = state
            .storage
            .latest_snapshot(config.provider.clone(), config.scoring_window_minutes)
            .await?;
        let open_alerts = open.iter().filter(|a| a.provider == config.provider).count();
        views.push(provider_view(&config, snapshot, open_alerts, now));
    }

    debug!(providers = views.len(), "provider health listed");
    Ok(Json(views))
}

/// Filter for the alerts view.
#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    /// Restrict to one provider.
    pub provider: Option<String>,
}

/// Lists unresolved missing-confirmation alerts.
///
/// # Errors
///
/// Returns 400 for an invalid provider filter and 503 when the store cannot
/// be read.
#[instrument(name = "list_alerts", skip(state))]
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> Result<Json<Vec<MissingConfirmationAlert>>, ApiError> {
    let provider = query.provider.as_deref().map(ProviderName::parse).transpose()?;
    let alerts = state.storage.list_open_alerts(provider).await?;
    Ok(Json(alerts))
}

/// Window of the events view.
#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    /// Look-back in hours, clamped to `1..=168`.
    pub hours: Option<i64>,
    /// Maximum number of events returned.
    pub limit: Option<i64>,
}

/// Lists recent health events, newest first.
///
/// # Errors
///
/// Returns 503 when the store cannot be read.
#[instrument(name = "list_events", skip(state))]
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Result<Json<Vec<HealthEvent>>, ApiError> {
    let hours = query.hours.unwrap_or(DEFAULT_EVENT_HOURS).clamp(1, MAX_EVENT_HOURS);
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT).clamp(1, MAX_EVENT_LIMIT);
    let since = state.clock.now() - Duration::hours(hours);

    let events = state.storage.list_events_since(since, limit).await?;
    Ok(Json(events))
}

/// Optional body of an alert acknowledgment.
#[derive(Debug, Default, Deserialize)]
pub struct AcknowledgeRequest {
    /// Resolution notes recorded on the alert.
    pub notes: Option<String>,
}

/// Acknowledges and closes a missing-confirmation alert.
///
/// # Errors
///
/// Returns 400 for a malformed id or body and 404 for unknown alerts.
#[instrument(name = "acknowledge_alert", skip(state, body), fields(alert_id = %id))]
pub async fn acknowledge_alert(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<MissingConfirmationAlert>, ApiError> {
    let id = AlertId::from(parse_id(&id)?);
    let request = if body.is_empty() {
        AcknowledgeRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("invalid acknowledgment: {e}")))?
    };

    let alert = state.dispatcher.acknowledge_alert(id, request.notes).await?;
    Ok(Json(alert))
}

/// Acknowledges and closes a health event.
///
/// # Errors
///
/// Returns 400 for a malformed id and 404 for unknown events.
#[instrument(name = "acknowledge_event", skip(state), fields(event_id = %id))]
pub async fn acknowledge_event(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<HealthEvent>, ApiError> {
    let id = HealthEventId::from(parse_id(&id)?);
    let event = state.dispatcher.acknowledge_event(id).await?;
    Ok(Json(event))
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|e| ApiError::bad_request(format!("invalid id '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use paywatch_monitor::aggregator::summarize;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 7, 0).unwrap()
    }

    fn config() -> MonitoringConfig {
        MonitoringConfig::default_for(ProviderName::parse("blockbee").unwrap(), now())
    }

    fn snapshot(start: DateTime<Utc>, status: HealthStatus) -> ProviderHealthSnapshot {
        let mut snapshot = summarize(&config().provider, start, 15, &[], start);
        snapshot.health_status = status;
        snapshot.health_score = 100.0;
        snapshot
    }

    #[test]
    fn missing_snapshot_is_degraded() {
        let view = provider_view(&config(), None, 0, now());
        assert!(view.stale);
        assert_eq!(view.status, HealthStatus::Degraded);
        assert!(view.health_score.is_none());
    }

    #[test]
    fn latest_closed_window_is_fresh() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 11, 45, 0).unwrap();
        let view = provider_view(&config(), Some(snapshot(start, HealthStatus::Healthy)), 0, now());
        assert!(!view.stale);
        assert_eq!(view.status, HealthStatus::Healthy);
    }

    #[test]
    fn stale_snapshot_never_reads_healthy() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 11, 30, 0).unwrap();

        let healthy =
            provider_view(&config(), Some(snapshot(start, HealthStatus::Healthy)), 0, now());
        assert!(healthy.stale);
        assert_eq!(healthy.status, HealthStatus::Degraded);

        let down = provider_view(&config(), Some(snapshot(start, HealthStatus::Down)), 0, now());
        assert_eq!(down.status, HealthStatus::Down);
    }
}
