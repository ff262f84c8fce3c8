//! Read-only statistics over the ledger and the event log.
//!
//! Every view looks back a number of hours from now, clamped to
//! `1..=`[`MAX_EVENT_HOURS`], and is computed from stored rows on request.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use paywatch_core::models::{
    DeliveryRecord, DeliveryStatus, HealthEvent, HealthEventType, HealthStatus, MonitoringConfig,
    ProcessingStatus, ProviderName, Severity,
};
use paywatch_monitor::MonitorError;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{
    views::{DEFAULT_EVENT_HOURS, MAX_EVENT_HOURS},
    ApiError,
};
use crate::AppState;

/// Events read for one alert summary.
const SUMMARY_EVENT_LIMIT: i64 = 10_000;

/// Alert count above which the summary reads `warning`.
pub const SUMMARY_WARNING_ABOVE: usize = 3;

/// Alert count above which the summary reads `critical`.
pub const SUMMARY_CRITICAL_ABOVE: usize = 10;

/// Look-back and optional provider filter shared by the stats views.
#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    /// Look-back in hours, clamped to `1..=168`.
    pub hours: Option<i64>,
    /// Restrict to one provider.
    pub provider: Option<String>,
}

impl StatsQuery {
    fn hours(&self) -> i64 {
        self.hours.unwrap_or(DEFAULT_EVENT_HOURS).clamp(1, MAX_EVENT_HOURS)
    }

    fn provider(&self) -> Result<Option<ProviderName>, ApiError> {
        Ok(self.provider.as_deref().map(ProviderName::parse).transpose()?)
    }
}

/// Processing time distribution over a look-back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceStats {
    /// Look-back in hours.
    pub hours: i64,
    /// Deliveries with a measured processing time.
    pub samples: usize,
    /// Mean processing time.
    pub mean_ms: Option<f64>,
    /// Interpolated median.
    pub median_ms: Option<f64>,
    /// Interpolated 95th percentile.
    pub p95_ms: Option<f64>,
    /// Fastest delivery.
    pub min_ms: Option<f64>,
    /// Slowest delivery.
    pub max_ms: Option<f64>,
}

/// Continuous percentile of sorted samples, interpolating between ranks.
pub fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    #[allow(clippy::cast_precision_loss)]
    let rank = q.clamp(0.0, 1.0) * last as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let (lo, hi) = (rank.floor() as usize, rank.ceil() as usize);
    #[allow(clippy::cast_precision_loss)]
    let weight = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * weight)
}

#[allow(clippy::cast_precision_loss)]
fn processing_ms(record: &DeliveryRecord) -> Option<f64> {
    record.processing_duration().map(|d| d.num_milliseconds() as f64)
}

/// Processing time distribution of `records`.
pub fn performance_stats(records: &[DeliveryRecord], hours: i64) -> PerformanceStats {
    let mut samples: Vec<f64> = records.iter().filter_map(processing_ms).collect();
    samples.sort_by(f64::total_cmp);

    #[allow(clippy::cast_precision_loss)]
    let mean_ms = (!samples.is_empty()).then(|| samples.iter().sum::<f64>() / samples.len() as f64);

    PerformanceStats {
        hours,
        samples: samples.len(),
        mean_ms,
        median_ms: percentile(&samples, 0.5),
        p95_ms: percentile(&samples, 0.95),
        min_ms: samples.first().copied(),
        max_ms: samples.last().copied(),
    }
}

/// Alert counts over a look-back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertSummary {
    /// Look-back in hours.
    pub hours: i64,
    /// Alerting events raised.
    pub total: usize,
    /// Alerting events per event type.
    pub by_type: BTreeMap<String, usize>,
    /// Band of the total: `info`, `warning` above 3, `critical` above 10.
    pub severity: Severity,
}

/// Counts alerting events by type. Recovery events are not alerts.
pub fn alert_summary(events: &[HealthEvent], hours: i64) -> AlertSummary {
    let mut by_type = BTreeMap::new();
    for event in events.iter().filter(|e| e.event_type != HealthEventType::Recovery) {
        *by_type.entry(event.event_type.as_str().to_string()).or_default() += 1;
    }
    let total = by_type.values().sum();

    let severity = if total > SUMMARY_CRITICAL_ABOVE {
        Severity::Critical
    } else if total > SUMMARY_WARNING_ABOVE {
        Severity::Warning
    } else {
        Severity::Info
    };

    AlertSummary { hours, total, by_type, severity }
}

/// Delivery outcomes of one provider over a look-back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderHealthDetails {
    /// Provider described.
    pub provider: ProviderName,
    /// Look-back in hours.
    pub hours: i64,
    /// Deliveries received, duplicates included.
    pub received: usize,
    /// Duplicate deliveries.
    pub duplicates: usize,
    /// Deliveries processed successfully.
    pub successful: usize,
    /// Deliveries that failed receipt or processing.
    pub failed: usize,
    /// Share of settled deliveries processed successfully.
    pub success_rate: Option<f64>,
    /// Mean processing time.
    pub mean_processing_ms: Option<f64>,
    /// Earliest delivery in the look-back.
    pub earliest: Option<DateTime<Utc>>,
    /// Latest delivery in the look-back.
    pub latest: Option<DateTime<Utc>>,
    /// `healthy` at or above the provider's success threshold, `degraded`
    /// below it, absent without settled deliveries.
    pub status: Option<HealthStatus>,
}

/// Summarizes a provider's deliveries against its success threshold.
pub fn provider_details(
    config: &MonitoringConfig,
    records: &[DeliveryRecord],
    hours: i64,
) -> ProviderHealthDetails {
    let duplicates =
        records.iter().filter(|r| r.delivery_status == DeliveryStatus::Duplicate).count();
    let settled: Vec<&DeliveryRecord> =
        records.iter().filter(|r| r.delivery_status != DeliveryStatus::Duplicate).collect();
    let successful =
        settled.iter().filter(|r| r.processing_status == ProcessingStatus::Success).count();
    let failed = settled
        .iter()
        .filter(|r| r.processing_status == ProcessingStatus::Failed || r.is_delivery_failure())
        .count();

    #[allow(clippy::cast_precision_loss)]
    let success_rate =
        (successful + failed > 0).then(|| successful as f64 / (successful + failed) as f64);
    let status = success_rate.map(|rate| {
        if rate >= config.min_success_rate_threshold {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        }
    });

    ProviderHealthDetails {
        provider: config.provider.clone(),
        hours,
        received: records.len(),
        duplicates,
        successful,
        failed,
        success_rate,
        mean_processing_ms: performance_stats(records, hours).mean_ms,
        earliest: records.iter().map(|r| r.received_at).min(),
        latest: records.iter().map(|r| r.received_at).max(),
        status,
    }
}

/// Open missing-confirmation alerts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingConfirmationCount {
    /// Unresolved alerts across providers.
    pub open: usize,
    /// Unresolved alerts per provider.
    pub by_provider: BTreeMap<String, usize>,
}

async fn deliveries_since(
    state: &AppState,
    providers: Vec<ProviderName>,
    hours: i64,
) -> Result<Vec<DeliveryRecord>, ApiError> {
    let now = state.clock.now();
    let since = now - Duration::hours(hours);
    let mut records = Vec::new();
    for provider in providers {
        // Range end is exclusive
        let rows = state
            .storage
            .deliveries_in_range(provider, since, now + Duration::milliseconds(1))
            .await?;
        records.extend(rows);
    }
    Ok(records)
}

/// Processing time statistics, for one provider or all configured ones.
///
/// # Errors
///
/// Returns 400 for an invalid provider filter and 503 when the ledger cannot
/// be read.
#[instrument(name = "performance_stats", skip(state))]
pub async fn performance(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<PerformanceStats>, ApiError> {
    let hours = query.hours();
    let providers = match query.provider()? {
        Some(provider) => vec![provider],
        None => state.storage.list_configs().await?.into_iter().map(|c| c.provider).collect(),
    };

    let records = deliveries_since(&state, providers, hours).await?;
    let stats = performance_stats(&records, hours);
    debug!(samples = stats.samples, "performance stats computed");
    Ok(Json(stats))
}

/// Alert counts by event type.
///
/// # Errors
///
/// Returns 400 for an invalid provider filter and 503 when the event log
/// cannot be read.
#[instrument(name = "alert_summary", skip(state))]
pub async fn alerts(
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<AlertSummary>, ApiError> {
    let hours = query.hours();
    let provider = query.provider()?;
    let since = state.clock.now() - Duration::hours(hours);

    let mut events = state.storage.list_events_since(since, SUMMARY_EVENT_LIMIT).await?;
    if let Some(provider) = provider {
        events.retain(|e| e.provider == provider);
    }
    Ok(Json(alert_summary(&events, hours)))
}

/// Delivery outcomes of one configured provider.
///
/// # Errors
///
/// Returns 400 for an invalid provider name, 404 for an unconfigured provider
/// and 503 when the stores cannot be read.
#[instrument(name = "provider_details", skip(state, query))]
pub async fn provider_health_details(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<ProviderHealthDetails>, ApiError> {
    let provider = ProviderName::parse(&provider)?;
    let hours = query.hours();
    let config = state
        .storage
        .find_config(provider.clone())
        .await?
        .ok_or_else(|| MonitorError::not_found(format!("no monitoring config for {provider}")))?;

    let records = deliveries_since(&state, vec![provider], hours).await?;
    Ok(Json(provider_details(&config, &records, hours)))
}

/// Count of unresolved missing-confirmation alerts.
///
/// # Errors
///
/// Returns 503 when the alert store cannot be read.
#[instrument(name = "missing_confirmation_count", skip(state))]
pub async fn missing_confirmations(
    State(state): State<AppState>,
) -> Result<Json<MissingConfirmationCount>, ApiError> {
    let open = state.storage.list_open_alerts(None).await?;
    let mut by_provider = BTreeMap::new();
    for alert in &open {
        *by_provider.entry(alert.provider.to_string()).or_default() += 1;
    }
    Ok(Json(MissingConfirmationCount { open: open.len(), by_provider }))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use paywatch_core::models::{DeliveryId, HealthEventId};

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn config() -> MonitoringConfig {
        MonitoringConfig::default_for(ProviderName::parse("dynopay").unwrap(), t0())
    }

    fn row(processing_ms: i64, status: ProcessingStatus) -> DeliveryRecord {
        let id = DeliveryId::new();
        DeliveryRecord {
            id,
            provider: config().provider,
            payment_intent_id: None,
            webhook_kind: "payment".to_string(),
            request_id: None,
            expected_at: None,
            received_at: t0(),
            processing_started_at: Some(t0()),
            processing_completed_at: Some(t0() + Duration::milliseconds(processing_ms)),
            delivery_status: DeliveryStatus::Received,
            processing_status: status,
            error_kind: None,
            error_message: None,
            retry_count: 0,
            signature_valid: true,
            timestamp_valid: true,
            rate_limited: false,
            payload_size_bytes: 64,
            fingerprint: id.to_string(),
            payment_confirmed: false,
            balance_credited: false,
            user_notified: false,
            duplicate_of: None,
            recovery_alert_id: None,
            created_at: t0(),
        }
    }

    fn event(event_type: HealthEventType) -> HealthEvent {
        HealthEvent {
            id: HealthEventId::new(),
            provider: config().provider,
            event_type,
            severity: Severity::Warning,
            title: String::new(),
            description: String::new(),
            threshold_type: None,
            threshold_value: None,
            actual_value: None,
            context: serde_json::json!({}),
            metrics_snapshot: None,
            alert_fingerprint: String::new(),
            occurrence_count: 1,
            escalation_level: 0,
            notified_at: None,
            resolved: false,
            auto_resolved: false,
            resolved_at: None,
            occurred_at: t0(),
        }
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let samples = [100.0, 200.0, 300.0, 400.0];
        assert_eq!(percentile(&samples, 0.5), Some(250.0));
        assert_eq!(percentile(&samples, 0.0), Some(100.0));
        assert_eq!(percentile(&samples, 1.0), Some(400.0));
        assert_eq!(percentile(&[7.0], 0.95), Some(7.0));
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn performance_ignores_rows_without_timing() {
        let mut pending = row(0, ProcessingStatus::Pending);
        pending.processing_completed_at = None;
        let records = vec![
            row(300, ProcessingStatus::Success),
            row(100, ProcessingStatus::Success),
            row(200, ProcessingStatus::Failed),
            pending,
        ];

        let stats = performance_stats(&records, 24);
        assert_eq!(stats.samples, 3);
        assert_eq!(stats.median_ms, Some(200.0));
        assert_eq!(stats.mean_ms, Some(200.0));
        assert_eq!(stats.min_ms, Some(100.0));
        assert_eq!(stats.max_ms, Some(300.0));
    }

    #[test]
    fn alert_summary_bands_by_total_and_skips_recoveries() {
        let mut events = vec![event(HealthEventType::Recovery); 5];
        events.extend(vec![event(HealthEventType::MissingConfirmation); 3]);
        let quiet = alert_summary(&events, 24);
        assert_eq!(quiet.total, 3);
        assert_eq!(quiet.severity, Severity::Info);
        assert!(!quiet.by_type.contains_key("recovery"));

        events.push(event(HealthEventType::ThresholdBreach));
        assert_eq!(alert_summary(&events, 24).severity, Severity::Warning);

        events.extend(vec![event(HealthEventType::Anomaly); 7]);
        let loud = alert_summary(&events, 24);
        assert_eq!(loud.total, 11);
        assert_eq!(loud.severity, Severity::Critical);
        assert_eq!(loud.by_type.get("anomaly"), Some(&7));
    }

    #[test]
    fn provider_details_rate_excludes_duplicates_and_pending() {
        let mut duplicate = row(50, ProcessingStatus::Skipped);
        duplicate.delivery_status = DeliveryStatus::Duplicate;
        let mut records: Vec<DeliveryRecord> =
            (0..8).map(|_| row(120, ProcessingStatus::Success)).collect();
        records.push(row(90, ProcessingStatus::Failed));
        records.push(row(0, ProcessingStatus::Pending));
        records.push(duplicate);

        let details = provider_details(&config(), &records, 6);
        assert_eq!(details.received, 11);
        assert_eq!(details.duplicates, 1);
        assert_eq!(details.successful, 8);
        assert_eq!(details.failed, 1);
        assert_eq!(details.success_rate, Some(8.0 / 9.0));
        assert_eq!(details.status, Some(HealthStatus::Degraded));

        let empty = provider_details(&config(), &[], 6);
        assert_eq!(empty.success_rate, None);
        assert_eq!(empty.status, None);
    }
}
