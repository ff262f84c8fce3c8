//! Window aggregation.
//!
//! Closes fixed, epoch-aligned windows per provider and window size, turning
//! the ledger rows received in `[start, end)` into one scored
//! [`ProviderHealthSnapshot`]. Snapshots are upserted by
//! `(provider, start, duration)`, so re-running a window replaces it.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use paywatch_core::{
    models::{
        DeliveryRecord, DeliveryStatus, HealthStatus, LatencyStats, MonitoringConfig,
        ProcessingStatus, ProviderHealthSnapshot, ProviderName,
    },
    Clock,
};
use tracing::{debug, info, instrument};

use crate::{error::Result, scorer, storage::MonitorStorage};

/// Most windows of one size closed by a single run.
pub const MAX_BACKFILL_WINDOWS: usize = 12;

/// Start of the window of `minutes` containing `at`, aligned to the epoch.
pub fn window_start(at: DateTime<Utc>, minutes: i32) -> DateTime<Utc> {
    let size = i64::from(minutes.max(1)) * 60;
    let aligned = at.timestamp().div_euclid(size) * size;
    DateTime::<Utc>::from_timestamp(aligned, 0).unwrap_or(at)
}

/// Closed windows due for aggregation, oldest first.
///
/// Starts after the latest stored window, or with the most recent closed
/// window when none is stored, and stops at `MAX_BACKFILL_WINDOWS`.
pub fn due_windows(
    latest_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    minutes: i32,
) -> Vec<DateTime<Utc>> {
    let size = Duration::minutes(i64::from(minutes));
    let open_start = window_start(now, minutes);

    let mut next = match latest_start {
        Some(latest) => latest + size,
        None => open_start - size,
    };

    let mut due = Vec::new();
    while next < open_start && due.len() < MAX_BACKFILL_WINDOWS {
        due.push(next);
        next += size;
    }
    due
}

/// Mean, min, max and nearest-rank p95 of a sample set in milliseconds.
pub fn latency_stats(samples: &mut [f64]) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats::default();
    }
    samples.sort_by(f64::total_cmp);

    let n = samples.len();
    #[allow(clippy::cast_precision_loss)]
    let mean = samples.iter().sum::<f64>() / n as f64;
    // Nearest rank: ceil(0.95 * n), 1-based
    let rank = (n * 95).div_ceil(100).max(1);

    LatencyStats {
        mean_ms: Some(mean),
        min_ms: samples.first().copied(),
        max_ms: samples.last().copied(),
        p95_ms: Some(samples[rank - 1]),
    }
}

#[allow(clippy::cast_precision_loss)]
fn millis(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: i64, denominator: i64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Builds the unscored metrics of one window from its ledger rows.
///
/// `records` must be the rows received in `[start, start + minutes)`. The
/// processing success rate only counts settled rows: pending and skipped
/// deliveries are in neither its numerator nor its denominator.
pub fn summarize(
    provider: &ProviderName,
    start: DateTime<Utc>,
    minutes: i32,
    records: &[DeliveryRecord],
    computed_at: DateTime<Utc>,
) -> ProviderHealthSnapshot {
    let received = i64::try_from(records.len()).unwrap_or(i64::MAX);
    let mut duplicates = 0_i64;
    let mut successful = 0_i64;
    let mut failed = 0_i64;
    let mut delivery_failures = 0_i64;
    let mut late = 0_i64;
    let mut secure = 0_i64;
    let mut error_counts: BTreeMap<String, i64> = BTreeMap::new();
    let mut delays = Vec::new();
    let mut durations = Vec::new();

    for record in records {
        if record.expected_at.is_some_and(|expected| expected < start) {
            late += 1;
        }
        if record.passed_security() {
            secure += 1;
        }
        if record.is_delivery_failure() {
            delivery_failures += 1;
        }
        if let Some(kind) = record.error_kind {
            *error_counts.entry(kind.as_str().to_string()).or_default() += 1;
        }

        if record.delivery_status == DeliveryStatus::Duplicate {
            duplicates += 1;
            continue;
        }
        if record.processing_status == ProcessingStatus::Success {
            successful += 1;
        } else if record.processing_status == ProcessingStatus::Failed
            || record.is_delivery_failure()
        {
            failed += 1;
        }

        if let Some(delay) = record.delivery_delay() {
            delays.push(millis(delay));
        }
        if let Some(duration) = record.processing_duration() {
            durations.push(millis(duration));
        }
    }

    ProviderHealthSnapshot {
        provider: provider.clone(),
        window_start: start,
        window_end: start + Duration::minutes(i64::from(minutes)),
        window_duration_minutes: minutes,
        expected_count: received - late,
        received_count: received,
        successful_count: successful,
        failed_count: failed,
        duplicate_count: duplicates,
        late_count: late,
        delivery_delay: latency_stats(&mut delays),
        processing_time: latency_stats(&mut durations),
        delivery_success_rate: ratio(received - delivery_failures, received),
        processing_success_rate: ratio(successful, successful + failed),
        security_pass_rate: ratio(secure, received),
        error_counts,
        health_score: 100.0,
        health_status: HealthStatus::Healthy,
        computed_at,
        thresholds_checked_at: None,
    }
}

/// Periodic window closer for every configured window size.
#[derive(Clone)]
pub struct WindowAggregator {
    storage: Arc<dyn MonitorStorage>,
    clock: Arc<dyn Clock>,
}

impl WindowAggregator {
    /// Creates an aggregator over the ledger.
    pub fn new(storage: Arc<dyn MonitorStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Closes every due window of every configured size for a provider.
    ///
    /// Returns the snapshots written, oldest first per window size.
    ///
    /// # Errors
    ///
    /// Returns the first storage error. Windows written before the error
    /// stay written and the next run continues after them.
    #[instrument(name = "aggregate", skip(self, config), fields(provider = %config.provider))]
    pub async fn run(&self, config: &MonitoringConfig) -> Result<Vec<ProviderHealthSnapshot>> {
        let now = self.clock.now();
        let mut written = Vec::new();

        for &minutes in &config.aggregation_windows_minutes {
            let latest =
                self.storage.latest_snapshot(config.provider.clone(), minutes).await?;
            let due = due_windows(latest.map(|s| s.window_start), now, minutes);

            for start in due {
                written.push(self.aggregate_window(config, start, minutes).await?);
            }
        }

        if !written.is_empty() {
            info!(windows = written.len(), "closed aggregation windows");
        }
        Ok(written)
    }

    /// Computes, scores and upserts one window.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the range read or the upsert.
    pub async fn aggregate_window(
        &self,
        config: &MonitoringConfig,
        start: DateTime<Utc>,
        minutes: i32,
    ) -> Result<ProviderHealthSnapshot> {
        let end = start + Duration::minutes(i64::from(minutes));
        let records =
            self.storage.deliveries_in_range(config.provider.clone(), start, end).await?;

        let mut snapshot = summarize(&config.provider, start, minutes, &records, self.clock.now());
        let assessment = scorer::assess(&snapshot, config);
        snapshot.health_score = assessment.score;
        snapshot.health_status = assessment.status;

        self.storage.upsert_snapshot(snapshot.clone()).await?;
        debug!(
            window_start = %start,
            window_minutes = minutes,
            received = snapshot.received_count,
            score = snapshot.health_score,
            status = %snapshot.health_status,
            "window closed"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn windows_align_to_their_size() {
        assert_eq!(window_start(at(12, 7), 5), at(12, 5));
        assert_eq!(window_start(at(12, 7), 15), at(12, 0));
        assert_eq!(window_start(at(12, 59), 60), at(12, 0));
        assert_eq!(window_start(at(12, 59), 1440), at(0, 0));
    }

    #[test]
    fn first_run_closes_only_latest_window() {
        assert_eq!(due_windows(None, at(12, 7), 5), vec![at(12, 0)]);
    }

    #[test]
    fn backfill_resumes_after_latest_and_is_capped() {
        assert_eq!(due_windows(Some(at(11, 45)), at(12, 16), 5).len(), 5);
        assert_eq!(due_windows(Some(at(11, 45)), at(12, 16), 5)[0], at(11, 50));
        assert_eq!(due_windows(Some(at(0, 0)), at(12, 0), 5).len(), MAX_BACKFILL_WINDOWS);
        assert!(due_windows(Some(at(12, 0)), at(12, 9), 5).is_empty());
    }

    #[test]
    fn p95_uses_nearest_rank() {
        let mut samples: Vec<f64> = (1..=20).map(f64::from).collect();
        let stats = latency_stats(&mut samples);
        assert_eq!(stats.p95_ms, Some(19.0));
        assert_eq!(stats.min_ms, Some(1.0));
        assert_eq!(stats.max_ms, Some(20.0));
        assert_eq!(stats.mean_ms, Some(10.5));

        let mut single = vec![42.0];
        assert_eq!(latency_stats(&mut single).p95_ms, Some(42.0));
        assert_eq!(latency_stats(&mut []), LatencyStats::default());
    }

    #[test]
    fn empty_window_has_null_rates() {
        let provider = ProviderName::parse("dynopay").unwrap();
        let snapshot = summarize(&provider, at(12, 0), 15, &[], at(12, 15));

        assert_eq!(snapshot.received_count, 0);
        assert_eq!(snapshot.delivery_success_rate, None);
        assert_eq!(snapshot.processing_success_rate, None);
        assert_eq!(snapshot.security_pass_rate, None);
        assert_eq!(snapshot.window_end, at(12, 15));
    }

    fn row(minute: u32, status: ProcessingStatus) -> DeliveryRecord {
        let id = paywatch_core::models::DeliveryId::new();
        DeliveryRecord {
            id,
            provider: ProviderName::parse("dynopay").unwrap(),
            payment_intent_id: None,
            webhook_kind: "payment".to_string(),
            request_id: None,
            expected_at: None,
            received_at: at(12, minute),
            processing_started_at: None,
            processing_completed_at: None,
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
            created_at: at(12, minute),
        }
    }

    #[test]
    fn unsettled_rows_do_not_dilute_success_rate() {
        let provider = ProviderName::parse("dynopay").unwrap();
        let mut records: Vec<DeliveryRecord> =
            (0..9).map(|minute| row(minute, ProcessingStatus::Success)).collect();
        records.push(row(9, ProcessingStatus::Pending));
        records.push(row(10, ProcessingStatus::Skipped));

        let snapshot = summarize(&provider, at(12, 0), 15, &records, at(12, 15));
        assert_eq!(snapshot.received_count, 11);
        assert_eq!(snapshot.successful_count, 9);
        assert_eq!(snapshot.failed_count, 0);
        assert_eq!(snapshot.processing_success_rate, Some(1.0));

        records.push(row(11, ProcessingStatus::Failed));
        let snapshot = summarize(&provider, at(12, 0), 15, &records, at(12, 15));
        assert_eq!(snapshot.processing_success_rate, Some(0.9));
    }
}
