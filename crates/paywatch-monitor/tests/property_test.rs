//! Property-based tests for window aggregation and health scoring.
//!
//! Generates arbitrary ledger contents for a window and checks the counting
//! identities every closed window must satisfy, then checks that the score
//! never improves when success rate drops or processing slows down.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use paywatch_core::models::{
    DeliveryId, DeliveryRecord, DeliveryStatus, ErrorKind, HealthStatus, LatencyStats,
    MonitoringConfig, ProcessingStatus, ProviderHealthSnapshot, ProviderName,
};
use paywatch_monitor::{aggregator::summarize, scorer};
use proptest::prelude::*;

fn window_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn provider() -> ProviderName {
    ProviderName::parse("blockbee").unwrap()
}

fn delivery_status() -> impl Strategy<Value = DeliveryStatus> {
    prop_oneof![
        6 => Just(DeliveryStatus::Received),
        1 => Just(DeliveryStatus::Failed),
        1 => Just(DeliveryStatus::Timeout),
        1 => Just(DeliveryStatus::Invalid),
        2 => Just(DeliveryStatus::Duplicate),
    ]
}

fn processing_status() -> impl Strategy<Value = ProcessingStatus> {
    prop_oneof![
        Just(ProcessingStatus::Pending),
        Just(ProcessingStatus::Success),
        Just(ProcessingStatus::Failed),
        Just(ProcessingStatus::Partial),
        Just(ProcessingStatus::Skipped),
    ]
}

/// Strategy for one ledger row received inside a 15-minute window.
fn record_strategy() -> impl Strategy<Value = DeliveryRecord> {
    (
        0i64..900,                       // received offset, seconds
        prop::option::of(-1800i64..900), // expected offset, seconds
        delivery_status(),
        processing_status(),
        0i64..20_000, // processing duration, ms
        any::<bool>(),
    )
        .prop_map(|(received, expected, delivery, processing, duration_ms, has_error)| {
            let received_at = window_start() + Duration::seconds(received);
            let id = DeliveryId::new();
            DeliveryRecord {
                id,
                provider: provider(),
                payment_intent_id: None,
                webhook_kind: "payment".to_string(),
                request_id: None,
                expected_at: expected.map(|s| window_start() + Duration::seconds(s)),
                received_at,
                processing_started_at: Some(received_at),
                processing_completed_at: Some(received_at + Duration::milliseconds(duration_ms)),
                delivery_status: delivery,
                processing_status: processing,
                error_kind: has_error.then_some(ErrorKind::BusinessLogicError),
                error_message: None,
                retry_count: 0,
                signature_valid: delivery != DeliveryStatus::Invalid,
                timestamp_valid: true,
                rate_limited: false,
                payload_size_bytes: 128,
                fingerprint: id.to_string(),
                payment_confirmed: false,
                balance_credited: false,
                user_notified: false,
                duplicate_of: None,
                recovery_alert_id: None,
                created_at: received_at,
            }
        })
}

fn scored_snapshot(success_rate: f64, processing_ms: f64) -> ProviderHealthSnapshot {
    ProviderHealthSnapshot {
        provider: provider(),
        window_start: window_start(),
        window_end: window_start() + Duration::minutes(15),
        window_duration_minutes: 15,
        expected_count: 50,
        received_count: 50,
        successful_count: 0,
        failed_count: 0,
        duplicate_count: 0,
        late_count: 0,
        delivery_delay: LatencyStats::default(),
        processing_time: LatencyStats { mean_ms: Some(processing_ms), ..LatencyStats::default() },
        delivery_success_rate: Some(1.0),
        processing_success_rate: Some(success_rate),
        security_pass_rate: Some(1.0),
        error_counts: BTreeMap::new(),
        health_score: 0.0,
        health_status: HealthStatus::Healthy,
        computed_at: window_start(),
        thresholds_checked_at: None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn window_counts_are_consistent(records in prop::collection::vec(record_strategy(), 0..200)) {
        let snapshot =
            summarize(&provider(), window_start(), 15, &records, window_start() + Duration::minutes(15));

        prop_assert!(snapshot.received_count <= snapshot.expected_count + snapshot.late_count);
        prop_assert!(
            snapshot.successful_count + snapshot.failed_count + snapshot.duplicate_count
                <= snapshot.received_count
        );
        prop_assert_eq!(snapshot.received_count, i64::try_from(records.len()).unwrap());

        for rate in [
            snapshot.delivery_success_rate,
            snapshot.processing_success_rate,
            snapshot.security_pass_rate,
        ]
        .into_iter()
        .flatten()
        {
            prop_assert!((0.0..=1.0).contains(&rate));
        }

        if let (Some(min), Some(p95), Some(max)) = (
            snapshot.processing_time.min_ms,
            snapshot.processing_time.p95_ms,
            snapshot.processing_time.max_ms,
        ) {
            prop_assert!(min <= p95 && p95 <= max);
        }
    }

    #[test]
    fn error_counts_add_up(records in prop::collection::vec(record_strategy(), 0..100)) {
        let snapshot =
            summarize(&provider(), window_start(), 15, &records, window_start() + Duration::minutes(15));
        let with_error = records.iter().filter(|r| r.error_kind.is_some()).count();

        prop_assert_eq!(
            snapshot.error_counts.values().sum::<i64>(),
            i64::try_from(with_error).unwrap()
        );
    }

    #[test]
    fn score_never_improves_as_success_rate_drops(
        high in 0.0f64..=1.0,
        drop in 0.0f64..=1.0,
        processing_ms in 0.0f64..60_000.0,
    ) {
        let low = (high - drop).max(0.0);
        let config = MonitoringConfig::default_for(provider(), window_start());

        let better = scorer::compute_score(&scored_snapshot(high, processing_ms), &config);
        let worse = scorer::compute_score(&scored_snapshot(low, processing_ms), &config);

        prop_assert!(worse <= better);
        prop_assert!((0.0..=100.0).contains(&worse));
    }

    #[test]
    fn score_never_improves_as_processing_slows(
        rate in 0.0f64..=1.0,
        fast in 0.0f64..60_000.0,
        extra in 0.0f64..60_000.0,
    ) {
        let config = MonitoringConfig::default_for(provider(), window_start());

        let better = scorer::compute_score(&scored_snapshot(rate, fast), &config);
        let worse = scorer::compute_score(&scored_snapshot(rate, fast + extra), &config);

        prop_assert!(worse <= better);
    }

    #[test]
    fn status_bands_follow_score(rate in 0.0f64..=1.0, processing_ms in 0.0f64..60_000.0) {
        let config = MonitoringConfig::default_for(provider(), window_start());
        let assessment = scorer::assess(&scored_snapshot(rate, processing_ms), &config);

        let expected = scorer::classify(assessment.score, &config.scoring.0);
        prop_assert_eq!(assessment.status, expected);
        prop_assert_eq!(
            assessment.breaches().any(|c| c.bucket == "down"),
            assessment.status == HealthStatus::Down
        );
    }
}
