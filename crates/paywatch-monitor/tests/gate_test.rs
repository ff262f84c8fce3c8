//! Ingest gate behavior against the in-memory ledger.
//!
//! Covers the duplicate path end to end: the second copy of a webhook is
//! recorded as its own ledger row, classified as a duplicate, and cannot
//! carry business effects, so a wallet credit is applied exactly once.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use chrono::Duration;
use paywatch_core::{
    models::{
        DeliveryStatus, ErrorKind, IntentId, ProcessingStatus, ProcessingUpdate, ProviderName,
        Severity,
    },
    TestClock,
};
use paywatch_monitor::{
    collaborators::NotificationSubject,
    gate::{failure_burst_fingerprint, SecurityInput, FAILURE_BURST_THRESHOLD},
    notify::RecordingNotifier,
    security::{generate_signature, ProviderSecrets, SecurityPolicy},
    AlertDispatcher, DeliveryEvent, IngestGate, MockMonitorStorage, MonitorError,
};

const SECRET: &str = "whsec_blockbee";

fn blockbee() -> ProviderName {
    ProviderName::parse("blockbee").unwrap()
}

fn setup() -> (IngestGate, MockMonitorStorage, TestClock) {
    let storage = MockMonitorStorage::new();
    let clock = TestClock::new();
    let gate = IngestGate::new(
        Arc::new(storage.clone()),
        Arc::new(clock.clone()),
        ProviderSecrets::new().with_secret(blockbee(), SECRET),
        SecurityPolicy::default(),
    );
    (gate, storage, clock)
}

fn signed_payment(clock: &TestClock, payload: &'static [u8]) -> DeliveryEvent {
    let timestamp = paywatch_core::Clock::now(clock).timestamp();
    let signature = generate_signature(SECRET, timestamp, payload).unwrap();
    let mut event = DeliveryEvent::new(
        blockbee(),
        "payment_confirmed",
        payload,
        SecurityInput::Headers { signature: Some(signature), timestamp: Some(timestamp) },
    );
    event.payment_intent_id = Some(IntentId::from("pi_dup"));
    event
}

fn credit(clock: &TestClock) -> ProcessingUpdate {
    let now = paywatch_core::Clock::now(clock);
    ProcessingUpdate {
        processing_status: Some(ProcessingStatus::Success),
        processing_started_at: Some(now),
        processing_completed_at: Some(now + Duration::milliseconds(120)),
        payment_confirmed: true,
        balance_credited: true,
        user_notified: true,
        ..ProcessingUpdate::default()
    }
}

#[tokio::test]
async fn duplicate_within_one_second_credits_once() {
    let (gate, storage, clock) = setup();
    let payload: &'static [u8] = br#"{"txid":"0xabc","value":"25.00"}"#;

    let first = gate.record_delivery(signed_payment(&clock, payload)).await.unwrap();
    clock.advance(std::time::Duration::from_millis(400));
    let second = gate.record_delivery(signed_payment(&clock, payload)).await.unwrap();

    assert!(first.should_process());
    assert!(!first.duplicate);
    assert!(second.duplicate);
    assert!(!second.should_process());
    assert_eq!(second.duplicate_of, Some(first.record_id));

    let rows = storage.deliveries().await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].delivery_status, DeliveryStatus::Received);
    assert_eq!(rows[1].delivery_status, DeliveryStatus::Duplicate);
    assert_eq!(rows[1].processing_status, ProcessingStatus::Skipped);
    assert_eq!(rows[0].fingerprint, rows[1].fingerprint);

    // The receiver applies the credit for the first copy only
    gate.update_processing(first.record_id, credit(&clock)).await.unwrap();
    let rejected = gate.update_processing(second.record_id, credit(&clock)).await;
    assert!(matches!(rejected, Err(MonitorError::InvalidInput { .. })));

    let credited = storage.deliveries().await.iter().filter(|r| r.balance_credited).count();
    assert_eq!(credited, 1);
}

#[tokio::test]
async fn different_kind_with_same_payload_is_not_a_duplicate() {
    let (gate, _storage, clock) = setup();
    let payload: &'static [u8] = br#"{"txid":"0xabc"}"#;

    let confirmed = gate.record_delivery(signed_payment(&clock, payload)).await.unwrap();
    let mut pending = signed_payment(&clock, payload);
    pending.webhook_kind = "payment_pending".to_string();
    let pending = gate.record_delivery(pending).await.unwrap();

    assert!(!confirmed.duplicate);
    assert!(!pending.duplicate);
}

#[tokio::test]
async fn rejected_copy_does_not_block_a_valid_retry() {
    let (gate, storage, clock) = setup();
    let payload: &'static [u8] = br#"{"txid":"0xdef"}"#;

    let mut forged = signed_payment(&clock, payload);
    forged.security = SecurityInput::Headers {
        signature: Some("00".repeat(32)),
        timestamp: Some(paywatch_core::Clock::now(&clock).timestamp()),
    };
    let forged = gate.record_delivery(forged).await.unwrap();
    let genuine = gate.record_delivery(signed_payment(&clock, payload)).await.unwrap();

    assert_eq!(forged.delivery_status, DeliveryStatus::Invalid);
    assert_eq!(forged.error_kind, Some(ErrorKind::SecurityValidationFailed));
    assert!(genuine.should_process());
    assert_eq!(storage.deliveries().await.len(), 2);
}

#[tokio::test]
async fn ledger_failure_surfaces_and_leaves_storage_error_row() {
    let (gate, storage, clock) = setup();
    storage.inject_failure("record_delivery", "connection reset").await;

    let result = gate.record_delivery(signed_payment(&clock, b"{}")).await;

    assert!(matches!(result, Err(MonitorError::Storage { .. })));
    let rows = storage.deliveries().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].error_kind, Some(ErrorKind::StorageError));
    assert_eq!(rows[0].processing_status, ProcessingStatus::Skipped);
}

#[tokio::test]
async fn reversed_processing_timestamps_are_rejected() {
    let (gate, _storage, clock) = setup();
    let verdict = gate.record_delivery(signed_payment(&clock, b"{}")).await.unwrap();

    let now = paywatch_core::Clock::now(&clock);
    let update = ProcessingUpdate {
        processing_status: Some(ProcessingStatus::Success),
        processing_started_at: Some(now),
        processing_completed_at: Some(now - Duration::seconds(1)),
        ..ProcessingUpdate::default()
    };

    let result = gate.update_processing(verdict.record_id, update).await;
    assert!(matches!(result, Err(MonitorError::InvalidInput { .. })));
}

#[tokio::test]
async fn unknown_record_update_is_not_found() {
    let (gate, _storage, clock) = setup();
    let result =
        gate.update_processing(paywatch_core::DeliveryId::new(), credit(&clock)).await;
    assert!(matches!(result, Err(MonitorError::NotFound { .. })));
}

#[tokio::test]
async fn late_redelivery_of_known_payload_is_a_duplicate() {
    let (gate, storage, clock) = setup();
    let payload: &'static [u8] = br#"{"txid":"0x51","value":"40.00"}"#;

    let first = gate.record_delivery(signed_payment(&clock, payload)).await.unwrap();
    // Provider retries the original signed request after the replay window
    let retry = signed_payment(&clock, payload);
    clock.advance_minutes(10);
    let second = gate.record_delivery(retry).await.unwrap();

    assert!(first.should_process());
    assert!(second.duplicate);
    assert_eq!(second.delivery_status, DeliveryStatus::Duplicate);
    assert_eq!(second.duplicate_of, Some(first.record_id));
    assert_eq!(second.error_kind, None);

    let rows = storage.deliveries().await;
    assert_eq!(rows.len(), 2);
    assert!(!rows[1].timestamp_valid);
    assert!(rows[1].signature_valid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_copies_record_one_accepted_delivery() {
    let (gate, storage, clock) = setup();
    let payload: &'static [u8] = br#"{"txid":"0x77","value":"12.50"}"#;

    let first = tokio::spawn({
        let gate = gate.clone();
        let event = signed_payment(&clock, payload);
        async move { gate.record_delivery(event).await }
    });
    let second = tokio::spawn({
        let gate = gate.clone();
        let event = signed_payment(&clock, payload);
        async move { gate.record_delivery(event).await }
    });
    let (first, second) = tokio::join!(first, second);
    let verdicts = [first.unwrap().unwrap(), second.unwrap().unwrap()];

    assert_eq!(verdicts.iter().filter(|v| v.should_process()).count(), 1);
    assert_eq!(verdicts.iter().filter(|v| v.duplicate).count(), 1);

    let rows = storage.deliveries().await;
    let received = rows.iter().filter(|r| r.delivery_status == DeliveryStatus::Received);
    let duplicates = rows.iter().filter(|r| r.delivery_status == DeliveryStatus::Duplicate);
    assert_eq!(received.count(), 1);
    assert_eq!(duplicates.count(), 1);
}

fn failed(clock: &TestClock) -> ProcessingUpdate {
    let now = paywatch_core::Clock::now(clock);
    ProcessingUpdate {
        processing_status: Some(ProcessingStatus::Failed),
        processing_started_at: Some(now),
        processing_completed_at: Some(now + Duration::milliseconds(80)),
        error_kind: Some(ErrorKind::BusinessLogicError),
        error_message: Some("wallet service unavailable".to_string()),
        ..ProcessingUpdate::default()
    }
}

async fn fail_deliveries(gate: &IngestGate, clock: &TestClock, count: usize) {
    for n in 0..count {
        let payload = format!(r#"{{"txid":"0xf{n}"}}"#);
        let event = DeliveryEvent::new(
            blockbee(),
            "payment_confirmed",
            payload.into_bytes(),
            SecurityInput::Precomputed { signature_valid: true, timestamp_valid: true },
        );
        let verdict = gate.record_delivery(event).await.unwrap();
        gate.update_processing(verdict.record_id, failed(clock)).await.unwrap();
        clock.advance(std::time::Duration::from_secs(30));
    }
}

#[tokio::test]
async fn processing_failure_burst_raises_one_critical_alert() {
    let (gate, storage, clock) = setup();
    let notifier = RecordingNotifier::new();
    let gate = gate.with_burst_alerts(AlertDispatcher::new(
        Arc::new(storage.clone()),
        Arc::new(clock.clone()),
        Arc::new(notifier.clone()),
    ));

    fail_deliveries(&gate, &clock, FAILURE_BURST_THRESHOLD - 1).await;
    assert_eq!(notifier.count().await, 0);

    fail_deliveries(&gate, &clock, 2).await;
    let sent = notifier.sent().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].level, Severity::Critical);
    assert_eq!(sent[0].fingerprint, failure_burst_fingerprint(&blockbee()));
    let NotificationSubject::Event(event) = &sent[0].subject else {
        panic!("expected a health event");
    };
    assert_eq!(event.context["failure_count"], FAILURE_BURST_THRESHOLD);
}

#[tokio::test]
async fn failure_burst_closes_once_failures_age_out() {
    let (gate, storage, clock) = setup();
    let gate = gate.with_burst_alerts(AlertDispatcher::new(
        Arc::new(storage.clone()),
        Arc::new(clock.clone()),
        Arc::new(RecordingNotifier::new()),
    ));
    fail_deliveries(&gate, &clock, FAILURE_BURST_THRESHOLD).await;
    assert_eq!(storage.events().await.iter().filter(|e| !e.resolved).count(), 1);

    clock.advance_minutes(20);
    let verdict = gate.record_delivery(signed_payment(&clock, b"{}")).await.unwrap();
    gate.update_processing(verdict.record_id, credit(&clock)).await.unwrap();

    let events = storage.events().await;
    assert_eq!(events.len(), 1);
    assert!(events[0].resolved);
    assert!(events[0].auto_resolved);
}
