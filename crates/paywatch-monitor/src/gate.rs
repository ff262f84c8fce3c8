//! Ingest and dedup gate.
//!
//! Every inbound webhook passes through [`IngestGate::record_delivery`] before
//! business handling. The gate fingerprints the payload and looks up the
//! accepted delivery owning it first: a known payload is recorded as a
//! duplicate whatever its signature, timestamp or rate-limit outcome. New
//! payloads go through those checks, and every delivery writes exactly one
//! ledger row. Only a verdict with [`GateVerdict::should_process`] may run
//! business logic; the caller reports the outcome back through
//! [`IngestGate::update_processing`].
//!
//! With [`IngestGate::with_burst_alerts`], every settled processing outcome
//! also recounts the provider's processing failures over the last
//! [`FAILURE_BURST_WINDOW_MINUTES`]: reaching [`FAILURE_BURST_THRESHOLD`]
//! raises a critical anomaly through the dispatcher, and dropping below it
//! closes the streak.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use paywatch_core::{
    models::{
        DeliveryId, DeliveryRecord, DeliveryStatus, ErrorKind, HealthEvent, HealthEventId,
        HealthEventType, IntentId, MonitoringConfig, ProcessingStatus, ProcessingUpdate,
        ProviderName, Severity,
    },
    Clock,
};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    dispatcher::{alert_fingerprint, AlertDispatcher, DispatchPolicy},
    error::{MonitorError, Result},
    fingerprint::fingerprint,
    security::{check_timestamp, verify_signature, ProviderSecrets, RateLimiter, SecurityPolicy},
    storage::MonitorStorage,
};

/// Processing failures within the burst window that raise a critical alert.
pub const FAILURE_BURST_THRESHOLD: usize = 5;

/// Look-back of the failure burst check.
pub const FAILURE_BURST_WINDOW_MINUTES: i64 = 15;

/// Dedup key of a provider's failure burst alert.
pub fn failure_burst_fingerprint(provider: &ProviderName) -> String {
    alert_fingerprint(provider, "failure_burst", format!("{FAILURE_BURST_WINDOW_MINUTES}m"))
}

/// Security material supplied with a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityInput {
    /// Raw signature and timestamp headers, verified by the gate.
    Headers {
        /// Signature header value.
        signature: Option<String>,
        /// Unix timestamp header value.
        timestamp: Option<i64>,
    },
    /// Flags from a caller that already validated the request.
    Precomputed {
        /// Signature check outcome.
        signature_valid: bool,
        /// Timestamp check outcome.
        timestamp_valid: bool,
    },
}

/// An inbound webhook as handed to the gate.
#[derive(Debug, Clone)]
pub struct DeliveryEvent {
    /// Sending provider.
    pub provider: ProviderName,
    /// Provider-defined webhook kind.
    pub webhook_kind: String,
    /// Raw request body.
    pub payload: Bytes,
    /// Signature material.
    pub security: SecurityInput,
    /// Intent the webhook refers to, when the receiver could tell.
    pub payment_intent_id: Option<IntentId>,
    /// Provider request id.
    pub request_id: Option<String>,
    /// When the provider was expected to deliver.
    pub expected_at: Option<DateTime<Utc>>,
    /// Provider-reported retry count.
    pub retry_count: i32,
}

impl DeliveryEvent {
    /// Creates an event with no intent, schedule or retry metadata.
    pub fn new(
        provider: ProviderName,
        webhook_kind: impl Into<String>,
        payload: impl Into<Bytes>,
        security: SecurityInput,
    ) -> Self {
        Self {
            provider,
            webhook_kind: webhook_kind.into(),
            payload: payload.into(),
            security,
            payment_intent_id: None,
            request_id: None,
            expected_at: None,
            retry_count: 0,
        }
    }
}

/// The gate's answer to the webhook receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateVerdict {
    /// Ledger row written for this delivery.
    pub record_id: DeliveryId,
    /// Whether the delivery collapsed onto an earlier one.
    pub duplicate: bool,
    /// First-seen record, for duplicates.
    pub duplicate_of: Option<DeliveryId>,
    /// Receipt classification.
    pub delivery_status: DeliveryStatus,
    /// Rejection reason, if any.
    pub error_kind: Option<ErrorKind>,
}

impl GateVerdict {
    /// Whether business handling may run for this delivery.
    pub fn should_process(&self) -> bool {
        self.delivery_status == DeliveryStatus::Received
    }

    fn from_record(record: &DeliveryRecord, duplicate: bool) -> Self {
        Self {
            record_id: record.id,
            duplicate,
            duplicate_of: record.duplicate_of,
            delivery_status: record.delivery_status,
            error_kind: record.error_kind,
        }
    }
}

/// Ingest gate shared by every webhook handler.
#[derive(Clone)]
pub struct IngestGate {
    storage: Arc<dyn MonitorStorage>,
    clock: Arc<dyn Clock>,
    secrets: Arc<ProviderSecrets>,
    policy: SecurityPolicy,
    limiter: RateLimiter,
    burst_dispatcher: Option<AlertDispatcher>,
}

impl IngestGate {
    /// Creates a gate over the ledger.
    pub fn new(
        storage: Arc<dyn MonitorStorage>,
        clock: Arc<dyn Clock>,
        secrets: ProviderSecrets,
        policy: SecurityPolicy,
    ) -> Self {
        let limiter = RateLimiter::new(&policy);
        Self {
            storage,
            clock,
            secrets: Arc::new(secrets),
            policy,
            limiter,
            burst_dispatcher: None,
        }
    }

    /// Raises failure burst alerts through `dispatcher` on processing updates.
    #[must_use]
    pub fn with_burst_alerts(mut self, dispatcher: AlertDispatcher) -> Self {
        self.burst_dispatcher = Some(dispatcher);
        self
    }

    /// Classifies and records an inbound delivery.
    ///
    /// Security and rate-limit rejections are recorded on the ledger row and
    /// reported through the verdict, never as errors.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::Storage` when the ledger write fails. The gate
    /// first tries to leave a minimal `storage_error` row behind.
    #[instrument(
        name = "record_delivery",
        skip(self, event),
        fields(provider = %event.provider, kind = %event.webhook_kind, size = event.payload.len())
    )]
    pub async fn record_delivery(&self, event: DeliveryEvent) -> Result<GateVerdict> {
        let now = self.clock.now();
        let content_fingerprint = fingerprint(&event.provider, &event.webhook_kind, &event.payload);

        let original = self
            .storage
            .find_accepted_delivery(
                event.provider.clone(),
                event.webhook_kind.clone(),
                content_fingerprint.clone(),
            )
            .await?;

        let (signature_valid, timestamp_valid) = self.evaluate_security(&event, now);
        let mut record = base_record(&event, content_fingerprint, now);
        record.signature_valid = signature_valid;
        record.timestamp_valid = timestamp_valid;

        if let Some(original) = &original {
            // Resends of an accepted payload stay duplicates even once their
            // timestamp has gone stale; the flags are kept on the row.
            debug!(
                duplicate_of = %original.id,
                signature_valid,
                timestamp_valid,
                "known fingerprint"
            );
        } else if !(signature_valid && timestamp_valid) {
            record.delivery_status = DeliveryStatus::Invalid;
            record.processing_status = ProcessingStatus::Skipped;
            record.error_kind = Some(ErrorKind::SecurityValidationFailed);
            record.error_message = Some(
                match (signature_valid, timestamp_valid) {
                    (false, false) => "invalid signature and stale timestamp",
                    (false, true) => "invalid signature",
                    _ => "stale or missing timestamp",
                }
                .to_string(),
            );
        } else if !self.limiter.try_acquire(&event.provider, now).await {
            record.delivery_status = DeliveryStatus::Failed;
            record.processing_status = ProcessingStatus::Skipped;
            record.rate_limited = true;
            record.error_kind = Some(ErrorKind::RateLimited);
            record.error_message = Some(format!(
                "more than {} deliveries within {}s",
                self.policy.rate_limit_max, self.policy.rate_limit_window_seconds
            ));
        }

        let outcome = match self.storage.record_delivery(record.clone()).await {
            Ok(outcome) => outcome,
            Err(storage_error) => {
                error!(error = %storage_error, record_id = %record.id, "ledger write failed");
                self.record_storage_failure(record, &storage_error.to_string()).await;
                return Err(MonitorError::from(storage_error));
            },
        };

        let verdict = GateVerdict::from_record(&outcome.record, outcome.duplicate);
        match verdict.delivery_status {
            DeliveryStatus::Received => {
                debug!(record_id = %verdict.record_id, "delivery accepted");
            },
            DeliveryStatus::Duplicate => {
                info!(
                    record_id = %verdict.record_id,
                    duplicate_of = ?verdict.duplicate_of,
                    "duplicate delivery recorded"
                );
            },
            status => {
                warn!(
                    record_id = %verdict.record_id,
                    status = %status,
                    error_kind = ?verdict.error_kind,
                    "delivery rejected"
                );
            },
        }

        Ok(verdict)
    }

    /// Applies the business outcome reported by the webhook receiver.
    ///
    /// A failing burst check is logged and does not fail the update.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown records and `InvalidInput` when business
    /// effects target a duplicate or the processing timestamps are reversed.
    #[instrument(name = "update_processing", skip(self, update), fields(record_id = %id))]
    pub async fn update_processing(
        &self,
        id: DeliveryId,
        update: ProcessingUpdate,
    ) -> Result<DeliveryRecord> {
        if let (Some(started), Some(completed)) =
            (update.processing_started_at, update.processing_completed_at)
        {
            if completed < started {
                return Err(MonitorError::invalid_input(
                    "processing_completed_at is before processing_started_at",
                ));
            }
        }

        let record = self.storage.apply_processing_update(id, update).await?;
        debug!(status = %record.processing_status, "processing outcome recorded");

        let settled = matches!(
            record.processing_status,
            ProcessingStatus::Success | ProcessingStatus::Failed
        );
        if let Some(dispatcher) = self.burst_dispatcher.as_ref().filter(|_| settled) {
            if let Err(error) = self.check_failure_burst(dispatcher, &record).await {
                warn!(provider = %record.provider, %error, "failure burst check failed");
            }
        }
        Ok(record)
    }

    /// Recounts recent processing failures of the record's provider.
    ///
    /// Returns whether a burst occurrence was dispatched.
    async fn check_failure_burst(
        &self,
        dispatcher: &AlertDispatcher,
        record: &DeliveryRecord,
    ) -> Result<bool> {
        let now = self.clock.now();
        let provider = &record.provider;
        let fingerprint = failure_burst_fingerprint(provider);
        let since = now - Duration::minutes(FAILURE_BURST_WINDOW_MINUTES);

        // Range end is exclusive
        let recent = self
            .storage
            .deliveries_in_range(provider.clone(), since, now + Duration::milliseconds(1))
            .await?;
        let failures = recent
            .iter()
            .filter(|r| r.processing_status == ProcessingStatus::Failed)
            .count();

        if failures < FAILURE_BURST_THRESHOLD {
            dispatcher.resolve(&fingerprint).await?;
            return Ok(false);
        }
        if record.processing_status != ProcessingStatus::Failed {
            return Ok(false);
        }

        let config = self
            .storage
            .find_config(provider.clone())
            .await?
            .unwrap_or_else(|| MonitoringConfig::default_for(provider.clone(), now));
        #[allow(clippy::cast_precision_loss)]
        let event = HealthEvent {
            id: HealthEventId::new(),
            provider: provider.clone(),
            event_type: HealthEventType::Anomaly,
            severity: Severity::Critical,
            title: format!("processing failure burst on {provider}"),
            description: format!(
                "{failures} processing failures within {FAILURE_BURST_WINDOW_MINUTES} minutes"
            ),
            threshold_type: None,
            threshold_value: Some(FAILURE_BURST_THRESHOLD as f64),
            actual_value: Some(failures as f64),
            context: serde_json::json!({
                "failure_count": failures,
                "window_minutes": FAILURE_BURST_WINDOW_MINUTES,
                "latest_record_id": record.id,
                "latest_error": record.error_message,
            }),
            metrics_snapshot: None,
            alert_fingerprint: fingerprint,
            occurrence_count: 1,
            escalation_level: 0,
            notified_at: None,
            resolved: false,
            auto_resolved: false,
            resolved_at: None,
            occurred_at: now,
        };

        dispatcher.dispatch_event(event, &DispatchPolicy::from(&config)).await?;
        warn!(%provider, failures, "processing failure burst");
        Ok(true)
    }

    fn evaluate_security(&self, event: &DeliveryEvent, now: DateTime<Utc>) -> (bool, bool) {
        match &event.security {
            SecurityInput::Precomputed { signature_valid, timestamp_valid } => {
                (*signature_valid, *timestamp_valid)
            },
            SecurityInput::Headers { signature, timestamp } => {
                let Some(secret) = self.secrets.get(&event.provider) else {
                    // Authenticated out of band; only check a timestamp that was sent
                    let timestamp_valid = timestamp
                        .map_or(true, |ts| check_timestamp(Some(ts), now, &self.policy).is_ok());
                    return (true, timestamp_valid);
                };

                let signature_valid =
                    match verify_signature(secret, *timestamp, &event.payload, signature.as_deref())
                    {
                        Ok(()) => true,
                        Err(reason) => {
                            debug!(%reason, "signature rejected");
                            false
                        },
                    };
                let timestamp_valid = match check_timestamp(*timestamp, now, &self.policy) {
                    Ok(()) => true,
                    Err(reason) => {
                        debug!(%reason, "timestamp rejected");
                        false
                    },
                };
                (signature_valid, timestamp_valid)
            },
        }
    }

    async fn record_storage_failure(&self, attempted: DeliveryRecord, message: &str) {
        let mut fallback = attempted;
        fallback.id = DeliveryId::new();
        fallback.delivery_status = DeliveryStatus::Failed;
        fallback.processing_status = ProcessingStatus::Skipped;
        fallback.error_kind = Some(ErrorKind::StorageError);
        fallback.error_message = Some(message.to_string());

        if let Err(retry_error) = self.storage.record_delivery(fallback).await {
            error!(error = %retry_error, "fallback ledger write failed");
        }
    }
}

fn base_record(event: &DeliveryEvent, fingerprint: String, now: DateTime<Utc>) -> DeliveryRecord {
    DeliveryRecord {
        id: DeliveryId::new(),
        provider: event.provider.clone(),
        payment_intent_id: event.payment_intent_id.clone(),
        webhook_kind: event.webhook_kind.clone(),
        request_id: event.request_id.clone(),
        expected_at: event.expected_at,
        received_at: now,
        processing_started_at: None,
        processing_completed_at: None,
        delivery_status: DeliveryStatus::Received,
        processing_status: ProcessingStatus::Pending,
        error_kind: None,
        error_message: None,
        retry_count: event.retry_count,
        signature_valid: true,
        timestamp_valid: true,
        rate_limited: false,
        payload_size_bytes: i64::try_from(event.payload.len()).unwrap_or(i64::MAX),
        fingerprint,
        payment_confirmed: false,
        balance_credited: false,
        user_notified: false,
        duplicate_of: None,
        recovery_alert_id: None,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use paywatch_core::TestClock;

    use super::*;
    use crate::{security::generate_signature, storage::mock::MockMonitorStorage};

    const SECRET: &str = "whsec_test";

    fn blockbee() -> ProviderName {
        ProviderName::parse("blockbee").unwrap()
    }

    fn setup() -> (IngestGate, MockMonitorStorage, TestClock) {
        let storage = MockMonitorStorage::new();
        let clock = TestClock::with_start_time(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let secrets = ProviderSecrets::new().with_secret(blockbee(), SECRET);
        let gate = IngestGate::new(
            Arc::new(storage.clone()),
            Arc::new(clock.clone()),
            secrets,
            SecurityPolicy::default(),
        );
        (gate, storage, clock)
    }

    fn signed(clock: &TestClock, payload: &'static [u8]) -> DeliveryEvent {
        let ts = clock.now().timestamp();
        let signature = generate_signature(SECRET, ts, payload).unwrap();
        DeliveryEvent::new(
            blockbee(),
            "payment",
            payload,
            SecurityInput::Headers { signature: Some(signature), timestamp: Some(ts) },
        )
    }

    #[tokio::test]
    async fn valid_delivery_is_accepted_pending() {
        let (gate, storage, clock) = setup();

        let verdict = gate.record_delivery(signed(&clock, br#"{"txid":"a"}"#)).await.unwrap();

        assert!(verdict.should_process());
        assert!(!verdict.duplicate);
        let stored = storage.deliveries().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].processing_status, ProcessingStatus::Pending);
        assert!(stored[0].passed_security());
    }

    #[tokio::test]
    async fn bad_signature_is_recorded_invalid() {
        let (gate, storage, clock) = setup();
        let mut event = signed(&clock, b"{}");
        event.security = SecurityInput::Headers {
            signature: Some("sha256=deadbeef".to_string()),
            timestamp: Some(clock.now().timestamp()),
        };

        let verdict = gate.record_delivery(event).await.unwrap();

        assert!(!verdict.should_process());
        assert_eq!(verdict.delivery_status, DeliveryStatus::Invalid);
        assert_eq!(verdict.error_kind, Some(ErrorKind::SecurityValidationFailed));
        assert!(!storage.deliveries().await[0].signature_valid);
    }

    #[tokio::test]
    async fn stale_timestamp_is_recorded_invalid() {
        let (gate, storage, clock) = setup();
        let event = signed(&clock, b"{}");
        clock.advance_minutes(10);

        let verdict = gate.record_delivery(event).await.unwrap();

        assert_eq!(verdict.delivery_status, DeliveryStatus::Invalid);
        let stored = &storage.deliveries().await[0];
        assert!(stored.signature_valid);
        assert!(!stored.timestamp_valid);
    }

    #[tokio::test]
    async fn provider_without_secret_skips_signature() {
        let (gate, _storage, _clock) = setup();
        let event = DeliveryEvent::new(
            ProviderName::parse("dynopay").unwrap(),
            "payment",
            &b"{}"[..],
            SecurityInput::Headers { signature: None, timestamp: None },
        );

        let verdict = gate.record_delivery(event).await.unwrap();
        assert!(verdict.should_process());
    }

    #[tokio::test]
    async fn precomputed_flags_are_trusted() {
        let (gate, _storage, _clock) = setup();
        let event = DeliveryEvent::new(
            blockbee(),
            "payment",
            &b"{}"[..],
            SecurityInput::Precomputed { signature_valid: true, timestamp_valid: false },
        );

        let verdict = gate.record_delivery(event).await.unwrap();
        assert_eq!(verdict.delivery_status, DeliveryStatus::Invalid);
    }

    #[tokio::test]
    async fn rate_limit_rejects_excess_but_not_duplicates() {
        let storage = MockMonitorStorage::new();
        let clock = TestClock::new();
        let policy = SecurityPolicy { rate_limit_max: 2, ..SecurityPolicy::default() };
        let gate =
            IngestGate::new(Arc::new(storage.clone()), Arc::new(clock), ProviderSecrets::new(), policy);
        let event = |payload: &'static str| {
            DeliveryEvent::new(
                blockbee(),
                "payment",
                payload.as_bytes(),
                SecurityInput::Precomputed { signature_valid: true, timestamp_valid: true },
            )
        };

        assert!(gate.record_delivery(event("1")).await.unwrap().should_process());
        assert!(gate.record_delivery(event("2")).await.unwrap().should_process());

        let limited = gate.record_delivery(event("3")).await.unwrap();
        assert_eq!(limited.delivery_status, DeliveryStatus::Failed);
        assert_eq!(limited.error_kind, Some(ErrorKind::RateLimited));

        let duplicate = gate.record_delivery(event("1")).await.unwrap();
        assert!(duplicate.duplicate);
        assert_eq!(duplicate.delivery_status, DeliveryStatus::Duplicate);
    }

    #[tokio::test]
    async fn storage_failure_leaves_error_row_and_surfaces() {
        let (gate, storage, clock) = setup();
        storage.inject_failure("record_delivery", "connection reset").await;

        let error = gate.record_delivery(signed(&clock, b"{}")).await.unwrap_err();

        assert!(matches!(error, MonitorError::Storage { .. }));
        let stored = storage.deliveries().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].error_kind, Some(ErrorKind::StorageError));
        assert_eq!(stored[0].delivery_status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn reversed_processing_timestamps_are_rejected() {
        let (gate, _storage, clock) = setup();
        let verdict = gate.record_delivery(signed(&clock, b"{}")).await.unwrap();

        let now = clock.now();
        let update = ProcessingUpdate {
            processing_started_at: Some(now),
            processing_completed_at: Some(now - chrono::Duration::seconds(1)),
            ..ProcessingUpdate::default()
        };
        let error = gate.update_processing(verdict.record_id, update).await.unwrap_err();
        assert!(matches!(error, MonitorError::InvalidInput { .. }));
    }
}
