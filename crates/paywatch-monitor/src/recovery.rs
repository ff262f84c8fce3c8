//! Recovery of missing confirmations.
//!
//! For every open alert still eligible for recovery, the orchestrator asks the
//! provider for the intent's current status on a backoff schedule. A
//! `confirmed` answer resolves the alert and writes a synthetic
//! reconciliation delivery into the ledger in the same transaction, so window
//! metrics account for the recovered confirmation. Running out of attempts
//! parks the alert in `manual` and raises a critical event.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use paywatch_core::{
    models::{
        DeliveryId, DeliveryRecord, DeliveryStatus, HealthEvent, HealthEventId, HealthEventType,
        MissingConfirmationAlert, MonitoringConfig, ProcessingStatus, RecoveryStatus, Severity,
        RECONCILIATION_KIND,
    },
    Clock,
};
use tracing::{info, instrument, warn};

use crate::{
    collaborators::{ProviderStatus, ProviderStatusQuery},
    dispatcher::{alert_fingerprint, AlertDispatcher, DispatchPolicy},
    error::{MonitorError, Result},
    fingerprint::fingerprint,
    storage::MonitorStorage,
};

/// Earliest time the next attempt for an alert may run.
///
/// The first attempt is due at detection; after `n` failed attempts the
/// alert waits `backoff[min(n - 1, len - 1)]` minutes from the last attempt.
pub fn next_attempt_at(alert: &MissingConfirmationAlert, backoff_minutes: &[i32]) -> DateTime<Utc> {
    let Some(last) = alert.last_recovery_attempt_at.filter(|_| alert.recovery_attempts > 0) else {
        return alert.detected_at;
    };
    let index = usize::try_from(alert.recovery_attempts - 1).unwrap_or(0);
    let wait = backoff_minutes
        .get(index)
        .or_else(|| backoff_minutes.last())
        .copied()
        .unwrap_or(0);
    last + Duration::minutes(i64::from(wait))
}

/// What one recovery pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Attempts made.
    pub attempted: usize,
    /// Alerts recovered.
    pub recovered: usize,
    /// Attempts that failed with attempts remaining.
    pub failed: usize,
    /// Alerts moved to manual follow-up.
    pub exhausted: usize,
    /// Candidates still waiting for their backoff.
    pub waiting: usize,
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Provider confirmed; alert resolved.
    Recovered(MissingConfirmationAlert),
    /// Attempt failed; more attempts remain.
    Failed(MissingConfirmationAlert),
    /// Attempt failed and the budget is spent.
    Exhausted(MissingConfirmationAlert),
}

/// Periodic recovery orchestrator.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    storage: Arc<dyn MonitorStorage>,
    clock: Arc<dyn Clock>,
    status: Arc<dyn ProviderStatusQuery>,
    dispatcher: AlertDispatcher,
}

impl RecoveryOrchestrator {
    /// Creates an orchestrator querying providers through `status`.
    pub fn new(
        storage: Arc<dyn MonitorStorage>,
        clock: Arc<dyn Clock>,
        status: Arc<dyn ProviderStatusQuery>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self { storage, clock, status, dispatcher }
    }

    /// Attempts recovery of every due candidate of a provider.
    ///
    /// # Errors
    ///
    /// Returns the error if candidates cannot be listed. Errors on single
    /// alerts are logged and the pass continues.
    #[instrument(name = "recover", skip(self, config), fields(provider = %config.provider))]
    pub async fn run(&self, config: &MonitoringConfig) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        if !config.auto_recovery_enabled {
            return Ok(report);
        }

        let now = self.clock.now();
        let candidates = self.storage.list_recovery_candidates(config.provider.clone()).await?;

        for alert in candidates {
            if next_attempt_at(&alert, &config.recovery_backoff_minutes) > now {
                report.waiting += 1;
                continue;
            }

            report.attempted += 1;
            match self.attempt(config, alert).await {
                Ok(AttemptOutcome::Recovered(_)) => report.recovered += 1,
                Ok(AttemptOutcome::Failed(_)) => report.failed += 1,
                Ok(AttemptOutcome::Exhausted(_)) => report.exhausted += 1,
                Err(error) => warn!(%error, "recovery attempt could not be recorded"),
            }
        }

        Ok(report)
    }

    /// Runs one bounded attempt for an alert and records its outcome.
    ///
    /// A timed-out query counts as a failed attempt.
    ///
    /// # Errors
    ///
    /// Returns storage errors from recording the outcome.
    pub async fn attempt(
        &self,
        config: &MonitoringConfig,
        alert: MissingConfirmationAlert,
    ) -> Result<AttemptOutcome> {
        let budget = u64::try_from(config.recovery_attempt_timeout_seconds).unwrap_or(1);
        let query = self.status.query_status(&alert.provider, &alert.payment_intent_id);

        let failure = match tokio::time::timeout(StdDuration::from_secs(budget), query).await {
            Ok(Ok(ProviderStatus::Confirmed)) => None,
            Ok(Ok(status)) => Some(format!("provider reported {status}")),
            Ok(Err(error)) => Some(error.to_string()),
            Err(_) => Some(MonitorError::timeout(budget).to_string()),
        };

        let now = self.clock.now();
        match failure {
            None => self.complete(config, alert, now).await.map(AttemptOutcome::Recovered),
            Some(reason) => self.fail(config, alert, reason, now).await,
        }
    }

    async fn complete(
        &self,
        config: &MonitoringConfig,
        alert: MissingConfirmationAlert,
        now: DateTime<Utc>,
    ) -> Result<MissingConfirmationAlert> {
        let record = reconciliation_record(&alert, now);
        let attempt = alert.recovery_attempts + 1;
        let recovered = self
            .storage
            .complete_recovery(
                alert.id,
                record,
                now,
                format!("provider confirmed payment on recovery attempt {attempt}"),
            )
            .await?;

        self.dispatcher.resolve(&AlertDispatcher::alert_key(&recovered)).await?;

        let event = lifecycle_event(
            &recovered,
            HealthEventType::Recovery,
            Severity::Info,
            format!("recovered missing confirmation for {}", recovered.payment_intent_id),
            now,
        );
        self.dispatcher.dispatch_event(event, &DispatchPolicy::from(config)).await?;

        info!(alert_id = %recovered.id, intent = %recovered.payment_intent_id, attempt, "payment recovered");
        Ok(recovered)
    }

    async fn fail(
        &self,
        config: &MonitoringConfig,
        alert: MissingConfirmationAlert,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<AttemptOutcome> {
        let updated = self
            .storage
            .record_recovery_failure(alert.id, reason.clone(), now, config.max_recovery_attempts)
            .await?;

        if updated.recovery_status != RecoveryStatus::Manual {
            warn!(
                alert_id = %updated.id,
                attempts = updated.recovery_attempts,
                %reason,
                "recovery attempt failed"
            );
            return Ok(AttemptOutcome::Failed(updated));
        }

        let event = lifecycle_event(
            &updated,
            HealthEventType::RecoveryExhausted,
            Severity::Critical,
            format!(
                "recovery exhausted for {} after {} attempts",
                updated.payment_intent_id, updated.recovery_attempts
            ),
            now,
        );
        self.dispatcher.dispatch_event(event, &DispatchPolicy::from(config)).await?;

        warn!(alert_id = %updated.id, %reason, "recovery exhausted, manual follow-up required");
        Ok(AttemptOutcome::Exhausted(updated))
    }
}

/// Synthetic ledger row recording a recovered confirmation.
pub fn reconciliation_record(alert: &MissingConfirmationAlert, now: DateTime<Utc>) -> DeliveryRecord {
    let payload = alert.id.to_string();
    DeliveryRecord {
        id: DeliveryId::new(),
        provider: alert.provider.clone(),
        payment_intent_id: Some(alert.payment_intent_id.clone()),
        webhook_kind: RECONCILIATION_KIND.to_string(),
        request_id: None,
        expected_at: None,
        received_at: now,
        processing_started_at: Some(now),
        processing_completed_at: Some(now),
        delivery_status: DeliveryStatus::Received,
        processing_status: ProcessingStatus::Success,
        error_kind: None,
        error_message: None,
        retry_count: alert.recovery_attempts,
        signature_valid: true,
        timestamp_valid: true,
        rate_limited: false,
        payload_size_bytes: i64::try_from(payload.len()).unwrap_or(0),
        fingerprint: fingerprint(&alert.provider, RECONCILIATION_KIND, payload.as_bytes()),
        payment_confirmed: true,
        balance_credited: false,
        user_notified: false,
        duplicate_of: None,
        recovery_alert_id: Some(alert.id),
        created_at: now,
    }
}

fn lifecycle_event(
    alert: &MissingConfirmationAlert,
    event_type: HealthEventType,
    severity: Severity,
    title: String,
    now: DateTime<Utc>,
) -> HealthEvent {
    HealthEvent {
        id: HealthEventId::new(),
        provider: alert.provider.clone(),
        event_type,
        severity,
        title,
        description: alert
            .last_recovery_error
            .clone()
            .unwrap_or_else(|| "provider status query".to_string()),
        threshold_type: None,
        threshold_value: None,
        actual_value: Some(f64::from(alert.recovery_attempts)),
        context: serde_json::json!({
            "alert_id": alert.id,
            "payment_intent_id": alert.payment_intent_id,
            "recovery_status": alert.recovery_status,
            "recovery_attempts": alert.recovery_attempts,
        }),
        metrics_snapshot: None,
        alert_fingerprint: alert_fingerprint(&alert.provider, event_type.as_str(), alert.id),
        occurrence_count: 1,
        escalation_level: 0,
        notified_at: None,
        resolved: event_type == HealthEventType::Recovery,
        auto_resolved: event_type == HealthEventType::Recovery,
        resolved_at: (event_type == HealthEventType::Recovery).then_some(now),
        occurred_at: now,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use paywatch_core::models::{
        AlertId, DetectionType, IntentId, PaymentSnapshot, ProviderName,
    };
    use rust_decimal::Decimal;

    use super::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn alert(attempts: i32, last: Option<DateTime<Utc>>) -> MissingConfirmationAlert {
        MissingConfirmationAlert {
            id: AlertId::new(),
            provider: ProviderName::parse("blockbee").unwrap(),
            payment_intent_id: IntentId::from("pi_1"),
            detection_type: DetectionType::Timeout,
            detected_at: t0(),
            expected_confirmation_by: t0(),
            time_overdue_minutes: 0,
            payment_snapshot: sqlx::types::Json(PaymentSnapshot {
                status: "awaiting_payment".to_string(),
                amount: Decimal::ONE,
                currency: "USDT".to_string(),
                address: None,
            }),
            last_webhook_received_at: None,
            recovery_status: RecoveryStatus::Pending,
            recovery_attempts: attempts,
            recovery_method: None,
            last_recovery_attempt_at: last,
            last_recovery_error: None,
            alert_sent: true,
            alert_level: Severity::Warning,
            escalation_level: 0,
            acknowledged: false,
            resolved: false,
            resolved_at: None,
            resolution_notes: None,
            auto_resolved: false,
            created_at: t0(),
            updated_at: t0(),
        }
    }

    #[test]
    fn first_attempt_is_due_at_detection() {
        assert_eq!(next_attempt_at(&alert(0, None), &[5, 15, 30]), t0());
    }

    #[test]
    fn backoff_indexes_by_attempts_made() {
        let backoff = [5, 15, 30];
        assert_eq!(next_attempt_at(&alert(1, Some(t0())), &backoff), t0() + Duration::minutes(5));
        assert_eq!(next_attempt_at(&alert(2, Some(t0())), &backoff), t0() + Duration::minutes(15));
        assert_eq!(next_attempt_at(&alert(3, Some(t0())), &backoff), t0() + Duration::minutes(30));
        assert_eq!(next_attempt_at(&alert(9, Some(t0())), &backoff), t0() + Duration::minutes(30));
    }

    #[test]
    fn reconciliation_record_confirms_the_intent() {
        let alert = alert(2, Some(t0()));
        let record = reconciliation_record(&alert, t0());

        assert!(record.confirms(&alert.payment_intent_id));
        assert_eq!(record.recovery_alert_id, Some(alert.id));
        assert_eq!(record.webhook_kind, RECONCILIATION_KIND);
        assert_eq!(record.processing_status, ProcessingStatus::Success);
    }
}
