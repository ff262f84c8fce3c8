//! Missing-confirmation detection.
//!
//! Scans the ledger's open payment intents for a provider and raises a
//! [`MissingConfirmationAlert`] when an intent is past its timeout without a
//! confirming delivery, or when webhooks arrived for it but none confirmed
//! within the anomaly window. The detector only reads delivery records.

use std::{collections::HashSet, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use paywatch_core::{
    error::CoreError,
    models::{
        AlertId, DeliveryRecord, DeliveryStatus, DetectionType, IntentId, MissingConfirmationAlert,
        MonitoringConfig, RecoveryStatus, Severity,
    },
    Clock,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    collaborators::{IntentSource, OpenIntent},
    dispatcher::{AlertDispatcher, DispatchPolicy},
    error::Result,
    storage::MonitorStorage,
};

/// Overdue minutes from which an alert is raised at `error` level.
pub const ERROR_LEVEL_OVERDUE_MINUTES: i64 = 60;

/// What one detector pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionReport {
    /// Open intents examined.
    pub scanned: usize,
    /// Alerts created.
    pub created: usize,
    /// Existing alerts refreshed.
    pub updated: usize,
    /// Alerts closed because the payment confirmed or the intent closed.
    pub auto_resolved: usize,
    /// Intents that could not be checked.
    pub errors: usize,
}

/// Outcome of checking one intent.
#[derive(Debug, Clone, PartialEq)]
pub enum IntentCheck {
    /// A delivery confirmed the payment.
    Confirmed,
    /// Neither trigger fired yet.
    NotDue,
    /// A trigger fired but the intent's alert was already resolved.
    AlreadyResolved,
    /// Another pass created the alert concurrently.
    AlreadyAlerted,
    /// A new alert was raised.
    Created(AlertId),
    /// The open alert was refreshed.
    Updated(AlertId),
}

/// Detection trigger for an intent, if any.
pub fn detect(
    intent: &OpenIntent,
    deliveries: &[DeliveryRecord],
    config: &MonitoringConfig,
    now: DateTime<Utc>,
) -> Option<DetectionType> {
    let age = now - intent.created_at;
    if age > config.confirmation_timeout() {
        return Some(DetectionType::Timeout);
    }

    let anomaly = config.anomaly.0;
    let webhooks = deliveries
        .iter()
        .filter(|record| record.delivery_status != DeliveryStatus::Duplicate)
        .count();
    let webhooks = i64::try_from(webhooks).unwrap_or(i64::MAX);

    (anomaly.enabled
        && webhooks >= anomaly.min_webhooks
        && age > Duration::minutes(anomaly.window_minutes))
    .then_some(DetectionType::Anomaly)
}

/// Deadline the confirmation missed.
pub fn confirmation_deadline(intent: &OpenIntent, config: &MonitoringConfig) -> DateTime<Utc> {
    intent.expected_by.unwrap_or(intent.created_at + config.confirmation_timeout())
}

/// Whole minutes from `deadline` to `now`, never negative.
pub fn overdue_minutes(deadline: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - deadline).num_minutes().max(0)
}

/// Alert level for an overdue duration.
pub fn level_for_overdue(minutes: i64) -> Severity {
    if minutes < ERROR_LEVEL_OVERDUE_MINUTES {
        Severity::Warning
    } else {
        Severity::Error
    }
}

/// Periodic missing-confirmation detector.
#[derive(Clone)]
pub struct ConfirmationDetector {
    storage: Arc<dyn MonitorStorage>,
    clock: Arc<dyn Clock>,
    intents: Arc<dyn IntentSource>,
    dispatcher: AlertDispatcher,
}

impl ConfirmationDetector {
    /// Creates a detector reading intents from `intents`.
    pub fn new(
        storage: Arc<dyn MonitorStorage>,
        clock: Arc<dyn Clock>,
        intents: Arc<dyn IntentSource>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Self { storage, clock, intents, dispatcher }
    }

    /// Runs one detector pass for a provider.
    ///
    /// Failures on individual intents are logged and counted; the pass moves
    /// on to the next intent.
    ///
    /// # Errors
    ///
    /// Returns the error when the intent listing or the open-alert listing
    /// fails.
    #[instrument(name = "detect_missing", skip(self, config), fields(provider = %config.provider))]
    pub async fn run(&self, config: &MonitoringConfig) -> Result<DetectionReport> {
        let now = self.clock.now();
        let anomaly = config.anomaly.0;
        let lookback = if anomaly.enabled {
            config.confirmation_timeout().min(Duration::minutes(anomaly.window_minutes))
        } else {
            config.confirmation_timeout()
        };

        let intents = self.intents.list_open_intents(&config.provider, now - lookback).await?;
        let mut report = DetectionReport { scanned: intents.len(), ..DetectionReport::default() };
        let open: HashSet<IntentId> = intents.iter().map(|i| i.intent_id.clone()).collect();

        for intent in &intents {
            match self.check_intent(config, intent, now).await {
                Ok(IntentCheck::Created(_)) => report.created += 1,
                Ok(IntentCheck::Updated(_)) => report.updated += 1,
                Ok(_) => {},
                Err(error) => {
                    warn!(intent = %intent.intent_id, %error, "intent check failed");
                    report.errors += 1;
                },
            }
        }

        report.auto_resolved = self.resolve_settled(config, &open, now).await?;

        if report.created + report.updated + report.auto_resolved > 0 {
            info!(
                scanned = report.scanned,
                created = report.created,
                updated = report.updated,
                auto_resolved = report.auto_resolved,
                "detector pass completed"
            );
        }
        Ok(report)
    }

    /// Checks one open intent, creating or refreshing its alert.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn check_intent(
        &self,
        config: &MonitoringConfig,
        intent: &OpenIntent,
        now: DateTime<Utc>,
    ) -> Result<IntentCheck> {
        let deliveries = self
            .storage
            .deliveries_for_intent(config.provider.clone(), intent.intent_id.clone())
            .await?;
        if deliveries.iter().any(|record| record.confirms(&intent.intent_id)) {
            return Ok(IntentCheck::Confirmed);
        }
        let Some(detection) = detect(intent, &deliveries, config, now) else {
            return Ok(IntentCheck::NotDue);
        };

        let deadline = confirmation_deadline(intent, config);
        let overdue = overdue_minutes(deadline, now);
        let level = level_for_overdue(overdue);
        let last_webhook = deliveries.iter().map(|record| record.received_at).max();
        let policy = DispatchPolicy::from(config);

        let existing = self
            .storage
            .find_alert_by_intent(config.provider.clone(), intent.intent_id.clone())
            .await?;

        match existing {
            Some(alert) if alert.resolved => Ok(IntentCheck::AlreadyResolved),
            Some(mut alert) => {
                alert.time_overdue_minutes = overdue;
                alert.last_webhook_received_at = last_webhook.or(alert.last_webhook_received_at);
                if detection == DetectionType::Timeout {
                    alert.detection_type = DetectionType::Timeout;
                }
                alert.alert_level = alert.alert_level.max(level);
                alert.updated_at = now;

                let id = alert.id;
                self.dispatcher.dispatch_alert(alert, &policy).await?;
                debug!(intent = %intent.intent_id, overdue, "missing confirmation refreshed");
                Ok(IntentCheck::Updated(id))
            },
            None => {
                let alert = MissingConfirmationAlert {
                    id: AlertId::new(),
                    provider: config.provider.clone(),
                    payment_intent_id: intent.intent_id.clone(),
                    detection_type: detection,
                    detected_at: now,
                    expected_confirmation_by: deadline,
                    time_overdue_minutes: overdue,
                    payment_snapshot: sqlx::types::Json(intent.snapshot()),
                    last_webhook_received_at: last_webhook,
                    recovery_status: RecoveryStatus::Pending,
                    recovery_attempts: 0,
                    recovery_method: None,
                    last_recovery_attempt_at: None,
                    last_recovery_error: None,
                    alert_sent: false,
                    alert_level: level,
                    escalation_level: 0,
                    acknowledged: false,
                    resolved: false,
                    resolved_at: None,
                    resolution_notes: None,
                    auto_resolved: false,
                    created_at: now,
                    updated_at: now,
                };

                match self.storage.create_alert(alert.clone()).await {
                    Ok(_) => {},
                    Err(CoreError::ConstraintViolation(_)) => {
                        return Ok(IntentCheck::AlreadyAlerted);
                    },
                    Err(error) => return Err(error.into()),
                }

                let id = alert.id;
                self.dispatcher.dispatch_alert(alert, &policy).await?;
                info!(
                    intent = %intent.intent_id,
                    detection = %detection,
                    overdue,
                    "missing confirmation detected"
                );
                Ok(IntentCheck::Created(id))
            },
        }
    }

    async fn resolve_settled(
        &self,
        config: &MonitoringConfig,
        open_intents: &HashSet<IntentId>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let alerts = self.storage.list_open_alerts(Some(config.provider.clone())).await?;
        let mut resolved = 0;

        for alert in alerts {
            let confirmed = self
                .storage
                .deliveries_for_intent(alert.provider.clone(), alert.payment_intent_id.clone())
                .await?
                .iter()
                .any(|record| record.confirms(&alert.payment_intent_id));
            let still_open = open_intents.contains(&alert.payment_intent_id);
            if still_open && !confirmed {
                continue;
            }

            let notes =
                if confirmed { "confirming delivery received" } else { "intent no longer open" };
            if self.storage.auto_resolve_alert(alert.id, notes.to_string(), now).await?.is_none() {
                continue;
            }
            self.dispatcher.resolve(&AlertDispatcher::alert_key(&alert)).await?;

            debug!(intent = %alert.payment_intent_id, confirmed, "missing confirmation auto-resolved");
            resolved += 1;
        }

        Ok(resolved)
    }
}
