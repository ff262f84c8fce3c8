//! Alert dispatch with cooldown suppression and escalation.
//!
//! Every occurrence of a health event or missing-confirmation alert is keyed
//! by an alert fingerprint `provider:category:bucket`. The dispatcher keeps one
//! [`AlertState`] per fingerprint, read-modify-written atomically by the
//! storage layer, and one open [`HealthEvent`] per unresolved streak.
//!
//! Occurrences of an open streak are folded into its event. Whether a streak
//! is new or continuing, an occurrence only notifies once the cooldown since
//! the fingerprint's last notification has elapsed, unless the occurrence
//! count crosses an escalation threshold, which always notifies at a raised
//! severity. Closing a streak keeps the last notification time, so a flapping
//! check cannot bypass the cooldown.

use std::{fmt::Display, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use paywatch_core::{
    models::{
        AlertId, AlertState, HealthEvent, HealthEventId, HealthEventType, MissingConfirmationAlert,
        MonitoringConfig, ProviderName, Severity,
    },
    Clock,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    collaborators::{Notification, NotificationSubject, Notifier},
    error::Result,
    storage::MonitorStorage,
};

/// Builds the dedup key of an alert.
pub fn alert_fingerprint(provider: &ProviderName, category: &str, bucket: impl Display) -> String {
    format!("{provider}:{category}:{bucket}")
}

/// Cooldown and escalation settings of one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchPolicy {
    /// Minimum time between notifications for one fingerprint.
    pub cooldown: Duration,
    /// Ascending occurrence counts that raise the escalation level.
    pub escalation_thresholds: Vec<i32>,
}

impl From<&MonitoringConfig> for DispatchPolicy {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            cooldown: config.alert_cooldown(),
            escalation_thresholds: config.escalation_thresholds.clone(),
        }
    }
}

impl DispatchPolicy {
    /// Number of thresholds reached by `occurrences`.
    pub fn level_for(&self, occurrences: i32) -> i32 {
        let reached = self.escalation_thresholds.iter().filter(|t| **t <= occurrences).count();
        i32::try_from(reached).unwrap_or(i32::MAX)
    }
}

/// What the dispatcher decided for one occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// First occurrence of a new streak.
    pub new_streak: bool,
    /// Occurrence count after this occurrence.
    pub occurrence_count: i32,
    /// Escalation level after this occurrence.
    pub escalation_level: i32,
    /// A threshold was crossed by this occurrence.
    pub escalated: bool,
    /// A notification goes out.
    pub notify: bool,
}

/// Decides the fate of an occurrence from the previous fingerprint state.
///
/// Pure, so the storage transition and the caller reach the same answer.
pub fn decide(previous: Option<&AlertState>, now: DateTime<Utc>, policy: &DispatchPolicy) -> Decision {
    let cooled_down = previous
        .and_then(|state| state.last_notified_at)
        .map_or(true, |sent| now - sent >= policy.cooldown);

    match previous {
        Some(state) if !state.resolved => {
            let occurrence_count = state.occurrence_count.saturating_add(1);
            let escalation_level = policy.level_for(occurrence_count);
            let escalated = escalation_level > state.escalation_level;
            Decision {
                new_streak: false,
                occurrence_count,
                escalation_level,
                escalated,
                notify: escalated || cooled_down,
            }
        },
        _ => {
            let escalation_level = policy.level_for(1);
            let escalated = escalation_level > 0;
            Decision {
                new_streak: true,
                occurrence_count: 1,
                escalation_level,
                escalated,
                notify: escalated || cooled_down,
            }
        },
    }
}

struct Occurrence {
    provider: ProviderName,
    category: String,
    now: DateTime<Utc>,
    candidate_event: HealthEventId,
    policy: DispatchPolicy,
}

fn next_state(previous: Option<&AlertState>, fingerprint: &str, occ: &Occurrence) -> AlertState {
    let decision = decide(previous, occ.now, &occ.policy);
    let continuing = previous.filter(|_| !decision.new_streak);

    AlertState {
        fingerprint: fingerprint.to_string(),
        provider: occ.provider.clone(),
        category: occ.category.clone(),
        occurrence_count: decision.occurrence_count,
        escalation_level: decision.escalation_level,
        last_notified_at: if decision.notify {
            Some(occ.now)
        } else {
            previous.and_then(|state| state.last_notified_at)
        },
        first_seen_at: continuing.map_or(occ.now, |state| state.first_seen_at),
        last_seen_at: occ.now,
        open_event_id: continuing
            .and_then(|state| state.open_event_id)
            .or(Some(occ.candidate_event)),
        resolved: false,
        updated_at: occ.now,
    }
}

/// Result of dispatching one occurrence.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// The decision taken.
    pub decision: Decision,
    /// Fingerprint state after the occurrence.
    pub state: AlertState,
    /// The open event as persisted.
    pub event: HealthEvent,
    /// Severity the notification carried, or would have carried.
    pub level: Severity,
}

/// Dispatcher shared by the scorer, detector, recovery and engine stages.
#[derive(Clone)]
pub struct AlertDispatcher {
    storage: Arc<dyn MonitorStorage>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
}

impl AlertDispatcher {
    /// Creates a dispatcher sending through `notifier`.
    pub fn new(
        storage: Arc<dyn MonitorStorage>,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self { storage, clock, notifier }
    }

    /// Registers an occurrence of a health event and notifies if due.
    ///
    /// The event's `alert_fingerprint` selects the streak. Notifier failures
    /// are logged and do not fail the dispatch.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the state transition or event write.
    pub async fn dispatch_event(
        &self,
        event: HealthEvent,
        policy: &DispatchPolicy,
    ) -> Result<DispatchOutcome> {
        self.dispatch(event, None, policy).await
    }

    /// Registers an occurrence of a missing-confirmation alert.
    ///
    /// Records it as a `missing_confirmation` event, notifies with the alert as
    /// subject if due, and persists `alert_sent` and `escalation_level`. An
    /// alert closed meanwhile, e.g. acknowledged while the notification was in
    /// flight, is returned as stored and left closed.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the transition, event or alert write.
    pub async fn dispatch_alert(
        &self,
        mut alert: MissingConfirmationAlert,
        policy: &DispatchPolicy,
    ) -> Result<(MissingConfirmationAlert, DispatchOutcome)> {
        let now = self.clock.now();
        let fingerprint = Self::alert_key(&alert);
        #[allow(clippy::cast_precision_loss)]
        let overdue_minutes = alert.time_overdue_minutes as f64;
        let event = HealthEvent {
            id: HealthEventId::new(),
            provider: alert.provider.clone(),
            event_type: HealthEventType::MissingConfirmation,
            severity: alert.alert_level,
            title: format!(
                "missing confirmation for {} on {}",
                alert.payment_intent_id, alert.provider
            ),
            description: format!(
                "{} minutes past the expected confirmation time ({} detection)",
                alert.time_overdue_minutes, alert.detection_type
            ),
            threshold_type: None,
            threshold_value: None,
            actual_value: Some(overdue_minutes),
            context: serde_json::json!({
                "alert_id": alert.id,
                "payment_intent_id": alert.payment_intent_id,
                "expected_confirmation_by": alert.expected_confirmation_by,
                "detection_type": alert.detection_type,
                "amount": alert.payment_snapshot.0.amount,
                "currency": alert.payment_snapshot.0.currency,
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

        let outcome = self.dispatch(event, Some(alert.clone()), policy).await?;

        alert.alert_sent |= outcome.decision.notify;
        alert.escalation_level = outcome.state.escalation_level;
        alert.updated_at = now;
        let alert = match self.storage.refresh_alert(alert.id, alert.refresh()).await? {
            Some(stored) => stored,
            None => {
                debug!(alert_id = %alert.id, "alert closed during dispatch, refresh skipped");
                self.storage.find_alert(alert.id).await?.unwrap_or(alert)
            },
        };
        Ok((alert, outcome))
    }

    /// Ends the streak of a fingerprint after a passing check.
    ///
    /// Auto-resolves the open event. Returns `false` when nothing was open.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the state or event write.
    #[instrument(name = "resolve_alert", skip(self))]
    pub async fn resolve(&self, fingerprint: &str) -> Result<bool> {
        self.close_streak(fingerprint, true).await
    }

    /// Operator acknowledgment of an event, also ending its streak.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown events and storage errors otherwise.
    pub async fn acknowledge_event(&self, id: HealthEventId) -> Result<HealthEvent> {
        let event = self.storage.acknowledge_event(id, self.clock.now()).await?;
        self.close_streak(&event.alert_fingerprint, false).await?;
        info!(event_id = %id, fingerprint = %event.alert_fingerprint, "event acknowledged");
        Ok(event)
    }

    /// Operator acknowledgment of a missing-confirmation alert.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unknown alerts and storage errors otherwise.
    pub async fn acknowledge_alert(
        &self,
        id: AlertId,
        notes: Option<String>,
    ) -> Result<MissingConfirmationAlert> {
        let alert = self.storage.acknowledge_alert(id, notes, self.clock.now()).await?;
        self.close_streak(&Self::alert_key(&alert), false).await?;
        info!(alert_id = %id, "alert acknowledged");
        Ok(alert)
    }

    /// Fingerprint of a missing-confirmation alert.
    pub fn alert_key(alert: &MissingConfirmationAlert) -> String {
        alert_fingerprint(
            &alert.provider,
            HealthEventType::MissingConfirmation.as_str(),
            &alert.payment_intent_id,
        )
    }

    async fn dispatch(
        &self,
        mut event: HealthEvent,
        alert: Option<MissingConfirmationAlert>,
        policy: &DispatchPolicy,
    ) -> Result<DispatchOutcome> {
        let now = self.clock.now();
        let fingerprint = event.alert_fingerprint.clone();
        let occurrence = Occurrence {
            provider: event.provider.clone(),
            category: fingerprint_category(&fingerprint),
            now,
            candidate_event: event.id,
            policy: policy.clone(),
        };

        let key = fingerprint.clone();
        let (previous, state) = self
            .storage
            .transition_alert_state(
                fingerprint.clone(),
                Box::new(move |previous| next_state(previous, &key, &occurrence)),
            )
            .await?;
        let decision = decide(previous.as_ref(), now, policy);
        let notified_at = decision.notify.then_some(now);

        let open = match (decision.new_streak, state.open_event_id) {
            (false, Some(open_id)) => self.storage.find_event(open_id).await?,
            _ => None,
        };
        let event = match open {
            Some(mut open) => {
                open.actual_value = event.actual_value.or(open.actual_value);
                open.occurrence_count = decision.occurrence_count;
                open.escalation_level = decision.escalation_level;
                open.notified_at = notified_at.or(open.notified_at);
                self.storage.update_event(open.clone()).await?;
                open
            },
            None => {
                event.id = state.open_event_id.unwrap_or(event.id);
                event.occurrence_count = decision.occurrence_count;
                event.escalation_level = decision.escalation_level;
                event.notified_at = notified_at;
                self.storage.create_event(event.clone()).await?;
                event
            },
        };

        let steps = u32::try_from(decision.escalation_level).unwrap_or(0);
        let level = event.severity.raised(steps);

        if decision.notify {
            let notification = Notification {
                subject: match alert {
                    Some(alert) => NotificationSubject::Alert(alert),
                    None => NotificationSubject::Event(event.clone()),
                },
                level,
                fingerprint: fingerprint.clone(),
                escalation_level: decision.escalation_level,
                occurrence_count: decision.occurrence_count,
                escalated: decision.escalated,
            };
            match self.notifier.notify(&notification).await {
                Ok(ack) => debug!(%fingerprint, accepted = ack.accepted, "notification sent"),
                Err(error) => warn!(%fingerprint, %error, "notification failed"),
            }
        } else {
            debug!(
                %fingerprint,
                occurrences = decision.occurrence_count,
                "notification suppressed by cooldown"
            );
        }

        Ok(DispatchOutcome { decision, state, event, level })
    }

    async fn close_streak(&self, fingerprint: &str, auto_resolved: bool) -> Result<bool> {
        let Some(current) = self.storage.find_alert_state(fingerprint.to_string()).await? else {
            return Ok(false);
        };
        if current.resolved {
            return Ok(false);
        }

        let now = self.clock.now();
        let fallback = current.clone();
        let (previous, _) = self
            .storage
            .transition_alert_state(
                fingerprint.to_string(),
                Box::new(move |previous| {
                    let mut next = previous.cloned().unwrap_or(fallback);
                    next.occurrence_count = 0;
                    next.escalation_level = 0;
                    next.open_event_id = None;
                    next.resolved = true;
                    next.updated_at = now;
                    next
                }),
            )
            .await?;

        let open_id = previous.and_then(|state| state.open_event_id);
        if let Some(open_id) = open_id {
            if let Some(mut event) = self.storage.find_event(open_id).await? {
                if !event.resolved {
                    event.resolved = true;
                    event.auto_resolved = auto_resolved;
                    event.resolved_at = Some(now);
                    self.storage.update_event(event).await?;
                }
            }
        }

        debug!(%fingerprint, auto_resolved, "alert streak closed");
        Ok(true)
    }
}

fn fingerprint_category(fingerprint: &str) -> String {
    fingerprint.split(':').nth(1).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> DispatchPolicy {
        DispatchPolicy { cooldown: Duration::minutes(60), escalation_thresholds: vec![3, 10, 25] }
    }

    fn state(occurrences: i32, level: i32, notified: DateTime<Utc>) -> AlertState {
        AlertState {
            fingerprint: "blockbee:success_rate:0.95".to_string(),
            provider: ProviderName::parse("blockbee").unwrap(),
            category: "success_rate".to_string(),
            occurrence_count: occurrences,
            escalation_level: level,
            last_notified_at: Some(notified),
            first_seen_at: notified,
            last_seen_at: notified,
            open_event_id: Some(HealthEventId::new()),
            resolved: false,
            updated_at: notified,
        }
    }

    #[test]
    fn escalation_level_counts_reached_thresholds() {
        let policy = policy();
        assert_eq!(policy.level_for(1), 0);
        assert_eq!(policy.level_for(3), 1);
        assert_eq!(policy.level_for(24), 2);
        assert_eq!(policy.level_for(100), 3);
    }

    #[test]
    fn first_occurrence_notifies() {
        let decision = decide(None, Utc::now(), &policy());
        assert!(decision.new_streak);
        assert!(decision.notify);
        assert_eq!(decision.occurrence_count, 1);
    }

    #[test]
    fn repeat_inside_cooldown_is_suppressed() {
        let now = Utc::now();
        let decision = decide(Some(&state(1, 0, now - Duration::minutes(10))), now, &policy());
        assert!(!decision.notify);
        assert_eq!(decision.occurrence_count, 2);
    }

    #[test]
    fn escalation_overrides_cooldown() {
        let now = Utc::now();
        let decision = decide(Some(&state(2, 0, now - Duration::minutes(10))), now, &policy());
        assert!(decision.escalated);
        assert!(decision.notify);
        assert_eq!(decision.escalation_level, 1);
    }

    #[test]
    fn resolved_state_starts_new_streak() {
        let now = Utc::now();
        let mut resolved = state(7, 1, now - Duration::minutes(61));
        resolved.resolved = true;

        let decision = decide(Some(&resolved), now, &policy());
        assert!(decision.new_streak);
        assert!(decision.notify);
        assert_eq!(decision.occurrence_count, 1);
        assert_eq!(decision.escalation_level, 0);
    }

    #[test]
    fn new_streak_inside_cooldown_is_suppressed() {
        let now = Utc::now();
        let mut resolved = state(2, 0, now - Duration::minutes(30));
        resolved.resolved = true;

        let decision = decide(Some(&resolved), now, &policy());
        assert!(decision.new_streak);
        assert!(!decision.notify);

        let occurrence = Occurrence {
            provider: resolved.provider.clone(),
            category: resolved.category.clone(),
            now,
            candidate_event: HealthEventId::new(),
            policy: policy(),
        };
        let next = next_state(Some(&resolved), &resolved.fingerprint, &occurrence);
        assert_eq!(next.last_notified_at, resolved.last_notified_at);
        assert!(!next.resolved);
    }

    #[test]
    fn fingerprint_category_is_middle_segment() {
        let fp = alert_fingerprint(&ProviderName::parse("dynopay").unwrap(), "delivery_delay", 300);
        assert_eq!(fp, "dynopay:delivery_delay:300");
        assert_eq!(fingerprint_category(&fp), "delivery_delay");
    }
}
