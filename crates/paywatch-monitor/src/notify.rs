//! In-process notifier implementations.
//!
//! [`TracingNotifier`] writes notifications to the structured log and is the
//! default transport when no alerting webhook is configured.
//! [`MulticastNotifier`] fans one notification out to several transports.
//! [`RecordingNotifier`] keeps every notification in memory for tests.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use paywatch_core::models::Severity;
use tokio::sync::RwLock;

use crate::{
    collaborators::{Notification, Notifier, NotifyAck},
    error::{MonitorError, Result},
};

/// Notifier that logs each notification at a level matching its severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<NotifyAck> {
        let title = notification.title();
        let provider = notification.provider();

        match notification.level {
            Severity::Info => tracing::info!(
                %provider,
                fingerprint = %notification.fingerprint,
                escalation_level = notification.escalation_level,
                "{title}"
            ),
            Severity::Warning => tracing::warn!(
                %provider,
                fingerprint = %notification.fingerprint,
                escalation_level = notification.escalation_level,
                "{title}"
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                %provider,
                fingerprint = %notification.fingerprint,
                escalation_level = notification.escalation_level,
                level = %notification.level,
                "{title}"
            ),
        }

        Ok(NotifyAck::accepted())
    }
}

/// Sends every notification to all inner transports concurrently.
///
/// Succeeds when at least one transport accepted the message.
#[derive(Clone)]
pub struct MulticastNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl MulticastNotifier {
    /// Creates a multicast over `targets`.
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }

    /// Number of inner transports.
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether there are no inner transports.
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[async_trait]
impl Notifier for MulticastNotifier {
    async fn notify(&self, notification: &Notification) -> Result<NotifyAck> {
        let results =
            join_all(self.targets.iter().map(|target| target.notify(notification))).await;

        let mut first_ack = None;
        let mut last_error = None;
        for result in results {
            match result {
                Ok(ack) if ack.accepted => {
                    first_ack.get_or_insert(ack);
                },
                Ok(_) => {},
                Err(error) => {
                    tracing::warn!(
                        fingerprint = %notification.fingerprint,
                        error = %error,
                        "notification transport failed"
                    );
                    last_error = Some(error);
                },
            }
        }

        match (first_ack, last_error) {
            (Some(ack), _) => Ok(ack),
            (None, Some(error)) => Err(error),
            (None, None) => Ok(NotifyAck::default()),
        }
    }
}

/// Notifier that stores notifications for later inspection.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<RwLock<Vec<Notification>>>,
    failing: Arc<RwLock<bool>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every notification recorded so far.
    pub async fn sent(&self) -> Vec<Notification> {
        self.sent.read().await.clone()
    }

    /// Number of notifications recorded so far.
    pub async fn count(&self) -> usize {
        self.sent.read().await.len()
    }

    /// Forgets recorded notifications.
    pub async fn clear(&self) {
        self.sent.write().await.clear();
    }

    /// Makes subsequent sends fail (still recording them).
    pub async fn set_failing(&self, failing: bool) {
        *self.failing.write().await = failing;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<NotifyAck> {
        self.sent.write().await.push(notification.clone());
        if *self.failing.read().await {
            return Err(MonitorError::collaborator("notification transport unavailable"));
        }
        Ok(NotifyAck::accepted())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use paywatch_core::models::{
        HealthEvent, HealthEventId, HealthEventType, ProviderName, Severity,
    };

    use super::*;
    use crate::collaborators::NotificationSubject;

    fn notification() -> Notification {
        Notification {
            subject: NotificationSubject::Event(HealthEvent {
                id: HealthEventId::new(),
                provider: ProviderName::parse("dynopay").unwrap(),
                event_type: HealthEventType::ThresholdBreach,
                severity: Severity::Warning,
                title: "success rate below threshold".to_string(),
                description: String::new(),
                threshold_type: None,
                threshold_value: None,
                actual_value: None,
                context: serde_json::json!({}),
                metrics_snapshot: None,
                alert_fingerprint: "dynopay:success_rate:0".to_string(),
                occurrence_count: 1,
                escalation_level: 0,
                notified_at: None,
                resolved: false,
                auto_resolved: false,
                resolved_at: None,
                occurred_at: Utc::now(),
            }),
            level: Severity::Warning,
            fingerprint: "dynopay:success_rate:0".to_string(),
            escalation_level: 0,
            occurrence_count: 1,
            escalated: false,
        }
    }

    #[tokio::test]
    async fn recording_notifier_keeps_messages() {
        let recorder = RecordingNotifier::new();
        recorder.notify(&notification()).await.unwrap();
        recorder.notify(&notification()).await.unwrap();

        assert_eq!(recorder.count().await, 2);
        recorder.clear().await;
        assert_eq!(recorder.count().await, 0);
    }

    #[tokio::test]
    async fn multicast_succeeds_if_any_target_accepts() {
        let healthy = RecordingNotifier::new();
        let broken = RecordingNotifier::new();
        broken.set_failing(true).await;

        let multicast =
            MulticastNotifier::new(vec![Arc::new(broken.clone()), Arc::new(healthy.clone())]);
        let ack = multicast.notify(&notification()).await.unwrap();

        assert!(ack.accepted);
        assert_eq!(healthy.count().await, 1);
        assert_eq!(broken.count().await, 1);
    }

    #[tokio::test]
    async fn multicast_fails_when_every_target_fails() {
        let broken = RecordingNotifier::new();
        broken.set_failing(true).await;

        let multicast = MulticastNotifier::new(vec![Arc::new(broken)]);
        assert!(multicast.notify(&notification()).await.is_err());
    }

    #[tokio::test]
    async fn tracing_notifier_always_accepts() {
        let ack = TracingNotifier.notify(&notification()).await.unwrap();
        assert!(ack.accepted);
    }
}
