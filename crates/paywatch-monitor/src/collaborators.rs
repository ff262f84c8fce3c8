//! Interfaces to the systems the engine observes but does not own.
//!
//! - [`IntentSource`]: the payment ledger, listing intents still waiting for a
//!   confirmation.
//! - [`ProviderStatusQuery`]: the settlement provider's status API, used by
//!   recovery to re-fetch an intent's state.
//! - [`Notifier`]: the notification transport. The engine decides *that* and
//!   *what* to notify; delivery of the message is the transport's job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paywatch_core::models::{
    HealthEvent, IntentId, MissingConfirmationAlert, PaymentSnapshot, ProviderName, Severity,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A payment intent that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIntent {
    /// Ledger reference of the intent.
    pub intent_id: IntentId,
    /// When the intent was created.
    pub created_at: DateTime<Utc>,
    /// When the provider was expected to confirm, if the ledger knows.
    #[serde(default)]
    pub expected_by: Option<DateTime<Utc>>,
    /// Ledger status.
    pub status: String,
    /// Expected amount.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Deposit address, for crypto settlements.
    #[serde(default)]
    pub address: Option<String>,
}

impl OpenIntent {
    /// Captures the payment state stored on an alert.
    pub fn snapshot(&self) -> PaymentSnapshot {
        PaymentSnapshot {
            status: self.status.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            address: self.address.clone(),
        }
    }
}

/// Payment state reported by a provider's status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Payment settled.
    Confirmed,
    /// Payment seen but not settled.
    Pending,
    /// Payment failed or expired.
    Failed,
    /// Provider does not know the intent.
    Unknown,
}

impl std::fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed => write!(f, "confirmed"),
            Self::Pending => write!(f, "pending"),
            Self::Failed => write!(f, "failed"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// What a notification is about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationSubject {
    /// A health event.
    Event(HealthEvent),
    /// A missing-confirmation alert.
    Alert(MissingConfirmationAlert),
}

/// A message the dispatcher decided to send.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    /// Subject of the message.
    pub subject: NotificationSubject,
    /// Severity after escalation.
    pub level: Severity,
    /// Dedup fingerprint the decision was made under.
    pub fingerprint: String,
    /// Escalation level at send time.
    pub escalation_level: i32,
    /// Consecutive unresolved occurrences at send time.
    pub occurrence_count: i32,
    /// Whether an escalation threshold was crossed by this occurrence.
    pub escalated: bool,
}

impl Notification {
    /// Provider the notification concerns.
    pub fn provider(&self) -> &ProviderName {
        match &self.subject {
            NotificationSubject::Event(event) => &event.provider,
            NotificationSubject::Alert(alert) => &alert.provider,
        }
    }

    /// One-line human readable summary.
    pub fn title(&self) -> String {
        match &self.subject {
            NotificationSubject::Event(event) => event.title.clone(),
            NotificationSubject::Alert(alert) => format!(
                "missing confirmation for {} on {} ({} min overdue)",
                alert.payment_intent_id, alert.provider, alert.time_overdue_minutes
            ),
        }
    }
}

/// Transport acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotifyAck {
    /// Whether the transport accepted the message.
    pub accepted: bool,
    /// Transport-side reference, if any.
    pub reference: Option<String>,
}

impl NotifyAck {
    /// Acknowledgment for an accepted message.
    pub fn accepted() -> Self {
        Self { accepted: true, reference: None }
    }
}

/// Source of payment intents awaiting confirmation.
#[async_trait]
pub trait IntentSource: Send + Sync {
    /// Lists unconfirmed intents for a provider created before `older_than`.
    async fn list_open_intents(
        &self,
        provider: &ProviderName,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<OpenIntent>>;
}

/// Provider-side status lookup used for recovery.
#[async_trait]
pub trait ProviderStatusQuery: Send + Sync {
    /// Re-fetches the provider's view of an intent.
    async fn query_status(&self, provider: &ProviderName, intent: &IntentId)
        -> Result<ProviderStatus>;
}

/// Notification transport.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends one notification.
    async fn notify(&self, notification: &Notification) -> Result<NotifyAck>;
}

pub mod mock {
    //! Scriptable collaborators for tests.

    use std::{
        collections::{HashMap, VecDeque},
        sync::Arc,
        time::Duration,
    };

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use paywatch_core::models::{IntentId, ProviderName};
    use tokio::sync::RwLock;

    use super::{IntentSource, OpenIntent, ProviderStatus, ProviderStatusQuery};
    use crate::error::{MonitorError, Result};

    /// Intent source backed by an in-memory list.
    #[derive(Clone, Default)]
    pub struct StaticIntentSource {
        intents: Arc<RwLock<HashMap<ProviderName, Vec<OpenIntent>>>>,
        failure: Arc<RwLock<Option<String>>>,
    }

    impl StaticIntentSource {
        /// Creates an empty source.
        pub fn new() -> Self {
            Self::default()
        }

        /// Adds an open intent for a provider.
        pub async fn add(&self, provider: &ProviderName, intent: OpenIntent) {
            self.intents.write().await.entry(provider.clone()).or_default().push(intent);
        }

        /// Removes an intent, as if the ledger confirmed or cancelled it.
        pub async fn close(&self, provider: &ProviderName, intent: &IntentId) {
            if let Some(intents) = self.intents.write().await.get_mut(provider) {
                intents.retain(|open| &open.intent_id != intent);
            }
        }

        /// Makes the next listing fail.
        pub async fn fail_next(&self, message: impl Into<String>) {
            *self.failure.write().await = Some(message.into());
        }
    }

    #[async_trait]
    impl IntentSource for StaticIntentSource {
        async fn list_open_intents(
            &self,
            provider: &ProviderName,
            older_than: DateTime<Utc>,
        ) -> Result<Vec<OpenIntent>> {
            if let Some(message) = self.failure.write().await.take() {
                return Err(MonitorError::collaborator(message));
            }
            Ok(self
                .intents
                .read()
                .await
                .get(provider)
                .map(|intents| {
                    intents.iter().filter(|intent| intent.created_at < older_than).cloned().collect()
                })
                .unwrap_or_default())
        }
    }

    /// One scripted answer of [`ScriptedStatusQuery`].
    #[derive(Debug, Clone)]
    pub enum ScriptedAnswer {
        /// Return this status.
        Status(ProviderStatus),
        /// Fail with a collaborator error.
        Error(String),
        /// Sleep before answering `Pending`, to exercise attempt timeouts.
        Hang(Duration),
    }

    /// Status query that replays scripted answers per intent.
    ///
    /// Once an intent's script is exhausted it answers `Pending`.
    #[derive(Clone, Default)]
    pub struct ScriptedStatusQuery {
        scripts: Arc<RwLock<HashMap<IntentId, VecDeque<ScriptedAnswer>>>>,
        calls: Arc<RwLock<Vec<IntentId>>>,
    }

    impl ScriptedStatusQuery {
        /// Creates a query with no scripts.
        pub fn new() -> Self {
            Self::default()
        }

        /// Appends answers for an intent.
        pub async fn script(
            &self,
            intent: &IntentId,
            answers: impl IntoIterator<Item = ScriptedAnswer>,
        ) {
            self.scripts.write().await.entry(intent.clone()).or_default().extend(answers);
        }

        /// Intents queried so far, in call order.
        pub async fn calls(&self) -> Vec<IntentId> {
            self.calls.read().await.clone()
        }
    }

    #[async_trait]
    impl ProviderStatusQuery for ScriptedStatusQuery {
        async fn query_status(
            &self,
            _provider: &ProviderName,
            intent: &IntentId,
        ) -> Result<ProviderStatus> {
            self.calls.write().await.push(intent.clone());
            let answer =
                self.scripts.write().await.get_mut(intent).and_then(VecDeque::pop_front);

            match answer {
                Some(ScriptedAnswer::Status(status)) => Ok(status),
                Some(ScriptedAnswer::Error(message)) => Err(MonitorError::collaborator(message)),
                Some(ScriptedAnswer::Hang(duration)) => {
                    tokio::time::sleep(duration).await;
                    Ok(ProviderStatus::Pending)
                },
                None => Ok(ProviderStatus::Pending),
            }
        }
    }
}
