//! Storage abstraction layer for the monitoring engine.
//!
//! Provides trait-based abstractions over storage operations to enable
//! testability without database dependencies. Production implementations
//! use the concrete `paywatch_core::storage::Storage` while tests use the
//! in-memory [`mock::MockMonitorStorage`].

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use paywatch_core::{
    error::Result,
    models::{
        AlertId, AlertRefresh, AlertState, DeliveryId, DeliveryRecord, HealthEvent, HealthEventId,
        IntentId, MissingConfirmationAlert, MonitoringConfig, ProcessingUpdate,
        ProviderHealthSnapshot, ProviderName, RecordOutcome,
    },
    storage::Storage,
};

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Read-modify-write step applied to a fingerprint's alert state.
pub type AlertTransition = Box<dyn FnOnce(Option<&AlertState>) -> AlertState + Send>;

/// Storage operations required by the gate, the periodic stages and the
/// dashboard views.
pub trait MonitorStorage: Send + Sync + 'static {
    /// Writes a delivery, classifying it as a duplicate when an accepted
    /// delivery already claims its fingerprint.
    ///
    /// Classification and insert are atomic.
    fn record_delivery(&self, record: DeliveryRecord) -> StorageFuture<'_, RecordOutcome>;

    /// Applies the business outcome reported after handling.
    ///
    /// Fails with `InvalidInput` if business effects target a duplicate.
    fn apply_processing_update(
        &self,
        id: DeliveryId,
        update: ProcessingUpdate,
    ) -> StorageFuture<'_, DeliveryRecord>;

    /// Finds a delivery by id.
    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>>;

    /// Finds the accepted delivery owning a fingerprint.
    fn find_accepted_delivery(
        &self,
        provider: ProviderName,
        webhook_kind: String,
        fingerprint: String,
    ) -> StorageFuture<'_, Option<DeliveryRecord>>;

    /// Lists deliveries received in `[start, end)`.
    fn deliveries_in_range(
        &self,
        provider: ProviderName,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>>;

    /// Lists deliveries linked to a payment intent.
    fn deliveries_for_intent(
        &self,
        provider: ProviderName,
        intent: IntentId,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>>;

    /// Inserts or replaces the snapshot for its window, keeping its
    /// threshold checkpoint.
    fn upsert_snapshot(&self, snapshot: ProviderHealthSnapshot) -> StorageFuture<'_, ()>;

    /// Records that every threshold check of a window was dispatched.
    fn mark_snapshot_checked(
        &self,
        provider: ProviderName,
        window_start: DateTime<Utc>,
        window_duration_minutes: i32,
        checked_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()>;

    /// Finds the most recent snapshot for a provider and window size.
    fn latest_snapshot(
        &self,
        provider: ProviderName,
        window_duration_minutes: i32,
    ) -> StorageFuture<'_, Option<ProviderHealthSnapshot>>;

    /// Inserts a missing-confirmation alert.
    fn create_alert(&self, alert: MissingConfirmationAlert) -> StorageFuture<'_, AlertId>;

    /// Writes the detector and dispatcher fields of an open alert.
    ///
    /// Returns `None` without writing when the alert is already resolved.
    fn refresh_alert(
        &self,
        id: AlertId,
        refresh: AlertRefresh,
    ) -> StorageFuture<'_, Option<MissingConfirmationAlert>>;

    /// Closes an open alert as auto-resolved.
    ///
    /// Returns `None` without writing when the alert is already resolved.
    fn auto_resolve_alert(
        &self,
        id: AlertId,
        notes: String,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<MissingConfirmationAlert>>;

    /// Finds an alert by id.
    fn find_alert(&self, id: AlertId) -> StorageFuture<'_, Option<MissingConfirmationAlert>>;

    /// Finds the alert for a payment intent, resolved or not.
    fn find_alert_by_intent(
        &self,
        provider: ProviderName,
        intent: IntentId,
    ) -> StorageFuture<'_, Option<MissingConfirmationAlert>>;

    /// Lists unresolved alerts, optionally for one provider.
    fn list_open_alerts(
        &self,
        provider: Option<ProviderName>,
    ) -> StorageFuture<'_, Vec<MissingConfirmationAlert>>;

    /// Lists alerts eligible for automated recovery.
    fn list_recovery_candidates(
        &self,
        provider: ProviderName,
    ) -> StorageFuture<'_, Vec<MissingConfirmationAlert>>;

    /// Counts a failed recovery attempt, moving the alert to `manual` once
    /// `max_attempts` is reached.
    fn record_recovery_failure(
        &self,
        id: AlertId,
        error: String,
        attempted_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> StorageFuture<'_, MissingConfirmationAlert>;

    /// Writes the reconciliation record and resolves the alert atomically.
    fn complete_recovery(
        &self,
        id: AlertId,
        reconciliation: DeliveryRecord,
        recovered_at: DateTime<Utc>,
        notes: String,
    ) -> StorageFuture<'_, MissingConfirmationAlert>;

    /// Records an operator acknowledgment and closes the alert.
    fn acknowledge_alert(
        &self,
        id: AlertId,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, MissingConfirmationAlert>;

    /// Inserts a health event.
    fn create_event(&self, event: HealthEvent) -> StorageFuture<'_, HealthEventId>;

    /// Persists dispatcher bookkeeping and resolution state of an event.
    fn update_event(&self, event: HealthEvent) -> StorageFuture<'_, ()>;

    /// Finds an event by id.
    fn find_event(&self, id: HealthEventId) -> StorageFuture<'_, Option<HealthEvent>>;

    /// Lists events since `since`, newest first.
    fn list_events_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StorageFuture<'_, Vec<HealthEvent>>;

    /// Closes an event by operator acknowledgment.
    fn acknowledge_event(&self, id: HealthEventId, at: DateTime<Utc>)
        -> StorageFuture<'_, HealthEvent>;

    /// Finds the dispatcher state for a fingerprint.
    fn find_alert_state(&self, fingerprint: String) -> StorageFuture<'_, Option<AlertState>>;

    /// Atomically replaces the dispatcher state for a fingerprint, returning
    /// the previous and the new state.
    fn transition_alert_state(
        &self,
        fingerprint: String,
        transition: AlertTransition,
    ) -> StorageFuture<'_, (Option<AlertState>, AlertState)>;

    /// Lists every provider configuration.
    fn list_configs(&self) -> StorageFuture<'_, Vec<MonitoringConfig>>;

    /// Finds the configuration for a provider.
    fn find_config(&self, provider: ProviderName) -> StorageFuture<'_, Option<MonitoringConfig>>;

    /// Inserts a configuration unless the provider already has one.
    fn seed_config(&self, config: MonitoringConfig) -> StorageFuture<'_, bool>;

    /// Inserts or replaces a provider configuration.
    fn upsert_config(&self, config: MonitoringConfig) -> StorageFuture<'_, ()>;

    /// Verifies the backing store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// Production storage implementation using PostgreSQL.
pub struct PostgresMonitorStorage {
    storage: Arc<Storage>,
}

impl PostgresMonitorStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl MonitorStorage for PostgresMonitorStorage {
    fn record_delivery(&self, record: DeliveryRecord) -> StorageFuture<'_, RecordOutcome> {
        Box::pin(async move { self.storage.deliveries.record(&record).await })
    }

    fn apply_processing_update(
        &self,
        id: DeliveryId,
        update: ProcessingUpdate,
    ) -> StorageFuture<'_, DeliveryRecord> {
        Box::pin(async move { self.storage.deliveries.apply_processing_update(id, &update).await })
    }

    fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>> {
        Box::pin(async move { self.storage.deliveries.find_by_id(id).await })
    }

    fn find_accepted_delivery(
        &self,
        provider: ProviderName,
        webhook_kind: String,
        fingerprint: String,
    ) -> StorageFuture<'_, Option<DeliveryRecord>> {
        Box::pin(async move {
            self.storage.deliveries.find_accepted(&provider, &webhook_kind, &fingerprint).await
        })
    }

    fn deliveries_in_range(
        &self,
        provider: ProviderName,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
        Box::pin(async move { self.storage.deliveries.find_in_range(&provider, start, end).await })
    }

    fn deliveries_for_intent(
        &self,
        provider: ProviderName,
        intent: IntentId,
    ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
        Box::pin(async move { self.storage.deliveries.find_by_intent(&provider, &intent).await })
    }

    fn upsert_snapshot(&self, snapshot: ProviderHealthSnapshot) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.snapshots.upsert(&snapshot).await })
    }

    fn mark_snapshot_checked(
        &self,
        provider: ProviderName,
        window_start: DateTime<Utc>,
        window_duration_minutes: i32,
        checked_at: DateTime<Utc>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            self.storage
                .snapshots
                .mark_checked(&provider, window_start, window_duration_minutes, checked_at)
                .await
        })
    }

    fn latest_snapshot(
        &self,
        provider: ProviderName,
        window_duration_minutes: i32,
    ) -> StorageFuture<'_, Option<ProviderHealthSnapshot>> {
        Box::pin(async move {
            self.storage.snapshots.find_latest(&provider, window_duration_minutes).await
        })
    }

    fn create_alert(&self, alert: MissingConfirmationAlert) -> StorageFuture<'_, AlertId> {
        Box::pin(async move { self.storage.alerts.create(&alert).await })
    }

    fn refresh_alert(
        &self,
        id: AlertId,
        refresh: AlertRefresh,
    ) -> StorageFuture<'_, Option<MissingConfirmationAlert>> {
        Box::pin(async move { self.storage.alerts.refresh(id, &refresh).await })
    }

    fn auto_resolve_alert(
        &self,
        id: AlertId,
        notes: String,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, Option<MissingConfirmationAlert>> {
        Box::pin(async move { self.storage.alerts.auto_resolve(id, &notes, at).await })
    }

    fn find_alert(&self, id: AlertId) -> StorageFuture<'_, Option<MissingConfirmationAlert>> {
        Box::pin(async move { self.storage.alerts.find_by_id(id).await })
    }

    fn find_alert_by_intent(
        &self,
        provider: ProviderName,
        intent: IntentId,
    ) -> StorageFuture<'_, Option<MissingConfirmationAlert>> {
        Box::pin(async move { self.storage.alerts.find_by_intent(&provider, &intent).await })
    }

    fn list_open_alerts(
        &self,
        provider: Option<ProviderName>,
    ) -> StorageFuture<'_, Vec<MissingConfirmationAlert>> {
        Box::pin(async move { self.storage.alerts.list_open(provider.as_ref()).await })
    }

    fn list_recovery_candidates(
        &self,
        provider: ProviderName,
    ) -> StorageFuture<'_, Vec<MissingConfirmationAlert>> {
        Box::pin(async move { self.storage.alerts.list_recovery_candidates(&provider).await })
    }

    fn record_recovery_failure(
        &self,
        id: AlertId,
        error: String,
        attempted_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> StorageFuture<'_, MissingConfirmationAlert> {
        Box::pin(async move {
            self.storage
                .alerts
                .record_recovery_failure(id, &error, attempted_at, max_attempts)
                .await
        })
    }

    fn complete_recovery(
        &self,
        id: AlertId,
        reconciliation: DeliveryRecord,
        recovered_at: DateTime<Utc>,
        notes: String,
    ) -> StorageFuture<'_, MissingConfirmationAlert> {
        Box::pin(async move {
            self.storage.complete_recovery(id, &reconciliation, recovered_at, &notes).await
        })
    }

    fn acknowledge_alert(
        &self,
        id: AlertId,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, MissingConfirmationAlert> {
        Box::pin(async move { self.storage.alerts.acknowledge(id, notes.as_deref(), at).await })
    }

    fn create_event(&self, event: HealthEvent) -> StorageFuture<'_, HealthEventId> {
        Box::pin(async move { self.storage.health_events.create(&event).await })
    }

    fn update_event(&self, event: HealthEvent) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.health_events.update(&event).await })
    }

    fn find_event(&self, id: HealthEventId) -> StorageFuture<'_, Option<HealthEvent>> {
        Box::pin(async move { self.storage.health_events.find_by_id(id).await })
    }

    fn list_events_since(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> StorageFuture<'_, Vec<HealthEvent>> {
        Box::pin(async move { self.storage.health_events.list_since(since, limit).await })
    }

    fn acknowledge_event(
        &self,
        id: HealthEventId,
        at: DateTime<Utc>,
    ) -> StorageFuture<'_, HealthEvent> {
        Box::pin(async move { self.storage.health_events.acknowledge(id, at).await })
    }

    fn find_alert_state(&self, fingerprint: String) -> StorageFuture<'_, Option<AlertState>> {
        Box::pin(async move { self.storage.alert_states.find(&fingerprint).await })
    }

    fn transition_alert_state(
        &self,
        fingerprint: String,
        transition: AlertTransition,
    ) -> StorageFuture<'_, (Option<AlertState>, AlertState)> {
        Box::pin(async move { self.storage.alert_states.transition(&fingerprint, transition).await })
    }

    fn list_configs(&self) -> StorageFuture<'_, Vec<MonitoringConfig>> {
        Box::pin(async move { self.storage.monitoring_configs.list().await })
    }

    fn find_config(&self, provider: ProviderName) -> StorageFuture<'_, Option<MonitoringConfig>> {
        Box::pin(async move { self.storage.monitoring_configs.find(&provider).await })
    }

    fn seed_config(&self, config: MonitoringConfig) -> StorageFuture<'_, bool> {
        Box::pin(async move { self.storage.monitoring_configs.seed(&config).await })
    }

    fn upsert_config(&self, config: MonitoringConfig) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.monitoring_configs.upsert(&config).await })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        Box::pin(async move { self.storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory storage for testing monitoring logic without a database.
    //!
    //! All state sits behind one lock so check-and-insert operations are as
    //! atomic as their Postgres counterparts. Failures can be injected per
    //! operation name to exercise error paths.

    use std::{
        collections::{BTreeMap, HashMap},
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use paywatch_core::{
        error::{CoreError, Result},
        models::{
            AlertId, AlertRefresh, AlertState, DeliveryId, DeliveryRecord, DeliveryStatus,
            HealthEvent, HealthEventId, IntentId, MissingConfirmationAlert, MonitoringConfig,
            ProcessingUpdate, ProviderHealthSnapshot, ProviderName, RecordOutcome,
            RecoveryMethod, RecoveryStatus,
        },
    };
    use tokio::sync::RwLock;

    use super::{AlertTransition, MonitorStorage, StorageFuture};

    type SnapshotKey = (ProviderName, DateTime<Utc>, i32);

    #[derive(Default)]
    struct MockState {
        deliveries: Vec<DeliveryRecord>,
        snapshots: BTreeMap<SnapshotKey, ProviderHealthSnapshot>,
        alerts: Vec<MissingConfirmationAlert>,
        events: Vec<HealthEvent>,
        alert_states: HashMap<String, AlertState>,
        configs: BTreeMap<ProviderName, MonitoringConfig>,
        failures: HashMap<&'static str, String>,
    }

    impl MockState {
        fn take_failure(&mut self, operation: &'static str) -> Result<()> {
            match self.failures.remove(operation) {
                Some(message) => Err(CoreError::Database(message)),
                None => Ok(()),
            }
        }

        fn accepted_owner(&self, record: &DeliveryRecord) -> Option<&DeliveryRecord> {
            self.deliveries.iter().find(|existing| {
                existing.delivery_status == DeliveryStatus::Received
                    && existing.provider == record.provider
                    && existing.webhook_kind == record.webhook_kind
                    && existing.fingerprint == record.fingerprint
            })
        }

        fn alert_mut(&mut self, id: AlertId) -> Result<&mut MissingConfirmationAlert> {
            self.alerts
                .iter_mut()
                .find(|alert| alert.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("alert {id} not found")))
        }

        fn event_mut(&mut self, id: HealthEventId) -> Result<&mut HealthEvent> {
            self.events
                .iter_mut()
                .find(|event| event.id == id)
                .ok_or_else(|| CoreError::NotFound(format!("health event {id} not found")))
        }
    }

    /// Mock storage for testing monitoring logic without a database.
    #[derive(Clone, Default)]
    pub struct MockMonitorStorage {
        state: Arc<RwLock<MockState>>,
    }

    impl MockMonitorStorage {
        /// Creates a new mock storage with empty state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next call of `operation` fail with a database error.
        ///
        /// `operation` is the trait method name, e.g. `"record_delivery"`.
        pub async fn inject_failure(&self, operation: &'static str, message: impl Into<String>) {
            self.state.write().await.failures.insert(operation, message.into());
        }

        /// Stores a configuration directly, bypassing validation.
        pub async fn put_config(&self, config: MonitoringConfig) {
            self.state.write().await.configs.insert(config.provider.clone(), config);
        }

        /// Inserts a delivery as-is, bypassing dedup classification.
        pub async fn put_delivery(&self, record: DeliveryRecord) {
            self.state.write().await.deliveries.push(record);
        }

        /// Returns every stored delivery in insertion order.
        pub async fn deliveries(&self) -> Vec<DeliveryRecord> {
            self.state.read().await.deliveries.clone()
        }

        /// Returns every stored snapshot ordered by key.
        pub async fn snapshots(&self) -> Vec<ProviderHealthSnapshot> {
            self.state.read().await.snapshots.values().cloned().collect()
        }

        /// Returns every stored alert in insertion order.
        pub async fn alerts(&self) -> Vec<MissingConfirmationAlert> {
            self.state.read().await.alerts.clone()
        }

        /// Returns every stored event in insertion order.
        pub async fn events(&self) -> Vec<HealthEvent> {
            self.state.read().await.events.clone()
        }
    }

    impl MonitorStorage for MockMonitorStorage {
        fn record_delivery(&self, record: DeliveryRecord) -> StorageFuture<'_, RecordOutcome> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("record_delivery")?;

                if record.delivery_status == DeliveryStatus::Received {
                    if let Some(owner) = state.accepted_owner(&record) {
                        let duplicate = record.into_duplicate_of(owner.id);
                        state.deliveries.push(duplicate.clone());
                        return Ok(RecordOutcome { record: duplicate, duplicate: true });
                    }
                }

                state.deliveries.push(record.clone());
                Ok(RecordOutcome { record, duplicate: false })
            })
        }

        fn apply_processing_update(
            &self,
            id: DeliveryId,
            update: ProcessingUpdate,
        ) -> StorageFuture<'_, DeliveryRecord> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("apply_processing_update")?;

                let record = state
                    .deliveries
                    .iter_mut()
                    .find(|record| record.id == id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery record {id} not found")))?;

                if record.delivery_status == DeliveryStatus::Duplicate
                    && update.has_business_impact()
                {
                    return Err(CoreError::InvalidInput(format!(
                        "delivery record {id} is a duplicate and cannot carry business effects"
                    )));
                }

                update.apply_to(record);
                Ok(record.clone())
            })
        }

        fn find_delivery(&self, id: DeliveryId) -> StorageFuture<'_, Option<DeliveryRecord>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("find_delivery")?;
                Ok(state.deliveries.iter().find(|record| record.id == id).cloned())
            })
        }

        fn find_accepted_delivery(
            &self,
            provider: ProviderName,
            webhook_kind: String,
            fingerprint: String,
        ) -> StorageFuture<'_, Option<DeliveryRecord>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("find_accepted_delivery")?;
                Ok(state
                    .deliveries
                    .iter()
                    .find(|record| {
                        record.delivery_status == DeliveryStatus::Received
                            && record.provider == provider
                            && record.webhook_kind == webhook_kind
                            && record.fingerprint == fingerprint
                    })
                    .cloned())
            })
        }

        fn deliveries_in_range(
            &self,
            provider: ProviderName,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("deliveries_in_range")?;
                let mut records: Vec<DeliveryRecord> = state
                    .deliveries
                    .iter()
                    .filter(|record| {
                        record.provider == provider
                            && record.received_at >= start
                            && record.received_at < end
                    })
                    .cloned()
                    .collect();
                records.sort_by_key(|record| record.received_at);
                Ok(records)
            })
        }

        fn deliveries_for_intent(
            &self,
            provider: ProviderName,
            intent: IntentId,
        ) -> StorageFuture<'_, Vec<DeliveryRecord>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("deliveries_for_intent")?;
                Ok(state
                    .deliveries
                    .iter()
                    .filter(|record| {
                        record.provider == provider
                            && record.payment_intent_id.as_ref() == Some(&intent)
                    })
                    .cloned()
                    .collect())
            })
        }

        fn upsert_snapshot(&self, mut snapshot: ProviderHealthSnapshot) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("upsert_snapshot")?;
                let key = (
                    snapshot.provider.clone(),
                    snapshot.window_start,
                    snapshot.window_duration_minutes,
                );
                if let Some(existing) = state.snapshots.get(&key) {
                    snapshot.thresholds_checked_at = existing.thresholds_checked_at;
                }
                state.snapshots.insert(key, snapshot);
                Ok(())
            })
        }

        fn mark_snapshot_checked(
            &self,
            provider: ProviderName,
            window_start: DateTime<Utc>,
            window_duration_minutes: i32,
            checked_at: DateTime<Utc>,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("mark_snapshot_checked")?;
                let key = (provider, window_start, window_duration_minutes);
                let snapshot = state.snapshots.get_mut(&key).ok_or_else(|| {
                    CoreError::NotFound(format!(
                        "no {} minute snapshot for {} at {}",
                        key.2, key.0, key.1
                    ))
                })?;
                snapshot.thresholds_checked_at = Some(checked_at);
                Ok(())
            })
        }

        fn latest_snapshot(
            &self,
            provider: ProviderName,
            window_duration_minutes: i32,
        ) -> StorageFuture<'_, Option<ProviderHealthSnapshot>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("latest_snapshot")?;
                Ok(state
                    .snapshots
                    .values()
                    .filter(|snapshot| {
                        snapshot.provider == provider
                            && snapshot.window_duration_minutes == window_duration_minutes
                    })
                    .max_by_key(|snapshot| snapshot.window_start)
                    .cloned())
            })
        }

        fn create_alert(&self, alert: MissingConfirmationAlert) -> StorageFuture<'_, AlertId> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("create_alert")?;
                if state.alerts.iter().any(|existing| {
                    existing.provider == alert.provider
                        && existing.payment_intent_id == alert.payment_intent_id
                }) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "alert already exists for intent {}",
                        alert.payment_intent_id
                    )));
                }
                let id = alert.id;
                state.alerts.push(alert);
                Ok(id)
            })
        }

        fn refresh_alert(
            &self,
            id: AlertId,
            refresh: AlertRefresh,
        ) -> StorageFuture<'_, Option<MissingConfirmationAlert>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("refresh_alert")?;
                let alert = state.alert_mut(id)?;
                if alert.resolved {
                    return Ok(None);
                }
                refresh.apply_to(alert);
                Ok(Some(alert.clone()))
            })
        }

        fn auto_resolve_alert(
            &self,
            id: AlertId,
            notes: String,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, Option<MissingConfirmationAlert>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("auto_resolve_alert")?;
                let alert = state.alert_mut(id)?;
                if alert.resolved {
                    return Ok(None);
                }
                alert.resolved = true;
                alert.auto_resolved = true;
                alert.resolved_at = Some(at);
                alert.resolution_notes = Some(notes);
                alert.updated_at = at;
                Ok(Some(alert.clone()))
            })
        }

        fn find_alert(&self, id: AlertId) -> StorageFuture<'_, Option<MissingConfirmationAlert>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("find_alert")?;
                Ok(state.alerts.iter().find(|alert| alert.id == id).cloned())
            })
        }

        fn find_alert_by_intent(
            &self,
            provider: ProviderName,
            intent: IntentId,
        ) -> StorageFuture<'_, Option<MissingConfirmationAlert>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("find_alert_by_intent")?;
                Ok(state
                    .alerts
                    .iter()
                    .find(|alert| alert.provider == provider && alert.payment_intent_id == intent)
                    .cloned())
            })
        }

        fn list_open_alerts(
            &self,
            provider: Option<ProviderName>,
        ) -> StorageFuture<'_, Vec<MissingConfirmationAlert>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("list_open_alerts")?;
                let mut alerts: Vec<MissingConfirmationAlert> = state
                    .alerts
                    .iter()
                    .filter(|alert| {
                        !alert.resolved && provider.as_ref().map_or(true, |p| &alert.provider == p)
                    })
                    .cloned()
                    .collect();
                alerts.sort_by_key(|alert| alert.detected_at);
                Ok(alerts)
            })
        }

        fn list_recovery_candidates(
            &self,
            provider: ProviderName,
        ) -> StorageFuture<'_, Vec<MissingConfirmationAlert>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("list_recovery_candidates")?;
                let mut alerts: Vec<MissingConfirmationAlert> = state
                    .alerts
                    .iter()
                    .filter(|alert| alert.provider == provider && alert.is_recovery_candidate())
                    .cloned()
                    .collect();
                alerts.sort_by_key(|alert| alert.detected_at);
                Ok(alerts)
            })
        }

        fn record_recovery_failure(
            &self,
            id: AlertId,
            error: String,
            attempted_at: DateTime<Utc>,
            max_attempts: i32,
        ) -> StorageFuture<'_, MissingConfirmationAlert> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("record_recovery_failure")?;
                let alert = state.alert_mut(id)?;
                alert.recovery_attempts += 1;
                alert.recovery_status = if alert.recovery_attempts >= max_attempts {
                    RecoveryStatus::Manual
                } else {
                    RecoveryStatus::Failed
                };
                alert.recovery_method = Some(RecoveryMethod::ProviderQuery);
                alert.last_recovery_attempt_at = Some(attempted_at);
                alert.last_recovery_error = Some(error);
                alert.updated_at = attempted_at;
                Ok(alert.clone())
            })
        }

        fn complete_recovery(
            &self,
            id: AlertId,
            reconciliation: DeliveryRecord,
            recovered_at: DateTime<Utc>,
            notes: String,
        ) -> StorageFuture<'_, MissingConfirmationAlert> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("complete_recovery")?;

                if !state.alerts.iter().any(|alert| alert.id == id) {
                    return Err(CoreError::NotFound(format!("alert {id} not found")));
                }
                if reconciliation.delivery_status == DeliveryStatus::Received
                    && state.accepted_owner(&reconciliation).is_some()
                {
                    return Err(CoreError::ConstraintViolation(format!(
                        "fingerprint {} already claimed",
                        reconciliation.fingerprint
                    )));
                }

                state.deliveries.push(reconciliation);
                let alert = state.alert_mut(id)?;
                alert.recovery_attempts += 1;
                alert.recovery_status = RecoveryStatus::Recovered;
                alert.recovery_method = Some(RecoveryMethod::ProviderQuery);
                alert.last_recovery_attempt_at = Some(recovered_at);
                alert.last_recovery_error = None;
                if !alert.resolved {
                    alert.resolved = true;
                    alert.resolved_at = Some(recovered_at);
                    alert.auto_resolved = true;
                    alert.resolution_notes = Some(notes);
                }
                alert.updated_at = recovered_at;
                Ok(alert.clone())
            })
        }

        fn acknowledge_alert(
            &self,
            id: AlertId,
            notes: Option<String>,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, MissingConfirmationAlert> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("acknowledge_alert")?;
                let alert = state.alert_mut(id)?;
                if !alert.resolved {
                    alert.auto_resolved = false;
                    alert.resolved_at = Some(at);
                }
                alert.acknowledged = true;
                alert.resolved = true;
                alert.recovery_method.get_or_insert(RecoveryMethod::ManualCheck);
                if notes.is_some() {
                    alert.resolution_notes = notes;
                }
                alert.updated_at = at;
                Ok(alert.clone())
            })
        }

        fn create_event(&self, event: HealthEvent) -> StorageFuture<'_, HealthEventId> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("create_event")?;
                let id = event.id;
                state.events.push(event);
                Ok(id)
            })
        }

        fn update_event(&self, event: HealthEvent) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("update_event")?;
                let stored = state.event_mut(event.id)?;
                stored.actual_value = event.actual_value;
                stored.occurrence_count = event.occurrence_count;
                stored.escalation_level = event.escalation_level;
                stored.notified_at = event.notified_at;
                stored.resolved = event.resolved;
                stored.auto_resolved = event.auto_resolved;
                stored.resolved_at = event.resolved_at;
                Ok(())
            })
        }

        fn find_event(&self, id: HealthEventId) -> StorageFuture<'_, Option<HealthEvent>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("find_event")?;
                Ok(state.events.iter().find(|event| event.id == id).cloned())
            })
        }

        fn list_events_since(
            &self,
            since: DateTime<Utc>,
            limit: i64,
        ) -> StorageFuture<'_, Vec<HealthEvent>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("list_events_since")?;
                let mut events: Vec<HealthEvent> =
                    state.events.iter().filter(|event| event.occurred_at >= since).cloned().collect();
                events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
                events.truncate(usize::try_from(limit).unwrap_or(0));
                Ok(events)
            })
        }

        fn acknowledge_event(
            &self,
            id: HealthEventId,
            at: DateTime<Utc>,
        ) -> StorageFuture<'_, HealthEvent> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("acknowledge_event")?;
                let event = state.event_mut(id)?;
                if !event.resolved {
                    event.auto_resolved = false;
                    event.resolved_at = Some(at);
                }
                event.resolved = true;
                Ok(event.clone())
            })
        }

        fn find_alert_state(&self, fingerprint: String) -> StorageFuture<'_, Option<AlertState>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("find_alert_state")?;
                Ok(state.alert_states.get(&fingerprint).cloned())
            })
        }

        fn transition_alert_state(
            &self,
            fingerprint: String,
            transition: AlertTransition,
        ) -> StorageFuture<'_, (Option<AlertState>, AlertState)> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("transition_alert_state")?;
                let previous = state.alert_states.get(&fingerprint).cloned();
                let next = transition(previous.as_ref());
                state.alert_states.insert(fingerprint, next.clone());
                Ok((previous, next))
            })
        }

        fn list_configs(&self) -> StorageFuture<'_, Vec<MonitoringConfig>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("list_configs")?;
                Ok(state.configs.values().cloned().collect())
            })
        }

        fn find_config(
            &self,
            provider: ProviderName,
        ) -> StorageFuture<'_, Option<MonitoringConfig>> {
            Box::pin(async move {
                let mut state = self.state.write().await;
                state.take_failure("find_config")?;
                Ok(state.configs.get(&provider).cloned())
            })
        }

        fn seed_config(&self, config: MonitoringConfig) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                config.validate()?;
                let mut state = self.state.write().await;
                state.take_failure("seed_config")?;
                if state.configs.contains_key(&config.provider) {
                    return Ok(false);
                }
                state.configs.insert(config.provider.clone(), config);
                Ok(true)
            })
        }

        fn upsert_config(&self, config: MonitoringConfig) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                config.validate()?;
                let mut state = self.state.write().await;
                state.take_failure("upsert_config")?;
                state.configs.insert(config.provider.clone(), config);
                Ok(())
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async move { self.state.write().await.take_failure("health_check") })
        }
    }
}
