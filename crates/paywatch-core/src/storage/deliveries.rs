//! Repository for the delivery ledger.
//!
//! Rows are append-only apart from the post-processing update. Duplicate
//! classification relies on the partial unique index over accepted
//! deliveries: the insert of an accepted record either claims the fingerprint
//! or falls through to a `duplicate` row pointing at the owner, inside one
//! transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    audit::{self, WriteOp},
    error::{CoreError, Result},
    models::{
        DeliveryId, DeliveryRecord, DeliveryStatus, IntentId, ProcessingUpdate, ProviderName,
        RecordOutcome,
    },
};

const COLUMNS: &str = "id, provider, payment_intent_id, webhook_kind, request_id, \
     expected_at, received_at, processing_started_at, processing_completed_at, \
     delivery_status, processing_status, error_kind, error_message, retry_count, \
     signature_valid, timestamp_valid, rate_limited, payload_size_bytes, fingerprint, \
     payment_confirmed, balance_credited, user_notified, duplicate_of, recovery_alert_id, \
     created_at";

const PLACEHOLDERS: &str = "$1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, \
     $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25";

/// Repository for delivery record operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Writes a delivery, classifying accepted deliveries against the
    /// fingerprint index.
    ///
    /// Records with status `received` either claim their fingerprint or are
    /// stored as a `duplicate` of the current owner. Other statuses are
    /// written as-is and never claim a fingerprint.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn record(&self, record: &DeliveryRecord) -> Result<RecordOutcome> {
        let mut tx = self.pool.begin().await?;

        if record.delivery_status != DeliveryStatus::Received {
            self.insert_impl(&mut *tx, record, "").await?;
            tx.commit().await?;
            audit::record("delivery_record", record.id, WriteOp::Insert);
            return Ok(RecordOutcome { record: record.clone(), duplicate: false });
        }

        let claimed = self
            .insert_impl(
                &mut *tx,
                record,
                "ON CONFLICT (provider, webhook_kind, fingerprint) \
                 WHERE delivery_status = 'received' DO NOTHING",
            )
            .await?;

        let outcome = if claimed.is_some() {
            RecordOutcome { record: record.clone(), duplicate: false }
        } else {
            let owner = self
                .find_accepted_impl(
                    &mut *tx,
                    &record.provider,
                    &record.webhook_kind,
                    &record.fingerprint,
                )
                .await?
                .ok_or_else(|| {
                    CoreError::Database("fingerprint owner vanished during insert".to_string())
                })?;
            let duplicate = record.clone().into_duplicate_of(owner.id);
            self.insert_impl(&mut *tx, &duplicate, "").await?;
            RecordOutcome { record: duplicate, duplicate: true }
        };

        tx.commit().await?;
        audit::record("delivery_record", outcome.record.id, WriteOp::Insert);

        Ok(outcome)
    }

    /// Inserts a record within a transaction without dedup classification.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the fingerprint is already claimed.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &DeliveryRecord,
    ) -> Result<DeliveryId> {
        self.insert_impl(&mut **tx, record, "").await?;
        audit::record("delivery_record", record.id, WriteOp::Insert);
        Ok(record.id)
    }

    async fn insert_impl<'e, E>(
        &self,
        executor: E,
        record: &DeliveryRecord,
        conflict_clause: &str,
    ) -> Result<Option<DeliveryId>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "INSERT INTO delivery_records ({COLUMNS}) VALUES ({PLACEHOLDERS}) {conflict_clause} \
             RETURNING id"
        );

        let id = sqlx::query_scalar::<_, DeliveryId>(&sql)
            .bind(record.id)
            .bind(&record.provider)
            .bind(&record.payment_intent_id)
            .bind(&record.webhook_kind)
            .bind(&record.request_id)
            .bind(record.expected_at)
            .bind(record.received_at)
            .bind(record.processing_started_at)
            .bind(record.processing_completed_at)
            .bind(record.delivery_status)
            .bind(record.processing_status)
            .bind(record.error_kind)
            .bind(&record.error_message)
            .bind(record.retry_count)
            .bind(record.signature_valid)
            .bind(record.timestamp_valid)
            .bind(record.rate_limited)
            .bind(record.payload_size_bytes)
            .bind(&record.fingerprint)
            .bind(record.payment_confirmed)
            .bind(record.balance_credited)
            .bind(record.user_notified)
            .bind(record.duplicate_of)
            .bind(record.recovery_alert_id)
            .bind(record.created_at)
            .fetch_optional(executor)
            .await?;

        Ok(id)
    }

    /// Finds a record by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<DeliveryRecord>> {
        let sql = format!("SELECT {COLUMNS} FROM delivery_records WHERE id = $1");
        let record = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(record)
    }

    /// Finds the accepted record owning a fingerprint.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_accepted(
        &self,
        provider: &ProviderName,
        webhook_kind: &str,
        fingerprint: &str,
    ) -> Result<Option<DeliveryRecord>> {
        self.find_accepted_impl(&*self.pool, provider, webhook_kind, fingerprint).await
    }

    async fn find_accepted_impl<'e, E>(
        &self,
        executor: E,
        provider: &ProviderName,
        webhook_kind: &str,
        fingerprint: &str,
    ) -> Result<Option<DeliveryRecord>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_records \
             WHERE provider = $1 AND webhook_kind = $2 AND fingerprint = $3 \
               AND delivery_status = 'received'"
        );
        let record = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(provider)
            .bind(webhook_kind)
            .bind(fingerprint)
            .fetch_optional(executor)
            .await?;

        Ok(record)
    }

    /// Applies the post-processing update to a record.
    ///
    /// The row is locked for the duration of the read-modify-write.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` for an unknown id and
    /// `CoreError::InvalidInput` when business effects are reported against a
    /// duplicate.
    pub async fn apply_processing_update(
        &self,
        id: DeliveryId,
        update: &ProcessingUpdate,
    ) -> Result<DeliveryRecord> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {COLUMNS} FROM delivery_records WHERE id = $1 FOR UPDATE");
        let mut record = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("delivery record {id} not found")))?;

        if record.delivery_status == DeliveryStatus::Duplicate && update.has_business_impact() {
            return Err(CoreError::InvalidInput(format!(
                "delivery record {id} is a duplicate and cannot carry business effects"
            )));
        }

        update.apply_to(&mut record);

        sqlx::query(
            r"
            UPDATE delivery_records
            SET processing_status = $2,
                processing_started_at = $3,
                processing_completed_at = $4,
                error_kind = $5,
                error_message = $6,
                payment_confirmed = $7,
                balance_credited = $8,
                user_notified = $9
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(record.processing_status)
        .bind(record.processing_started_at)
        .bind(record.processing_completed_at)
        .bind(record.error_kind)
        .bind(&record.error_message)
        .bind(record.payment_confirmed)
        .bind(record.balance_credited)
        .bind(record.user_notified)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        audit::record("delivery_record", id, WriteOp::Update);

        Ok(record)
    }

    /// Finds records received in `[start, end)` for a provider.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_in_range(
        &self,
        provider: &ProviderName,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<DeliveryRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_records \
             WHERE provider = $1 AND received_at >= $2 AND received_at < $3 \
             ORDER BY received_at ASC"
        );
        let records = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(provider)
            .bind(start)
            .bind(end)
            .fetch_all(&*self.pool)
            .await?;

        Ok(records)
    }

    /// Finds every record linked to a payment intent, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_intent(
        &self,
        provider: &ProviderName,
        intent: &IntentId,
    ) -> Result<Vec<DeliveryRecord>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM delivery_records \
             WHERE provider = $1 AND payment_intent_id = $2 \
             ORDER BY received_at ASC"
        );
        let records = sqlx::query_as::<_, DeliveryRecord>(&sql)
            .bind(provider)
            .bind(intent)
            .fetch_all(&*self.pool)
            .await?;

        Ok(records)
    }
}
