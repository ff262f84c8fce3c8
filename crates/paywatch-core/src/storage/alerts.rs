//! Repository for missing-confirmation alerts.
//!
//! One row per (provider, payment intent). Recovery bookkeeping is updated
//! with single-statement increments so a failed attempt is counted exactly
//! once even if two writers race.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use crate::{
    audit::{self, WriteOp},
    error::{CoreError, Result},
    models::{AlertId, AlertRefresh, IntentId, MissingConfirmationAlert, ProviderName},
};

const COLUMNS: &str = "id, provider, payment_intent_id, detection_type, detected_at, \
     expected_confirmation_by, time_overdue_minutes, payment_snapshot, \
     last_webhook_received_at, recovery_status, recovery_attempts, recovery_method, \
     last_recovery_attempt_at, last_recovery_error, alert_sent, alert_level, \
     escalation_level, acknowledged, resolved, resolved_at, resolution_notes, \
     auto_resolved, created_at, updated_at";

/// Repository for missing-confirmation alert operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new alert.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the intent already has an
    /// alert.
    pub async fn create(&self, alert: &MissingConfirmationAlert) -> Result<AlertId> {
        let sql = format!(
            "INSERT INTO missing_confirmation_alerts ({COLUMNS}) VALUES (\
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)"
        );

        sqlx::query(&sql)
            .bind(alert.id)
            .bind(&alert.provider)
            .bind(&alert.payment_intent_id)
            .bind(alert.detection_type)
            .bind(alert.detected_at)
            .bind(alert.expected_confirmation_by)
            .bind(alert.time_overdue_minutes)
            .bind(&alert.payment_snapshot)
            .bind(alert.last_webhook_received_at)
            .bind(alert.recovery_status)
            .bind(alert.recovery_attempts)
            .bind(alert.recovery_method)
            .bind(alert.last_recovery_attempt_at)
            .bind(&alert.last_recovery_error)
            .bind(alert.alert_sent)
            .bind(alert.alert_level)
            .bind(alert.escalation_level)
            .bind(alert.acknowledged)
            .bind(alert.resolved)
            .bind(alert.resolved_at)
            .bind(&alert.resolution_notes)
            .bind(alert.auto_resolved)
            .bind(alert.created_at)
            .bind(alert.updated_at)
            .execute(&*self.pool)
            .await?;

        audit::record("missing_confirmation_alert", alert.id, WriteOp::Insert);
        Ok(alert.id)
    }

    /// Writes the detector and dispatcher fields of an open alert.
    ///
    /// Acknowledgment, resolution and recovery columns are left alone, and
    /// the write is skipped once the alert is resolved. Returns the updated
    /// row, or `None` when the alert was already closed.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the alert does not exist.
    pub async fn refresh(
        &self,
        id: AlertId,
        refresh: &AlertRefresh,
    ) -> Result<Option<MissingConfirmationAlert>> {
        let sql = format!(
            "UPDATE missing_confirmation_alerts \
             SET detection_type = $2, \
                 time_overdue_minutes = $3, \
                 last_webhook_received_at = $4, \
                 alert_level = $5, \
                 alert_sent = alert_sent OR $6, \
                 escalation_level = $7, \
                 updated_at = $8 \
             WHERE id = $1 AND resolved = FALSE \
             RETURNING {COLUMNS}"
        );
        let updated = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(id)
            .bind(refresh.detection_type)
            .bind(refresh.time_overdue_minutes)
            .bind(refresh.last_webhook_received_at)
            .bind(refresh.alert_level)
            .bind(refresh.alert_sent)
            .bind(refresh.escalation_level)
            .bind(refresh.updated_at)
            .fetch_optional(&*self.pool)
            .await?;

        match updated {
            Some(alert) => {
                audit::record("missing_confirmation_alert", id, WriteOp::Update);
                Ok(Some(alert))
            },
            None => self.closed_or_missing(id).await,
        }
    }

    /// Closes an open alert without operator involvement.
    ///
    /// Returns `None` when the alert was already closed, leaving its
    /// resolution untouched.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the alert does not exist.
    pub async fn auto_resolve(
        &self,
        id: AlertId,
        notes: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<MissingConfirmationAlert>> {
        let sql = format!(
            "UPDATE missing_confirmation_alerts \
             SET resolved = TRUE, \
                 auto_resolved = TRUE, \
                 resolved_at = $3, \
                 resolution_notes = $2, \
                 updated_at = $3 \
             WHERE id = $1 AND resolved = FALSE \
             RETURNING {COLUMNS}"
        );
        let resolved = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(id)
            .bind(notes)
            .bind(at)
            .fetch_optional(&*self.pool)
            .await?;

        match resolved {
            Some(alert) => {
                audit::record("missing_confirmation_alert", id, WriteOp::Resolve);
                Ok(Some(alert))
            },
            None => self.closed_or_missing(id).await,
        }
    }

    async fn closed_or_missing(&self, id: AlertId) -> Result<Option<MissingConfirmationAlert>> {
        match self.find_by_id(id).await? {
            Some(_) => Ok(None),
            None => Err(CoreError::NotFound(format!("alert {id} not found"))),
        }
    }

    /// Finds an alert by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: AlertId) -> Result<Option<MissingConfirmationAlert>> {
        self.find_by_id_impl(&*self.pool, id).await
    }

    async fn find_by_id_impl<'e, E>(
        &self,
        executor: E,
        id: AlertId,
    ) -> Result<Option<MissingConfirmationAlert>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let sql = format!("SELECT {COLUMNS} FROM missing_confirmation_alerts WHERE id = $1");
        let alert = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(id)
            .fetch_optional(executor)
            .await?;

        Ok(alert)
    }

    /// Finds the alert for a payment intent, resolved or not.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_intent(
        &self,
        provider: &ProviderName,
        intent: &IntentId,
    ) -> Result<Option<MissingConfirmationAlert>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM missing_confirmation_alerts \
             WHERE provider = $1 AND payment_intent_id = $2"
        );
        let alert = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(provider)
            .bind(intent)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(alert)
    }

    /// Lists unresolved alerts, optionally for one provider, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_open(
        &self,
        provider: Option<&ProviderName>,
    ) -> Result<Vec<MissingConfirmationAlert>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM missing_confirmation_alerts \
             WHERE resolved = FALSE AND ($1::TEXT IS NULL OR provider = $1) \
             ORDER BY detected_at ASC"
        );
        let alerts = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(provider)
            .fetch_all(&*self.pool)
            .await?;

        Ok(alerts)
    }

    /// Lists alerts eligible for automated recovery.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_recovery_candidates(
        &self,
        provider: &ProviderName,
    ) -> Result<Vec<MissingConfirmationAlert>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM missing_confirmation_alerts \
             WHERE provider = $1 \
               AND recovery_status IN ('pending', 'failed') \
               AND acknowledged = FALSE \
               AND resolved = FALSE \
             ORDER BY detected_at ASC"
        );
        let alerts = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(provider)
            .fetch_all(&*self.pool)
            .await?;

        Ok(alerts)
    }

    /// Counts a failed recovery attempt.
    ///
    /// The alert moves to `manual` once `max_attempts` is reached, otherwise
    /// to `failed`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the alert does not exist.
    pub async fn record_recovery_failure(
        &self,
        id: AlertId,
        error: &str,
        attempted_at: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<MissingConfirmationAlert> {
        let sql = format!(
            "UPDATE missing_confirmation_alerts \
             SET recovery_attempts = recovery_attempts + 1, \
                 recovery_status = CASE WHEN recovery_attempts + 1 >= $4 \
                     THEN 'manual' ELSE 'failed' END, \
                 recovery_method = 'provider_query', \
                 last_recovery_attempt_at = $3, \
                 last_recovery_error = $2, \
                 updated_at = $3 \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let alert = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(id)
            .bind(error)
            .bind(attempted_at)
            .bind(max_attempts)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("alert {id} not found")))?;

        audit::record("missing_confirmation_alert", id, WriteOp::Update);
        Ok(alert)
    }

    /// Marks an alert recovered and resolved within a transaction.
    ///
    /// An alert an operator closed meanwhile keeps its resolution.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the alert does not exist.
    pub async fn mark_recovered_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: AlertId,
        recovered_at: DateTime<Utc>,
        notes: &str,
    ) -> Result<MissingConfirmationAlert> {
        let sql = format!(
            "UPDATE missing_confirmation_alerts \
             SET recovery_attempts = recovery_attempts + 1, \
                 recovery_status = 'recovered', \
                 recovery_method = 'provider_query', \
                 last_recovery_attempt_at = $2, \
                 last_recovery_error = NULL, \
                 resolved_at = CASE WHEN resolved THEN resolved_at ELSE $2 END, \
                 auto_resolved = CASE WHEN resolved THEN auto_resolved ELSE TRUE END, \
                 resolution_notes = CASE WHEN resolved THEN resolution_notes ELSE $3 END, \
                 resolved = TRUE, \
                 updated_at = $2 \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let alert = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(id)
            .bind(recovered_at)
            .bind(notes)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("alert {id} not found")))?;

        audit::record("missing_confirmation_alert", id, WriteOp::Resolve);
        Ok(alert)
    }

    /// Records an operator acknowledgment and closes the alert.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the alert does not exist.
    pub async fn acknowledge(
        &self,
        id: AlertId,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<MissingConfirmationAlert> {
        let sql = format!(
            "UPDATE missing_confirmation_alerts \
             SET acknowledged = TRUE, \
                 resolved = TRUE, \
                 resolved_at = COALESCE(resolved_at, $2), \
                 auto_resolved = CASE WHEN resolved THEN auto_resolved ELSE FALSE END, \
                 recovery_method = COALESCE(recovery_method, 'manual_check'), \
                 resolution_notes = COALESCE($3, resolution_notes), \
                 updated_at = $2 \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let alert = sqlx::query_as::<_, MissingConfirmationAlert>(&sql)
            .bind(id)
            .bind(at)
            .bind(notes)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("alert {id} not found")))?;

        audit::record("missing_confirmation_alert", id, WriteOp::Resolve);
        Ok(alert)
    }
}
