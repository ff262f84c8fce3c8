//! Repository for health events.
//!
//! Events are immutable records of an occurrence. Only the dispatcher
//! bookkeeping columns (`occurrence_count`, `escalation_level`,
//! `notified_at`) and the resolution columns change after insert.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    audit::{self, WriteOp},
    error::{CoreError, Result},
    models::{HealthEvent, HealthEventId},
};

const COLUMNS: &str = "id, provider, event_type, severity, title, description, \
     threshold_type, threshold_value, actual_value, context, metrics_snapshot, \
     alert_fingerprint, occurrence_count, escalation_level, notified_at, resolved, \
     auto_resolved, resolved_at, occurred_at";

/// Repository for health event operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new event.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, event: &HealthEvent) -> Result<HealthEventId> {
        let sql = format!(
            "INSERT INTO health_events ({COLUMNS}) VALUES (\
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        );

        sqlx::query(&sql)
            .bind(event.id)
            .bind(&event.provider)
            .bind(event.event_type)
            .bind(event.severity)
            .bind(&event.title)
            .bind(&event.description)
            .bind(event.threshold_type)
            .bind(event.threshold_value)
            .bind(event.actual_value)
            .bind(&event.context)
            .bind(&event.metrics_snapshot)
            .bind(&event.alert_fingerprint)
            .bind(event.occurrence_count)
            .bind(event.escalation_level)
            .bind(event.notified_at)
            .bind(event.resolved)
            .bind(event.auto_resolved)
            .bind(event.resolved_at)
            .bind(event.occurred_at)
            .execute(&*self.pool)
            .await?;

        audit::record("health_event", event.id, WriteOp::Insert);
        Ok(event.id)
    }

    /// Persists dispatcher bookkeeping and resolution state.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the event does not exist.
    pub async fn update(&self, event: &HealthEvent) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE health_events
            SET actual_value = $2,
                occurrence_count = $3,
                escalation_level = $4,
                notified_at = $5,
                resolved = $6,
                auto_resolved = $7,
                resolved_at = $8
            WHERE id = $1
            ",
        )
        .bind(event.id)
        .bind(event.actual_value)
        .bind(event.occurrence_count)
        .bind(event.escalation_level)
        .bind(event.notified_at)
        .bind(event.resolved)
        .bind(event.auto_resolved)
        .bind(event.resolved_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("health event {} not found", event.id)));
        }

        let op = if event.resolved { WriteOp::Resolve } else { WriteOp::Update };
        audit::record("health_event", event.id, op);
        Ok(())
    }

    /// Finds an event by id.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: HealthEventId) -> Result<Option<HealthEvent>> {
        let sql = format!("SELECT {COLUMNS} FROM health_events WHERE id = $1");
        let event = sqlx::query_as::<_, HealthEvent>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(event)
    }

    /// Lists events that occurred at or after `since`, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list_since(&self, since: DateTime<Utc>, limit: i64) -> Result<Vec<HealthEvent>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM health_events \
             WHERE occurred_at >= $1 \
             ORDER BY occurred_at DESC \
             LIMIT $2"
        );
        let events = sqlx::query_as::<_, HealthEvent>(&sql)
            .bind(since)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        Ok(events)
    }

    /// Closes an event by operator acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the event does not exist.
    pub async fn acknowledge(&self, id: HealthEventId, at: DateTime<Utc>) -> Result<HealthEvent> {
        let sql = format!(
            "UPDATE health_events \
             SET resolved = TRUE, \
                 auto_resolved = CASE WHEN resolved THEN auto_resolved ELSE FALSE END, \
                 resolved_at = COALESCE(resolved_at, $2) \
             WHERE id = $1 \
             RETURNING {COLUMNS}"
        );
        let event = sqlx::query_as::<_, HealthEvent>(&sql)
            .bind(id)
            .bind(at)
            .fetch_optional(&*self.pool)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("health event {id} not found")))?;

        audit::record("health_event", id, WriteOp::Resolve);
        Ok(event)
    }
}
