//! Repository for dispatcher alert state.
//!
//! Cooldown and escalation bookkeeping is read-modify-written under a
//! transaction-scoped advisory lock keyed by the fingerprint, which also
//! serializes the first insert for a fingerprint that has no row yet.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    audit::{self, WriteOp},
    error::Result,
    models::AlertState,
};

const COLUMNS: &str = "fingerprint, provider, category, occurrence_count, escalation_level, \
     last_notified_at, first_seen_at, last_seen_at, open_event_id, resolved, updated_at";

/// Repository for alert state operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Finds the state for a fingerprint.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, fingerprint: &str) -> Result<Option<AlertState>> {
        let sql = format!("SELECT {COLUMNS} FROM alert_states WHERE fingerprint = $1");
        let state = sqlx::query_as::<_, AlertState>(&sql)
            .bind(fingerprint)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(state)
    }

    /// Atomically replaces the state for a fingerprint.
    ///
    /// `transition` receives the current state, if any, and returns the state
    /// to store. Returns the previous and the new state.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction fails.
    pub async fn transition<F>(
        &self,
        fingerprint: &str,
        transition: F,
    ) -> Result<(Option<AlertState>, AlertState)>
    where
        F: FnOnce(Option<&AlertState>) -> AlertState + Send,
    {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;

        let sql = format!("SELECT {COLUMNS} FROM alert_states WHERE fingerprint = $1");
        let previous = sqlx::query_as::<_, AlertState>(&sql)
            .bind(fingerprint)
            .fetch_optional(&mut *tx)
            .await?;

        let next = transition(previous.as_ref());

        let upsert = format!(
            "INSERT INTO alert_states ({COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (fingerprint) DO UPDATE SET \
                occurrence_count = EXCLUDED.occurrence_count, \
                escalation_level = EXCLUDED.escalation_level, \
                last_notified_at = EXCLUDED.last_notified_at, \
                first_seen_at = EXCLUDED.first_seen_at, \
                last_seen_at = EXCLUDED.last_seen_at, \
                open_event_id = EXCLUDED.open_event_id, \
                resolved = EXCLUDED.resolved, \
                updated_at = EXCLUDED.updated_at"
        );
        sqlx::query(&upsert)
            .bind(&next.fingerprint)
            .bind(&next.provider)
            .bind(&next.category)
            .bind(next.occurrence_count)
            .bind(next.escalation_level)
            .bind(next.last_notified_at)
            .bind(next.first_seen_at)
            .bind(next.last_seen_at)
            .bind(next.open_event_id)
            .bind(next.resolved)
            .bind(next.updated_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        audit::record("alert_state", fingerprint, WriteOp::Upsert);

        Ok((previous, next))
    }
}
