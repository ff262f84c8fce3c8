//! Repository for provider health snapshots.
//!
//! Snapshots are keyed by (provider, window_start, window_duration_minutes)
//! and written with an upsert so recomputing a closed window replaces the
//! previous row instead of adding a second one. A recomputation keeps the
//! window's threshold checkpoint.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    audit::{self, WriteOp},
    error::{CoreError, Result},
    models::{ProviderHealthSnapshot, ProviderName},
};

const COLUMNS: &str = "provider, window_start, window_end, window_duration_minutes, \
     expected_count, received_count, successful_count, failed_count, duplicate_count, \
     late_count, delay_mean_ms, delay_min_ms, delay_max_ms, delay_p95_ms, \
     processing_mean_ms, processing_min_ms, processing_max_ms, processing_p95_ms, \
     delivery_success_rate, processing_success_rate, security_pass_rate, error_counts, \
     health_score, health_status, computed_at, thresholds_checked_at";

/// Repository for health snapshot operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts or replaces the snapshot for its window.
    ///
    /// # Errors
    ///
    /// Returns error if the upsert fails.
    pub async fn upsert(&self, snapshot: &ProviderHealthSnapshot) -> Result<()> {
        let sql = format!(
            "INSERT INTO health_snapshots ({COLUMNS}) VALUES (\
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, \
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26) \
             ON CONFLICT (provider, window_start, window_duration_minutes) DO UPDATE SET \
                window_end = EXCLUDED.window_end, \
                expected_count = EXCLUDED.expected_count, \
                received_count = EXCLUDED.received_count, \
                successful_count = EXCLUDED.successful_count, \
                failed_count = EXCLUDED.failed_count, \
                duplicate_count = EXCLUDED.duplicate_count, \
                late_count = EXCLUDED.late_count, \
                delay_mean_ms = EXCLUDED.delay_mean_ms, \
                delay_min_ms = EXCLUDED.delay_min_ms, \
                delay_max_ms = EXCLUDED.delay_max_ms, \
                delay_p95_ms = EXCLUDED.delay_p95_ms, \
                processing_mean_ms = EXCLUDED.processing_mean_ms, \
                processing_min_ms = EXCLUDED.processing_min_ms, \
                processing_max_ms = EXCLUDED.processing_max_ms, \
                processing_p95_ms = EXCLUDED.processing_p95_ms, \
                delivery_success_rate = EXCLUDED.delivery_success_rate, \
                processing_success_rate = EXCLUDED.processing_success_rate, \
                security_pass_rate = EXCLUDED.security_pass_rate, \
                error_counts = EXCLUDED.error_counts, \
                health_score = EXCLUDED.health_score, \
                health_status = EXCLUDED.health_status, \
                computed_at = EXCLUDED.computed_at"
        );

        sqlx::query(&sql)
            .bind(&snapshot.provider)
            .bind(snapshot.window_start)
            .bind(snapshot.window_end)
            .bind(snapshot.window_duration_minutes)
            .bind(snapshot.expected_count)
            .bind(snapshot.received_count)
            .bind(snapshot.successful_count)
            .bind(snapshot.failed_count)
            .bind(snapshot.duplicate_count)
            .bind(snapshot.late_count)
            .bind(snapshot.delivery_delay.mean_ms)
            .bind(snapshot.delivery_delay.min_ms)
            .bind(snapshot.delivery_delay.max_ms)
            .bind(snapshot.delivery_delay.p95_ms)
            .bind(snapshot.processing_time.mean_ms)
            .bind(snapshot.processing_time.min_ms)
            .bind(snapshot.processing_time.max_ms)
            .bind(snapshot.processing_time.p95_ms)
            .bind(snapshot.delivery_success_rate)
            .bind(snapshot.processing_success_rate)
            .bind(snapshot.security_pass_rate)
            .bind(sqlx::types::Json(&snapshot.error_counts))
            .bind(snapshot.health_score)
            .bind(snapshot.health_status)
            .bind(snapshot.computed_at)
            .bind(snapshot.thresholds_checked_at)
            .execute(&*self.pool)
            .await?;

        audit::record(
            "health_snapshot",
            format!(
                "{}/{}/{}",
                snapshot.provider,
                snapshot.window_start.to_rfc3339(),
                snapshot.window_duration_minutes
            ),
            WriteOp::Upsert,
        );

        Ok(())
    }

    /// Records that every threshold check of a window was dispatched.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the window has no snapshot.
    pub async fn mark_checked(
        &self,
        provider: &ProviderName,
        window_start: DateTime<Utc>,
        window_duration_minutes: i32,
        checked_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE health_snapshots
            SET thresholds_checked_at = $4
            WHERE provider = $1 AND window_start = $2 AND window_duration_minutes = $3
            ",
        )
        .bind(provider)
        .bind(window_start)
        .bind(window_duration_minutes)
        .bind(checked_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "no {window_duration_minutes}-minute snapshot for {provider} at {window_start}"
            )));
        }
        Ok(())
    }

    /// Finds the most recent snapshot for a provider and window size.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_latest(
        &self,
        provider: &ProviderName,
        window_duration_minutes: i32,
    ) -> Result<Option<ProviderHealthSnapshot>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM health_snapshots \
             WHERE provider = $1 AND window_duration_minutes = $2 \
             ORDER BY window_start DESC LIMIT 1"
        );
        let snapshot = sqlx::query_as::<_, ProviderHealthSnapshot>(&sql)
            .bind(provider)
            .bind(window_duration_minutes)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(snapshot)
    }

    /// Finds the snapshot for one exact window.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_window(
        &self,
        provider: &ProviderName,
        window_start: DateTime<Utc>,
        window_duration_minutes: i32,
    ) -> Result<Option<ProviderHealthSnapshot>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM health_snapshots \
             WHERE provider = $1 AND window_start = $2 AND window_duration_minutes = $3"
        );
        let snapshot = sqlx::query_as::<_, ProviderHealthSnapshot>(&sql)
            .bind(provider)
            .bind(window_start)
            .bind(window_duration_minutes)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(snapshot)
    }
}
