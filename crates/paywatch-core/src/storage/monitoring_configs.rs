//! Repository for per-provider monitoring configuration.
//!
//! Exactly one row per provider. Defaults are seeded at boot with
//! `ON CONFLICT DO NOTHING` so operator edits survive restarts.

use std::sync::Arc;

use sqlx::PgPool;

use crate::{
    audit::{self, WriteOp},
    error::Result,
    models::{MonitoringConfig, ProviderName},
};

const COLUMNS: &str = "provider, min_success_rate_threshold, max_avg_processing_time_ms, \
     max_delivery_delay_seconds, missing_confirmation_timeout_minutes, alert_cooldown_minutes, \
     escalation_thresholds, monitoring_enabled, alert_on_threshold_breach, \
     auto_recovery_enabled, aggregation_windows_minutes, scoring_window_minutes, \
     health_check_interval_minutes, max_recovery_attempts, recovery_backoff_minutes, \
     recovery_attempt_timeout_seconds, scoring, anomaly, updated_at";

/// Repository for monitoring configuration operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a configuration unless one exists for the provider.
    ///
    /// Returns whether a row was inserted.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or insert fails.
    pub async fn seed(&self, config: &MonitoringConfig) -> Result<bool> {
        config.validate()?;
        let inserted = self.write(config, "ON CONFLICT (provider) DO NOTHING").await?;
        if inserted {
            audit::record("monitoring_config", &config.provider, WriteOp::Insert);
        }
        Ok(inserted)
    }

    /// Inserts or replaces the configuration for a provider.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the upsert fails.
    pub async fn upsert(&self, config: &MonitoringConfig) -> Result<()> {
        config.validate()?;
        self.write(
            config,
            "ON CONFLICT (provider) DO UPDATE SET \
                min_success_rate_threshold = EXCLUDED.min_success_rate_threshold, \
                max_avg_processing_time_ms = EXCLUDED.max_avg_processing_time_ms, \
                max_delivery_delay_seconds = EXCLUDED.max_delivery_delay_seconds, \
                missing_confirmation_timeout_minutes = \
                    EXCLUDED.missing_confirmation_timeout_minutes, \
                alert_cooldown_minutes = EXCLUDED.alert_cooldown_minutes, \
                escalation_thresholds = EXCLUDED.escalation_thresholds, \
                monitoring_enabled = EXCLUDED.monitoring_enabled, \
                alert_on_threshold_breach = EXCLUDED.alert_on_threshold_breach, \
                auto_recovery_enabled = EXCLUDED.auto_recovery_enabled, \
                aggregation_windows_minutes = EXCLUDED.aggregation_windows_minutes, \
                scoring_window_minutes = EXCLUDED.scoring_window_minutes, \
                health_check_interval_minutes = EXCLUDED.health_check_interval_minutes, \
                max_recovery_attempts = EXCLUDED.max_recovery_attempts, \
                recovery_backoff_minutes = EXCLUDED.recovery_backoff_minutes, \
                recovery_attempt_timeout_seconds = EXCLUDED.recovery_attempt_timeout_seconds, \
                scoring = EXCLUDED.scoring, \
                anomaly = EXCLUDED.anomaly, \
                updated_at = EXCLUDED.updated_at",
        )
        .await?;
        audit::record("monitoring_config", &config.provider, WriteOp::Upsert);
        Ok(())
    }

    async fn write(&self, config: &MonitoringConfig, conflict_clause: &str) -> Result<bool> {
        let sql = format!(
            "INSERT INTO monitoring_configs ({COLUMNS}) VALUES (\
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, \
                $11, $12, $13, $14, $15, $16, $17, $18, $19) {conflict_clause}"
        );

        let result = sqlx::query(&sql)
            .bind(&config.provider)
            .bind(config.min_success_rate_threshold)
            .bind(config.max_avg_processing_time_ms)
            .bind(config.max_delivery_delay_seconds)
            .bind(config.missing_confirmation_timeout_minutes)
            .bind(config.alert_cooldown_minutes)
            .bind(&config.escalation_thresholds)
            .bind(config.monitoring_enabled)
            .bind(config.alert_on_threshold_breach)
            .bind(config.auto_recovery_enabled)
            .bind(&config.aggregation_windows_minutes)
            .bind(config.scoring_window_minutes)
            .bind(config.health_check_interval_minutes)
            .bind(config.max_recovery_attempts)
            .bind(&config.recovery_backoff_minutes)
            .bind(config.recovery_attempt_timeout_seconds)
            .bind(&config.scoring)
            .bind(&config.anomaly)
            .bind(config.updated_at)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Finds the configuration for a provider.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find(&self, provider: &ProviderName) -> Result<Option<MonitoringConfig>> {
        let sql = format!("SELECT {COLUMNS} FROM monitoring_configs WHERE provider = $1");
        let config = sqlx::query_as::<_, MonitoringConfig>(&sql)
            .bind(provider)
            .fetch_optional(&*self.pool)
            .await?;

        Ok(config)
    }

    /// Lists every provider configuration ordered by provider.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn list(&self) -> Result<Vec<MonitoringConfig>> {
        let sql = format!("SELECT {COLUMNS} FROM monitoring_configs ORDER BY provider ASC");
        let configs = sqlx::query_as::<_, MonitoringConfig>(&sql).fetch_all(&*self.pool).await?;

        Ok(configs)
    }
}
