//! Schema bootstrap.
//!
//! Creates every table and index the repositories rely on. Statements are
//! idempotent so the migration runs on every boot. The partial unique index on
//! accepted deliveries backs duplicate detection and the unique
//! (provider, payment_intent_id) constraint backs the one-alert-per-intent
//! rule.

use sqlx::PgPool;
use tracing::debug;

use crate::error::{CoreError, Result};

const STATEMENTS: &[(&str, &str)] = &[
    (
        "delivery_records table",
        r"
        CREATE TABLE IF NOT EXISTS delivery_records (
            id UUID PRIMARY KEY,
            provider TEXT NOT NULL,
            payment_intent_id TEXT,
            webhook_kind TEXT NOT NULL,
            request_id TEXT,
            expected_at TIMESTAMPTZ,
            received_at TIMESTAMPTZ NOT NULL,
            processing_started_at TIMESTAMPTZ,
            processing_completed_at TIMESTAMPTZ,
            delivery_status TEXT NOT NULL CHECK (delivery_status IN
                ('received', 'failed', 'timeout', 'invalid', 'duplicate')),
            processing_status TEXT NOT NULL CHECK (processing_status IN
                ('pending', 'success', 'failed', 'partial', 'skipped')),
            error_kind TEXT,
            error_message TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            signature_valid BOOLEAN NOT NULL,
            timestamp_valid BOOLEAN NOT NULL,
            rate_limited BOOLEAN NOT NULL,
            payload_size_bytes BIGINT NOT NULL CHECK (payload_size_bytes >= 0),
            fingerprint TEXT NOT NULL,
            payment_confirmed BOOLEAN NOT NULL DEFAULT FALSE,
            balance_credited BOOLEAN NOT NULL DEFAULT FALSE,
            user_notified BOOLEAN NOT NULL DEFAULT FALSE,
            duplicate_of UUID REFERENCES delivery_records(id),
            recovery_alert_id UUID,
            created_at TIMESTAMPTZ NOT NULL,
            CHECK (delivery_status <> 'duplicate'
                OR NOT (payment_confirmed OR balance_credited OR user_notified))
        )
        ",
    ),
    (
        "delivery_records fingerprint index",
        r"
        CREATE UNIQUE INDEX IF NOT EXISTS uq_delivery_records_fingerprint
        ON delivery_records(provider, webhook_kind, fingerprint)
        WHERE delivery_status = 'received'
        ",
    ),
    (
        "delivery_records window index",
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_records_window
        ON delivery_records(provider, received_at)
        ",
    ),
    (
        "delivery_records intent index",
        r"
        CREATE INDEX IF NOT EXISTS idx_delivery_records_intent
        ON delivery_records(provider, payment_intent_id)
        WHERE payment_intent_id IS NOT NULL
        ",
    ),
    (
        "health_snapshots table",
        r"
        CREATE TABLE IF NOT EXISTS health_snapshots (
            provider TEXT NOT NULL,
            window_start TIMESTAMPTZ NOT NULL,
            window_end TIMESTAMPTZ NOT NULL,
            window_duration_minutes INTEGER NOT NULL CHECK (window_duration_minutes > 0),
            expected_count BIGINT NOT NULL,
            received_count BIGINT NOT NULL,
            successful_count BIGINT NOT NULL,
            failed_count BIGINT NOT NULL,
            duplicate_count BIGINT NOT NULL,
            late_count BIGINT NOT NULL,
            delay_mean_ms DOUBLE PRECISION,
            delay_min_ms DOUBLE PRECISION,
            delay_max_ms DOUBLE PRECISION,
            delay_p95_ms DOUBLE PRECISION,
            processing_mean_ms DOUBLE PRECISION,
            processing_min_ms DOUBLE PRECISION,
            processing_max_ms DOUBLE PRECISION,
            processing_p95_ms DOUBLE PRECISION,
            delivery_success_rate DOUBLE PRECISION,
            processing_success_rate DOUBLE PRECISION,
            security_pass_rate DOUBLE PRECISION,
            error_counts JSONB NOT NULL DEFAULT '{}',
            health_score DOUBLE PRECISION NOT NULL CHECK (health_score BETWEEN 0 AND 100),
            health_status TEXT NOT NULL,
            computed_at TIMESTAMPTZ NOT NULL,
            thresholds_checked_at TIMESTAMPTZ,
            PRIMARY KEY (provider, window_start, window_duration_minutes)
        )
        ",
    ),
    (
        "missing_confirmation_alerts table",
        r"
        CREATE TABLE IF NOT EXISTS missing_confirmation_alerts (
            id UUID PRIMARY KEY,
            provider TEXT NOT NULL,
            payment_intent_id TEXT NOT NULL,
            detection_type TEXT NOT NULL,
            detected_at TIMESTAMPTZ NOT NULL,
            expected_confirmation_by TIMESTAMPTZ NOT NULL,
            time_overdue_minutes BIGINT NOT NULL CHECK (time_overdue_minutes >= 0),
            payment_snapshot JSONB NOT NULL,
            last_webhook_received_at TIMESTAMPTZ,
            recovery_status TEXT NOT NULL,
            recovery_attempts INTEGER NOT NULL DEFAULT 0,
            recovery_method TEXT,
            last_recovery_attempt_at TIMESTAMPTZ,
            last_recovery_error TEXT,
            alert_sent BOOLEAN NOT NULL DEFAULT FALSE,
            alert_level TEXT NOT NULL,
            escalation_level INTEGER NOT NULL DEFAULT 0,
            acknowledged BOOLEAN NOT NULL DEFAULT FALSE,
            resolved BOOLEAN NOT NULL DEFAULT FALSE,
            resolved_at TIMESTAMPTZ,
            resolution_notes TEXT,
            auto_resolved BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            UNIQUE (provider, payment_intent_id)
        )
        ",
    ),
    (
        "missing_confirmation_alerts open index",
        r"
        CREATE INDEX IF NOT EXISTS idx_missing_confirmation_alerts_open
        ON missing_confirmation_alerts(provider, detected_at)
        WHERE resolved = FALSE
        ",
    ),
    (
        "health_events table",
        r"
        CREATE TABLE IF NOT EXISTS health_events (
            id UUID PRIMARY KEY,
            provider TEXT NOT NULL,
            event_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            threshold_type TEXT,
            threshold_value DOUBLE PRECISION,
            actual_value DOUBLE PRECISION,
            context JSONB NOT NULL DEFAULT '{}',
            metrics_snapshot JSONB,
            alert_fingerprint TEXT NOT NULL,
            occurrence_count INTEGER NOT NULL DEFAULT 1,
            escalation_level INTEGER NOT NULL DEFAULT 0,
            notified_at TIMESTAMPTZ,
            resolved BOOLEAN NOT NULL DEFAULT FALSE,
            auto_resolved BOOLEAN NOT NULL DEFAULT FALSE,
            resolved_at TIMESTAMPTZ,
            occurred_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "health_events recent index",
        r"
        CREATE INDEX IF NOT EXISTS idx_health_events_recent
        ON health_events(occurred_at DESC)
        ",
    ),
    (
        "alert_states table",
        r"
        CREATE TABLE IF NOT EXISTS alert_states (
            fingerprint TEXT PRIMARY KEY,
            provider TEXT NOT NULL,
            category TEXT NOT NULL,
            occurrence_count INTEGER NOT NULL,
            escalation_level INTEGER NOT NULL,
            last_notified_at TIMESTAMPTZ,
            first_seen_at TIMESTAMPTZ NOT NULL,
            last_seen_at TIMESTAMPTZ NOT NULL,
            open_event_id UUID,
            resolved BOOLEAN NOT NULL DEFAULT FALSE,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
    (
        "monitoring_configs table",
        r"
        CREATE TABLE IF NOT EXISTS monitoring_configs (
            provider TEXT PRIMARY KEY,
            min_success_rate_threshold DOUBLE PRECISION NOT NULL,
            max_avg_processing_time_ms BIGINT NOT NULL,
            max_delivery_delay_seconds BIGINT NOT NULL,
            missing_confirmation_timeout_minutes BIGINT NOT NULL,
            alert_cooldown_minutes BIGINT NOT NULL,
            escalation_thresholds INTEGER[] NOT NULL,
            monitoring_enabled BOOLEAN NOT NULL,
            alert_on_threshold_breach BOOLEAN NOT NULL,
            auto_recovery_enabled BOOLEAN NOT NULL,
            aggregation_windows_minutes INTEGER[] NOT NULL,
            scoring_window_minutes INTEGER NOT NULL,
            health_check_interval_minutes BIGINT NOT NULL,
            max_recovery_attempts INTEGER NOT NULL,
            recovery_backoff_minutes INTEGER[] NOT NULL,
            recovery_attempt_timeout_seconds BIGINT NOT NULL,
            scoring JSONB NOT NULL,
            anomaly JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        ",
    ),
];

/// Creates all tables and indexes if they do not exist.
///
/// # Errors
///
/// Returns `CoreError::Database` naming the statement that failed.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    for (name, statement) in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| CoreError::Database(format!("failed to create {name}: {e}")))?;
        debug!(object = name, "schema object ensured");
    }

    Ok(())
}
