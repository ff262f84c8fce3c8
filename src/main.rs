//! Paywatch webhook reliability service.
//!
//! Main entry point. Loads configuration, prepares the database, seeds the
//! default provider configurations, starts the monitor engine and serves the
//! HTTP API until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use paywatch_api::{start_server, AppState, Config};
use paywatch_core::{
    models::{MonitoringConfig, ProviderName, DEFAULT_PROVIDERS},
    storage::Storage,
    Clock, RealClock,
};
use paywatch_monitor::{
    client::{HttpCollaboratorClient, HttpNotifier},
    notify::{MulticastNotifier, TracingNotifier},
    IngestGate, MonitorEngine, MonitorStorage, Notifier, PostgresMonitorStorage,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting paywatch webhook monitoring service");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    paywatch_core::storage::migrate(&db_pool).await.context("Failed to migrate schema")?;
    info!("Database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage: Arc<dyn MonitorStorage> =
        Arc::new(PostgresMonitorStorage::new(Arc::new(Storage::new(db_pool.clone()))));

    seed_provider_configs(storage.as_ref(), clock.now()).await?;

    let collaborator = Arc::new(
        HttpCollaboratorClient::new(config.to_collaborator_config())
            .context("Failed to build collaborator client")?,
    );
    let notifier = build_notifier(&config)?;

    let mut engine = MonitorEngine::new(
        config.to_engine_config(),
        storage.clone(),
        clock.clone(),
        collaborator.clone(),
        collaborator,
        notifier,
    );
    engine.start().context("Failed to start monitor engine")?;
    info!(tick_seconds = config.engine_tick_seconds, "Monitor engine started");

    let gate = IngestGate::new(
        storage.clone(),
        clock.clone(),
        config.provider_secrets()?,
        config.to_security_policy(),
    )
    .with_burst_alerts(engine.dispatcher());
    let state = AppState::new(storage, gate, engine.dispatcher(), clock)
        .with_limits(Duration::from_secs(config.request_timeout), config.max_payload_bytes);
    let addr = config.parse_server_addr()?;

    let served = start_server(state, addr).await;
    if let Err(e) = &served {
        error!(error = %e, "Server failed");
    }

    if let Err(e) = engine.shutdown().await {
        warn!(error = %e, "Monitor engine did not stop cleanly");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Paywatch shutdown complete");
    served.context("HTTP server failed")
}

/// Initializes tracing with environment-based configuration.
///
/// `RUST_LOG` wins over the configured default filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Inserts the default configuration for each built-in provider that has
/// none yet. Existing rows are left untouched.
async fn seed_provider_configs(
    storage: &dyn MonitorStorage,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<()> {
    for name in DEFAULT_PROVIDERS {
        let provider = ProviderName::parse(name)?;
        let inserted = storage
            .seed_config(MonitoringConfig::default_for(provider, now))
            .await
            .with_context(|| format!("Failed to seed monitoring config for {name}"))?;
        if inserted {
            info!(provider = name, "Seeded default monitoring config");
        }
    }
    Ok(())
}

/// Log-only notifier, fanned out to the alerting webhook when configured.
fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    let Some(webhook) = config.to_notifier_config() else {
        return Ok(Arc::new(TracingNotifier));
    };

    let http = HttpNotifier::new(webhook).context("Failed to build alerting notifier")?;
    Ok(Arc::new(MulticastNotifier::new(vec![Arc::new(TracingNotifier), Arc::new(http)])))
}
