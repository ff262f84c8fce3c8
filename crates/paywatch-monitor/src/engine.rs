//! Scheduling engine for the periodic monitoring stages.
//!
//! ```text
//! ┌───────────────┐ tick ┌──────────────────────┐   ┌───────────────────┐
//! │ MonitorEngine │─────▶│ JoinSet, 1 task per  │──▶│ MonitorCycle      │
//! └───────────────┘      │ enabled provider     │   │ aggregate, score, │
//!        │               └──────────────────────┘   │ detect, recover   │
//!        ▼                                          └───────────────────┘
//! ┌───────────────┐
//! │ Cancellation  │
//! └───────────────┘
//! ```
//!
//! Every tick reloads the configuration table and spawns one cycle per
//! enabled provider. Cycles are serialized per provider by a lock that a
//! tick only tries to take: a provider whose previous cycle is still running
//! is skipped for that tick. Cancellation stops new ticks; in-flight cycles
//! are awaited within the shutdown timeout.

use std::{collections::HashMap, sync::Arc, time::Duration};

use paywatch_core::{models::ProviderName, Clock};
use tokio::{
    sync::{Mutex, RwLock},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    collaborators::{IntentSource, Notifier, ProviderStatusQuery},
    cycle::{CycleReport, MonitorCycle},
    dispatcher::AlertDispatcher,
    error::{MonitorError, Result},
    storage::MonitorStorage,
};

/// Default interval between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Default consecutive failed cycles before a monitoring-failure alert.
pub const DEFAULT_FAILURE_ALERT_THRESHOLD: u32 = 5;

/// Configuration for the monitoring engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Interval between ticks.
    pub tick_interval: Duration,

    /// Maximum time to wait for in-flight cycles at shutdown.
    pub shutdown_timeout: Duration,

    /// Consecutive failed cycles of one provider that raise a critical alert.
    pub failure_alert_threshold: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            shutdown_timeout: Duration::from_secs(30),
            failure_alert_threshold: DEFAULT_FAILURE_ALERT_THRESHOLD,
        }
    }
}

/// Counters for engine monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Ticks started.
    pub ticks: u64,
    /// Cycles whose every stage completed.
    pub cycles_completed: u64,
    /// Cycles with at least one failed stage.
    pub cycles_failed: u64,
    /// Cycles skipped because the provider's previous cycle was still running.
    pub cycles_skipped: u64,
    /// Snapshots written.
    pub windows_closed: u64,
    /// Missing-confirmation alerts created.
    pub alerts_created: u64,
    /// Alerts recovered through provider queries.
    pub recoveries: u64,
}

impl EngineStats {
    fn record(&mut self, report: &CycleReport) {
        if report.succeeded() {
            self.cycles_completed += 1;
        } else {
            self.cycles_failed += 1;
        }
        self.windows_closed += report.windows_closed as u64;
        self.alerts_created += report.detection.map_or(0, |d| d.created as u64);
        self.recoveries += report.recovery.recovered as u64;
    }
}

/// Outcome of one provider's slot in a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderRun {
    /// The cycle ran.
    Ran(CycleReport),
    /// The provider's previous cycle still held its lock.
    Skipped,
    /// The cycle could not start.
    Failed(String),
}

/// Main engine driving the periodic monitoring cycles.
pub struct MonitorEngine {
    config: EngineConfig,
    storage: Arc<dyn MonitorStorage>,
    clock: Arc<dyn Clock>,
    cycle: MonitorCycle,
    provider_locks: Arc<Mutex<HashMap<ProviderName, Arc<Mutex<()>>>>>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    scheduler: Option<JoinHandle<Result<()>>>,
}

impl MonitorEngine {
    /// Creates an engine over the given storage and collaborators.
    pub fn new(
        config: EngineConfig,
        storage: Arc<dyn MonitorStorage>,
        clock: Arc<dyn Clock>,
        intents: Arc<dyn IntentSource>,
        status: Arc<dyn ProviderStatusQuery>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let cycle = MonitorCycle::new(
            storage.clone(),
            clock.clone(),
            intents,
            status,
            notifier,
            config.failure_alert_threshold,
        );
        Self {
            config,
            storage,
            clock,
            cycle,
            provider_locks: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            scheduler: None,
        }
    }

    /// Dispatcher shared with the API for acknowledgments.
    pub fn dispatcher(&self) -> AlertDispatcher {
        self.cycle.dispatcher().clone()
    }

    /// Starts the scheduler loop.
    ///
    /// Returns immediately. The first tick runs right away.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when already started or when the tick interval
    /// is zero.
    pub fn start(&mut self) -> Result<()> {
        if self.scheduler.is_some() {
            return Err(MonitorError::configuration("monitor engine already started"));
        }
        if self.config.tick_interval.is_zero() {
            return Err(MonitorError::configuration("tick interval must be greater than zero"));
        }

        info!(
            tick_interval_seconds = self.config.tick_interval.as_secs(),
            failure_alert_threshold = self.config.failure_alert_threshold,
            "starting monitor engine"
        );

        let runner = self.runner();
        let span = tracing::info_span!("monitor_scheduler");
        self.scheduler = Some(tokio::spawn(async move { runner.run().await }.instrument(span)));
        Ok(())
    }

    /// Runs one tick for every enabled provider and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns storage errors from loading the configuration table.
    pub async fn tick(&self) -> Result<HashMap<ProviderName, ProviderRun>> {
        self.runner().tick().await
    }

    /// Runs one cycle for a single provider, bypassing the scheduler.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for unconfigured providers and `Configuration` for
    /// invalid configurations.
    pub async fn run_cycle(&self, provider: &ProviderName) -> Result<CycleReport> {
        let report = self.cycle.run_for(provider).await?;
        self.stats.write().await.record(&report);
        Ok(report)
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Whether the scheduler loop is running.
    pub fn is_running(&self) -> bool {
        self.scheduler.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Gracefully shuts down the engine.
    ///
    /// Stops new ticks and waits for in-flight cycles to complete within the
    /// configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` when cycles outlive the timeout and
    /// `TaskPanic` when the scheduler panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(timeout_seconds = timeout.as_secs(), "shutting down monitor engine");

        self.cancellation_token.cancel();

        let Some(handle) = self.scheduler.take() else {
            info!("monitor engine was not started, shutdown completed immediately");
            return Ok(());
        };

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => {
                if let Err(ref error) = result {
                    warn!(%error, "scheduler completed with error during shutdown");
                }
                info!("monitor engine shutdown completed");
                Ok(())
            },
            Ok(Err(join_error)) => {
                error!(error = %join_error, "scheduler task panicked during shutdown");
                Err(MonitorError::TaskPanic { message: join_error.to_string() })
            },
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "engine shutdown timed out, some cycles may still be running"
                );
                Err(MonitorError::ShutdownTimeout { timeout })
            },
        }
    }

    fn runner(&self) -> Scheduler {
        Scheduler {
            tick_interval: self.config.tick_interval,
            storage: self.storage.clone(),
            clock: self.clock.clone(),
            cycle: self.cycle.clone(),
            provider_locks: self.provider_locks.clone(),
            stats: self.stats.clone(),
            cancellation_token: self.cancellation_token.clone(),
        }
    }
}

impl Drop for MonitorEngine {
    fn drop(&mut self) {
        let active = self.scheduler.as_ref().is_some_and(|handle| !handle.is_finished());
        if active && !self.cancellation_token.is_cancelled() {
            error!("MonitorEngine dropped while running, forcing cancellation");
            self.cancellation_token.cancel();
            warn!("call shutdown() before dropping the engine to let in-flight cycles finish");
        }
    }
}

#[derive(Clone)]
struct Scheduler {
    tick_interval: Duration,
    storage: Arc<dyn MonitorStorage>,
    clock: Arc<dyn Clock>,
    cycle: MonitorCycle,
    provider_locks: Arc<Mutex<HashMap<ProviderName, Arc<Mutex<()>>>>>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
}

impl Scheduler {
    async fn run(self) -> Result<()> {
        info!("monitor scheduler started");

        while !self.cancellation_token.is_cancelled() {
            if let Err(error) = self.tick().await {
                error!(%error, "monitor tick failed");
            }

            tokio::select! {
                () = self.clock.sleep(self.tick_interval) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!("monitor scheduler stopped");
        Ok(())
    }

    async fn tick(&self) -> Result<HashMap<ProviderName, ProviderRun>> {
        self.stats.write().await.ticks += 1;
        let configs = self.storage.list_configs().await?;

        let mut tasks = JoinSet::new();
        let mut runs = HashMap::new();

        for config in configs {
            if !config.monitoring_enabled {
                debug!(provider = %config.provider, "monitoring disabled, skipping");
                continue;
            }

            let lock = self.lock_for(&config.provider).await;
            let Ok(guard) = lock.try_lock_owned() else {
                debug!(provider = %config.provider, "previous cycle still running, skipping");
                self.stats.write().await.cycles_skipped += 1;
                runs.insert(config.provider, ProviderRun::Skipped);
                continue;
            };

            let cycle = self.cycle.clone();
            tasks.spawn(async move {
                let outcome = cycle.run(&config).await;
                drop(guard);
                (config.provider, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((provider, Ok(report))) => {
                    self.stats.write().await.record(&report);
                    runs.insert(provider, ProviderRun::Ran(report));
                },
                Ok((provider, Err(error))) => {
                    error!(%provider, %error, "monitor cycle could not start");
                    self.stats.write().await.cycles_failed += 1;
                    runs.insert(provider, ProviderRun::Failed(error.to_string()));
                },
                Err(join_error) => {
                    error!(error = %join_error, "monitor cycle panicked");
                    self.stats.write().await.cycles_failed += 1;
                },
            }
        }

        Ok(runs)
    }

    async fn lock_for(&self, provider: &ProviderName) -> Arc<Mutex<()>> {
        self.provider_locks.lock().await.entry(provider.clone()).or_default().clone()
    }
}
