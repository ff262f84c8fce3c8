//! One monitoring cycle for one provider.
//!
//! A cycle closes due aggregation windows, checks the newest scoring-window
//! snapshot against the provider's thresholds once, runs the missing-confirmation
//! detector when its interval has elapsed and attempts due recoveries. Stages
//! run independently: a failing stage is logged and reported, and the
//! remaining stages still run so the next cycle starts from consistent
//! inputs.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use paywatch_core::{
    models::{
        HealthEvent, HealthEventId, HealthEventType, MonitoringConfig, ProviderHealthSnapshot,
        ProviderName, Severity,
    },
    Clock,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    aggregator::WindowAggregator,
    collaborators::{
        IntentSource, Notification, NotificationSubject, Notifier, ProviderStatusQuery,
    },
    detector::{ConfirmationDetector, DetectionReport},
    dispatcher::{alert_fingerprint, AlertDispatcher, DispatchPolicy},
    error::{MonitorError, Result},
    recovery::{RecoveryOrchestrator, RecoveryReport},
    scorer::{self, ThresholdCheck},
    storage::MonitorStorage,
};

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Snapshots written by the aggregator.
    pub windows_closed: usize,
    /// Threshold breaches dispatched.
    pub breaches: usize,
    /// Threshold streaks closed by a passing check.
    pub resolved: usize,
    /// Detector report, when the detector was due.
    pub detection: Option<DetectionReport>,
    /// Recovery report.
    pub recovery: RecoveryReport,
    /// Stages that failed, with their errors.
    pub failures: Vec<(&'static str, String)>,
}

impl CycleReport {
    /// Whether every stage completed.
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Builds the health event raised for a breached check.
pub fn breach_event(
    check: &ThresholdCheck,
    snapshot: &ProviderHealthSnapshot,
    now: DateTime<Utc>,
) -> HealthEvent {
    let provider = &snapshot.provider;
    HealthEvent {
        id: HealthEventId::new(),
        provider: provider.clone(),
        event_type: check.event_type(),
        severity: check.severity,
        title: check.title(provider.as_str()),
        description: format!(
            "{} window starting {}: observed {}, limit {}",
            snapshot.window_duration_minutes,
            snapshot.window_start,
            check.actual_value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3}")),
            check.threshold_value
        ),
        threshold_type: Some(check.threshold_type),
        threshold_value: Some(check.threshold_value),
        actual_value: check.actual_value,
        context: serde_json::json!({
            "window_start": snapshot.window_start,
            "window_minutes": snapshot.window_duration_minutes,
            "health_score": snapshot.health_score,
            "health_status": snapshot.health_status,
        }),
        metrics_snapshot: serde_json::to_value(snapshot).ok(),
        alert_fingerprint: check_fingerprint(provider, check),
        occurrence_count: 1,
        escalation_level: 0,
        notified_at: None,
        resolved: false,
        auto_resolved: false,
        resolved_at: None,
        occurred_at: now,
    }
}

/// Dedup key of a threshold check.
pub fn check_fingerprint(provider: &ProviderName, check: &ThresholdCheck) -> String {
    alert_fingerprint(provider, check.threshold_type.as_str(), &check.bucket)
}

/// Dedup key of the repeated-cycle-failure alert.
pub fn monitoring_failure_fingerprint(provider: &ProviderName) -> String {
    alert_fingerprint(provider, HealthEventType::MonitoringFailure.as_str(), "cycle")
}

/// Per-provider pipeline shared by every scheduled tick.
#[derive(Clone)]
pub struct MonitorCycle {
    storage: Arc<dyn MonitorStorage>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    aggregator: WindowAggregator,
    detector: ConfirmationDetector,
    recovery: RecoveryOrchestrator,
    dispatcher: AlertDispatcher,
    last_detection: Arc<Mutex<HashMap<ProviderName, DateTime<Utc>>>>,
    consecutive_failures: Arc<Mutex<HashMap<ProviderName, u32>>>,
    failure_alert_threshold: u32,
}

impl MonitorCycle {
    /// Wires every stage over one storage, clock and set of collaborators.
    pub fn new(
        storage: Arc<dyn MonitorStorage>,
        clock: Arc<dyn Clock>,
        intents: Arc<dyn IntentSource>,
        status: Arc<dyn ProviderStatusQuery>,
        notifier: Arc<dyn Notifier>,
        failure_alert_threshold: u32,
    ) -> Self {
        let dispatcher = AlertDispatcher::new(storage.clone(), clock.clone(), notifier.clone());
        Self {
            aggregator: WindowAggregator::new(storage.clone(), clock.clone()),
            detector: ConfirmationDetector::new(
                storage.clone(),
                clock.clone(),
                intents,
                dispatcher.clone(),
            ),
            recovery: RecoveryOrchestrator::new(
                storage.clone(),
                clock.clone(),
                status,
                dispatcher.clone(),
            ),
            dispatcher,
            storage,
            clock,
            notifier,
            last_detection: Arc::new(Mutex::new(HashMap::new())),
            consecutive_failures: Arc::new(Mutex::new(HashMap::new())),
            failure_alert_threshold: failure_alert_threshold.max(1),
        }
    }

    /// Dispatcher used by every stage.
    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    /// Loads the provider's configuration and runs one cycle.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the provider has no configuration and
    /// `Configuration` when it is invalid.
    pub async fn run_for(&self, provider: &ProviderName) -> Result<CycleReport> {
        let config = self
            .storage
            .find_config(provider.clone())
            .await?
            .ok_or_else(|| MonitorError::not_found(format!("no monitoring config for {provider}")))?;
        self.run(&config).await
    }

    /// Runs every stage once for a provider.
    ///
    /// Stage failures are collected in the report rather than returned, and
    /// feed the consecutive-failure counter.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the configuration does not validate.
    #[instrument(name = "monitor_cycle", skip(self, config), fields(provider = %config.provider))]
    pub async fn run(&self, config: &MonitoringConfig) -> Result<CycleReport> {
        config.validate().map_err(|e| MonitorError::configuration(e.to_string()))?;

        let mut report = CycleReport::default();

        match self.aggregator.run(config).await {
            Ok(snapshots) => report.windows_closed = snapshots.len(),
            Err(error) => report.failures.push(("aggregate", error.to_string())),
        }

        if config.alert_on_threshold_breach {
            if let Err(error) = self.check_latest_window(config, &mut report).await {
                report.failures.push(("thresholds", error.to_string()));
            }
        }

        if self.detection_due(config).await {
            match self.detector.run(config).await {
                Ok(detection) => {
                    self.last_detection
                        .lock()
                        .await
                        .insert(config.provider.clone(), self.clock.now());
                    report.detection = Some(detection);
                },
                Err(error) => report.failures.push(("detect", error.to_string())),
            }
        }

        match self.recovery.run(config).await {
            Ok(recovery) => report.recovery = recovery,
            Err(error) => report.failures.push(("recover", error.to_string())),
        }

        self.track_outcome(config, &report).await;
        debug!(
            windows = report.windows_closed,
            breaches = report.breaches,
            failures = report.failures.len(),
            "cycle finished"
        );
        Ok(report)
    }

    /// Checks the newest scoring-window snapshot unless a previous cycle
    /// already did. The checkpoint is only written once every check was
    /// dispatched, so a failed check is retried on the next cycle.
    async fn check_latest_window(
        &self,
        config: &MonitoringConfig,
        report: &mut CycleReport,
    ) -> Result<()> {
        let latest = self
            .storage
            .latest_snapshot(config.provider.clone(), config.scoring_window_minutes)
            .await?;
        let Some(snapshot) = latest.filter(|s| s.thresholds_checked_at.is_none()) else {
            return Ok(());
        };

        self.check_thresholds(config, &snapshot, report).await?;
        self.storage
            .mark_snapshot_checked(
                snapshot.provider.clone(),
                snapshot.window_start,
                snapshot.window_duration_minutes,
                self.clock.now(),
            )
            .await?;
        Ok(())
    }

    async fn check_thresholds(
        &self,
        config: &MonitoringConfig,
        snapshot: &ProviderHealthSnapshot,
        report: &mut CycleReport,
    ) -> Result<()> {
        let assessment = scorer::assess(snapshot, config);
        let policy = DispatchPolicy::from(config);
        let now = self.clock.now();

        for check in &assessment.checks {
            if check.breached {
                self.dispatcher.dispatch_event(breach_event(check, snapshot, now), &policy).await?;
                report.breaches += 1;
            } else if self.dispatcher.resolve(&check_fingerprint(&config.provider, check)).await? {
                report.resolved += 1;
            }
        }
        Ok(())
    }

    async fn detection_due(&self, config: &MonitoringConfig) -> bool {
        let now = self.clock.now();
        self.last_detection
            .lock()
            .await
            .get(&config.provider)
            .map_or(true, |last| now - *last >= config.health_check_interval())
    }

    async fn track_outcome(&self, config: &MonitoringConfig, report: &CycleReport) {
        let provider = &config.provider;
        let failures = {
            let mut counters = self.consecutive_failures.lock().await;
            let counter = counters.entry(provider.clone()).or_insert(0);
            if report.succeeded() {
                let previous = *counter;
                *counter = 0;
                drop(counters);
                if previous >= self.failure_alert_threshold {
                    info!(%provider, "monitoring cycles recovered");
                    if let Err(error) =
                        self.dispatcher.resolve(&monitoring_failure_fingerprint(provider)).await
                    {
                        warn!(%provider, %error, "could not close monitoring failure alert");
                    }
                }
                return;
            }
            *counter = counter.saturating_add(1);
            *counter
        };

        warn!(%provider, consecutive = failures, stages = ?report.failures, "monitoring cycle failed");
        if failures == self.failure_alert_threshold {
            self.raise_monitoring_failure(config, failures, report).await;
        }
    }

    async fn raise_monitoring_failure(
        &self,
        config: &MonitoringConfig,
        failures: u32,
        report: &CycleReport,
    ) {
        let now = self.clock.now();
        let event = HealthEvent {
            id: HealthEventId::new(),
            provider: config.provider.clone(),
            event_type: HealthEventType::MonitoringFailure,
            severity: Severity::Critical,
            title: format!("{} monitoring failed {failures} cycles in a row", config.provider),
            description: report
                .failures
                .iter()
                .map(|(stage, error)| format!("{stage}: {error}"))
                .collect::<Vec<_>>()
                .join("; "),
            threshold_type: None,
            threshold_value: Some(f64::from(self.failure_alert_threshold)),
            actual_value: Some(f64::from(failures)),
            context: serde_json::json!({ "consecutive_failures": failures }),
            metrics_snapshot: None,
            alert_fingerprint: monitoring_failure_fingerprint(&config.provider),
            occurrence_count: 1,
            escalation_level: 0,
            notified_at: Some(now),
            resolved: false,
            auto_resolved: false,
            resolved_at: None,
            occurred_at: now,
        };

        match self.dispatcher.dispatch_event(event.clone(), &DispatchPolicy::from(config)).await {
            Ok(_) => {},
            Err(error) => {
                // Storage may be what is failing; notify without persisting.
                error!(provider = %config.provider, %error, "monitoring failure alert not persisted");
                let notification = Notification {
                    fingerprint: event.alert_fingerprint.clone(),
                    subject: NotificationSubject::Event(event),
                    level: Severity::Critical,
                    escalation_level: 0,
                    occurrence_count: 1,
                    escalated: false,
                };
                if let Err(error) = self.notifier.notify(&notification).await {
                    error!(provider = %config.provider, %error, "monitoring failure notification failed");
                }
            },
        }
    }
}
