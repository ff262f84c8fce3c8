//! Health scoring.
//!
//! A pure function from a window snapshot and the provider's configuration to
//! a score in `[0, 100]`, a status band and the list of threshold checks. The
//! score starts at 100 and loses points for a processing success rate below
//! the threshold, slow processing and late delivery. Windows without traffic
//! are neutral: they score 100 and breach nothing.

use paywatch_core::models::{
    HealthEventType, HealthStatus, MonitoringConfig, ProviderHealthSnapshot, ScoringPolicy,
    Severity, ThresholdType,
};
use serde::Serialize;

/// Outcome of one threshold check against a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdCheck {
    /// Threshold checked.
    pub threshold_type: ThresholdType,
    /// Dedup bucket distinguishing checks of the same type.
    pub bucket: String,
    /// Configured limit.
    pub threshold_value: f64,
    /// Observed value, if the window had data for it.
    pub actual_value: Option<f64>,
    /// Whether the observed value violates the limit.
    pub breached: bool,
    /// Base severity of a breach.
    pub severity: Severity,
}

impl ThresholdCheck {
    /// Health event type raised for a breach of this check.
    pub fn event_type(&self) -> HealthEventType {
        if self.threshold_type == ThresholdType::HealthStatus
            && self.bucket == HealthStatus::Down.as_str()
        {
            HealthEventType::ProviderDown
        } else {
            HealthEventType::ThresholdBreach
        }
    }

    /// Short summary used as the event title.
    pub fn title(&self, provider: &str) -> String {
        match self.threshold_type {
            ThresholdType::SuccessRate => format!("{provider} success rate below threshold"),
            ThresholdType::ProcessingTime => format!("{provider} processing time above limit"),
            ThresholdType::DeliveryDelay => format!("{provider} delivery delay above limit"),
            ThresholdType::HealthStatus => format!("{provider} health is {}", self.bucket),
        }
    }
}

/// Score, status and threshold checks for one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthAssessment {
    /// Score in `[0, 100]`.
    pub score: f64,
    /// Band the score falls into.
    pub status: HealthStatus,
    /// Every threshold check, breached or not.
    pub checks: Vec<ThresholdCheck>,
}

impl HealthAssessment {
    /// Checks that breached.
    pub fn breaches(&self) -> impl Iterator<Item = &ThresholdCheck> {
        self.checks.iter().filter(|check| check.breached)
    }
}

/// Maps a score onto the configured status bands.
pub fn classify(score: f64, policy: &ScoringPolicy) -> HealthStatus {
    if score >= policy.healthy_min {
        HealthStatus::Healthy
    } else if score >= policy.degraded_min {
        HealthStatus::Degraded
    } else if score >= policy.critical_min {
        HealthStatus::Critical
    } else {
        HealthStatus::Down
    }
}

/// Computes the score of a snapshot under a configuration.
///
/// Missing rates or latencies contribute no penalty.
pub fn compute_score(snapshot: &ProviderHealthSnapshot, config: &MonitoringConfig) -> f64 {
    if !snapshot.has_traffic() {
        return 100.0;
    }
    let policy = &config.scoring.0;
    let mut penalty = 0.0;

    if let Some(rate) = snapshot.processing_success_rate {
        let shortfall_points = (config.min_success_rate_threshold - rate) * 100.0;
        if shortfall_points > 0.0 {
            penalty += shortfall_points * policy.success_penalty_per_point;
        }
    }

    if let Some(mean_ms) = snapshot.processing_time.mean_ms {
        let over_seconds = (mean_ms - max_processing_ms(config)) / 1000.0;
        if over_seconds > 0.0 {
            penalty +=
                (over_seconds * policy.processing_penalty_per_second).min(policy.processing_penalty_cap);
        }
    }

    if let Some(mean_ms) = snapshot.delivery_delay.mean_ms {
        let over_minutes = (mean_ms / 1000.0 - max_delay_seconds(config)) / 60.0;
        if over_minutes > 0.0 {
            penalty += (over_minutes * policy.delay_penalty_per_minute).min(policy.delay_penalty_cap);
        }
    }

    (100.0 - penalty).clamp(0.0, 100.0)
}

/// Scores a snapshot and evaluates every threshold.
pub fn assess(snapshot: &ProviderHealthSnapshot, config: &MonitoringConfig) -> HealthAssessment {
    let policy = &config.scoring.0;
    let score = compute_score(snapshot, config);
    let status = classify(score, policy);
    let evaluate = snapshot.has_traffic();

    let success_rate = snapshot.processing_success_rate;
    let processing_ms = snapshot.processing_time.mean_ms;
    let delay_seconds = snapshot.delivery_delay.mean_ms.map(|ms| ms / 1000.0);

    let checks = vec![
        ThresholdCheck {
            threshold_type: ThresholdType::SuccessRate,
            bucket: format_bucket(config.min_success_rate_threshold),
            threshold_value: config.min_success_rate_threshold,
            actual_value: success_rate,
            breached: evaluate
                && success_rate.is_some_and(|rate| rate < config.min_success_rate_threshold),
            severity: Severity::Warning,
        },
        ThresholdCheck {
            threshold_type: ThresholdType::ProcessingTime,
            bucket: format_bucket(max_processing_ms(config)),
            threshold_value: max_processing_ms(config),
            actual_value: processing_ms,
            breached: evaluate && processing_ms.is_some_and(|ms| ms > max_processing_ms(config)),
            severity: Severity::Warning,
        },
        ThresholdCheck {
            threshold_type: ThresholdType::DeliveryDelay,
            bucket: format_bucket(max_delay_seconds(config)),
            threshold_value: max_delay_seconds(config),
            actual_value: delay_seconds,
            breached: evaluate && delay_seconds.is_some_and(|s| s > max_delay_seconds(config)),
            severity: Severity::Warning,
        },
        ThresholdCheck {
            threshold_type: ThresholdType::HealthStatus,
            bucket: HealthStatus::Critical.as_str().to_string(),
            threshold_value: policy.degraded_min,
            actual_value: Some(score),
            breached: evaluate && status == HealthStatus::Critical,
            severity: Severity::Error,
        },
        ThresholdCheck {
            threshold_type: ThresholdType::HealthStatus,
            bucket: HealthStatus::Down.as_str().to_string(),
            threshold_value: policy.critical_min,
            actual_value: Some(score),
            breached: evaluate && status == HealthStatus::Down,
            severity: Severity::Critical,
        },
    ];

    HealthAssessment { score, status, checks }
}

#[allow(clippy::cast_precision_loss)]
fn max_processing_ms(config: &MonitoringConfig) -> f64 {
    config.max_avg_processing_time_ms as f64
}

#[allow(clippy::cast_precision_loss)]
fn max_delay_seconds(config: &MonitoringConfig) -> f64 {
    config.max_delivery_delay_seconds as f64
}

fn format_bucket(value: f64) -> String {
    format!("{value}")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{TimeZone, Utc};
    use paywatch_core::models::{LatencyStats, ProviderName};

    use super::*;

    fn config() -> MonitoringConfig {
        MonitoringConfig::default_for(ProviderName::parse("blockbee").unwrap(), Utc::now())
    }

    fn snapshot(success_rate: f64, processing_ms: f64, delay_ms: f64) -> ProviderHealthSnapshot {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        ProviderHealthSnapshot {
            provider: ProviderName::parse("blockbee").unwrap(),
            window_start: start,
            window_end: start + chrono::Duration::minutes(15),
            window_duration_minutes: 15,
            expected_count: 100,
            received_count: 100,
            successful_count: 100,
            failed_count: 0,
            duplicate_count: 0,
            late_count: 0,
            delivery_delay: LatencyStats { mean_ms: Some(delay_ms), ..LatencyStats::default() },
            processing_time: LatencyStats {
                mean_ms: Some(processing_ms),
                ..LatencyStats::default()
            },
            delivery_success_rate: Some(1.0),
            processing_success_rate: Some(success_rate),
            security_pass_rate: Some(1.0),
            error_counts: BTreeMap::new(),
            health_score: 0.0,
            health_status: HealthStatus::Down,
            computed_at: start,
            thresholds_checked_at: None,
        }
    }

    #[test]
    fn perfect_window_scores_100() {
        let assessment = assess(&snapshot(1.0, 100.0, 0.0), &config());
        assert!((assessment.score - 100.0).abs() < f64::EPSILON);
        assert_eq!(assessment.status, HealthStatus::Healthy);
        assert_eq!(assessment.breaches().count(), 0);
    }

    #[test]
    fn success_shortfall_costs_two_points_per_point() {
        // 0.90 against 0.95 is 5 points short
        let score = compute_score(&snapshot(0.90, 100.0, 0.0), &config());
        assert!((score - 90.0).abs() < 1e-9);
    }

    #[test]
    fn processing_penalty_is_capped() {
        let score = compute_score(&snapshot(1.0, 600_000.0, 0.0), &config());
        assert!((score - 70.0).abs() < 1e-9);
    }

    #[test]
    fn delay_penalty_applies_per_minute() {
        // 300s limit, 420s average: 2 minutes over
        let score = compute_score(&snapshot(1.0, 100.0, 420_000.0), &config());
        assert!((score - 90.0).abs() < 1e-9);
    }

    #[test]
    fn ninety_seven_percent_is_healthy_at_default_threshold() {
        let assessment = assess(&snapshot(0.97, 100.0, 0.0), &config());
        assert_eq!(assessment.status, HealthStatus::Healthy);
        assert_eq!(assessment.breaches().count(), 0);
    }

    #[test]
    fn bands_map_scores() {
        let policy = ScoringPolicy::default();
        assert_eq!(classify(90.0, &policy), HealthStatus::Healthy);
        assert_eq!(classify(89.9, &policy), HealthStatus::Degraded);
        assert_eq!(classify(70.0, &policy), HealthStatus::Degraded);
        assert_eq!(classify(40.0, &policy), HealthStatus::Critical);
        assert_eq!(classify(39.9, &policy), HealthStatus::Down);
    }

    #[test]
    fn empty_window_is_neutral() {
        let mut empty = snapshot(0.0, 0.0, 0.0);
        empty.received_count = 0;
        empty.processing_success_rate = None;

        let assessment = assess(&empty, &config());
        assert_eq!(assessment.status, HealthStatus::Healthy);
        assert_eq!(assessment.breaches().count(), 0);
    }

    #[test]
    fn collapse_breaches_success_and_status() {
        let assessment = assess(&snapshot(0.50, 100.0, 0.0), &config());

        assert_eq!(assessment.status, HealthStatus::Down);
        let breached: Vec<_> = assessment.breaches().map(|c| c.threshold_type).collect();
        assert_eq!(breached, vec![ThresholdType::SuccessRate, ThresholdType::HealthStatus]);

        let down = assessment.breaches().last().unwrap();
        assert_eq!(down.event_type(), HealthEventType::ProviderDown);
        assert_eq!(down.severity, Severity::Critical);
    }
}
