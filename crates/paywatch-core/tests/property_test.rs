//! Property-based tests for core invariants.
//!
//! Provider names must normalize idempotently so ledger rows written under
//! different spellings land on the same key, severity escalation must be
//! monotonic and saturating, and configuration validation must accept every
//! well-formed escalation ladder.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use chrono::Utc;
use paywatch_core::models::{MonitoringConfig, ProviderName, Severity};
use proptest::prelude::*;

fn severity() -> impl Strategy<Value = Severity> {
    prop_oneof![
        Just(Severity::Info),
        Just(Severity::Warning),
        Just(Severity::Error),
        Just(Severity::Critical),
    ]
}

proptest! {
    #[test]
    fn provider_names_normalize_idempotently(name in "[A-Za-z0-9_-]{1,32}") {
        let parsed = ProviderName::parse(&name).unwrap();
        let reparsed = ProviderName::parse(parsed.as_str()).unwrap();

        prop_assert_eq!(&parsed, &reparsed);
        prop_assert_eq!(parsed.as_str(), name.to_ascii_lowercase());
        prop_assert_eq!(ProviderName::parse(&format!("  {name}\t")).unwrap(), parsed);
    }

    #[test]
    fn provider_names_reject_separators(
        left in "[a-z]{1,8}",
        sep in "[ :/.]",
        right in "[a-z]{1,8}",
    ) {
        let joined = format!("{left}{sep}{right}");
        prop_assert!(ProviderName::parse(&joined).is_err());
    }

    #[test]
    fn severity_raise_is_monotonic_and_saturating(level in severity(), steps in 0u32..10) {
        let raised = level.raised(steps);
        let further = level.raised(steps + 1);

        prop_assert!(raised >= level);
        prop_assert!(further >= raised);
        prop_assert!(raised <= Severity::Critical);
        if steps >= 3 {
            prop_assert_eq!(raised, Severity::Critical);
        }
    }

    #[test]
    fn ascending_escalation_ladders_validate(
        mut ladder in prop::collection::btree_set(1i32..500, 0..6),
    ) {
        let mut config =
            MonitoringConfig::default_for(ProviderName::parse("blockbee").unwrap(), Utc::now());
        config.escalation_thresholds = std::mem::take(&mut ladder).into_iter().collect();

        prop_assert!(config.validate().is_ok());

        if config.escalation_thresholds.len() >= 2 {
            config.escalation_thresholds.reverse();
            prop_assert!(config.validate().is_err());
        }
    }

    #[test]
    fn success_thresholds_outside_unit_interval_are_rejected(threshold in 1.0001f64..100.0) {
        let mut config =
            MonitoringConfig::default_for(ProviderName::parse("dynopay").unwrap(), Utc::now());
        config.min_success_rate_threshold = threshold;
        prop_assert!(config.validate().is_err());

        config.min_success_rate_threshold = -threshold;
        prop_assert!(config.validate().is_err());
    }
}
