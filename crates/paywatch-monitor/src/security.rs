//! Security validation for inbound deliveries.
//!
//! Three independent checks feed the ledger's security flags:
//!
//! - **Signature**: HMAC-SHA256 over `"{timestamp}.{payload}"` with the
//!   provider's shared secret. Accepted as `sha256=<hex>`, `v1=<hex>` or raw
//!   hex and compared in constant time.
//! - **Timestamp freshness**: rejects replays older than the replay window and
//!   timestamps too far in the future.
//! - **Rate limit**: per-provider sliding window over receipt times.
//!
//! None of these checks throw. Their verdicts are recorded on the delivery so
//! aggregation sees rejected traffic too.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use paywatch_core::ProviderName;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// Freshness and rate-limit policy applied by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Oldest accepted timestamp, in seconds before now.
    pub replay_window_seconds: i64,
    /// Newest accepted timestamp, in seconds after now.
    pub max_future_skew_seconds: i64,
    /// Deliveries accepted per provider within one rate window.
    pub rate_limit_max: usize,
    /// Length of the rate window in seconds.
    pub rate_limit_window_seconds: i64,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            replay_window_seconds: 300,
            max_future_skew_seconds: 30,
            rate_limit_max: 100,
            rate_limit_window_seconds: 60,
        }
    }
}

/// Shared webhook secrets keyed by provider.
///
/// Providers without an entry authenticate out of band and skip the
/// signature check.
#[derive(Clone, Default)]
pub struct ProviderSecrets {
    secrets: HashMap<ProviderName, String>,
}

impl ProviderSecrets {
    /// Creates an empty secret set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the secret for a provider.
    #[must_use]
    pub fn with_secret(mut self, provider: ProviderName, secret: impl Into<String>) -> Self {
        self.secrets.insert(provider, secret.into());
        self
    }

    /// Returns the secret for a provider, if one is configured.
    pub fn get(&self, provider: &ProviderName) -> Option<&str> {
        self.secrets.get(provider).map(String::as_str)
    }

    /// Number of providers with a configured secret.
    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    /// Whether no secrets are configured.
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

impl fmt::Debug for ProviderSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.secrets.keys()).finish()
    }
}

impl FromIterator<(ProviderName, String)> for ProviderSecrets {
    fn from_iter<I: IntoIterator<Item = (ProviderName, String)>>(iter: I) -> Self {
        Self { secrets: iter.into_iter().collect() }
    }
}

/// Signature validation errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Missing signature header.
    MissingSignature,
    /// Missing timestamp header.
    MissingTimestamp,
    /// Invalid signature format.
    InvalidFormat(String),
    /// Signature verification failed.
    VerificationFailed,
    /// Invalid secret key.
    InvalidSecret,
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingSignature => write!(f, "signature header missing"),
            Self::MissingTimestamp => write!(f, "timestamp header missing"),
            Self::InvalidFormat(format) => write!(f, "invalid signature format: {format}"),
            Self::VerificationFailed => write!(f, "signature verification failed"),
            Self::InvalidSecret => write!(f, "invalid secret key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Timestamp freshness errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampError {
    /// No timestamp was supplied.
    Missing,
    /// Older than the replay window.
    Expired {
        /// Age in seconds.
        age_seconds: i64,
    },
    /// Too far in the future.
    FromFuture {
        /// Skew in seconds.
        skew_seconds: i64,
    },
}

impl fmt::Display for TimestampError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "timestamp missing"),
            Self::Expired { age_seconds } => {
                write!(f, "timestamp expired: {age_seconds}s old")
            },
            Self::FromFuture { skew_seconds } => {
                write!(f, "timestamp {skew_seconds}s in the future")
            },
        }
    }
}

impl std::error::Error for TimestampError {}

/// Generates the HMAC-SHA256 signature of a delivery as lowercase hex.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret key is invalid.
pub fn generate_signature(
    secret: &str,
    timestamp: i64,
    payload: &[u8],
) -> Result<String, SignatureError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::InvalidSecret)?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies a delivery signature header against the provider secret.
///
/// # Errors
///
/// Returns the reason the signature was rejected.
pub fn verify_signature(
    secret: &str,
    timestamp: Option<i64>,
    payload: &[u8],
    signature: Option<&str>,
) -> Result<(), SignatureError> {
    let signature = signature.filter(|s| !s.is_empty()).ok_or(SignatureError::MissingSignature)?;
    let timestamp = timestamp.ok_or(SignatureError::MissingTimestamp)?;
    if secret.is_empty() {
        return Err(SignatureError::InvalidSecret);
    }

    let provided = parse_signature_format(signature)?;
    let expected = generate_signature(secret, timestamp, payload)?;

    if timing_safe_eq(&provided.to_ascii_lowercase(), &expected) {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}

/// Checks a unix timestamp against the replay window.
///
/// # Errors
///
/// Returns the freshness violation.
pub fn check_timestamp(
    timestamp: Option<i64>,
    now: DateTime<Utc>,
    policy: &SecurityPolicy,
) -> Result<(), TimestampError> {
    let timestamp = timestamp.ok_or(TimestampError::Missing)?;
    let age_seconds = now.timestamp() - timestamp;

    if age_seconds > policy.replay_window_seconds {
        return Err(TimestampError::Expired { age_seconds });
    }
    if -age_seconds > policy.max_future_skew_seconds {
        return Err(TimestampError::FromFuture { skew_seconds: -age_seconds });
    }
    Ok(())
}

/// Parses signature from various formats to raw hex.
///
/// Supported formats:
/// - "sha256=<hex>"
/// - "v1=<hex>"
/// - "<hex>" (raw, 64 characters)
fn parse_signature_format(signature: &str) -> Result<String, SignatureError> {
    if let Some(hex) = signature.strip_prefix("sha256=") {
        return Ok(hex.to_string());
    }

    if let Some(hex) = signature.strip_prefix("v1=") {
        return Ok(hex.to_string());
    }

    if signature.chars().all(|c| c.is_ascii_hexdigit()) && signature.len() == 64 {
        return Ok(signature.to_string());
    }

    Err(SignatureError::InvalidFormat(format!(
        "expected 'sha256=<hex>', 'v1=<hex>', or raw hex, got: {signature}",
    )))
}

/// Constant-time string comparison.
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.as_bytes().iter().zip(b.as_bytes()) {
        result |= a_byte ^ b_byte;
    }

    result == 0
}

/// Per-provider sliding-window rate limiter.
///
/// Only admitted deliveries consume budget, so a provider hammering the
/// endpoint while limited does not extend its own lockout.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: Arc<Mutex<HashMap<ProviderName, VecDeque<DateTime<Utc>>>>>,
}

impl RateLimiter {
    /// Creates a limiter from the security policy.
    pub fn new(policy: &SecurityPolicy) -> Self {
        Self {
            max_requests: policy.rate_limit_max,
            window: Duration::seconds(policy.rate_limit_window_seconds),
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Admits a delivery received at `now`, returning `false` when the
    /// provider is over budget.
    #[allow(clippy::significant_drop_tightening)] // Check and record must be atomic
    pub async fn try_acquire(&self, provider: &ProviderName, now: DateTime<Utc>) -> bool {
        let mut windows = self.windows.lock().await;
        let admitted = windows.entry(provider.clone()).or_default();

        let cutoff = now - self.window;
        while admitted.front().is_some_and(|at| *at <= cutoff) {
            admitted.pop_front();
        }

        if admitted.len() >= self.max_requests {
            return false;
        }

        admitted.push_back(now);
        true
    }

    /// Number of deliveries currently counted against a provider.
    pub async fn in_window(&self, provider: &ProviderName, now: DateTime<Utc>) -> usize {
        let windows = self.windows.lock().await;
        let cutoff = now - self.window;
        windows.get(provider).map_or(0, |admitted| admitted.iter().filter(|at| **at > cutoff).count())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn verify_signature_accepts_all_formats() {
        let ts = now().timestamp();
        let payload = br#"{"txid":"abc"}"#;
        let hex = generate_signature("secret", ts, payload).unwrap();

        for header in [format!("sha256={hex}"), format!("v1={hex}"), hex.clone()] {
            assert_eq!(verify_signature("secret", Some(ts), payload, Some(&header)), Ok(()));
        }
        let upper = format!("sha256={}", hex.to_ascii_uppercase());
        assert_eq!(verify_signature("secret", Some(ts), payload, Some(&upper)), Ok(()));
    }

    #[test]
    fn verify_signature_binds_timestamp_and_payload() {
        let ts = now().timestamp();
        let hex = generate_signature("secret", ts, b"payload").unwrap();
        let header = format!("sha256={hex}");

        assert_eq!(
            verify_signature("secret", Some(ts + 1), b"payload", Some(&header)),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_signature("secret", Some(ts), b"tampered", Some(&header)),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            verify_signature("other", Some(ts), b"payload", Some(&header)),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn verify_signature_reports_missing_inputs() {
        assert_eq!(
            verify_signature("secret", Some(1), b"p", None),
            Err(SignatureError::MissingSignature)
        );
        assert_eq!(
            verify_signature("secret", Some(1), b"p", Some("")),
            Err(SignatureError::MissingSignature)
        );
        assert_eq!(
            verify_signature("secret", None, b"p", Some("sha256=00")),
            Err(SignatureError::MissingTimestamp)
        );
        assert!(matches!(
            verify_signature("secret", Some(1), b"p", Some("invalid_format")),
            Err(SignatureError::InvalidFormat(_))
        ));
    }

    #[test]
    fn timestamp_window_boundaries() {
        let policy = SecurityPolicy::default();
        let ts = now().timestamp();

        assert!(check_timestamp(Some(ts), now(), &policy).is_ok());
        assert!(check_timestamp(Some(ts - 300), now(), &policy).is_ok());
        assert_eq!(
            check_timestamp(Some(ts - 301), now(), &policy),
            Err(TimestampError::Expired { age_seconds: 301 })
        );
        assert!(check_timestamp(Some(ts + 30), now(), &policy).is_ok());
        assert_eq!(
            check_timestamp(Some(ts + 31), now(), &policy),
            Err(TimestampError::FromFuture { skew_seconds: 31 })
        );
        assert_eq!(check_timestamp(None, now(), &policy), Err(TimestampError::Missing));
    }

    #[test]
    fn timing_safe_eq_compares_content_and_length() {
        assert!(timing_safe_eq("hello", "hello"));
        assert!(!timing_safe_eq("hello", "world"));
        assert!(!timing_safe_eq("hello", "hello_world"));
    }

    #[tokio::test]
    async fn rate_limiter_slides() {
        let policy = SecurityPolicy { rate_limit_max: 2, ..SecurityPolicy::default() };
        let limiter = RateLimiter::new(&policy);
        let provider = ProviderName::parse("blockbee").unwrap();
        let other = ProviderName::parse("dynopay").unwrap();

        assert!(limiter.try_acquire(&provider, now()).await);
        assert!(limiter.try_acquire(&provider, now() + Duration::seconds(10)).await);
        assert!(!limiter.try_acquire(&provider, now() + Duration::seconds(20)).await);
        assert!(limiter.try_acquire(&other, now() + Duration::seconds(20)).await);

        assert!(limiter.try_acquire(&provider, now() + Duration::seconds(60)).await);
        assert_eq!(limiter.in_window(&provider, now() + Duration::seconds(60)).await, 2);
    }

    #[test]
    fn secrets_debug_hides_values() {
        let secrets = ProviderSecrets::new()
            .with_secret(ProviderName::parse("blockbee").unwrap(), "super-secret");
        let rendered = format!("{secrets:?}");
        assert!(rendered.contains("blockbee"));
        assert!(!rendered.contains("super-secret"));
    }
}
