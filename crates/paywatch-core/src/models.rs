//! Core domain models and strongly-typed identifiers.
//!
//! Defines delivery records, health snapshots, missing-confirmation alerts,
//! health events and per-provider monitoring configuration, plus the newtype
//! ID wrappers and text-backed enums that map onto the Postgres schema.

use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Settlement providers seeded with a default monitoring configuration.
pub const DEFAULT_PROVIDERS: [&str; 2] = ["dynopay", "blockbee"];

/// Webhook kind used for reconciliation records written by recovery.
pub const RECONCILIATION_KIND: &str = "reconciliation";

/// Normalized settlement provider name.
///
/// Provider names are case-insensitive on the wire and always stored
/// lowercase, so `BlockBee` and `blockbee` address the same ledger rows.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderName(String);

impl ProviderName {
    /// Parses and normalizes a provider name.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` for empty names or names containing
    /// characters other than ASCII alphanumerics, `-` and `_`.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        let normalized = name.trim().to_ascii_lowercase();
        if normalized.is_empty() {
            return Err(CoreError::InvalidInput("provider name cannot be empty".to_string()));
        }
        if !normalized.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(CoreError::InvalidInput(format!("invalid provider name: {name}")));
        }
        Ok(Self(normalized))
    }

    /// Returns the normalized name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ProviderName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ProviderName> for String {
    fn from(value: ProviderName) -> Self {
        value.0
    }
}

impl sqlx::Type<PgDb> for ProviderName {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for ProviderName {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Self::parse(s).map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for ProviderName {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Reference to a payment intent owned by the external ledger.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentId(pub String);

impl fmt::Display for IntentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IntentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for IntentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl sqlx::Type<PgDb> for IntentId {
    fn type_info() -> PgTypeInfo {
        <String as sqlx::Type<PgDb>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        <String as sqlx::Type<PgDb>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for IntentId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<String as sqlx::Decode<PgDb>>::decode(value)?))
    }
}

impl sqlx::Encode<'_, PgDb> for IntentId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <String as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery record identifier.
///
/// Returned to the webhook receiver by the gate and used as the key for the
/// post-processing update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed missing-confirmation alert identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertId(pub Uuid);

impl AlertId {
    /// Creates a new random alert ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for AlertId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for AlertId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for AlertId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for AlertId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed health event identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HealthEventId(pub Uuid);

impl HealthEventId {
    /// Creates a new random health event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for HealthEventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HealthEventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for HealthEventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for HealthEventId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for HealthEventId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for HealthEventId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Implements text conversions and the Postgres TEXT mapping for a
/// fieldless enum.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            /// Returns the stored text form.
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("invalid {}: {other}", stringify!($ty))),
                }
            }
        }

        impl sqlx::Type<PgDb> for $ty {
            fn type_info() -> PgTypeInfo {
                <&str as sqlx::Type<PgDb>>::type_info()
            }

            fn compatible(ty: &PgTypeInfo) -> bool {
                <&str as sqlx::Type<PgDb>>::compatible(ty)
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $ty {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                s.parse::<Self>().map_err(Into::into)
            }
        }

        impl sqlx::Encode<'_, PgDb> for $ty {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

/// Outcome of receiving a webhook, independent of business handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Accepted and passed security validation.
    Received,
    /// Rejected before processing, e.g. by the provider rate limiter.
    Failed,
    /// Receipt timed out.
    Timeout,
    /// Failed signature or timestamp validation.
    Invalid,
    /// Same fingerprint as an already accepted delivery.
    Duplicate,
}

text_enum!(DeliveryStatus {
    Received => "received",
    Failed => "failed",
    Timeout => "timeout",
    Invalid => "invalid",
    Duplicate => "duplicate",
});

/// Outcome of the business handling that runs after receipt.
///
/// Records start in `Pending` until the webhook receiver reports back through
/// the post-processing update; duplicates and rejected deliveries go straight
/// to `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    /// Business handling has not reported yet.
    Pending,
    /// Business handling completed.
    Success,
    /// Business handling failed.
    Failed,
    /// Business handling completed only some of its effects.
    Partial,
    /// No business handling was attempted.
    Skipped,
}

text_enum!(ProcessingStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
    Partial => "partial",
    Skipped => "skipped",
});

/// Error categories recorded on delivery records and counted per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Signature or timestamp validation failed.
    SecurityValidationFailed,
    /// Payload could not be parsed by the receiver.
    ParsingError,
    /// Business rules rejected the webhook.
    BusinessLogicError,
    /// Processing exceeded its time budget.
    TimeoutError,
    /// Provider exceeded the ingest rate limit.
    RateLimited,
    /// The ledger write itself failed.
    StorageError,
}

text_enum!(ErrorKind {
    SecurityValidationFailed => "security_validation_failed",
    ParsingError => "parsing_error",
    BusinessLogicError => "business_logic_error",
    TimeoutError => "timeout_error",
    RateLimited => "rate_limited",
    StorageError => "storage_error",
});

/// Provider health classification derived from the health score.
///
/// Variants are ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Score at or above the healthy band.
    Healthy,
    /// Score at or above the degraded band.
    Degraded,
    /// Score at or above the critical band.
    Critical,
    /// Score below every band.
    Down,
}

text_enum!(HealthStatus {
    Healthy => "healthy",
    Degraded => "degraded",
    Critical => "critical",
    Down => "down",
});

/// How a missing confirmation was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    /// No confirming delivery within the configured timeout.
    Timeout,
    /// Webhooks arrived but none confirmed the payment.
    Anomaly,
    /// Raised by an operator.
    Manual,
}

text_enum!(DetectionType {
    Timeout => "timeout",
    Anomaly => "anomaly",
    Manual => "manual",
});

/// Recovery progress of a missing-confirmation alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    /// No attempt made yet.
    Pending,
    /// Provider confirmed the payment.
    Recovered,
    /// Last attempt failed, more attempts remain.
    Failed,
    /// Attempts exhausted; requires human follow-up.
    Manual,
}

text_enum!(RecoveryStatus {
    Pending => "pending",
    Recovered => "recovered",
    Failed => "failed",
    Manual => "manual",
});

/// Method used for the most recent recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMethod {
    /// Pull-based status query against the provider.
    ProviderQuery,
    /// Operator checked and closed the alert.
    ManualCheck,
}

text_enum!(RecoveryMethod {
    ProviderQuery => "provider_query",
    ManualCheck => "manual_check",
});

/// Notification severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Info,
    /// Needs attention.
    Warning,
    /// Needs action.
    Error,
    /// Needs action now.
    Critical,
}

text_enum!(Severity {
    Info => "info",
    Warning => "warning",
    Error => "error",
    Critical => "critical",
});

impl Severity {
    /// Raises the severity by `steps` levels, saturating at `Critical`.
    pub fn raised(self, steps: u32) -> Self {
        let levels = [Self::Info, Self::Warning, Self::Error, Self::Critical];
        let current = levels.iter().position(|level| *level == self).unwrap_or(0);
        let target = current.saturating_add(usize::try_from(steps).unwrap_or(usize::MAX));
        levels[target.min(levels.len() - 1)]
    }
}

/// Kind of notable occurrence captured as a health event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEventType {
    /// A scored window breached a configured threshold.
    ThresholdBreach,
    /// A scored window classified the provider as down.
    ProviderDown,
    /// A missing confirmation was recovered.
    Recovery,
    /// Recovery attempts were exhausted.
    RecoveryExhausted,
    /// A payment confirmation is overdue.
    MissingConfirmation,
    /// Webhooks arrived without the expected confirmation.
    Anomaly,
    /// Monitoring cycles are failing repeatedly.
    MonitoringFailure,
}

text_enum!(HealthEventType {
    ThresholdBreach => "threshold_breach",
    ProviderDown => "provider_down",
    Recovery => "recovery",
    RecoveryExhausted => "recovery_exhausted",
    MissingConfirmation => "missing_confirmation",
    Anomaly => "anomaly",
    MonitoringFailure => "monitoring_failure",
});

/// Threshold checked against a scored window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    /// Processing success rate below the minimum.
    SuccessRate,
    /// Average processing time above the maximum.
    ProcessingTime,
    /// Average delivery delay above the maximum.
    DeliveryDelay,
    /// Health status critical or down.
    HealthStatus,
}

text_enum!(ThresholdType {
    SuccessRate => "success_rate",
    ProcessingTime => "processing_time",
    DeliveryDelay => "delivery_delay",
    HealthStatus => "health_status",
});

/// One webhook delivery attempt as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryRecord {
    /// Unique identifier for this record.
    pub id: DeliveryId,

    /// Provider that sent the webhook.
    pub provider: ProviderName,

    /// Payment intent the webhook refers to, when known.
    pub payment_intent_id: Option<IntentId>,

    /// Provider-defined webhook kind, e.g. `payment.confirmed`.
    pub webhook_kind: String,

    /// Provider request id, when supplied.
    pub request_id: Option<String>,

    /// When the provider was expected to deliver, if scheduled.
    pub expected_at: Option<DateTime<Utc>>,

    /// When the delivery reached the gate.
    pub received_at: DateTime<Utc>,

    /// When business handling started.
    pub processing_started_at: Option<DateTime<Utc>>,

    /// When business handling finished.
    pub processing_completed_at: Option<DateTime<Utc>>,

    /// Receipt outcome.
    pub delivery_status: DeliveryStatus,

    /// Business handling outcome.
    pub processing_status: ProcessingStatus,

    /// Error category, if any stage failed.
    pub error_kind: Option<ErrorKind>,

    /// Human-readable error detail.
    pub error_message: Option<String>,

    /// Provider-reported retry count.
    pub retry_count: i32,

    /// Signature check outcome.
    pub signature_valid: bool,

    /// Timestamp freshness outcome.
    pub timestamp_valid: bool,

    /// Whether the provider rate limiter rejected this delivery.
    pub rate_limited: bool,

    /// Raw payload size.
    pub payload_size_bytes: i64,

    /// Content fingerprint over provider, kind and payload.
    pub fingerprint: String,

    /// Business handling confirmed the payment.
    pub payment_confirmed: bool,

    /// Business handling credited the balance.
    pub balance_credited: bool,

    /// Business handling notified the user.
    pub user_notified: bool,

    /// First-seen record this duplicate collapses onto.
    pub duplicate_of: Option<DeliveryId>,

    /// Alert whose recovery produced this reconciliation record.
    pub recovery_alert_id: Option<AlertId>,

    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

impl DeliveryRecord {
    /// Whether the delivery passed every security check.
    pub fn passed_security(&self) -> bool {
        self.signature_valid && self.timestamp_valid && !self.rate_limited
    }

    /// Whether receipt itself failed.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self.delivery_status,
            DeliveryStatus::Failed | DeliveryStatus::Timeout | DeliveryStatus::Invalid
        )
    }

    /// Receipt delay relative to the expected time, clamped at zero.
    pub fn delivery_delay(&self) -> Option<Duration> {
        self.expected_at.map(|expected| (self.received_at - expected).max(Duration::zero()))
    }

    /// Duration of business handling, when both ends are known.
    pub fn processing_duration(&self) -> Option<Duration> {
        match (self.processing_started_at, self.processing_completed_at) {
            (Some(started), Some(completed)) => Some((completed - started).max(Duration::zero())),
            _ => None,
        }
    }

    /// Whether this record confirms the given payment intent.
    pub fn confirms(&self, intent: &IntentId) -> bool {
        self.delivery_status != DeliveryStatus::Duplicate
            && self.payment_confirmed
            && self.payment_intent_id.as_ref() == Some(intent)
    }

    /// Turns an accepted record into the duplicate of `original`.
    ///
    /// Duplicates never carry business effects and skip processing.
    pub fn into_duplicate_of(mut self, original: DeliveryId) -> Self {
        self.delivery_status = DeliveryStatus::Duplicate;
        self.processing_status = ProcessingStatus::Skipped;
        self.duplicate_of = Some(original);
        self.payment_confirmed = false;
        self.balance_credited = false;
        self.user_notified = false;
        self
    }
}

/// Result of writing a delivery to the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// The row as stored.
    pub record: DeliveryRecord,
    /// Whether the write collapsed onto an earlier accepted delivery.
    pub duplicate: bool,
}

/// Business outcome reported by the webhook receiver after handling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingUpdate {
    /// Final processing status.
    pub processing_status: Option<ProcessingStatus>,
    /// When handling started.
    pub processing_started_at: Option<DateTime<Utc>>,
    /// When handling finished.
    pub processing_completed_at: Option<DateTime<Utc>>,
    /// Error category if handling failed.
    pub error_kind: Option<ErrorKind>,
    /// Error detail if handling failed.
    pub error_message: Option<String>,
    /// Payment was confirmed by this webhook.
    #[serde(default)]
    pub payment_confirmed: bool,
    /// Balance was credited by this webhook.
    #[serde(default)]
    pub balance_credited: bool,
    /// User was notified because of this webhook.
    #[serde(default)]
    pub user_notified: bool,
}

impl ProcessingUpdate {
    /// Whether the update applies any business effect.
    pub fn has_business_impact(&self) -> bool {
        self.payment_confirmed || self.balance_credited || self.user_notified
    }

    /// Applies the update onto a record.
    pub fn apply_to(&self, record: &mut DeliveryRecord) {
        if let Some(status) = self.processing_status {
            record.processing_status = status;
        }
        if self.processing_started_at.is_some() {
            record.processing_started_at = self.processing_started_at;
        }
        if self.processing_completed_at.is_some() {
            record.processing_completed_at = self.processing_completed_at;
        }
        if self.error_kind.is_some() {
            record.error_kind = self.error_kind;
        }
        if self.error_message.is_some() {
            record.error_message.clone_from(&self.error_message);
        }
        record.payment_confirmed |= self.payment_confirmed;
        record.balance_credited |= self.balance_credited;
        record.user_notified |= self.user_notified;
    }
}

/// Mean, min, max and p95 of a latency series in milliseconds.
///
/// All fields are `None` when the series is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    /// Arithmetic mean.
    pub mean_ms: Option<f64>,
    /// Smallest sample.
    pub min_ms: Option<f64>,
    /// Largest sample.
    pub max_ms: Option<f64>,
    /// Nearest-rank 95th percentile.
    pub p95_ms: Option<f64>,
}

/// Aggregated health metrics for one provider and one closed window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealthSnapshot {
    /// Provider the window belongs to.
    pub provider: ProviderName,
    /// Inclusive window start.
    pub window_start: DateTime<Utc>,
    /// Exclusive window end.
    pub window_end: DateTime<Utc>,
    /// Window size.
    pub window_duration_minutes: i32,
    /// Deliveries scheduled for this window.
    pub expected_count: i64,
    /// Deliveries received in this window.
    pub received_count: i64,
    /// Deliveries whose processing succeeded.
    pub successful_count: i64,
    /// Deliveries that failed receipt or processing.
    pub failed_count: i64,
    /// Duplicate deliveries.
    pub duplicate_count: i64,
    /// Deliveries received here that were expected in an earlier window.
    pub late_count: i64,
    /// Receipt delay statistics.
    pub delivery_delay: LatencyStats,
    /// Processing time statistics.
    pub processing_time: LatencyStats,
    /// Share of deliveries received without a receipt failure.
    pub delivery_success_rate: Option<f64>,
    /// Share of settled deliveries processed successfully. Settled means
    /// succeeded or failed; duplicates, pending and skipped rows are left out.
    pub processing_success_rate: Option<f64>,
    /// Share of deliveries passing every security check.
    pub security_pass_rate: Option<f64>,
    /// Deliveries per error category.
    pub error_counts: BTreeMap<String, i64>,
    /// Score in `[0, 100]`.
    pub health_score: f64,
    /// Classification of the score.
    pub health_status: HealthStatus,
    /// When the snapshot was computed.
    pub computed_at: DateTime<Utc>,
    /// When the window's thresholds were last checked to completion. `None`
    /// until a monitoring cycle has dispatched every check for it.
    #[serde(default)]
    pub thresholds_checked_at: Option<DateTime<Utc>>,
}

impl ProviderHealthSnapshot {
    /// Whether any delivery was received in the window.
    pub fn has_traffic(&self) -> bool {
        self.received_count > 0
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for ProviderHealthSnapshot {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let error_counts: sqlx::types::Json<BTreeMap<String, i64>> =
            row.try_get("error_counts")?;

        Ok(Self {
            provider: row.try_get("provider")?,
            window_start: row.try_get("window_start")?,
            window_end: row.try_get("window_end")?,
            window_duration_minutes: row.try_get("window_duration_minutes")?,
            expected_count: row.try_get("expected_count")?,
            received_count: row.try_get("received_count")?,
            successful_count: row.try_get("successful_count")?,
            failed_count: row.try_get("failed_count")?,
            duplicate_count: row.try_get("duplicate_count")?,
            late_count: row.try_get("late_count")?,
            delivery_delay: LatencyStats {
                mean_ms: row.try_get("delay_mean_ms")?,
                min_ms: row.try_get("delay_min_ms")?,
                max_ms: row.try_get("delay_max_ms")?,
                p95_ms: row.try_get("delay_p95_ms")?,
            },
            processing_time: LatencyStats {
                mean_ms: row.try_get("processing_mean_ms")?,
                min_ms: row.try_get("processing_min_ms")?,
                max_ms: row.try_get("processing_max_ms")?,
                p95_ms: row.try_get("processing_p95_ms")?,
            },
            delivery_success_rate: row.try_get("delivery_success_rate")?,
            processing_success_rate: row.try_get("processing_success_rate")?,
            security_pass_rate: row.try_get("security_pass_rate")?,
            error_counts: error_counts.0,
            health_score: row.try_get("health_score")?,
            health_status: row.try_get("health_status")?,
            computed_at: row.try_get("computed_at")?,
            thresholds_checked_at: row.try_get("thresholds_checked_at")?,
        })
    }
}

/// Payment state captured when a missing confirmation was detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSnapshot {
    /// Ledger status of the intent.
    pub status: String,
    /// Expected amount.
    pub amount: Decimal,
    /// Currency code.
    pub currency: String,
    /// Deposit address, for crypto settlements.
    pub address: Option<String>,
}

/// A payment intent suspected of a missing confirmation.
///
/// At most one alert exists per provider and intent. The detector creates and
/// refreshes it, the recovery orchestrator drives `recovery_*`, and operators
/// or passing checks close it through `resolved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MissingConfirmationAlert {
    /// Unique identifier.
    pub id: AlertId,
    /// Provider expected to confirm.
    pub provider: ProviderName,
    /// Intent awaiting confirmation.
    pub payment_intent_id: IntentId,
    /// How the absence was detected.
    pub detection_type: DetectionType,
    /// First detection time.
    pub detected_at: DateTime<Utc>,
    /// Deadline the confirmation missed.
    pub expected_confirmation_by: DateTime<Utc>,
    /// Whole minutes past the deadline at the latest detector pass.
    pub time_overdue_minutes: i64,
    /// Payment state at detection time.
    pub payment_snapshot: sqlx::types::Json<PaymentSnapshot>,
    /// Most recent delivery seen for the intent.
    pub last_webhook_received_at: Option<DateTime<Utc>>,
    /// Recovery progress.
    pub recovery_status: RecoveryStatus,
    /// Attempts made so far.
    pub recovery_attempts: i32,
    /// Method of the latest recovery action.
    pub recovery_method: Option<RecoveryMethod>,
    /// When the latest attempt ran.
    pub last_recovery_attempt_at: Option<DateTime<Utc>>,
    /// Error from the latest failed attempt.
    pub last_recovery_error: Option<String>,
    /// Whether a notification went out.
    pub alert_sent: bool,
    /// Base notification level.
    pub alert_level: Severity,
    /// Escalation level reached by the dispatcher.
    pub escalation_level: i32,
    /// Operator acknowledged the alert.
    pub acknowledged: bool,
    /// Alert is closed.
    pub resolved: bool,
    /// When the alert was closed.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Free-form resolution notes.
    pub resolution_notes: Option<String>,
    /// Closed by a passing check rather than an operator.
    pub auto_resolved: bool,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl MissingConfirmationAlert {
    /// Whether the recovery orchestrator should consider this alert.
    pub fn is_recovery_candidate(&self) -> bool {
        matches!(self.recovery_status, RecoveryStatus::Pending | RecoveryStatus::Failed)
            && !self.acknowledged
            && !self.resolved
    }

    /// Detector and dispatcher fields of this alert, ready to write back.
    pub fn refresh(&self) -> AlertRefresh {
        AlertRefresh {
            detection_type: self.detection_type,
            time_overdue_minutes: self.time_overdue_minutes,
            last_webhook_received_at: self.last_webhook_received_at,
            alert_level: self.alert_level,
            alert_sent: self.alert_sent,
            escalation_level: self.escalation_level,
            updated_at: self.updated_at,
        }
    }
}

/// Fields of an open alert owned by the detector and the dispatcher.
///
/// Writing a refresh never touches acknowledgment, resolution or recovery
/// columns, and is skipped once the alert is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRefresh {
    /// How the absence was detected.
    pub detection_type: DetectionType,
    /// Whole minutes past the deadline.
    pub time_overdue_minutes: i64,
    /// Most recent delivery seen for the intent.
    pub last_webhook_received_at: Option<DateTime<Utc>>,
    /// Base notification level.
    pub alert_level: Severity,
    /// A notification went out. Never cleared by a refresh.
    pub alert_sent: bool,
    /// Escalation level reached by the dispatcher.
    pub escalation_level: i32,
    /// Mutation time.
    pub updated_at: DateTime<Utc>,
}

impl AlertRefresh {
    /// Applies the refresh onto an open alert.
    pub fn apply_to(&self, alert: &mut MissingConfirmationAlert) {
        alert.detection_type = self.detection_type;
        alert.time_overdue_minutes = self.time_overdue_minutes;
        alert.last_webhook_received_at = self.last_webhook_received_at;
        alert.alert_level = self.alert_level;
        alert.alert_sent |= self.alert_sent;
        alert.escalation_level = self.escalation_level;
        alert.updated_at = self.updated_at;
    }
}

/// A point-in-time notable occurrence for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct HealthEvent {
    /// Unique identifier.
    pub id: HealthEventId,
    /// Provider concerned.
    pub provider: ProviderName,
    /// Kind of occurrence.
    pub event_type: HealthEventType,
    /// Base severity.
    pub severity: Severity,
    /// Short summary.
    pub title: String,
    /// Longer description.
    pub description: String,
    /// Threshold that was checked, for breaches.
    pub threshold_type: Option<ThresholdType>,
    /// Configured threshold value.
    pub threshold_value: Option<f64>,
    /// Observed value.
    pub actual_value: Option<f64>,
    /// Structured context.
    pub context: serde_json::Value,
    /// Snapshot the event was derived from.
    pub metrics_snapshot: Option<serde_json::Value>,
    /// Dispatcher dedup key.
    pub alert_fingerprint: String,
    /// Consecutive occurrences folded into this event.
    pub occurrence_count: i32,
    /// Escalation level reached.
    pub escalation_level: i32,
    /// Most recent notification time.
    pub notified_at: Option<DateTime<Utc>>,
    /// Event is closed.
    pub resolved: bool,
    /// Closed by a passing check rather than an operator.
    pub auto_resolved: bool,
    /// When the event was closed.
    pub resolved_at: Option<DateTime<Utc>>,
    /// When the occurrence was first observed.
    pub occurred_at: DateTime<Utc>,
}

/// Dispatcher bookkeeping for one alert fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AlertState {
    /// Dedup key.
    pub fingerprint: String,
    /// Provider the fingerprint belongs to.
    pub provider: ProviderName,
    /// Threshold or alert type the fingerprint tracks.
    pub category: String,
    /// Consecutive unresolved occurrences.
    pub occurrence_count: i32,
    /// Number of escalation thresholds crossed.
    pub escalation_level: i32,
    /// When a notification last went out.
    pub last_notified_at: Option<DateTime<Utc>>,
    /// First occurrence of the current streak.
    pub first_seen_at: DateTime<Utc>,
    /// Latest occurrence.
    pub last_seen_at: DateTime<Utc>,
    /// Open health event carrying this fingerprint.
    pub open_event_id: Option<HealthEventId>,
    /// Streak ended by a passing check or acknowledgment.
    pub resolved: bool,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Penalty weights and status bands for the health scorer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPolicy {
    /// Points lost per percentage point below the success threshold.
    pub success_penalty_per_point: f64,
    /// Points lost per second of average processing time over the limit.
    pub processing_penalty_per_second: f64,
    /// Maximum processing-time penalty.
    pub processing_penalty_cap: f64,
    /// Points lost per minute of average delivery delay over the limit.
    pub delay_penalty_per_minute: f64,
    /// Maximum delivery-delay penalty.
    pub delay_penalty_cap: f64,
    /// Minimum score classified healthy.
    pub healthy_min: f64,
    /// Minimum score classified degraded.
    pub degraded_min: f64,
    /// Minimum score classified critical.
    pub critical_min: f64,
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            success_penalty_per_point: 2.0,
            processing_penalty_per_second: 5.0,
            processing_penalty_cap: 30.0,
            delay_penalty_per_minute: 5.0,
            delay_penalty_cap: 30.0,
            healthy_min: 90.0,
            degraded_min: 70.0,
            critical_min: 40.0,
        }
    }
}

/// Rule for flagging intents that received webhooks but no confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyPolicy {
    /// Whether anomaly detection runs at all.
    pub enabled: bool,
    /// Webhooks that must have arrived for silence to be anomalous.
    pub min_webhooks: i64,
    /// Minutes after intent creation by which a confirmation is expected.
    pub window_minutes: i64,
}

impl Default for AnomalyPolicy {
    fn default() -> Self {
        Self { enabled: true, min_webhooks: 1, window_minutes: 20 }
    }
}

/// Per-provider monitoring thresholds and policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MonitoringConfig {
    /// Provider this row configures.
    pub provider: ProviderName,
    /// Minimum processing success rate in `[0, 1]`.
    pub min_success_rate_threshold: f64,
    /// Maximum average processing time.
    pub max_avg_processing_time_ms: i64,
    /// Maximum average delivery delay.
    pub max_delivery_delay_seconds: i64,
    /// Minutes after creation before an unconfirmed intent is overdue.
    pub missing_confirmation_timeout_minutes: i64,
    /// Minimum minutes between notifications for one fingerprint.
    pub alert_cooldown_minutes: i64,
    /// Ascending occurrence counts that raise the escalation level.
    pub escalation_thresholds: Vec<i32>,
    /// Master switch for every periodic stage.
    pub monitoring_enabled: bool,
    /// Whether threshold breaches notify.
    pub alert_on_threshold_breach: bool,
    /// Whether the recovery orchestrator runs.
    pub auto_recovery_enabled: bool,
    /// Window sizes the aggregator closes.
    pub aggregation_windows_minutes: Vec<i32>,
    /// Window whose snapshot drives threshold checks.
    pub scoring_window_minutes: i32,
    /// Minutes between detector passes.
    pub health_check_interval_minutes: i64,
    /// Attempts before recovery gives up.
    pub max_recovery_attempts: i32,
    /// Minutes to wait between attempts.
    pub recovery_backoff_minutes: Vec<i32>,
    /// Per-attempt timeout.
    pub recovery_attempt_timeout_seconds: i64,
    /// Scorer weights and bands.
    pub scoring: sqlx::types::Json<ScoringPolicy>,
    /// Anomaly detection rule.
    pub anomaly: sqlx::types::Json<AnomalyPolicy>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl MonitoringConfig {
    /// Default configuration seeded for a provider at first boot.
    pub fn default_for(provider: ProviderName, now: DateTime<Utc>) -> Self {
        Self {
            provider,
            min_success_rate_threshold: 0.95,
            max_avg_processing_time_ms: 5000,
            max_delivery_delay_seconds: 300,
            missing_confirmation_timeout_minutes: 30,
            alert_cooldown_minutes: 60,
            escalation_thresholds: vec![3, 10, 25],
            monitoring_enabled: true,
            alert_on_threshold_breach: true,
            auto_recovery_enabled: true,
            aggregation_windows_minutes: vec![5, 15, 60, 1440],
            scoring_window_minutes: 15,
            health_check_interval_minutes: 15,
            max_recovery_attempts: 3,
            recovery_backoff_minutes: vec![5, 15, 30],
            recovery_attempt_timeout_seconds: 30,
            scoring: sqlx::types::Json(ScoringPolicy::default()),
            anomaly: sqlx::types::Json(AnomalyPolicy::default()),
            updated_at: now,
        }
    }

    /// Checks every field for a usable value.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` naming the first invalid field.
    pub fn validate(&self) -> Result<(), CoreError> {
        fn invalid(message: &str) -> Result<(), CoreError> {
            Err(CoreError::InvalidInput(message.to_string()))
        }

        if !(0.0..=1.0).contains(&self.min_success_rate_threshold) {
            return invalid("min_success_rate_threshold must be between 0.0 and 1.0");
        }
        if self.max_avg_processing_time_ms <= 0 {
            return invalid("max_avg_processing_time_ms must be greater than 0");
        }
        if self.max_delivery_delay_seconds <= 0 {
            return invalid("max_delivery_delay_seconds must be greater than 0");
        }
        if self.missing_confirmation_timeout_minutes <= 0 {
            return invalid("missing_confirmation_timeout_minutes must be greater than 0");
        }
        if self.alert_cooldown_minutes < 0 {
            return invalid("alert_cooldown_minutes cannot be negative");
        }
        if self.escalation_thresholds.iter().any(|t| *t <= 0)
            || self.escalation_thresholds.windows(2).any(|pair| pair[0] >= pair[1])
        {
            return invalid("escalation_thresholds must be positive and strictly ascending");
        }
        if self.aggregation_windows_minutes.is_empty()
            || self.aggregation_windows_minutes.iter().any(|w| *w <= 0 || 1440 % *w != 0)
        {
            return invalid("aggregation_windows_minutes must be non-empty divisors of 1440");
        }
        if !self.aggregation_windows_minutes.contains(&self.scoring_window_minutes) {
            return invalid("scoring_window_minutes must be one of aggregation_windows_minutes");
        }
        if self.health_check_interval_minutes <= 0 {
            return invalid("health_check_interval_minutes must be greater than 0");
        }
        if self.max_recovery_attempts <= 0 {
            return invalid("max_recovery_attempts must be greater than 0");
        }
        if self.recovery_backoff_minutes.is_empty()
            || self.recovery_backoff_minutes.iter().any(|m| *m < 0)
        {
            return invalid("recovery_backoff_minutes must be non-empty and non-negative");
        }
        if self.recovery_attempt_timeout_seconds <= 0 {
            return invalid("recovery_attempt_timeout_seconds must be greater than 0");
        }
        let scoring = self.scoring.0;
        if !(scoring.critical_min <= scoring.degraded_min
            && scoring.degraded_min <= scoring.healthy_min
            && scoring.healthy_min <= 100.0
            && scoring.critical_min >= 0.0)
        {
            return invalid("scoring bands must satisfy 0 <= critical <= degraded <= healthy <= 100");
        }
        if scoring.success_penalty_per_point < 0.0
            || scoring.processing_penalty_per_second < 0.0
            || scoring.delay_penalty_per_minute < 0.0
            || scoring.processing_penalty_cap < 0.0
            || scoring.delay_penalty_cap < 0.0
        {
            return invalid("scoring penalties cannot be negative");
        }
        let anomaly = self.anomaly.0;
        if anomaly.min_webhooks < 1 || anomaly.window_minutes <= 0 {
            return invalid("anomaly policy requires min_webhooks >= 1 and window_minutes > 0");
        }
        Ok(())
    }

    /// Alert cooldown as a duration.
    pub fn alert_cooldown(&self) -> Duration {
        Duration::minutes(self.alert_cooldown_minutes)
    }

    /// Missing-confirmation timeout as a duration.
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::minutes(self.missing_confirmation_timeout_minutes)
    }

    /// Detector interval as a duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::minutes(self.health_check_interval_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_names_are_normalized() {
        let name = ProviderName::parse("  BlockBee ").unwrap();
        assert_eq!(name.as_str(), "blockbee");
        assert!(ProviderName::parse("").is_err());
        assert!(ProviderName::parse("block bee").is_err());
    }

    #[test]
    fn text_enums_round_trip_through_strings() {
        assert_eq!("duplicate".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Duplicate);
        assert_eq!(ErrorKind::ParsingError.to_string(), "parsing_error");
        assert!("unknown".parse::<HealthStatus>().is_err());
    }

    #[test]
    fn severity_raises_and_saturates() {
        assert_eq!(Severity::Warning.raised(0), Severity::Warning);
        assert_eq!(Severity::Warning.raised(1), Severity::Error);
        assert_eq!(Severity::Warning.raised(7), Severity::Critical);
    }

    #[test]
    fn default_config_is_valid() {
        let config =
            MonitoringConfig::default_for(ProviderName::parse("dynopay").unwrap(), Utc::now());
        assert!(config.validate().is_ok());
        assert!((config.min_success_rate_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(config.max_avg_processing_time_ms, 5000);
        assert_eq!(config.missing_confirmation_timeout_minutes, 30);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let base =
            MonitoringConfig::default_for(ProviderName::parse("dynopay").unwrap(), Utc::now());

        let mut config = base.clone();
        config.min_success_rate_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.escalation_thresholds = vec![10, 3];
        assert!(config.validate().is_err());

        let mut config = base.clone();
        config.aggregation_windows_minutes = vec![7];
        config.scoring_window_minutes = 7;
        assert!(config.validate().is_err());

        let mut config = base;
        config.scoring_window_minutes = 30;
        assert!(config.validate().is_err());
    }

    #[test]
    fn delivery_delay_clamps_negative_values() {
        let now = Utc::now();
        let record = DeliveryRecord {
            id: DeliveryId::new(),
            provider: ProviderName::parse("blockbee").unwrap(),
            payment_intent_id: None,
            webhook_kind: "payment".to_string(),
            request_id: None,
            expected_at: Some(now + Duration::minutes(5)),
            received_at: now,
            processing_started_at: None,
            processing_completed_at: None,
            delivery_status: DeliveryStatus::Received,
            processing_status: ProcessingStatus::Pending,
            error_kind: None,
            error_message: None,
            retry_count: 0,
            signature_valid: true,
            timestamp_valid: true,
            rate_limited: false,
            payload_size_bytes: 2,
            fingerprint: "ab".to_string(),
            payment_confirmed: false,
            balance_credited: false,
            user_notified: false,
            duplicate_of: None,
            recovery_alert_id: None,
            created_at: now,
        };

        assert_eq!(record.delivery_delay(), Some(Duration::zero()));
        assert_eq!(record.processing_duration(), None);
    }
}
