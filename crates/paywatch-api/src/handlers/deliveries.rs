//! Delivery ingestion and post-processing updates.
//!
//! The webhook-receiving collaborator forwards every inbound webhook here
//! before handling it and reports the business outcome afterwards. Security
//! and parsing problems with the webhook itself are recorded on the ledger
//! row and returned in the verdict, never as HTTP errors.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use paywatch_core::models::{DeliveryId, DeliveryRecord, IntentId, ProcessingUpdate, ProviderName};
use paywatch_monitor::{gate::SecurityInput, DeliveryEvent, GateVerdict};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::ApiError;
use crate::AppState;

/// Header naming the provider-defined webhook kind.
pub const KIND_HEADER: &str = "x-webhook-kind";
/// Header carrying the provider signature.
pub const SIGNATURE_HEADER: &str = "x-signature";
/// Header carrying the signed unix timestamp.
pub const TIMESTAMP_HEADER: &str = "x-timestamp";
/// Header carrying the provider request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
/// Header carrying the RFC 3339 time the delivery was expected.
pub const EXPECTED_AT_HEADER: &str = "x-expected-at";
/// Header naming the payment intent the webhook refers to.
pub const INTENT_HEADER: &str = "x-payment-intent-id";
/// Header carrying the provider retry count.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

const UNKNOWN_KIND: &str = "unknown";

/// Response to a recorded delivery.
#[derive(Debug, Serialize)]
pub struct DeliveryResponse {
    /// Gate classification.
    #[serde(flatten)]
    pub verdict: GateVerdict,
    /// Whether the receiver may apply business effects.
    pub should_process: bool,
}

/// Records an inbound webhook delivery.
///
/// Returns `201 Created` for a delivery the receiver should process and
/// `200 OK` for duplicates and rejected deliveries, which are recorded but
/// must not be processed.
///
/// # Errors
///
/// - 400: unknown provider name
/// - 413: body exceeds the configured limit
/// - 503: the ledger write failed
#[instrument(
    name = "record_delivery",
    skip(state, headers, body),
    fields(provider = %provider, size = body.len())
)]
pub async fn record_delivery(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let provider = ProviderName::parse(&provider)?;
    let event = delivery_event(provider, &headers, body);

    let verdict = state.gate.record_delivery(event).await?;
    let should_process = verdict.should_process();

    info!(
        record_id = %verdict.record_id,
        status = %verdict.delivery_status,
        duplicate = verdict.duplicate,
        "delivery recorded"
    );

    let status = if should_process { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(DeliveryResponse { verdict, should_process })).into_response())
}

/// Applies the business outcome reported after handling a delivery.
///
/// # Errors
///
/// - 400: malformed id or body, reversed timestamps, or business effects on
///   a duplicate
/// - 404: unknown record
#[instrument(name = "update_processing", skip(state, body), fields(record_id = %id))]
pub async fn update_processing(
    Path(id): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<DeliveryRecord>, ApiError> {
    let id = Uuid::parse_str(&id)
        .map(DeliveryId::from)
        .map_err(|e| ApiError::bad_request(format!("invalid delivery id: {e}")))?;
    let update: ProcessingUpdate = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid processing update: {e}")))?;

    let record = state.gate.update_processing(id, update).await?;
    debug!(status = %record.processing_status, "processing update applied");
    Ok(Json(record))
}

/// Builds the gate event from the raw body and webhook headers.
///
/// Malformed optional headers are dropped with a warning so the delivery is
/// still recorded.
pub fn delivery_event(provider: ProviderName, headers: &HeaderMap, body: Bytes) -> DeliveryEvent {
    let kind = header(headers, KIND_HEADER).unwrap_or(UNKNOWN_KIND);

    let timestamp = header(headers, TIMESTAMP_HEADER).and_then(|v| match v.parse::<i64>() {
        Ok(ts) => Some(ts),
        Err(_) => {
            warn!(value = v, "ignoring non-numeric timestamp header");
            None
        },
    });

    let security = SecurityInput::Headers {
        signature: header(headers, SIGNATURE_HEADER).map(str::to_string),
        timestamp,
    };

    let mut event = DeliveryEvent::new(provider, kind, body, security);
    event.payment_intent_id = header(headers, INTENT_HEADER).map(IntentId::from);
    event.request_id = header(headers, REQUEST_ID_HEADER).map(str::to_string);
    event.expected_at = header(headers, EXPECTED_AT_HEADER).and_then(|v| {
        match DateTime::parse_from_rfc3339(v) {
            Ok(at) => Some(at.with_timezone(&Utc)),
            Err(e) => {
                warn!(value = v, error = %e, "ignoring malformed expected-at header");
                None
            },
        }
    });
    event.retry_count =
        header(headers, RETRY_COUNT_HEADER).and_then(|v| v.parse().ok()).unwrap_or(0);
    event
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blockbee() -> ProviderName {
        ProviderName::parse("blockbee").unwrap()
    }

    #[test]
    fn headers_map_onto_event() {
        let mut headers = HeaderMap::new();
        headers.insert(KIND_HEADER, "payment_confirmed".parse().unwrap());
        headers.insert(SIGNATURE_HEADER, "sha256=abcd".parse().unwrap());
        headers.insert(TIMESTAMP_HEADER, "1709294400".parse().unwrap());
        headers.insert(INTENT_HEADER, "pi_42".parse().unwrap());
        headers.insert(EXPECTED_AT_HEADER, "2024-03-01T12:00:00Z".parse().unwrap());
        headers.insert(RETRY_COUNT_HEADER, "2".parse().unwrap());

        let event = delivery_event(blockbee(), &headers, Bytes::from_static(b"{}"));

        assert_eq!(event.webhook_kind, "payment_confirmed");
        assert_eq!(event.payment_intent_id, Some(IntentId::from("pi_42")));
        assert_eq!(event.retry_count, 2);
        assert_eq!(event.expected_at.unwrap().to_rfc3339(), "2024-03-01T12:00:00+00:00");
        assert_eq!(
            event.security,
            SecurityInput::Headers {
                signature: Some("sha256=abcd".to_string()),
                timestamp: Some(1_709_294_400),
            }
        );
    }

    #[test]
    fn malformed_optional_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(TIMESTAMP_HEADER, "yesterday".parse().unwrap());
        headers.insert(EXPECTED_AT_HEADER, "soon".parse().unwrap());
        headers.insert(RETRY_COUNT_HEADER, "many".parse().unwrap());

        let event = delivery_event(blockbee(), &headers, Bytes::new());

        assert_eq!(event.webhook_kind, UNKNOWN_KIND);
        assert!(event.expected_at.is_none());
        assert_eq!(event.retry_count, 0);
        assert_eq!(event.security, SecurityInput::Headers { signature: None, timestamp: None });
    }
}
