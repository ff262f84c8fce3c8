//! Paywatch HTTP API.
//!
//! Exposes the ingest gate to the webhook-receiving collaborator and the
//! read-only health, alert and event views to operators, together with the
//! service configuration shared with the binary.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{sync::Arc, time::Duration};

use paywatch_core::Clock;
use paywatch_monitor::{AlertDispatcher, IngestGate, MonitorStorage};

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server};

/// Default request timeout applied by the router.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default limit on webhook body size.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Ledger and state stores backing the views.
    pub storage: Arc<dyn MonitorStorage>,
    /// Gate recording inbound deliveries.
    pub gate: IngestGate,
    /// Dispatcher closing streaks on operator acknowledgment.
    pub dispatcher: AlertDispatcher,
    /// Time source for views and health checks.
    pub clock: Arc<dyn Clock>,
    /// Timeout enforced on every request.
    pub request_timeout: Duration,
    /// Largest accepted request body.
    pub max_payload_bytes: usize,
}

impl AppState {
    /// Creates state with default request limits.
    pub fn new(
        storage: Arc<dyn MonitorStorage>,
        gate: IngestGate,
        dispatcher: AlertDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            gate,
            dispatcher,
            clock,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    /// Overrides the request timeout and body limit.
    #[must_use]
    pub fn with_limits(mut self, request_timeout: Duration, max_payload_bytes: usize) -> Self {
        self.request_timeout = request_timeout;
        self.max_payload_bytes = max_payload_bytes;
        self
    }
}
