//! Webhook delivery reliability and provider health monitoring.
//!
//! This crate records every inbound payment webhook through the
//! [`gate::IngestGate`], then runs a set of periodic stages per provider on
//! top of the resulting ledger:
//!
//! 1. **Aggregate** - close fixed windows into scored health snapshots
//! 2. **Score** - check the newest window against the provider's thresholds
//! 3. **Detect** - raise alerts for payment intents missing a confirmation
//! 4. **Recover** - poll the provider for overdue intents on a backoff
//!
//! Every alert occurrence goes through the [`dispatcher::AlertDispatcher`],
//! which applies per-fingerprint cooldown and escalation before calling the
//! configured [`collaborators::Notifier`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use paywatch_core::{Clock, RealClock};
//! use paywatch_monitor::{
//!     client::{ClientConfig, HttpCollaboratorClient},
//!     notify::TracingNotifier,
//!     storage::MonitorStorage,
//!     EngineConfig, MonitorEngine, MonitorError,
//! };
//!
//! # async fn example(storage: Arc<dyn MonitorStorage>) -> Result<(), MonitorError> {
//! let ledger = Arc::new(HttpCollaboratorClient::new(ClientConfig::new("http://ledger:8080"))?);
//! let mut engine = MonitorEngine::new(
//!     EngineConfig::default(),
//!     storage,
//!     Arc::new(RealClock::new()) as Arc<dyn Clock>,
//!     ledger.clone(),
//!     ledger,
//!     Arc::new(TracingNotifier),
//! );
//!
//! engine.start()?;
//! # engine.shutdown().await
//! # }
//! ```

pub mod aggregator;
pub mod client;
pub mod collaborators;
pub mod cycle;
pub mod detector;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod gate;
pub mod notify;
pub mod recovery;
pub mod scorer;
pub mod security;
pub mod storage;

pub use collaborators::{IntentSource, Notification, Notifier, ProviderStatusQuery};
pub use dispatcher::AlertDispatcher;
pub use engine::{EngineConfig, EngineStats, MonitorEngine};
pub use error::{MonitorError, Result};
pub use gate::{DeliveryEvent, GateVerdict, IngestGate};
pub use storage::{mock::MockMonitorStorage, MonitorStorage, PostgresMonitorStorage};
