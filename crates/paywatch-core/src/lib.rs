//! Core domain models, storage and time primitives.
//!
//! Provides the delivery ledger, health snapshot, alert and configuration
//! types shared by the monitor and API crates, together with the Postgres
//! repositories that persist them and the clock abstraction every periodic
//! component reads time from.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AlertId, AlertState, DeliveryId, DeliveryRecord, DeliveryStatus, ErrorKind, HealthEvent,
    HealthEventId, HealthStatus, IntentId, MissingConfirmationAlert, MonitoringConfig,
    ProcessingStatus, ProviderHealthSnapshot, ProviderName, Severity,
};
pub use time::{Clock, RealClock, TestClock};
