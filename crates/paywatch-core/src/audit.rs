//! Write audit hook.
//!
//! Every repository and in-memory store calls [`record`] at the point of
//! mutation. Entries go to the `paywatch::audit` tracing target so they can be
//! routed to a dedicated sink by the subscriber configuration.

use std::fmt;

/// Kind of mutation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    /// New row.
    Insert,
    /// Existing row changed.
    Update,
    /// Insert or replace keyed by a natural key.
    Upsert,
    /// Row closed by a passing check or an operator.
    Resolve,
}

impl fmt::Display for WriteOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Upsert => write!(f, "upsert"),
            Self::Resolve => write!(f, "resolve"),
        }
    }
}

/// Records one write against an entity.
pub fn record(entity: &'static str, id: impl fmt::Display, op: WriteOp) {
    tracing::info!(target: "paywatch::audit", entity, id = %id, op = %op, "ledger write");
}
