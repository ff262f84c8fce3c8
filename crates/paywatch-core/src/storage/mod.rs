//! Database access layer for the delivery ledger and health state.
//!
//! Each table has its own repository. Operations that must commit together
//! across tables live on [`Storage`] itself and share one transaction.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod alert_states;
pub mod alerts;
pub mod deliveries;
pub mod health_events;
pub mod monitoring_configs;
pub mod schema;
pub mod snapshots;

pub use schema::migrate;

use crate::{
    error::Result,
    models::{AlertId, DeliveryRecord, MissingConfirmationAlert},
};

/// Container for all repository instances providing unified database access.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<PgPool>,

    /// Repository for the delivery ledger.
    pub deliveries: Arc<deliveries::Repository>,

    /// Repository for windowed health snapshots.
    pub snapshots: Arc<snapshots::Repository>,

    /// Repository for missing-confirmation alerts.
    pub alerts: Arc<alerts::Repository>,

    /// Repository for health events.
    pub health_events: Arc<health_events::Repository>,

    /// Repository for dispatcher cooldown state.
    pub alert_states: Arc<alert_states::Repository>,

    /// Repository for per-provider monitoring configuration.
    pub monitoring_configs: Arc<monitoring_configs::Repository>,
}

impl Storage {
    /// Creates a new storage instance with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            deliveries: Arc::new(deliveries::Repository::new(pool.clone())),
            snapshots: Arc::new(snapshots::Repository::new(pool.clone())),
            alerts: Arc::new(alerts::Repository::new(pool.clone())),
            health_events: Arc::new(health_events::Repository::new(pool.clone())),
            alert_states: Arc::new(alert_states::Repository::new(pool.clone())),
            monitoring_configs: Arc::new(monitoring_configs::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Performs a health check on the database connection.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }

    /// Writes the reconciliation record for a recovered payment and resolves
    /// its alert in one transaction.
    ///
    /// Either both writes commit or neither does.
    ///
    /// # Errors
    ///
    /// Returns error if either write fails; the transaction is rolled back.
    pub async fn complete_recovery(
        &self,
        alert_id: AlertId,
        reconciliation: &DeliveryRecord,
        recovered_at: DateTime<Utc>,
        notes: &str,
    ) -> Result<MissingConfirmationAlert> {
        let mut tx = self.pool.begin().await?;

        self.deliveries.create_in_tx(&mut tx, reconciliation).await?;
        let alert = self.alerts.mark_recovered_in_tx(&mut tx, alert_id, recovered_at, notes).await?;

        tx.commit().await?;
        Ok(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool);
        assert_eq!(Arc::strong_count(&storage.pool), 7);
    }
}
