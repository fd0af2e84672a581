//! Durable persistence for snapshots, signals, trackings, outcomes and
//! aggregated statistics. The Store is the only shared mutable state in the
//! process and is safe for concurrent callers.

mod codec;
mod notifications;
mod outcomes;
mod pairs;
mod rows;
mod signals;
mod snapshots;
mod stats;
mod trackings;

use market_core::StoreError;
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use std::time::Duration;

/// Connection pool sizing, mirrored from the `database` config section.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 25,
            min_connections: 5,
            max_lifetime: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: AnyPool,
}

impl Store {
    /// Connect and apply the embedded schema.
    pub async fn connect(database_url: &str, settings: &PoolSettings) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(settings.max_connections)
            .min_connections(settings.min_connections)
            .max_lifetime(settings.max_lifetime)
            .connect(database_url)
            .await
            .map_err(map_sqlx_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// An isolated in-memory store with the schema applied. Used by tests
    /// across the workspace; a single connection keeps SQLite's per-connection
    /// memory database coherent.
    pub async fn in_memory() -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(map_sqlx_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let schema = include_str!("../../../schema.sql");

        // The driver does not accept multi-statement text; apply one at a
        // time. CREATE INDEX has no portable IF NOT EXISTS form, so an
        // already-existing index is treated as applied.
        for statement in schema.split(';') {
            let stmt = statement.trim();
            if stmt.is_empty() {
                continue;
            }
            if let Err(err) = sqlx::query(stmt).execute(&self.pool).await {
                if stmt.starts_with("CREATE INDEX") {
                    tracing::debug!("index statement skipped: {err}");
                    continue;
                }
                return Err(map_sqlx_err(err));
            }
        }

        Ok(())
    }

    /// Startup connectivity check.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx_err)
    }
}

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::UniqueViolation(err.to_string())
    } else {
        StoreError::Database(err.to_string())
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.is_unique_violation()
                // The Any driver does not always classify; fall back to the
                // backend message shapes (SQLite / MySQL).
                || db.message().contains("UNIQUE constraint failed")
                || db.message().contains("Duplicate entry")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_applies_and_pings() {
        let store = Store::in_memory().await.unwrap();
        store.ping().await.unwrap();
    }
}
