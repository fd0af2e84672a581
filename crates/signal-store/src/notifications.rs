use chrono::{DateTime, Utc};
use market_core::StoreError;
use uuid::Uuid;

use crate::codec::ts_to_db;
use crate::{map_sqlx_err, Store};

impl Store {
    /// Append one dispatched event to the notification audit table.
    pub async fn record_notification(
        &self,
        kind: &str,
        title: &str,
        message: &str,
        metadata: Option<&serde_json::Value>,
        created_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications (id, kind, title, message, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(kind)
        .bind(title)
        .bind(message)
        .bind(metadata.map(|m| m.to_string()))
        .bind(ts_to_db(created_at))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    pub async fn notification_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notifications")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        Ok(count)
    }
}
