use chrono::{DateTime, Utc};
use market_core::{Snapshot, StoreError};

use crate::codec::{dec_to_db, flag_to_db, ts_to_db};
use crate::rows::SnapshotRow;
use crate::{is_unique_violation, map_sqlx_err, Store};

/// Snapshots are written in multi-row statements of this size.
const SNAPSHOT_BATCH_SIZE: usize = 100;

impl Store {
    /// Persist a batch of snapshots. Duplicate (symbol, timestamp) rows are
    /// idempotent no-ops: a batch that trips the unique key is replayed
    /// row-by-row so the fresh rows still land.
    pub async fn insert_snapshots(&self, snapshots: &[Snapshot]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;

        for chunk in snapshots.chunks(SNAPSHOT_BATCH_SIZE) {
            let rows = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");
            let sql = format!(
                "INSERT INTO market_data (symbol, timestamp, long_account_ratio, \
                 short_account_ratio, long_position_ratio, short_position_ratio, \
                 position_ratio_available, data_quality_score, price, volume_24h, \
                 open_interest, funding_rate) VALUES {rows}"
            );

            let mut query = sqlx::query(&sql);
            for snap in chunk {
                query = query
                    .bind(&snap.symbol)
                    .bind(ts_to_db(snap.timestamp))
                    .bind(dec_to_db(snap.long_account_ratio))
                    .bind(dec_to_db(snap.short_account_ratio))
                    .bind(dec_to_db(snap.long_position_ratio))
                    .bind(dec_to_db(snap.short_position_ratio))
                    .bind(flag_to_db(snap.position_ratio_available))
                    .bind(dec_to_db(snap.data_quality_score))
                    .bind(dec_to_db(snap.price))
                    .bind(dec_to_db(snap.volume_24h))
                    .bind(dec_to_db(snap.open_interest))
                    .bind(dec_to_db(snap.funding_rate));
            }

            match query.execute(self.pool()).await {
                Ok(result) => inserted += result.rows_affected(),
                Err(err) if is_unique_violation(&err) => {
                    inserted += self.insert_snapshots_one_by_one(chunk).await?;
                }
                Err(err) => return Err(map_sqlx_err(err)),
            }
        }

        Ok(inserted)
    }

    async fn insert_snapshots_one_by_one(&self, chunk: &[Snapshot]) -> Result<u64, StoreError> {
        let mut inserted = 0u64;
        for snap in chunk {
            let result = sqlx::query(
                "INSERT INTO market_data (symbol, timestamp, long_account_ratio, \
                 short_account_ratio, long_position_ratio, short_position_ratio, \
                 position_ratio_available, data_quality_score, price, volume_24h, \
                 open_interest, funding_rate) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&snap.symbol)
            .bind(ts_to_db(snap.timestamp))
            .bind(dec_to_db(snap.long_account_ratio))
            .bind(dec_to_db(snap.short_account_ratio))
            .bind(dec_to_db(snap.long_position_ratio))
            .bind(dec_to_db(snap.short_position_ratio))
            .bind(flag_to_db(snap.position_ratio_available))
            .bind(dec_to_db(snap.data_quality_score))
            .bind(dec_to_db(snap.price))
            .bind(dec_to_db(snap.volume_24h))
            .bind(dec_to_db(snap.open_interest))
            .bind(dec_to_db(snap.funding_rate))
            .execute(self.pool())
            .await;

            match result {
                Ok(r) => inserted += r.rows_affected(),
                Err(err) if is_unique_violation(&err) => {
                    tracing::debug!(symbol = %snap.symbol, "duplicate snapshot skipped");
                }
                Err(err) => return Err(map_sqlx_err(err)),
            }
        }
        Ok(inserted)
    }

    /// Snapshots for one symbol since `since`, newest first.
    pub async fn snapshots_since(
        &self,
        symbol: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Snapshot>, StoreError> {
        let rows: Vec<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM market_data WHERE symbol = ? AND timestamp >= ? \
             ORDER BY timestamp DESC",
        )
        .bind(symbol)
        .bind(ts_to_db(since))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter().map(Snapshot::try_from).collect()
    }

    pub async fn latest_snapshot(&self, symbol: &str) -> Result<Option<Snapshot>, StoreError> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            "SELECT * FROM market_data WHERE symbol = ? ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        row.map(Snapshot::try_from).transpose()
    }

    /// Retention sweep: delete snapshots older than `before`.
    pub async fn prune_snapshots(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM market_data WHERE timestamp < ?")
            .bind(ts_to_db(before))
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn snapshot(symbol: &str, at: DateTime<Utc>) -> Snapshot {
        Snapshot {
            symbol: symbol.into(),
            timestamp: at,
            long_account_ratio: dec!(60),
            short_account_ratio: dec!(40),
            long_position_ratio: dec!(55),
            short_position_ratio: dec!(45),
            position_ratio_available: true,
            data_quality_score: dec!(100),
            price: dec!(50000),
            volume_24h: dec!(1000000),
            open_interest: dec!(2000),
            funding_rate: dec!(0.0001),
        }
    }

    #[tokio::test]
    async fn duplicate_snapshot_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let at = Utc::now();

        let first = store
            .insert_snapshots(&[snapshot("BTCUSDT", at)])
            .await
            .unwrap();
        assert_eq!(first, 1);

        // Same (symbol, timestamp) again plus one fresh row: only the fresh
        // row lands, no error surfaces.
        let second = store
            .insert_snapshots(&[
                snapshot("BTCUSDT", at),
                snapshot("BTCUSDT", at + Duration::minutes(5)),
            ])
            .await
            .unwrap();
        assert_eq!(second, 1);
    }

    #[tokio::test]
    async fn snapshots_since_returns_newest_first() {
        let store = Store::in_memory().await.unwrap();
        let base = Utc::now();

        store
            .insert_snapshots(&[
                snapshot("BTCUSDT", base - Duration::hours(3)),
                snapshot("BTCUSDT", base - Duration::hours(1)),
                snapshot("BTCUSDT", base - Duration::hours(2)),
                snapshot("ETHUSDT", base - Duration::hours(1)),
            ])
            .await
            .unwrap();

        let window = store
            .snapshots_since("BTCUSDT", base - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(window.len(), 3);
        assert!(window[0].timestamp > window[1].timestamp);
        assert!(window[1].timestamp > window[2].timestamp);
    }

    #[tokio::test]
    async fn prune_removes_only_old_rows() {
        let store = Store::in_memory().await.unwrap();
        let base = Utc::now();

        store
            .insert_snapshots(&[
                snapshot("BTCUSDT", base - Duration::days(40)),
                snapshot("BTCUSDT", base - Duration::hours(1)),
            ])
            .await
            .unwrap();

        let pruned = store
            .prune_snapshots(base - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.latest_snapshot("BTCUSDT").await.unwrap().is_some());
    }
}
