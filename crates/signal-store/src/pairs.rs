use chrono::{DateTime, Utc};
use market_core::{StoreError, TradingPair};

use crate::codec::{flag_to_db, ts_to_db};
use crate::rows::PairRow;
use crate::{map_sqlx_err, Store};

impl Store {
    /// Upsert the symbol registry after a sweep: symbols in `present` become
    /// (or stay) active, previously known symbols missing from `present` are
    /// deactivated. Nothing is ever deleted.
    pub async fn sync_trading_pairs(
        &self,
        present: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let known: Vec<PairRow> =
            sqlx::query_as("SELECT symbol, is_active FROM trading_pairs")
                .fetch_all(self.pool())
                .await
                .map_err(map_sqlx_err)?;

        let now_db = ts_to_db(now);

        for symbol in present {
            let exists = known.iter().any(|p| &p.symbol == symbol);
            if exists {
                sqlx::query(
                    "UPDATE trading_pairs SET is_active = ?, updated_at = ? WHERE symbol = ?",
                )
                .bind(flag_to_db(true))
                .bind(&now_db)
                .bind(symbol)
                .execute(self.pool())
                .await
                .map_err(map_sqlx_err)?;
            } else {
                sqlx::query(
                    "INSERT INTO trading_pairs (symbol, is_active, first_seen_at, updated_at) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(symbol)
                .bind(flag_to_db(true))
                .bind(&now_db)
                .bind(&now_db)
                .execute(self.pool())
                .await
                .map_err(map_sqlx_err)?;
            }
        }

        for row in &known {
            if row.is_active != 0 && !present.contains(&row.symbol) {
                tracing::info!(symbol = %row.symbol, "deactivating delisted pair");
                sqlx::query(
                    "UPDATE trading_pairs SET is_active = ?, updated_at = ? WHERE symbol = ?",
                )
                .bind(flag_to_db(false))
                .bind(&now_db)
                .bind(&row.symbol)
                .execute(self.pool())
                .await
                .map_err(map_sqlx_err)?;
            }
        }

        Ok(())
    }

    pub async fn active_pairs(&self) -> Result<Vec<TradingPair>, StoreError> {
        let rows: Vec<PairRow> = sqlx::query_as(
            "SELECT symbol, is_active FROM trading_pairs WHERE is_active = 1 ORDER BY symbol",
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(TradingPair::from).collect())
    }
}
