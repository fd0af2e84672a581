use chrono::{DateTime, Utc};
use market_core::{StatisticsCell, StoreError};

use crate::codec::{opt_dec_to_db, ts_to_db};
use crate::rows::StatisticsRow;
use crate::{map_sqlx_err, Store};

/// Storage form of the symbol column: `''` is the global cell, matching the
/// `COALESCE(symbol, '')` uniqueness key.
fn symbol_key(symbol: &Option<String>) -> String {
    symbol.clone().unwrap_or_default()
}

impl Store {
    /// Upsert a cell on (strategy, symbol-or-'', period_label, period_start).
    pub async fn upsert_statistics_cell(&self, cell: &StatisticsCell) -> Result<(), StoreError> {
        let existing: Option<(i64,)> = sqlx::query_as(
            "SELECT total_signals FROM strategy_statistics WHERE strategy_name = ? \
             AND symbol = ? AND period_label = ? AND period_start = ?",
        )
        .bind(&cell.strategy_name)
        .bind(symbol_key(&cell.symbol))
        .bind(&cell.period_label)
        .bind(ts_to_db(cell.period_start))
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        if existing.is_some() {
            self.update_statistics_cell(cell).await
        } else {
            self.insert_statistics_cell(cell).await
        }
    }

    async fn insert_statistics_cell(&self, cell: &StatisticsCell) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO strategy_statistics (strategy_name, symbol, period_label, \
             period_start, period_end, total_signals, confirmed_signals, \
             invalidated_signals, profitable_signals, losing_signals, neutral_signals, \
             win_rate, avg_profit_pct, avg_loss_pct, avg_holding_hours, best_profit_pct, \
             worst_loss_pct, profit_factor, theoretical_win_rate, close_win_rate, \
             total_kline_hours, profitable_kline_hours, avg_hourly_return_pct, \
             max_hourly_return_pct, min_hourly_return_pct, avg_max_potential_profit_pct, \
             avg_max_potential_loss_pct, calculated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&cell.strategy_name)
        .bind(symbol_key(&cell.symbol))
        .bind(&cell.period_label)
        .bind(ts_to_db(cell.period_start))
        .bind(ts_to_db(cell.period_end))
        .bind(cell.total_signals)
        .bind(cell.confirmed_signals)
        .bind(cell.invalidated_signals)
        .bind(cell.profitable_signals)
        .bind(cell.losing_signals)
        .bind(cell.neutral_signals)
        .bind(opt_dec_to_db(cell.win_rate))
        .bind(opt_dec_to_db(cell.avg_profit_pct))
        .bind(opt_dec_to_db(cell.avg_loss_pct))
        .bind(opt_dec_to_db(cell.avg_holding_hours))
        .bind(opt_dec_to_db(cell.best_profit_pct))
        .bind(opt_dec_to_db(cell.worst_loss_pct))
        .bind(opt_dec_to_db(cell.profit_factor))
        .bind(opt_dec_to_db(cell.theoretical_win_rate))
        .bind(opt_dec_to_db(cell.close_win_rate))
        .bind(cell.total_kline_hours)
        .bind(cell.profitable_kline_hours)
        .bind(opt_dec_to_db(cell.avg_hourly_return_pct))
        .bind(opt_dec_to_db(cell.max_hourly_return_pct))
        .bind(opt_dec_to_db(cell.min_hourly_return_pct))
        .bind(opt_dec_to_db(cell.avg_max_potential_profit_pct))
        .bind(opt_dec_to_db(cell.avg_max_potential_loss_pct))
        .bind(ts_to_db(cell.calculated_at))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn update_statistics_cell(&self, cell: &StatisticsCell) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE strategy_statistics SET period_end = ?, total_signals = ?, \
             confirmed_signals = ?, invalidated_signals = ?, profitable_signals = ?, \
             losing_signals = ?, neutral_signals = ?, win_rate = ?, avg_profit_pct = ?, \
             avg_loss_pct = ?, avg_holding_hours = ?, best_profit_pct = ?, \
             worst_loss_pct = ?, profit_factor = ?, theoretical_win_rate = ?, \
             close_win_rate = ?, total_kline_hours = ?, profitable_kline_hours = ?, \
             avg_hourly_return_pct = ?, max_hourly_return_pct = ?, \
             min_hourly_return_pct = ?, avg_max_potential_profit_pct = ?, \
             avg_max_potential_loss_pct = ?, calculated_at = ? \
             WHERE strategy_name = ? AND symbol = ? AND period_label = ? AND period_start = ?",
        )
        .bind(ts_to_db(cell.period_end))
        .bind(cell.total_signals)
        .bind(cell.confirmed_signals)
        .bind(cell.invalidated_signals)
        .bind(cell.profitable_signals)
        .bind(cell.losing_signals)
        .bind(cell.neutral_signals)
        .bind(opt_dec_to_db(cell.win_rate))
        .bind(opt_dec_to_db(cell.avg_profit_pct))
        .bind(opt_dec_to_db(cell.avg_loss_pct))
        .bind(opt_dec_to_db(cell.avg_holding_hours))
        .bind(opt_dec_to_db(cell.best_profit_pct))
        .bind(opt_dec_to_db(cell.worst_loss_pct))
        .bind(opt_dec_to_db(cell.profit_factor))
        .bind(opt_dec_to_db(cell.theoretical_win_rate))
        .bind(opt_dec_to_db(cell.close_win_rate))
        .bind(cell.total_kline_hours)
        .bind(cell.profitable_kline_hours)
        .bind(opt_dec_to_db(cell.avg_hourly_return_pct))
        .bind(opt_dec_to_db(cell.max_hourly_return_pct))
        .bind(opt_dec_to_db(cell.min_hourly_return_pct))
        .bind(opt_dec_to_db(cell.avg_max_potential_profit_pct))
        .bind(opt_dec_to_db(cell.avg_max_potential_loss_pct))
        .bind(ts_to_db(cell.calculated_at))
        .bind(&cell.strategy_name)
        .bind(symbol_key(&cell.symbol))
        .bind(&cell.period_label)
        .bind(ts_to_db(cell.period_start))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// The most recent cell for (strategy, symbol, period_label) calculated
    /// strictly before `before`, regardless of its period_start. This is the
    /// baseline for change detection.
    pub async fn previous_statistics_cell(
        &self,
        strategy_name: &str,
        symbol: &Option<String>,
        period_label: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<StatisticsCell>, StoreError> {
        let row: Option<StatisticsRow> = sqlx::query_as(
            "SELECT * FROM strategy_statistics WHERE strategy_name = ? AND symbol = ? \
             AND period_label = ? AND calculated_at < ? \
             ORDER BY calculated_at DESC LIMIT 1",
        )
        .bind(strategy_name)
        .bind(symbol_key(symbol))
        .bind(period_label)
        .bind(ts_to_db(before))
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        row.map(StatisticsCell::try_from).transpose()
    }

    /// The cell currently stored under the uniqueness key, if any.
    pub async fn statistics_cell(
        &self,
        strategy_name: &str,
        symbol: &Option<String>,
        period_label: &str,
        period_start: DateTime<Utc>,
    ) -> Result<Option<StatisticsCell>, StoreError> {
        let row: Option<StatisticsRow> = sqlx::query_as(
            "SELECT * FROM strategy_statistics WHERE strategy_name = ? AND symbol = ? \
             AND period_label = ? AND period_start = ?",
        )
        .bind(strategy_name)
        .bind(symbol_key(symbol))
        .bind(period_label)
        .bind(ts_to_db(period_start))
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        row.map(StatisticsCell::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn cell(symbol: Option<String>, calculated_at: DateTime<Utc>) -> StatisticsCell {
        let period_start = calculated_at - Duration::hours(24);
        StatisticsCell {
            strategy_name: "minority_follower".into(),
            symbol,
            period_label: "24h".into(),
            period_start,
            period_end: calculated_at,
            total_signals: 10,
            confirmed_signals: 6,
            invalidated_signals: 4,
            profitable_signals: 4,
            losing_signals: 1,
            neutral_signals: 1,
            win_rate: Some(dec!(66.67)),
            avg_profit_pct: Some(dec!(4.1)),
            avg_loss_pct: Some(dec!(1.9)),
            avg_holding_hours: Some(dec!(12.5)),
            best_profit_pct: Some(dec!(9.0)),
            worst_loss_pct: Some(dec!(-2.5)),
            profit_factor: Some(dec!(3.2)),
            theoretical_win_rate: Some(dec!(70)),
            close_win_rate: Some(dec!(55)),
            total_kline_hours: 120,
            profitable_kline_hours: 66,
            avg_hourly_return_pct: Some(dec!(0.05)),
            max_hourly_return_pct: Some(dec!(2.4)),
            min_hourly_return_pct: Some(dec!(-1.8)),
            avg_max_potential_profit_pct: Some(dec!(1.2)),
            avg_max_potential_loss_pct: Some(dec!(-0.9)),
            calculated_at,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_same_key() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();

        let mut c = cell(None, now);
        store.upsert_statistics_cell(&c).await.unwrap();

        c.total_signals = 12;
        store.upsert_statistics_cell(&c).await.unwrap();

        let loaded = store
            .statistics_cell("minority_follower", &None, "24h", c.period_start)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.total_signals, 12);
    }

    #[tokio::test]
    async fn global_and_symbol_cells_are_distinct() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();

        store.upsert_statistics_cell(&cell(None, now)).await.unwrap();
        store
            .upsert_statistics_cell(&cell(Some("BTCUSDT".into()), now))
            .await
            .unwrap();

        let global = store
            .statistics_cell("minority_follower", &None, "24h", now - Duration::hours(24))
            .await
            .unwrap();
        let symbol = store
            .statistics_cell(
                "minority_follower",
                &Some("BTCUSDT".into()),
                "24h",
                now - Duration::hours(24),
            )
            .await
            .unwrap();
        assert!(global.is_some());
        assert_eq!(symbol.unwrap().symbol.as_deref(), Some("BTCUSDT"));
    }

    #[tokio::test]
    async fn previous_cell_ignores_period_start() {
        let store = Store::in_memory().await.unwrap();
        let earlier = Utc::now() - Duration::hours(6);
        let now = Utc::now();

        store.upsert_statistics_cell(&cell(None, earlier)).await.unwrap();
        store.upsert_statistics_cell(&cell(None, now)).await.unwrap();

        let previous = store
            .previous_statistics_cell("minority_follower", &None, "24h", now)
            .await
            .unwrap()
            .unwrap();
        assert!((previous.calculated_at - earlier).num_milliseconds().abs() < 1000);
    }
}
