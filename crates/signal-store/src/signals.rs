use chrono::{DateTime, Utc};
use market_core::{Signal, SignalStatus, StoreError};

use crate::codec::{dec_to_db, flag_to_db, opt_dec_to_db, opt_ts_to_db, ts_from_db, ts_to_db};
use crate::rows::SignalRow;
use crate::{map_sqlx_err, Store};

impl Store {
    pub async fn insert_signal(&self, signal: &Signal) -> Result<(), StoreError> {
        let config_snapshot = serde_json::to_string(&signal.config_snapshot)
            .map_err(|e| StoreError::Database(format!("config snapshot encode: {e}")))?;

        sqlx::query(
            "INSERT INTO signals (signal_id, symbol, direction, strategy_name, generated_at, \
             price_at_signal, long_account_ratio, short_account_ratio, long_position_ratio, \
             short_position_ratio, confirmation_start, confirmation_end, is_confirmed, \
             confirmed_at, status, reason, config_snapshot, stop_loss_price, target_price_1, \
             target_price_2, trailing_stop_pct, trailing_activation_pct, exit_price, \
             exit_reason, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(signal.signal_id.to_string())
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(&signal.strategy_name)
        .bind(ts_to_db(signal.generated_at))
        .bind(dec_to_db(signal.price_at_signal))
        .bind(dec_to_db(signal.long_account_ratio))
        .bind(dec_to_db(signal.short_account_ratio))
        .bind(dec_to_db(signal.long_position_ratio))
        .bind(dec_to_db(signal.short_position_ratio))
        .bind(ts_to_db(signal.confirmation_start))
        .bind(ts_to_db(signal.confirmation_end))
        .bind(flag_to_db(signal.is_confirmed))
        .bind(opt_ts_to_db(signal.confirmed_at))
        .bind(signal.status.as_str())
        .bind(&signal.reason)
        .bind(config_snapshot)
        .bind(opt_dec_to_db(signal.stop_loss_price))
        .bind(opt_dec_to_db(signal.target_price_1))
        .bind(opt_dec_to_db(signal.target_price_2))
        .bind(opt_dec_to_db(signal.trailing_stop_pct))
        .bind(opt_dec_to_db(signal.trailing_activation_pct))
        .bind(opt_dec_to_db(signal.exit_price))
        .bind(signal.exit_reason.map(|r| r.as_str()))
        .bind(ts_to_db(Utc::now()))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Targeted column-set update. `created_at` is deliberately not in the
    /// set so a rewrite can never corrupt the insertion timestamp.
    pub async fn update_signal(&self, signal: &Signal) -> Result<(), StoreError> {
        let config_snapshot = serde_json::to_string(&signal.config_snapshot)
            .map_err(|e| StoreError::Database(format!("config snapshot encode: {e}")))?;

        let result = sqlx::query(
            "UPDATE signals SET symbol = ?, direction = ?, strategy_name = ?, \
             generated_at = ?, price_at_signal = ?, long_account_ratio = ?, \
             short_account_ratio = ?, long_position_ratio = ?, short_position_ratio = ?, \
             confirmation_start = ?, confirmation_end = ?, is_confirmed = ?, confirmed_at = ?, \
             status = ?, reason = ?, config_snapshot = ?, stop_loss_price = ?, \
             target_price_1 = ?, target_price_2 = ?, trailing_stop_pct = ?, \
             trailing_activation_pct = ?, exit_price = ?, exit_reason = ? \
             WHERE signal_id = ?",
        )
        .bind(&signal.symbol)
        .bind(signal.direction.as_str())
        .bind(&signal.strategy_name)
        .bind(ts_to_db(signal.generated_at))
        .bind(dec_to_db(signal.price_at_signal))
        .bind(dec_to_db(signal.long_account_ratio))
        .bind(dec_to_db(signal.short_account_ratio))
        .bind(dec_to_db(signal.long_position_ratio))
        .bind(dec_to_db(signal.short_position_ratio))
        .bind(ts_to_db(signal.confirmation_start))
        .bind(ts_to_db(signal.confirmation_end))
        .bind(flag_to_db(signal.is_confirmed))
        .bind(opt_ts_to_db(signal.confirmed_at))
        .bind(signal.status.as_str())
        .bind(&signal.reason)
        .bind(config_snapshot)
        .bind(opt_dec_to_db(signal.stop_loss_price))
        .bind(opt_dec_to_db(signal.target_price_1))
        .bind(opt_dec_to_db(signal.target_price_2))
        .bind(opt_dec_to_db(signal.trailing_stop_pct))
        .bind(opt_dec_to_db(signal.trailing_activation_pct))
        .bind(opt_dec_to_db(signal.exit_price))
        .bind(signal.exit_reason.map(|r| r.as_str()))
        .bind(signal.signal_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(signal.signal_id.to_string()));
        }

        Ok(())
    }

    /// PENDING signals whose confirmation window has elapsed.
    pub async fn pending_signals_due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Signal>, StoreError> {
        let rows: Vec<SignalRow> = sqlx::query_as(
            "SELECT * FROM signals WHERE status = ? AND confirmation_end <= ? \
             ORDER BY confirmation_end",
        )
        .bind(SignalStatus::Pending.as_str())
        .bind(ts_to_db(now))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter().map(Signal::try_from).collect()
    }

    /// The union of CONFIRMED and TRACKING signals the tick tracker walks.
    pub async fn signals_to_track(&self) -> Result<Vec<Signal>, StoreError> {
        let rows: Vec<SignalRow> = sqlx::query_as(
            "SELECT * FROM signals WHERE status IN (?, ?) ORDER BY symbol, generated_at",
        )
        .bind(SignalStatus::Confirmed.as_str())
        .bind(SignalStatus::Tracking.as_str())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter().map(Signal::try_from).collect()
    }

    /// Count of non-terminal signals on a symbol (concurrency cap input).
    pub async fn active_signal_count(&self, symbol: &str) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM signals WHERE symbol = ? AND status IN (?, ?, ?)",
        )
        .bind(symbol)
        .bind(SignalStatus::Pending.as_str())
        .bind(SignalStatus::Confirmed.as_str())
        .bind(SignalStatus::Tracking.as_str())
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(count)
    }

    /// When the most recent signal on a symbol was generated, across all
    /// strategies (cooldown input).
    pub async fn latest_signal_generated_at(
        &self,
        symbol: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT generated_at FROM signals WHERE symbol = ? \
             ORDER BY generated_at DESC LIMIT 1",
        )
        .bind(symbol)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        row.map(|(raw,)| ts_from_db(&raw)).transpose()
    }

    /// All signals for one strategy generated inside `[from, to]`.
    pub async fn signals_in_window(
        &self,
        strategy_name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Signal>, StoreError> {
        let rows: Vec<SignalRow> = sqlx::query_as(
            "SELECT * FROM signals WHERE strategy_name = ? AND generated_at >= ? \
             AND generated_at <= ? ORDER BY generated_at",
        )
        .bind(strategy_name)
        .bind(ts_to_db(from))
        .bind(ts_to_db(to))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter().map(Signal::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use market_core::SignalDirection;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn signal(symbol: &str, generated_at: DateTime<Utc>) -> Signal {
        Signal::pending(
            symbol,
            SignalDirection::Short,
            "minority_follower",
            generated_at,
            dec!(50000),
            (dec!(80), dec!(20), dec!(55), dec!(45)),
            4,
            "LONG ratio is 80.00%".into(),
            BTreeMap::from([("profit_target_pct".into(), "5".into())]),
        )
    }

    #[tokio::test]
    async fn signal_round_trip_preserves_fields() {
        let store = Store::in_memory().await.unwrap();
        let generated_at = Utc::now() - Duration::hours(5);
        let original = signal("BTCUSDT", generated_at);
        store.insert_signal(&original).await.unwrap();

        let due = store.pending_signals_due(Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);
        let loaded = &due[0];
        assert_eq!(loaded.signal_id, original.signal_id);
        assert_eq!(loaded.direction, SignalDirection::Short);
        assert_eq!(loaded.price_at_signal, dec!(50000));
        assert_eq!(
            loaded.config_snapshot.get("profit_target_pct"),
            Some(&"5".to_string())
        );
        assert_eq!(loaded.confirmation_end - loaded.generated_at, Duration::hours(4));
    }

    #[tokio::test]
    async fn pending_due_excludes_open_windows() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();

        store.insert_signal(&signal("BTCUSDT", now - Duration::hours(5))).await.unwrap();
        store.insert_signal(&signal("ETHUSDT", now - Duration::hours(1))).await.unwrap();

        let due = store.pending_signals_due(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn status_update_moves_between_query_sets() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        let mut s = signal("BTCUSDT", now - Duration::hours(5));
        store.insert_signal(&s).await.unwrap();

        s.confirm(now).unwrap();
        store.update_signal(&s).await.unwrap();

        assert!(store.pending_signals_due(now).await.unwrap().is_empty());
        let to_track = store.signals_to_track().await.unwrap();
        assert_eq!(to_track.len(), 1);
        assert!(to_track[0].is_confirmed);
        assert!(to_track[0].confirmed_at.is_some());
    }

    #[tokio::test]
    async fn active_count_and_cooldown_queries() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();
        let newest = now - Duration::hours(1);

        store.insert_signal(&signal("BTCUSDT", now - Duration::hours(9))).await.unwrap();
        store.insert_signal(&signal("BTCUSDT", newest)).await.unwrap();

        assert_eq!(store.active_signal_count("BTCUSDT").await.unwrap(), 2);
        assert_eq!(store.active_signal_count("ETHUSDT").await.unwrap(), 0);

        let latest = store
            .latest_signal_generated_at("BTCUSDT")
            .await
            .unwrap()
            .unwrap();
        assert!((latest - newest).num_milliseconds().abs() < 1000);
    }

    #[tokio::test]
    async fn update_of_unknown_signal_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let s = signal("BTCUSDT", Utc::now());
        assert!(matches!(
            store.update_signal(&s).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
