use chrono::{DateTime, Utc};
use market_core::{SignalKlineTracking, SignalTracking, StoreError};
use uuid::Uuid;

use crate::codec::{dec_to_db, flag_to_db, ts_from_db, ts_to_db};
use crate::rows::{KlineTrackingRow, TrackingRow};
use crate::{is_unique_violation, map_sqlx_err, Store};

impl Store {
    pub async fn insert_tracking(&self, tracking: &SignalTracking) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO signal_tracking (signal_id, tracked_at, current_price, \
             price_change_pct, highest_price, highest_price_pct, highest_price_at, \
             lowest_price, lowest_price_pct, lowest_price_at, hours_elapsed) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tracking.signal_id.to_string())
        .bind(ts_to_db(tracking.tracked_at))
        .bind(dec_to_db(tracking.current_price))
        .bind(dec_to_db(tracking.price_change_pct))
        .bind(dec_to_db(tracking.highest_price))
        .bind(dec_to_db(tracking.highest_price_pct))
        .bind(ts_to_db(tracking.highest_price_at))
        .bind(dec_to_db(tracking.lowest_price))
        .bind(dec_to_db(tracking.lowest_price_pct))
        .bind(ts_to_db(tracking.lowest_price_at))
        .bind(dec_to_db(tracking.hours_elapsed))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// The most recent tick row for a signal, carrying the running
    /// peak/trough forward.
    pub async fn latest_tracking(
        &self,
        signal_id: Uuid,
    ) -> Result<Option<SignalTracking>, StoreError> {
        let row: Option<TrackingRow> = sqlx::query_as(
            "SELECT * FROM signal_tracking WHERE signal_id = ? \
             ORDER BY tracked_at DESC LIMIT 1",
        )
        .bind(signal_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        row.map(SignalTracking::try_from).transpose()
    }

    /// Append one bar attribution. Duplicate (signal_id, open_time) rows are
    /// idempotent no-ops so bar-tracker re-runs never double-attribute.
    pub async fn insert_kline_tracking(
        &self,
        tracking: &SignalKlineTracking,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO signal_kline_tracking (signal_id, open_time, close_time, open, \
             high, low, close, volume, open_change_pct, high_change_pct, low_change_pct, \
             close_change_pct, hourly_return_pct, is_profitable_at_high, \
             is_profitable_at_close, max_potential_profit_pct, max_potential_loss_pct) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(tracking.signal_id.to_string())
        .bind(ts_to_db(tracking.open_time))
        .bind(ts_to_db(tracking.close_time))
        .bind(dec_to_db(tracking.open))
        .bind(dec_to_db(tracking.high))
        .bind(dec_to_db(tracking.low))
        .bind(dec_to_db(tracking.close))
        .bind(dec_to_db(tracking.volume))
        .bind(dec_to_db(tracking.open_change_pct))
        .bind(dec_to_db(tracking.high_change_pct))
        .bind(dec_to_db(tracking.low_change_pct))
        .bind(dec_to_db(tracking.close_change_pct))
        .bind(dec_to_db(tracking.hourly_return_pct))
        .bind(flag_to_db(tracking.is_profitable_at_high))
        .bind(flag_to_db(tracking.is_profitable_at_close))
        .bind(dec_to_db(tracking.max_potential_profit_pct))
        .bind(dec_to_db(tracking.max_potential_loss_pct))
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(map_sqlx_err(err)),
        }
    }

    /// Close time of the last bar attributed to a signal, if any.
    pub async fn last_kline_close(
        &self,
        signal_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT close_time FROM signal_kline_tracking WHERE signal_id = ? \
             ORDER BY close_time DESC LIMIT 1",
        )
        .bind(signal_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        row.map(|(raw,)| ts_from_db(&raw)).transpose()
    }

    pub async fn kline_trackings(
        &self,
        signal_id: Uuid,
    ) -> Result<Vec<SignalKlineTracking>, StoreError> {
        let rows: Vec<KlineTrackingRow> = sqlx::query_as(
            "SELECT * FROM signal_kline_tracking WHERE signal_id = ? ORDER BY open_time",
        )
        .bind(signal_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.into_iter().map(SignalKlineTracking::try_from).collect()
    }
}
