//! `FromRow` structs mirroring the table layouts, plus conversions into the
//! domain types. Columns arrive in the portable string formats described in
//! `codec`.

use market_core::{
    Signal, SignalKlineTracking, SignalOutcome, SignalTracking, Snapshot, StatisticsCell,
    StoreError, TradingPair,
};
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

use crate::codec::*;

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Database(format!("bad uuid '{raw}': {e}")))
}

#[derive(sqlx::FromRow)]
pub struct PairRow {
    pub symbol: String,
    pub is_active: i64,
}

impl From<PairRow> for TradingPair {
    fn from(row: PairRow) -> Self {
        TradingPair {
            symbol: row.symbol,
            is_active: flag_from_db(row.is_active),
        }
    }
}

#[derive(sqlx::FromRow)]
pub struct SnapshotRow {
    pub symbol: String,
    pub timestamp: String,
    pub long_account_ratio: String,
    pub short_account_ratio: String,
    pub long_position_ratio: String,
    pub short_position_ratio: String,
    pub position_ratio_available: i64,
    pub data_quality_score: String,
    pub price: String,
    pub volume_24h: String,
    pub open_interest: String,
    pub funding_rate: String,
}

impl TryFrom<SnapshotRow> for Snapshot {
    type Error = StoreError;

    fn try_from(row: SnapshotRow) -> Result<Self, Self::Error> {
        Ok(Snapshot {
            symbol: row.symbol,
            timestamp: ts_from_db(&row.timestamp)?,
            long_account_ratio: dec_from_db(&row.long_account_ratio)?,
            short_account_ratio: dec_from_db(&row.short_account_ratio)?,
            long_position_ratio: dec_from_db(&row.long_position_ratio)?,
            short_position_ratio: dec_from_db(&row.short_position_ratio)?,
            position_ratio_available: flag_from_db(row.position_ratio_available),
            data_quality_score: dec_from_db(&row.data_quality_score)?,
            price: dec_from_db(&row.price)?,
            volume_24h: dec_from_db(&row.volume_24h)?,
            open_interest: dec_from_db(&row.open_interest)?,
            funding_rate: dec_from_db(&row.funding_rate)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct SignalRow {
    pub signal_id: String,
    pub symbol: String,
    pub direction: String,
    pub strategy_name: String,
    pub generated_at: String,
    pub price_at_signal: String,
    pub long_account_ratio: String,
    pub short_account_ratio: String,
    pub long_position_ratio: String,
    pub short_position_ratio: String,
    pub confirmation_start: String,
    pub confirmation_end: String,
    pub is_confirmed: i64,
    pub confirmed_at: Option<String>,
    pub status: String,
    pub reason: String,
    pub config_snapshot: String,
    pub stop_loss_price: Option<String>,
    pub target_price_1: Option<String>,
    pub target_price_2: Option<String>,
    pub trailing_stop_pct: Option<String>,
    pub trailing_activation_pct: Option<String>,
    pub exit_price: Option<String>,
    pub exit_reason: Option<String>,
}

impl TryFrom<SignalRow> for Signal {
    type Error = StoreError;

    fn try_from(row: SignalRow) -> Result<Self, Self::Error> {
        let config_snapshot: BTreeMap<String, String> = serde_json::from_str(&row.config_snapshot)
            .map_err(|e| StoreError::Database(format!("bad config snapshot: {e}")))?;

        Ok(Signal {
            signal_id: parse_uuid(&row.signal_id)?,
            symbol: row.symbol,
            direction: row.direction.parse().map_err(StoreError::Database)?,
            strategy_name: row.strategy_name,
            generated_at: ts_from_db(&row.generated_at)?,
            price_at_signal: dec_from_db(&row.price_at_signal)?,
            long_account_ratio: dec_from_db(&row.long_account_ratio)?,
            short_account_ratio: dec_from_db(&row.short_account_ratio)?,
            long_position_ratio: dec_from_db(&row.long_position_ratio)?,
            short_position_ratio: dec_from_db(&row.short_position_ratio)?,
            confirmation_start: ts_from_db(&row.confirmation_start)?,
            confirmation_end: ts_from_db(&row.confirmation_end)?,
            is_confirmed: flag_from_db(row.is_confirmed),
            confirmed_at: opt_ts_from_db(row.confirmed_at.as_deref())?,
            status: row.status.parse().map_err(StoreError::Database)?,
            reason: row.reason,
            config_snapshot,
            stop_loss_price: opt_dec_from_db(row.stop_loss_price.as_deref())?,
            target_price_1: opt_dec_from_db(row.target_price_1.as_deref())?,
            target_price_2: opt_dec_from_db(row.target_price_2.as_deref())?,
            trailing_stop_pct: opt_dec_from_db(row.trailing_stop_pct.as_deref())?,
            trailing_activation_pct: opt_dec_from_db(row.trailing_activation_pct.as_deref())?,
            exit_price: opt_dec_from_db(row.exit_price.as_deref())?,
            exit_reason: row
                .exit_reason
                .as_deref()
                .map(market_core::ExitReason::from_str)
                .transpose()
                .map_err(StoreError::Database)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct TrackingRow {
    pub signal_id: String,
    pub tracked_at: String,
    pub current_price: String,
    pub price_change_pct: String,
    pub highest_price: String,
    pub highest_price_pct: String,
    pub highest_price_at: String,
    pub lowest_price: String,
    pub lowest_price_pct: String,
    pub lowest_price_at: String,
    pub hours_elapsed: String,
}

impl TryFrom<TrackingRow> for SignalTracking {
    type Error = StoreError;

    fn try_from(row: TrackingRow) -> Result<Self, Self::Error> {
        Ok(SignalTracking {
            signal_id: parse_uuid(&row.signal_id)?,
            tracked_at: ts_from_db(&row.tracked_at)?,
            current_price: dec_from_db(&row.current_price)?,
            price_change_pct: dec_from_db(&row.price_change_pct)?,
            highest_price: dec_from_db(&row.highest_price)?,
            highest_price_pct: dec_from_db(&row.highest_price_pct)?,
            highest_price_at: ts_from_db(&row.highest_price_at)?,
            lowest_price: dec_from_db(&row.lowest_price)?,
            lowest_price_pct: dec_from_db(&row.lowest_price_pct)?,
            lowest_price_at: ts_from_db(&row.lowest_price_at)?,
            hours_elapsed: dec_from_db(&row.hours_elapsed)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct KlineTrackingRow {
    pub signal_id: String,
    pub open_time: String,
    pub close_time: String,
    pub open: String,
    pub high: String,
    pub low: String,
    pub close: String,
    pub volume: String,
    pub open_change_pct: String,
    pub high_change_pct: String,
    pub low_change_pct: String,
    pub close_change_pct: String,
    pub hourly_return_pct: String,
    pub is_profitable_at_high: i64,
    pub is_profitable_at_close: i64,
    pub max_potential_profit_pct: String,
    pub max_potential_loss_pct: String,
}

impl TryFrom<KlineTrackingRow> for SignalKlineTracking {
    type Error = StoreError;

    fn try_from(row: KlineTrackingRow) -> Result<Self, Self::Error> {
        Ok(SignalKlineTracking {
            signal_id: parse_uuid(&row.signal_id)?,
            open_time: ts_from_db(&row.open_time)?,
            close_time: ts_from_db(&row.close_time)?,
            open: dec_from_db(&row.open)?,
            high: dec_from_db(&row.high)?,
            low: dec_from_db(&row.low)?,
            close: dec_from_db(&row.close)?,
            volume: dec_from_db(&row.volume)?,
            open_change_pct: dec_from_db(&row.open_change_pct)?,
            high_change_pct: dec_from_db(&row.high_change_pct)?,
            low_change_pct: dec_from_db(&row.low_change_pct)?,
            close_change_pct: dec_from_db(&row.close_change_pct)?,
            hourly_return_pct: dec_from_db(&row.hourly_return_pct)?,
            is_profitable_at_high: flag_from_db(row.is_profitable_at_high),
            is_profitable_at_close: flag_from_db(row.is_profitable_at_close),
            max_potential_profit_pct: dec_from_db(&row.max_potential_profit_pct)?,
            max_potential_loss_pct: dec_from_db(&row.max_potential_loss_pct)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct OutcomeRow {
    pub signal_id: String,
    pub outcome: String,
    pub max_favorable_move_pct: String,
    pub max_adverse_move_pct: String,
    pub final_price_change_pct: String,
    pub hours_to_peak: Option<String>,
    pub hours_to_trough: Option<String>,
    pub total_tracking_hours: String,
    pub profit_target_hit: i64,
    pub stop_loss_hit: i64,
    pub closed_at: String,
}

impl TryFrom<OutcomeRow> for SignalOutcome {
    type Error = StoreError;

    fn try_from(row: OutcomeRow) -> Result<Self, Self::Error> {
        Ok(SignalOutcome {
            signal_id: parse_uuid(&row.signal_id)?,
            outcome: row.outcome.parse().map_err(StoreError::Database)?,
            max_favorable_move_pct: dec_from_db(&row.max_favorable_move_pct)?,
            max_adverse_move_pct: dec_from_db(&row.max_adverse_move_pct)?,
            final_price_change_pct: dec_from_db(&row.final_price_change_pct)?,
            hours_to_peak: opt_dec_from_db(row.hours_to_peak.as_deref())?,
            hours_to_trough: opt_dec_from_db(row.hours_to_trough.as_deref())?,
            total_tracking_hours: dec_from_db(&row.total_tracking_hours)?,
            profit_target_hit: flag_from_db(row.profit_target_hit),
            stop_loss_hit: flag_from_db(row.stop_loss_hit),
            closed_at: ts_from_db(&row.closed_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
pub struct StatisticsRow {
    pub strategy_name: String,
    pub symbol: String,
    pub period_label: String,
    pub period_start: String,
    pub period_end: String,
    pub total_signals: i64,
    pub confirmed_signals: i64,
    pub invalidated_signals: i64,
    pub profitable_signals: i64,
    pub losing_signals: i64,
    pub neutral_signals: i64,
    pub win_rate: Option<String>,
    pub avg_profit_pct: Option<String>,
    pub avg_loss_pct: Option<String>,
    pub avg_holding_hours: Option<String>,
    pub best_profit_pct: Option<String>,
    pub worst_loss_pct: Option<String>,
    pub profit_factor: Option<String>,
    pub theoretical_win_rate: Option<String>,
    pub close_win_rate: Option<String>,
    pub total_kline_hours: i64,
    pub profitable_kline_hours: i64,
    pub avg_hourly_return_pct: Option<String>,
    pub max_hourly_return_pct: Option<String>,
    pub min_hourly_return_pct: Option<String>,
    pub avg_max_potential_profit_pct: Option<String>,
    pub avg_max_potential_loss_pct: Option<String>,
    pub calculated_at: String,
}

impl TryFrom<StatisticsRow> for StatisticsCell {
    type Error = StoreError;

    fn try_from(row: StatisticsRow) -> Result<Self, Self::Error> {
        Ok(StatisticsCell {
            strategy_name: row.strategy_name,
            // The empty string is the storage form of the global cell.
            symbol: if row.symbol.is_empty() {
                None
            } else {
                Some(row.symbol)
            },
            period_label: row.period_label,
            period_start: ts_from_db(&row.period_start)?,
            period_end: ts_from_db(&row.period_end)?,
            total_signals: row.total_signals,
            confirmed_signals: row.confirmed_signals,
            invalidated_signals: row.invalidated_signals,
            profitable_signals: row.profitable_signals,
            losing_signals: row.losing_signals,
            neutral_signals: row.neutral_signals,
            win_rate: opt_dec_from_db(row.win_rate.as_deref())?,
            avg_profit_pct: opt_dec_from_db(row.avg_profit_pct.as_deref())?,
            avg_loss_pct: opt_dec_from_db(row.avg_loss_pct.as_deref())?,
            avg_holding_hours: opt_dec_from_db(row.avg_holding_hours.as_deref())?,
            best_profit_pct: opt_dec_from_db(row.best_profit_pct.as_deref())?,
            worst_loss_pct: opt_dec_from_db(row.worst_loss_pct.as_deref())?,
            profit_factor: opt_dec_from_db(row.profit_factor.as_deref())?,
            theoretical_win_rate: opt_dec_from_db(row.theoretical_win_rate.as_deref())?,
            close_win_rate: opt_dec_from_db(row.close_win_rate.as_deref())?,
            total_kline_hours: row.total_kline_hours,
            profitable_kline_hours: row.profitable_kline_hours,
            avg_hourly_return_pct: opt_dec_from_db(row.avg_hourly_return_pct.as_deref())?,
            max_hourly_return_pct: opt_dec_from_db(row.max_hourly_return_pct.as_deref())?,
            min_hourly_return_pct: opt_dec_from_db(row.min_hourly_return_pct.as_deref())?,
            avg_max_potential_profit_pct: opt_dec_from_db(
                row.avg_max_potential_profit_pct.as_deref(),
            )?,
            avg_max_potential_loss_pct: opt_dec_from_db(row.avg_max_potential_loss_pct.as_deref())?,
            calculated_at: ts_from_db(&row.calculated_at)?,
        })
    }
}
