use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

/// Trade direction of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalDirection {
    Long,
    Short,
}

impl SignalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::Long => "LONG",
            SignalDirection::Short => "SHORT",
        }
    }
}

impl fmt::Display for SignalDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(SignalDirection::Long),
            "SHORT" => Ok(SignalDirection::Short),
            other => Err(format!("unknown signal direction '{other}'")),
        }
    }
}

/// Lifecycle state of a signal.
///
/// PENDING -> CONFIRMED | INVALIDATED; CONFIRMED -> TRACKING;
/// TRACKING -> CLOSED. INVALIDATED and CLOSED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    Pending,
    Confirmed,
    Tracking,
    Invalidated,
    Closed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Pending => "PENDING",
            SignalStatus::Confirmed => "CONFIRMED",
            SignalStatus::Tracking => "TRACKING",
            SignalStatus::Invalidated => "INVALIDATED",
            SignalStatus::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SignalStatus::Invalidated | SignalStatus::Closed)
    }

    /// Non-terminal states count against the per-symbol concurrency cap.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    fn allows(&self, to: SignalStatus) -> bool {
        matches!(
            (self, to),
            (SignalStatus::Pending, SignalStatus::Confirmed)
                | (SignalStatus::Pending, SignalStatus::Invalidated)
                | (SignalStatus::Confirmed, SignalStatus::Tracking)
                | (SignalStatus::Tracking, SignalStatus::Closed)
        )
    }
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(SignalStatus::Pending),
            "CONFIRMED" => Ok(SignalStatus::Confirmed),
            "TRACKING" => Ok(SignalStatus::Tracking),
            "INVALIDATED" => Ok(SignalStatus::Invalidated),
            "CLOSED" => Ok(SignalStatus::Closed),
            other => Err(format!("unknown signal status '{other}'")),
        }
    }
}

/// Why the tick tracker closed a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Time,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "SL",
            ExitReason::TakeProfit => "TP",
            ExitReason::Time => "Time",
        }
    }
}

impl FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SL" => Ok(ExitReason::StopLoss),
            "TP" => Ok(ExitReason::TakeProfit),
            "Time" => Ok(ExitReason::Time),
            other => Err(format!("unknown exit reason '{other}'")),
        }
    }
}

/// Terminal P&L classification of a closed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Profit,
    Loss,
    Neutral,
    Timeout,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Profit => "PROFIT",
            OutcomeKind::Loss => "LOSS",
            OutcomeKind::Neutral => "NEUTRAL",
            OutcomeKind::Timeout => "TIMEOUT",
        }
    }
}

impl FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PROFIT" => Ok(OutcomeKind::Profit),
            "LOSS" => Ok(OutcomeKind::Loss),
            "NEUTRAL" => Ok(OutcomeKind::Neutral),
            "TIMEOUT" => Ok(OutcomeKind::Timeout),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// A directional trade idea produced by a strategy, carrying its
/// confirmation window, tracking parameters and an auditable copy of the
/// strategy configuration that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: Uuid,
    pub symbol: String,
    pub direction: SignalDirection,
    pub strategy_name: String,
    pub generated_at: DateTime<Utc>,
    pub price_at_signal: Decimal,
    pub long_account_ratio: Decimal,
    pub short_account_ratio: Decimal,
    pub long_position_ratio: Decimal,
    pub short_position_ratio: Decimal,
    pub confirmation_start: DateTime<Utc>,
    pub confirmation_end: DateTime<Utc>,
    pub is_confirmed: bool,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub status: SignalStatus,
    pub reason: String,
    /// Opaque parameter bag recorded at generation time. Compared by key
    /// lookup only, never structurally.
    pub config_snapshot: BTreeMap<String, String>,
    pub stop_loss_price: Option<Decimal>,
    pub target_price_1: Option<Decimal>,
    pub target_price_2: Option<Decimal>,
    pub trailing_stop_pct: Option<Decimal>,
    pub trailing_activation_pct: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
}

impl Signal {
    /// Build a fresh PENDING signal with its confirmation window anchored at
    /// `generated_at`.
    #[allow(clippy::too_many_arguments)]
    pub fn pending(
        symbol: &str,
        direction: SignalDirection,
        strategy_name: &str,
        generated_at: DateTime<Utc>,
        price_at_signal: Decimal,
        snapshot_ratios: (Decimal, Decimal, Decimal, Decimal),
        confirmation_hours: i64,
        reason: String,
        config_snapshot: BTreeMap<String, String>,
    ) -> Self {
        let (long_account, short_account, long_position, short_position) = snapshot_ratios;
        Self {
            signal_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            strategy_name: strategy_name.to_string(),
            generated_at,
            price_at_signal,
            long_account_ratio: long_account,
            short_account_ratio: short_account,
            long_position_ratio: long_position,
            short_position_ratio: short_position,
            confirmation_start: generated_at,
            confirmation_end: generated_at + Duration::hours(confirmation_hours),
            is_confirmed: false,
            confirmed_at: None,
            status: SignalStatus::Pending,
            reason,
            config_snapshot,
            stop_loss_price: None,
            target_price_1: None,
            target_price_2: None,
            trailing_stop_pct: None,
            trailing_activation_pct: None,
            exit_price: None,
            exit_reason: None,
        }
    }

    /// Look up a decimal parameter recorded at generation time.
    pub fn config_decimal(&self, key: &str) -> Option<Decimal> {
        self.config_snapshot
            .get(key)
            .and_then(|v| Decimal::from_str(v).ok())
    }

    fn transition_to(&mut self, to: SignalStatus) -> Result<(), ValidationError> {
        if self.status.is_terminal() {
            return Err(ValidationError::TerminalSignal {
                signal_id: self.signal_id.to_string(),
                status: self.status.to_string(),
            });
        }
        if !self.status.allows(to) {
            return Err(ValidationError::IllegalTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        Ok(())
    }

    /// PENDING -> CONFIRMED at the confirmation boundary.
    pub fn confirm(&mut self, at: DateTime<Utc>) -> Result<(), ValidationError> {
        self.transition_to(SignalStatus::Confirmed)?;
        self.is_confirmed = true;
        self.confirmed_at = Some(at);
        Ok(())
    }

    /// PENDING -> INVALIDATED (terminal) when conditions no longer hold.
    pub fn invalidate(&mut self, reason: &str) -> Result<(), ValidationError> {
        self.transition_to(SignalStatus::Invalidated)?;
        self.reason = format!("{} | invalidated: {}", self.reason, reason);
        Ok(())
    }

    /// CONFIRMED -> TRACKING on first tracker touch.
    pub fn begin_tracking(&mut self) -> Result<(), ValidationError> {
        self.transition_to(SignalStatus::Tracking)
    }

    /// TRACKING -> CLOSED (terminal) on SL, TP or timeout.
    pub fn close(&mut self, exit_price: Decimal, reason: ExitReason) -> Result<(), ValidationError> {
        self.transition_to(SignalStatus::Closed)?;
        self.exit_price = Some(exit_price);
        self.exit_reason = Some(reason);
        Ok(())
    }
}

/// Append-only tick observation attached to a signal. Peaks and troughs are
/// carried forward from the previous row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalTracking {
    pub signal_id: Uuid,
    pub tracked_at: DateTime<Utc>,
    pub current_price: Decimal,
    /// Direction-aware change versus the entry price.
    pub price_change_pct: Decimal,
    pub highest_price: Decimal,
    pub highest_price_pct: Decimal,
    pub highest_price_at: DateTime<Utc>,
    pub lowest_price: Decimal,
    pub lowest_price_pct: Decimal,
    pub lowest_price_at: DateTime<Utc>,
    pub hours_elapsed: Decimal,
}

/// One record per completed hourly bar after signal generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalKlineTracking {
    pub signal_id: Uuid,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub open_change_pct: Decimal,
    pub high_change_pct: Decimal,
    pub low_change_pct: Decimal,
    pub close_change_pct: Decimal,
    /// (close - open) / open * 100, direction-agnostic.
    pub hourly_return_pct: Decimal,
    pub is_profitable_at_high: bool,
    pub is_profitable_at_close: bool,
    pub max_potential_profit_pct: Decimal,
    pub max_potential_loss_pct: Decimal,
}

/// Terminal record of a signal's price behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalOutcome {
    pub signal_id: Uuid,
    pub outcome: OutcomeKind,
    pub max_favorable_move_pct: Decimal,
    pub max_adverse_move_pct: Decimal,
    pub final_price_change_pct: Decimal,
    pub hours_to_peak: Option<Decimal>,
    pub hours_to_trough: Option<Decimal>,
    pub total_tracking_hours: Decimal,
    pub profit_target_hit: bool,
    pub stop_loss_hit: bool,
    pub closed_at: DateTime<Utc>,
}

/// Rolled-up performance for one (strategy, symbol-or-global, period) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsCell {
    pub strategy_name: String,
    /// `None` is the global cell across all symbols.
    pub symbol: Option<String>,
    pub period_label: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_signals: i64,
    pub confirmed_signals: i64,
    pub invalidated_signals: i64,
    pub profitable_signals: i64,
    pub losing_signals: i64,
    pub neutral_signals: i64,
    pub win_rate: Option<Decimal>,
    pub avg_profit_pct: Option<Decimal>,
    pub avg_loss_pct: Option<Decimal>,
    pub avg_holding_hours: Option<Decimal>,
    pub best_profit_pct: Option<Decimal>,
    pub worst_loss_pct: Option<Decimal>,
    pub profit_factor: Option<Decimal>,
    pub theoretical_win_rate: Option<Decimal>,
    pub close_win_rate: Option<Decimal>,
    pub total_kline_hours: i64,
    pub profitable_kline_hours: i64,
    pub avg_hourly_return_pct: Option<Decimal>,
    pub max_hourly_return_pct: Option<Decimal>,
    pub min_hourly_return_pct: Option<Decimal>,
    pub avg_max_potential_profit_pct: Option<Decimal>,
    pub avg_max_potential_loss_pct: Option<Decimal>,
    pub calculated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn signal() -> Signal {
        Signal::pending(
            "BTCUSDT",
            SignalDirection::Short,
            "minority_follower",
            Utc::now(),
            dec!(50000),
            (dec!(80), dec!(20), dec!(55), dec!(45)),
            4,
            "LONG ratio is 80.00%".into(),
            BTreeMap::new(),
        )
    }

    #[test]
    fn confirmation_window_matches_configured_hours() {
        let s = signal();
        assert_eq!(s.confirmation_end - s.generated_at, Duration::hours(4));
        assert_eq!(s.confirmation_start, s.generated_at);
    }

    #[test]
    fn happy_path_transitions() {
        let mut s = signal();
        s.confirm(Utc::now()).unwrap();
        assert!(s.is_confirmed);
        assert!(s.confirmed_at.is_some());
        s.begin_tracking().unwrap();
        s.close(dec!(48000), ExitReason::TakeProfit).unwrap();
        assert_eq!(s.status, SignalStatus::Closed);
        assert_eq!(s.exit_price, Some(dec!(48000)));
    }

    #[test]
    fn invalidated_is_terminal() {
        let mut s = signal();
        s.invalidate("dominant side faded").unwrap();
        assert!(s.status.is_terminal());
        assert!(s.confirm(Utc::now()).is_err());
        assert!(s.begin_tracking().is_err());
    }

    #[test]
    fn closed_signal_rejects_further_transitions() {
        let mut s = signal();
        s.confirm(Utc::now()).unwrap();
        s.begin_tracking().unwrap();
        s.close(dec!(51000), ExitReason::StopLoss).unwrap();
        assert!(s.close(dec!(50000), ExitReason::Time).is_err());
    }

    #[test]
    fn pending_cannot_jump_to_tracking() {
        let mut s = signal();
        assert!(s.begin_tracking().is_err());
    }

    #[test]
    fn config_snapshot_lookup() {
        let mut s = signal();
        s.config_snapshot
            .insert("profit_target_pct".into(), "5".into());
        assert_eq!(s.config_decimal("profit_target_pct"), Some(dec!(5)));
        assert_eq!(s.config_decimal("missing"), None);
    }
}
