use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::signal::SignalDirection;

/// Plain percentage change of `current` versus `base`. Returns zero when the
/// base is zero rather than dividing by it.
pub fn pct_change(base: Decimal, current: Decimal) -> Decimal {
    if base.is_zero() {
        return Decimal::ZERO;
    }
    ((current - base) / base * Decimal::ONE_HUNDRED).round_dp(4)
}

/// Direction-aware percentage change: profit is positive in the signal's
/// intended direction, so a price drop on a SHORT yields a positive change.
pub fn direction_change_pct(
    direction: SignalDirection,
    entry: Decimal,
    current: Decimal,
) -> Decimal {
    let raw = pct_change(entry, current);
    match direction {
        SignalDirection::Long => raw,
        SignalDirection::Short => -raw,
    }
}

/// Fractional hours between two instants, rounded to 4 decimal places.
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    let ms = (to - from).num_milliseconds();
    (Decimal::from(ms) / Decimal::from(3_600_000_i64)).round_dp(4)
}
