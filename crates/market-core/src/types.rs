use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// One (symbol, timestamp) positioning observation assembled by the
/// collector. Immutable once persisted; pruned by the retention sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    /// Percent of accounts net long, 0-100.
    pub long_account_ratio: Decimal,
    /// Percent of accounts net short, 0-100.
    pub short_account_ratio: Decimal,
    /// Percent of top-trader position size net long, 0-100. Zero when the
    /// venue omits the series.
    pub long_position_ratio: Decimal,
    /// Percent of top-trader position size net short, 0-100.
    pub short_position_ratio: Decimal,
    pub position_ratio_available: bool,
    /// 0-100; 20 points deducted when the position ratio is missing.
    pub data_quality_score: Decimal,
    pub price: Decimal,
    pub volume_24h: Decimal,
    pub open_interest: Decimal,
    pub funding_rate: Decimal,
}

impl Snapshot {
    /// Check the persistence invariants. `now` is injected so sweeps are
    /// deterministic under test.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        let fail = |reason: String| ValidationError::Snapshot {
            symbol: self.symbol.clone(),
            reason,
        };

        if self.symbol.is_empty() {
            return Err(fail("empty symbol".into()));
        }
        if self.timestamp < now - Duration::hours(1) || self.timestamp > now + Duration::minutes(5)
        {
            return Err(fail(format!("timestamp {} out of window", self.timestamp)));
        }

        // Ratio sums may drift by one basis point of a percent upstream.
        let tolerance = Decimal::new(1, 2);
        let hundred = Decimal::ONE_HUNDRED;

        for (name, value) in [
            ("long_account_ratio", self.long_account_ratio),
            ("short_account_ratio", self.short_account_ratio),
        ] {
            if value < Decimal::ZERO || value > hundred {
                return Err(fail(format!("{name} {value} outside [0,100]")));
            }
        }

        let account_sum = self.long_account_ratio + self.short_account_ratio;
        if (account_sum - hundred).abs() > tolerance {
            return Err(fail(format!("account ratios sum to {account_sum}")));
        }

        if self.position_ratio_available {
            let position_sum = self.long_position_ratio + self.short_position_ratio;
            if (position_sum - hundred).abs() > tolerance {
                return Err(fail(format!("position ratios sum to {position_sum}")));
            }
        } else if !self.long_position_ratio.is_zero() || !self.short_position_ratio.is_zero() {
            return Err(fail("position ratios must be zero when unavailable".into()));
        }

        if self.price <= Decimal::ZERO {
            return Err(fail(format!("non-positive price {}", self.price)));
        }
        if self.open_interest < Decimal::ZERO {
            return Err(fail(format!("negative open interest {}", self.open_interest)));
        }
        if self.data_quality_score < Decimal::ZERO || self.data_quality_score > hundred {
            return Err(fail(format!(
                "data quality score {} outside [0,100]",
                self.data_quality_score
            )));
        }

        Ok(())
    }
}

/// Registry entry for a quoted contract. Symbols dropped by the venue are
/// deactivated, never deleted, so historical signals keep resolving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingPair {
    pub symbol: String,
    pub is_active: bool,
}

/// Symbol metadata from the venue's exchange information endpoint.
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: String,
    pub quote_asset: String,
    pub status: String,
}

impl SymbolInfo {
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

/// One long/short ratio observation, already normalized to percent.
#[derive(Debug, Clone)]
pub struct RatioSample {
    pub symbol: String,
    pub long_ratio: Decimal,
    pub short_ratio: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// 24-hour rolling ticker stats.
#[derive(Debug, Clone)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: Decimal,
    pub quote_volume: Decimal,
}

/// One OHLCV bar with venue open/close instants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Kline {
    pub fn body(&self) -> Decimal {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> Decimal {
        self.high - self.low
    }

    pub fn upper_wick(&self) -> Decimal {
        self.high - self.open.max(self.close)
    }

    pub fn lower_wick(&self) -> Decimal {
        self.open.min(self.close) - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(now: DateTime<Utc>) -> Snapshot {
        Snapshot {
            symbol: "BTCUSDT".into(),
            timestamp: now,
            long_account_ratio: dec!(62.5),
            short_account_ratio: dec!(37.5),
            long_position_ratio: dec!(55),
            short_position_ratio: dec!(45),
            position_ratio_available: true,
            data_quality_score: dec!(100),
            price: dec!(50000),
            volume_24h: dec!(1000000),
            open_interest: dec!(250000),
            funding_rate: dec!(0.0001),
        }
    }

    #[test]
    fn valid_snapshot_passes() {
        let now = Utc::now();
        assert!(snapshot(now).validate(now).is_ok());
    }

    #[test]
    fn ratio_sum_tolerance_is_enforced() {
        let now = Utc::now();
        let mut snap = snapshot(now);
        snap.long_account_ratio = dec!(62.52);
        // 62.52 + 37.5 = 100.02 > 100.01 tolerance
        assert!(snap.validate(now).is_err());

        snap.long_account_ratio = dec!(62.51);
        assert!(snap.validate(now).is_ok());
    }

    #[test]
    fn stale_timestamp_rejected() {
        let now = Utc::now();
        let mut snap = snapshot(now);
        snap.timestamp = now - Duration::hours(2);
        assert!(snap.validate(now).is_err());
    }

    #[test]
    fn future_timestamp_rejected_beyond_clock_skew() {
        let now = Utc::now();
        let mut snap = snapshot(now);
        snap.timestamp = now + Duration::minutes(4);
        assert!(snap.validate(now).is_ok());
        snap.timestamp = now + Duration::minutes(6);
        assert!(snap.validate(now).is_err());
    }

    #[test]
    fn zero_price_rejected() {
        let now = Utc::now();
        let mut snap = snapshot(now);
        snap.price = dec!(0);
        assert!(snap.validate(now).is_err());
    }

    #[test]
    fn missing_position_ratio_requires_zeroes() {
        let now = Utc::now();
        let mut snap = snapshot(now);
        snap.position_ratio_available = false;
        assert!(snap.validate(now).is_err());

        snap.long_position_ratio = dec!(0);
        snap.short_position_ratio = dec!(0);
        snap.data_quality_score = dec!(80);
        assert!(snap.validate(now).is_ok());
    }

    #[test]
    fn kline_anatomy() {
        let k = Kline {
            open_time: Utc::now(),
            close_time: Utc::now(),
            open: dec!(100),
            high: dec!(110),
            low: dec!(98),
            close: dec!(102),
            volume: dec!(5),
        };
        assert_eq!(k.body(), dec!(2));
        assert_eq!(k.range(), dec!(12));
        assert_eq!(k.upper_wick(), dec!(8));
        assert_eq!(k.lower_wick(), dec!(2));
        assert!(k.is_bullish());
    }
}
