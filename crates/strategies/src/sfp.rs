use async_trait::async_trait;
use market_core::{
    Kline, MarketDataSource, Signal, SignalDirection, Snapshot, Strategy, StrategyError,
    StrategyParams,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::sync::Arc;

/// Bearish-only smart-money strategy: crowded retail longs paying funding
/// while whales lean the other way, triggered by a reversal candle at the
/// most recently completed bar.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmartMoneySfpSettings {
    pub enabled: bool,
    /// Retail crowding gate on the long account ratio, percent.
    pub min_long_account_ratio: Decimal,
    /// Number of bars in the swing lookback window.
    pub lookback_period: usize,
    /// Kline interval requested from the venue, e.g. `1h`.
    pub kline_interval: String,
    pub confirmation_hours: i64,
    pub tracking_hours: i64,
    pub profit_target_pct: Decimal,
    pub stop_loss_pct: Decimal,
}

impl Default for SmartMoneySfpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_long_account_ratio: dec!(70),
            lookback_period: 20,
            kline_interval: "1h".into(),
            confirmation_hours: 2,
            tracking_hours: 24,
            profit_target_pct: dec!(5),
            stop_loss_pct: dec!(2),
        }
    }
}

/// Which reversal shape fired at the trigger bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReversalPattern {
    SwingFailure,
    ShootingStar,
    BearishEngulfing,
}

impl ReversalPattern {
    fn label(&self) -> &'static str {
        match self {
            ReversalPattern::SwingFailure => "swing failure",
            ReversalPattern::ShootingStar => "shooting star",
            ReversalPattern::BearishEngulfing => "bearish engulfing",
        }
    }
}

/// Swing failure: the trigger bar's high pierces the lookback window's
/// highest high but its close falls back below it.
pub fn is_swing_failure(window: &[Kline], trigger: &Kline) -> bool {
    let Some(highest_high) = window.iter().map(|k| k.high).max() else {
        return false;
    };
    trigger.high > highest_high && trigger.close < highest_high
}

/// Shooting star: small body (<= 40% of the total range), long upper wick
/// (>= 2x body) and a lower wick no larger than the body.
pub fn is_shooting_star(trigger: &Kline) -> bool {
    let range = trigger.range();
    if range <= Decimal::ZERO {
        return false;
    }
    let body = trigger.body();
    body <= range * dec!(0.4)
        && trigger.upper_wick() >= body * dec!(2)
        && trigger.lower_wick() <= body
}

/// Bearish engulfing: prior bar green, trigger bar red, and the trigger body
/// fully engulfs the prior body (equality at the hinge counts).
pub fn is_bearish_engulfing(prior: &Kline, trigger: &Kline) -> bool {
    prior.is_bullish()
        && trigger.is_bearish()
        && trigger.open >= prior.close
        && trigger.close <= prior.open
}

pub struct SmartMoneySfp {
    settings: SmartMoneySfpSettings,
    params: StrategyParams,
    source: Arc<dyn MarketDataSource>,
}

impl SmartMoneySfp {
    pub const KEY: &'static str = "smartmoney";
    pub const NAME: &'static str = "smart_money_sfp";

    /// Stop-loss buffer above the trigger high.
    const STOP_BUFFER: Decimal = dec!(1.001);

    pub fn new(settings: SmartMoneySfpSettings, source: Arc<dyn MarketDataSource>) -> Self {
        let params = StrategyParams {
            confirmation_hours: settings.confirmation_hours,
            tracking_hours: settings.tracking_hours,
            profit_target_pct: settings.profit_target_pct,
            stop_loss_pct: settings.stop_loss_pct,
        };
        Self {
            settings,
            params,
            source,
        }
    }

    fn preconditions(&self, snap: &Snapshot) -> (bool, String) {
        if !snap.position_ratio_available {
            return (false, "position ratio unavailable".into());
        }
        if snap.long_account_ratio < self.settings.min_long_account_ratio {
            return (
                false,
                format!(
                    "long account ratio {:.2}% below {:.2}%",
                    snap.long_account_ratio, self.settings.min_long_account_ratio
                ),
            );
        }
        if snap.long_position_ratio >= snap.long_account_ratio {
            return (
                false,
                "whale positioning matches retail, no divergence".into(),
            );
        }
        if snap.funding_rate <= Decimal::ZERO {
            return (false, "funding is not positive, longs are not paying".into());
        }
        (
            true,
            format!(
                "retail {:.2}% long vs whales {:.2}%, funding {:.6} positive",
                snap.long_account_ratio, snap.long_position_ratio, snap.funding_rate
            ),
        )
    }

    /// Inspect the second-to-last bar (the most recently closed completed
    /// bar) for any of the three reversal shapes.
    fn detect(&self, bars: &[Kline]) -> Option<(ReversalPattern, Kline, Kline)> {
        let needed = self.settings.lookback_period + 2;
        if bars.len() < needed {
            return None;
        }

        let trigger = &bars[bars.len() - 2];
        let prior = &bars[bars.len() - 3];
        let window = &bars[bars.len() - 2 - self.settings.lookback_period..bars.len() - 2];

        let pattern = if is_swing_failure(window, trigger) {
            ReversalPattern::SwingFailure
        } else if is_shooting_star(trigger) {
            ReversalPattern::ShootingStar
        } else if is_bearish_engulfing(prior, trigger) {
            ReversalPattern::BearishEngulfing
        } else {
            return None;
        };

        Some((pattern, trigger.clone(), prior.clone()))
    }

    /// SL above the invalidation high, TP1 at the window low, TP2 at a fixed
    /// 1:3 risk multiple below entry.
    fn trade_levels(
        &self,
        entry: Decimal,
        pattern: ReversalPattern,
        trigger: &Kline,
        prior: &Kline,
        window: &[Kline],
    ) -> (Decimal, Decimal, Decimal) {
        let invalidation_high = if pattern == ReversalPattern::BearishEngulfing {
            trigger.high.max(prior.high)
        } else {
            trigger.high
        };
        let stop_loss = invalidation_high * Self::STOP_BUFFER;

        let target_1 = window
            .iter()
            .map(|k| k.low)
            .min()
            .unwrap_or(entry);

        let mut risk = stop_loss - entry;
        if risk <= Decimal::ZERO {
            risk = entry * dec!(0.01);
        }
        let target_2 = entry - risk * dec!(3);

        (stop_loss, target_1, target_2)
    }

    fn config_snapshot(
        &self,
        pattern: ReversalPattern,
    ) -> std::collections::BTreeMap<String, String> {
        let mut bag = crate::base_config_snapshot(&self.params);
        bag.insert(
            "min_long_account_ratio".into(),
            self.settings.min_long_account_ratio.to_string(),
        );
        bag.insert(
            "lookback_period".into(),
            self.settings.lookback_period.to_string(),
        );
        bag.insert("kline_interval".into(), self.settings.kline_interval.clone());
        bag.insert("pattern".into(), pattern.label().to_string());
        bag
    }
}

#[async_trait]
impl Strategy for SmartMoneySfp {
    fn key(&self) -> &'static str {
        Self::KEY
    }

    fn name(&self) -> &str {
        Self::NAME
    }

    fn enabled(&self) -> bool {
        self.settings.enabled
    }

    fn params(&self) -> &StrategyParams {
        &self.params
    }

    async fn analyze(&self, window: &[Snapshot]) -> Result<Vec<Signal>, StrategyError> {
        let Some(latest) = window.first() else {
            return Ok(Vec::new());
        };

        let (hold, reason) = self.preconditions(latest);
        if !hold {
            tracing::trace!(symbol = %latest.symbol, reason, "smart money SFP quiet");
            return Ok(Vec::new());
        }

        let limit = (self.settings.lookback_period + 2) as u32;
        let bars = self
            .source
            .klines(&latest.symbol, &self.settings.kline_interval, limit)
            .await?;

        let Some((pattern, trigger, prior)) = self.detect(&bars) else {
            return Ok(Vec::new());
        };

        let lookback = &bars[bars.len() - 2 - self.settings.lookback_period..bars.len() - 2];
        let entry = latest.price;
        let (stop_loss, target_1, target_2) =
            self.trade_levels(entry, pattern, &trigger, &prior, lookback);

        let mut signal = Signal::pending(
            &latest.symbol,
            SignalDirection::Short,
            Self::NAME,
            latest.timestamp,
            entry,
            (
                latest.long_account_ratio,
                latest.short_account_ratio,
                latest.long_position_ratio,
                latest.short_position_ratio,
            ),
            self.params.confirmation_hours,
            format!("{reason}; {} at the last completed bar", pattern.label()),
            self.config_snapshot(pattern),
        );
        signal.stop_loss_price = Some(stop_loss);
        signal.target_price_1 = Some(target_1);
        signal.target_price_2 = Some(target_2);

        tracing::debug!(
            symbol = %latest.symbol,
            pattern = pattern.label(),
            %entry,
            %stop_loss,
            %target_1,
            %target_2,
            "smart money SFP signal"
        );

        Ok(vec![signal])
    }

    fn should_generate(&self, latest: &Snapshot) -> (bool, String) {
        // The candle trigger needs bars; this gate only covers the
        // positioning preconditions.
        self.preconditions(latest)
    }

    fn validate_confirmation(&self, _signal: &Signal, current: &Snapshot) -> (bool, String) {
        // The historical candle pattern is fact; re-check only that the
        // positioning backdrop still favors the short.
        self.preconditions(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use market_core::testing::FakeMarketData;

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal, idx: i64) -> Kline {
        let open_time = Utc::now() - Duration::hours(30 - idx);
        Kline {
            open_time,
            close_time: open_time + Duration::hours(1) - Duration::milliseconds(1),
            open,
            high,
            low,
            close,
            volume: dec!(100),
        }
    }

    /// A flat 20-bar lookback window topped at 105 with lows at 95.
    fn flat_window() -> Vec<Kline> {
        (0..20)
            .map(|i| bar(dec!(100), dec!(105), dec!(95), dec!(101), i))
            .collect()
    }

    fn crowded_snapshot() -> Snapshot {
        Snapshot {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            long_account_ratio: dec!(78),
            short_account_ratio: dec!(22),
            long_position_ratio: dec!(52),
            short_position_ratio: dec!(48),
            position_ratio_available: true,
            data_quality_score: dec!(100),
            price: dec!(100),
            volume_24h: dec!(1000000),
            open_interest: dec!(2500),
            funding_rate: dec!(0.0003),
        }
    }

    fn strategy_with(bars: Vec<Kline>) -> SmartMoneySfp {
        let fake = FakeMarketData::new();
        fake.set_klines("BTCUSDT", bars);
        SmartMoneySfp::new(SmartMoneySfpSettings::default(), Arc::new(fake))
    }

    #[test]
    fn swing_failure_detection() {
        let window = flat_window();
        // Pierces 105 but closes back under it.
        let trigger = bar(dec!(104), dec!(107), dec!(100), dec!(103), 20);
        assert!(is_swing_failure(&window, &trigger));

        // Closes above the swing high: breakout, not failure.
        let breakout = bar(dec!(104), dec!(107), dec!(103), dec!(106), 20);
        assert!(!is_swing_failure(&window, &breakout));
    }

    #[test]
    fn shooting_star_detection() {
        // Range 10, body 1, upper wick 8, lower wick 1.
        let star = bar(dec!(100), dec!(109), dec!(99), dec!(101), 0);
        assert!(is_shooting_star(&star));

        // Fat body disqualifies.
        let solid = bar(dec!(100), dec!(109), dec!(99), dec!(108), 0);
        assert!(!is_shooting_star(&solid));
    }

    #[test]
    fn bearish_engulfing_detection() {
        let prior = bar(dec!(100), dec!(103), dec!(99), dec!(102), 0);
        let engulfing = bar(dec!(102.5), dec!(103.5), dec!(98), dec!(99.5), 1);
        assert!(is_bearish_engulfing(&prior, &engulfing));

        // Equality at the hinge is inclusive.
        let exact = bar(dec!(102), dec!(103), dec!(98), dec!(100), 1);
        assert!(is_bearish_engulfing(&prior, &exact));

        // Red prior bar disqualifies.
        let red_prior = bar(dec!(102), dec!(103), dec!(99), dec!(100), 0);
        assert!(!is_bearish_engulfing(&red_prior, &engulfing));
    }

    #[tokio::test]
    async fn sfp_emits_short_with_trade_levels() {
        let mut bars = flat_window();
        // Trigger: swing failure above the 105 top.
        bars.push(bar(dec!(104), dec!(107), dec!(100), dec!(103), 20));
        // In-progress bar the venue would also return.
        bars.push(bar(dec!(103), dec!(104), dec!(102), dec!(103), 21));

        let strategy = strategy_with(bars);
        let signals = strategy.analyze(&[crowded_snapshot()]).await.unwrap();
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert_eq!(signal.direction, SignalDirection::Short);
        // SL = 107 * 1.001, TP1 = window low 95, TP2 = 100 - 3 * (107.107 - 100).
        assert_eq!(signal.stop_loss_price, Some(dec!(107.107)));
        assert_eq!(signal.target_price_1, Some(dec!(95)));
        assert_eq!(signal.target_price_2, Some(dec!(78.679)));
        assert!(signal.reason.contains("swing failure"));
        assert_eq!(
            signal.config_snapshot.get("pattern"),
            Some(&"swing failure".to_string())
        );
    }

    #[tokio::test]
    async fn stop_below_entry_collapses_risk() {
        let mut bars = flat_window();
        // Shooting star trigger far below the current price.
        bars.push(bar(dec!(80), dec!(89), dec!(79), dec!(81), 20));
        bars.push(bar(dec!(81), dec!(82), dec!(80), dec!(81), 21));

        let strategy = strategy_with(bars);
        let mut snap = crowded_snapshot();
        snap.price = dec!(100);

        let signals = strategy.analyze(&[snap]).await.unwrap();
        assert_eq!(signals.len(), 1);
        // SL 89*1.001 = 89.089 <= entry 100, so risk collapses to 1% of
        // entry: TP2 = 100 - 3 = 97.
        assert_eq!(signals[0].target_price_2, Some(dec!(97)));
    }

    #[tokio::test]
    async fn quiet_without_positive_funding() {
        let mut bars = flat_window();
        bars.push(bar(dec!(104), dec!(107), dec!(100), dec!(103), 20));
        bars.push(bar(dec!(103), dec!(104), dec!(102), dec!(103), 21));

        let strategy = strategy_with(bars);
        let mut snap = crowded_snapshot();
        snap.funding_rate = dec!(-0.0001);
        assert!(strategy.analyze(&[snap]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quiet_without_retail_crowding() {
        let mut bars = flat_window();
        bars.push(bar(dec!(104), dec!(107), dec!(100), dec!(103), 20));
        bars.push(bar(dec!(103), dec!(104), dec!(102), dec!(103), 21));

        let strategy = strategy_with(bars);
        let mut snap = crowded_snapshot();
        snap.long_account_ratio = dec!(60);
        snap.short_account_ratio = dec!(40);
        assert!(strategy.analyze(&[snap]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quiet_when_whales_match_retail() {
        let mut bars = flat_window();
        bars.push(bar(dec!(104), dec!(107), dec!(100), dec!(103), 20));
        bars.push(bar(dec!(103), dec!(104), dec!(102), dec!(103), 21));

        let strategy = strategy_with(bars);
        let mut snap = crowded_snapshot();
        snap.long_position_ratio = dec!(80);
        snap.short_position_ratio = dec!(20);
        assert!(strategy.analyze(&[snap]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quiet_with_too_few_bars() {
        let strategy = strategy_with(flat_window());
        assert!(strategy.analyze(&[crowded_snapshot()]).await.unwrap().is_empty());
    }
}
