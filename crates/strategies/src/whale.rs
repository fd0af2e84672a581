use async_trait::async_trait;
use market_core::{
    Signal, SignalDirection, Snapshot, Strategy, StrategyError, StrategyParams,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Retail-vs-whale split: fires when the account majority disagrees in
/// direction with the position-size majority. The signal follows the whales.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhaleDivergenceSettings {
    pub enabled: bool,
    /// Account-side extremity gate: the dominant account ratio must reach
    /// this percent.
    pub min_ratio_difference: Decimal,
    /// The whale-side position ratio must reach this percent.
    pub whale_position_threshold: Decimal,
    /// Minimum |account delta - position delta| divergence magnitude.
    pub min_divergence: Decimal,
    pub confirmation_hours: i64,
    pub tracking_hours: i64,
    pub profit_target_pct: Decimal,
    pub stop_loss_pct: Decimal,
}

impl Default for WhaleDivergenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_ratio_difference: dec!(75),
            whale_position_threshold: dec!(60),
            min_divergence: dec!(20),
            confirmation_hours: 4,
            tracking_hours: 48,
            profit_target_pct: dec!(5),
            stop_loss_pct: dec!(2),
        }
    }
}

pub struct WhaleDivergence {
    settings: WhaleDivergenceSettings,
    params: StrategyParams,
}

struct DivergenceRead {
    account_majority: SignalDirection,
    whale_majority: SignalDirection,
    divergence: Decimal,
    account_extremity: Decimal,
    whale_ratio: Decimal,
}

impl WhaleDivergence {
    pub const KEY: &'static str = "whale";
    pub const NAME: &'static str = "whale_divergence";

    pub fn new(settings: WhaleDivergenceSettings) -> Self {
        let params = StrategyParams {
            confirmation_hours: settings.confirmation_hours,
            tracking_hours: settings.tracking_hours,
            profit_target_pct: settings.profit_target_pct,
            stop_loss_pct: settings.stop_loss_pct,
        };
        Self { settings, params }
    }

    /// Read both majorities off a snapshot. `None` when either side is
    /// perfectly balanced or the position series is absent.
    fn read(&self, snap: &Snapshot) -> Option<DivergenceRead> {
        if !snap.position_ratio_available {
            return None;
        }

        let account_delta = snap.long_account_ratio - snap.short_account_ratio;
        let position_delta = snap.long_position_ratio - snap.short_position_ratio;
        if account_delta.is_zero() || position_delta.is_zero() {
            return None;
        }

        let account_majority = if account_delta > Decimal::ZERO {
            SignalDirection::Long
        } else {
            SignalDirection::Short
        };
        let whale_majority = if position_delta > Decimal::ZERO {
            SignalDirection::Long
        } else {
            SignalDirection::Short
        };

        Some(DivergenceRead {
            account_majority,
            whale_majority,
            divergence: (account_delta - position_delta).abs(),
            account_extremity: snap.long_account_ratio.max(snap.short_account_ratio),
            whale_ratio: snap.long_position_ratio.max(snap.short_position_ratio),
        })
    }

    fn gates(&self, read: &DivergenceRead) -> (bool, String) {
        if read.account_majority == read.whale_majority {
            return (
                false,
                "accounts and whale positions agree in direction".into(),
            );
        }
        if read.divergence < self.settings.min_divergence {
            return (
                false,
                format!(
                    "divergence {:.2} below minimum {:.2}",
                    read.divergence, self.settings.min_divergence
                ),
            );
        }
        if read.account_extremity < self.settings.min_ratio_difference {
            return (
                false,
                format!(
                    "account extremity {:.2}% below {:.2}%",
                    read.account_extremity, self.settings.min_ratio_difference
                ),
            );
        }
        if read.whale_ratio < self.settings.whale_position_threshold {
            return (
                false,
                format!(
                    "whale position ratio {:.2}% below {:.2}%",
                    read.whale_ratio, self.settings.whale_position_threshold
                ),
            );
        }
        (
            true,
            format!(
                "retail {:.2}% {} vs whales {:.2}% {} (divergence {:.2}), following whales",
                read.account_extremity,
                read.account_majority,
                read.whale_ratio,
                read.whale_majority,
                read.divergence
            ),
        )
    }

    fn config_snapshot(&self) -> std::collections::BTreeMap<String, String> {
        let mut bag = crate::base_config_snapshot(&self.params);
        bag.insert(
            "min_ratio_difference".into(),
            self.settings.min_ratio_difference.to_string(),
        );
        bag.insert(
            "whale_position_threshold".into(),
            self.settings.whale_position_threshold.to_string(),
        );
        bag.insert(
            "min_divergence".into(),
            self.settings.min_divergence.to_string(),
        );
        bag
    }
}

#[async_trait]
impl Strategy for WhaleDivergence {
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

        let Some(read) = self.read(latest) else {
            return Ok(Vec::new());
        };
        let (fire, reason) = self.gates(&read);
        if !fire {
            tracing::trace!(symbol = %latest.symbol, reason, "whale divergence quiet");
            return Ok(Vec::new());
        }

        let signal = Signal::pending(
            &latest.symbol,
            read.whale_majority,
            Self::NAME,
            latest.timestamp,
            latest.price,
            (
                latest.long_account_ratio,
                latest.short_account_ratio,
                latest.long_position_ratio,
                latest.short_position_ratio,
            ),
            self.params.confirmation_hours,
            reason,
            self.config_snapshot(),
        );

        Ok(vec![signal])
    }

    fn should_generate(&self, latest: &Snapshot) -> (bool, String) {
        match self.read(latest) {
            Some(read) => self.gates(&read),
            None => (false, "position ratio unavailable or balanced".into()),
        }
    }

    fn validate_confirmation(&self, signal: &Signal, current: &Snapshot) -> (bool, String) {
        let Some(read) = self.read(current) else {
            return (false, "position ratio no longer available".into());
        };
        if read.whale_majority != signal.direction {
            return (
                false,
                format!("whale direction flipped to {}", read.whale_majority),
            );
        }
        self.gates(&read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(
        long_acc: Decimal,
        short_acc: Decimal,
        long_pos: Decimal,
        short_pos: Decimal,
    ) -> Snapshot {
        Snapshot {
            symbol: "ETHUSDT".into(),
            timestamp: Utc::now(),
            long_account_ratio: long_acc,
            short_account_ratio: short_acc,
            long_position_ratio: long_pos,
            short_position_ratio: short_pos,
            position_ratio_available: true,
            data_quality_score: dec!(100),
            price: dec!(2500),
            volume_24h: dec!(500000),
            open_interest: dec!(10000),
            funding_rate: dec!(0.0001),
        }
    }

    #[tokio::test]
    async fn retail_long_whales_short_fires_short() {
        let strategy = WhaleDivergence::new(WhaleDivergenceSettings::default());
        // Δaccount = 60, Δposition = -50, divergence = 110.
        let window = vec![snapshot(dec!(80), dec!(20), dec!(25), dec!(75))];

        let signals = strategy.analyze(&window).await.unwrap();
        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.direction, SignalDirection::Short);
        assert_eq!(signal.price_at_signal, dec!(2500));
        assert!(signal.reason.contains("following whales"));
    }

    #[tokio::test]
    async fn agreement_between_crowds_is_quiet() {
        let strategy = WhaleDivergence::new(WhaleDivergenceSettings::default());
        let window = vec![snapshot(dec!(80), dec!(20), dec!(70), dec!(30))];
        assert!(strategy.analyze(&window).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn weak_whale_side_is_quiet() {
        let strategy = WhaleDivergence::new(WhaleDivergenceSettings::default());
        // Whales lean short but only 55% < 60% threshold.
        let window = vec![snapshot(dec!(80), dec!(20), dec!(45), dec!(55))];
        assert!(strategy.analyze(&window).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_position_series_is_quiet() {
        let strategy = WhaleDivergence::new(WhaleDivergenceSettings::default());
        let mut snap = snapshot(dec!(80), dec!(20), dec!(0), dec!(0));
        snap.position_ratio_available = false;
        assert!(strategy.analyze(&[snap]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirmation_fails_when_whales_flip() {
        let strategy = WhaleDivergence::new(WhaleDivergenceSettings::default());
        let signal = strategy
            .analyze(&[snapshot(dec!(80), dec!(20), dec!(25), dec!(75))])
            .await
            .unwrap()
            .remove(0);

        // Whales flipped long: direction no longer matches the signal.
        let (ok, reason) = strategy.validate_confirmation(
            &signal,
            &snapshot(dec!(80), dec!(20), dec!(75), dec!(25)),
        );
        assert!(!ok);
        assert!(reason.contains("flipped"));

        // Conditions still hold: confirmed.
        let (ok, _) = strategy.validate_confirmation(
            &signal,
            &snapshot(dec!(78), dec!(22), dec!(30), dec!(70)),
        );
        assert!(ok);
    }
}
