use async_trait::async_trait;
use market_core::{
    Signal, SignalDirection, Snapshot, Strategy, StrategyError, StrategyParams,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

/// Contrarian crowd-positioning strategy: when the dominant crowd exceeds a
/// threshold, signal against it. The two thresholds are independent so
/// asymmetric regimes can be encoded.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MinorityFollowerSettings {
    pub enabled: bool,
    /// Generate LONG when the short account ratio reaches this percent.
    pub generate_long_when_short_ratio_above: Decimal,
    /// Generate SHORT when the long account ratio reaches this percent.
    pub generate_short_when_long_ratio_above: Decimal,
    pub confirmation_hours: i64,
    pub tracking_hours: i64,
    pub profit_target_pct: Decimal,
    pub stop_loss_pct: Decimal,
}

impl Default for MinorityFollowerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            generate_long_when_short_ratio_above: dec!(75),
            generate_short_when_long_ratio_above: dec!(75),
            confirmation_hours: 4,
            tracking_hours: 48,
            profit_target_pct: dec!(5),
            stop_loss_pct: dec!(2),
        }
    }
}

pub struct MinorityFollower {
    settings: MinorityFollowerSettings,
    params: StrategyParams,
}

impl MinorityFollower {
    pub const KEY: &'static str = "minority";
    pub const NAME: &'static str = "minority_follower";

    pub fn new(settings: MinorityFollowerSettings) -> Self {
        let params = StrategyParams {
            confirmation_hours: settings.confirmation_hours,
            tracking_hours: settings.tracking_hours,
            profit_target_pct: settings.profit_target_pct,
            stop_loss_pct: settings.stop_loss_pct,
        };
        Self { settings, params }
    }

    fn config_snapshot(&self) -> std::collections::BTreeMap<String, String> {
        let mut bag = crate::base_config_snapshot(&self.params);
        bag.insert(
            "generate_long_when_short_ratio_above".into(),
            self.settings.generate_long_when_short_ratio_above.to_string(),
        );
        bag.insert(
            "generate_short_when_long_ratio_above".into(),
            self.settings.generate_short_when_long_ratio_above.to_string(),
        );
        bag
    }
}

#[async_trait]
impl Strategy for MinorityFollower {
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

        let (fire, reason) = self.should_generate(latest);
        if !fire {
            tracing::trace!(symbol = %latest.symbol, reason, "minority follower quiet");
            return Ok(Vec::new());
        }

        let direction =
            if latest.long_account_ratio >= self.settings.generate_short_when_long_ratio_above {
                SignalDirection::Short
            } else {
                SignalDirection::Long
            };

        let signal = Signal::pending(
            &latest.symbol,
            direction,
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
        if latest.long_account_ratio >= self.settings.generate_short_when_long_ratio_above {
            return (
                true,
                format!(
                    "LONG ratio is {:.2}% (>= {:.2}%), crowd is long, going contrarian SHORT",
                    latest.long_account_ratio, self.settings.generate_short_when_long_ratio_above
                ),
            );
        }
        if latest.short_account_ratio >= self.settings.generate_long_when_short_ratio_above {
            return (
                true,
                format!(
                    "SHORT ratio is {:.2}% (>= {:.2}%), crowd is short, going contrarian LONG",
                    latest.short_account_ratio, self.settings.generate_long_when_short_ratio_above
                ),
            );
        }
        (
            false,
            format!(
                "no crowding: long {:.2}%, short {:.2}%",
                latest.long_account_ratio, latest.short_account_ratio
            ),
        )
    }

    fn validate_confirmation(&self, signal: &Signal, current: &Snapshot) -> (bool, String) {
        // Thresholds come from the signal's own parameter bag so later config
        // changes cannot reinterpret it.
        match signal.direction {
            SignalDirection::Short => {
                let threshold = signal
                    .config_decimal("generate_short_when_long_ratio_above")
                    .unwrap_or(self.settings.generate_short_when_long_ratio_above);
                if current.long_account_ratio >= threshold {
                    (
                        true,
                        format!("LONG ratio still {:.2}%", current.long_account_ratio),
                    )
                } else {
                    (
                        false,
                        format!(
                            "LONG ratio faded to {:.2}% (< {:.2}%)",
                            current.long_account_ratio, threshold
                        ),
                    )
                }
            }
            SignalDirection::Long => {
                let threshold = signal
                    .config_decimal("generate_long_when_short_ratio_above")
                    .unwrap_or(self.settings.generate_long_when_short_ratio_above);
                if current.short_account_ratio >= threshold {
                    (
                        true,
                        format!("SHORT ratio still {:.2}%", current.short_account_ratio),
                    )
                } else {
                    (
                        false,
                        format!(
                            "SHORT ratio faded to {:.2}% (< {:.2}%)",
                            current.short_account_ratio, threshold
                        ),
                    )
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(long: Decimal, short: Decimal, price: Decimal) -> Snapshot {
        Snapshot {
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
            long_account_ratio: long,
            short_account_ratio: short,
            long_position_ratio: dec!(55),
            short_position_ratio: dec!(45),
            position_ratio_available: true,
            data_quality_score: dec!(100),
            price,
            volume_24h: dec!(1000000),
            open_interest: dec!(2500),
            funding_rate: dec!(0.0001),
        }
    }

    #[tokio::test]
    async fn crowded_long_fires_contrarian_short() {
        let strategy = MinorityFollower::new(MinorityFollowerSettings::default());
        let window = vec![snapshot(dec!(80), dec!(20), dec!(50000))];

        let signals = strategy.analyze(&window).await.unwrap();
        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.direction, SignalDirection::Short);
        assert_eq!(signal.price_at_signal, dec!(50000));
        assert!(signal.reason.contains("LONG ratio is 80.00%"));
        assert_eq!(
            signal.config_snapshot.get("generate_short_when_long_ratio_above"),
            Some(&"75".to_string())
        );
    }

    #[tokio::test]
    async fn crowded_short_fires_contrarian_long() {
        let strategy = MinorityFollower::new(MinorityFollowerSettings::default());
        let window = vec![snapshot(dec!(22), dec!(78), dec!(2500))];

        let signals = strategy.analyze(&window).await.unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].direction, SignalDirection::Long);
    }

    #[tokio::test]
    async fn balanced_crowd_is_quiet() {
        let strategy = MinorityFollower::new(MinorityFollowerSettings::default());
        let window = vec![snapshot(dec!(60), dec!(40), dec!(50000))];
        assert!(strategy.analyze(&window).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_window_is_quiet() {
        let strategy = MinorityFollower::new(MinorityFollowerSettings::default());
        assert!(strategy.analyze(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirmation_survives_while_crowd_holds() {
        let strategy = MinorityFollower::new(MinorityFollowerSettings::default());
        let window = vec![snapshot(dec!(80), dec!(20), dec!(50000))];
        let signal = strategy.analyze(&window).await.unwrap().remove(0);

        let (ok, _) = strategy.validate_confirmation(&signal, &snapshot(dec!(78), dec!(22), dec!(49000)));
        assert!(ok);

        let (ok, reason) =
            strategy.validate_confirmation(&signal, &snapshot(dec!(70), dec!(30), dec!(49000)));
        assert!(!ok);
        assert!(reason.contains("faded"));
    }

    #[tokio::test]
    async fn asymmetric_thresholds_are_independent() {
        let strategy = MinorityFollower::new(MinorityFollowerSettings {
            generate_short_when_long_ratio_above: dec!(85),
            generate_long_when_short_ratio_above: dec!(70),
            ..MinorityFollowerSettings::default()
        });

        // 80% long crowd no longer clears the raised short-side threshold.
        assert!(strategy
            .analyze(&[snapshot(dec!(80), dec!(20), dec!(50000))])
            .await
            .unwrap()
            .is_empty());
        // 72% short crowd clears the lowered long-side threshold.
        assert_eq!(
            strategy
                .analyze(&[snapshot(dec!(28), dec!(72), dec!(50000))])
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
