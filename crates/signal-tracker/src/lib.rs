//! Signal tracking: the tick loop observes live prices and resolves
//! stop-loss / take-profit / timeout closes; the bar loop attributes
//! completed hourly OHLCV bars to each signal.

mod bars;
mod tick;

pub use bars::BarStats;
pub use tick::TickStats;

use market_core::{MarketDataSource, Signal};
use notifier::Dispatcher;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use signal_store::Store;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Inter-symbol pacing delay for upstream fetches.
    pub pace: Duration,
    /// Fallback thresholds for signals whose config snapshot lacks them.
    pub default_profit_target_pct: Decimal,
    pub default_stop_loss_pct: Decimal,
    pub default_tracking_hours: i64,
    /// When true (the default), explicit price levels on a signal win over
    /// the percentage rules.
    pub prefer_price_levels: bool,
    /// Interval requested from the venue for bar attribution.
    pub kline_interval: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            pace: Duration::from_millis(100),
            default_profit_target_pct: dec!(5),
            default_stop_loss_pct: dec!(2),
            default_tracking_hours: 48,
            prefer_price_levels: true,
            kline_interval: "1h".into(),
        }
    }
}

pub struct Tracker {
    source: Arc<dyn MarketDataSource>,
    store: Store,
    dispatcher: Dispatcher,
    config: TrackerConfig,
}

impl Tracker {
    pub fn new(
        source: Arc<dyn MarketDataSource>,
        store: Store,
        dispatcher: Dispatcher,
        config: TrackerConfig,
    ) -> Self {
        Self {
            source,
            store,
            dispatcher,
            config,
        }
    }

    /// Per-signal threshold resolution: the parameter bag recorded at
    /// generation time wins, the configured defaults back it up.
    fn profit_target_pct(&self, signal: &Signal) -> Decimal {
        signal
            .config_decimal("profit_target_pct")
            .unwrap_or(self.config.default_profit_target_pct)
    }

    fn stop_loss_pct(&self, signal: &Signal) -> Decimal {
        signal
            .config_decimal("stop_loss_pct")
            .unwrap_or(self.config.default_stop_loss_pct)
    }

    fn tracking_hours(&self, signal: &Signal) -> i64 {
        signal
            .config_snapshot
            .get("tracking_hours")
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.config.default_tracking_hours)
    }
}
