//! The closed set of signal strategies: minority-follower,
//! whale-divergence and smart-money SFP.

mod minority;
mod sfp;
mod whale;

pub use minority::{MinorityFollower, MinorityFollowerSettings};
pub use sfp::{SmartMoneySfp, SmartMoneySfpSettings};
pub use whale::{WhaleDivergence, WhaleDivergenceSettings};

use market_core::StrategyParams;
use std::collections::BTreeMap;

/// Start a config-snapshot bag with the base parameters every strategy
/// records; strategy-specific keys are layered on top.
pub(crate) fn base_config_snapshot(params: &StrategyParams) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "confirmation_hours".to_string(),
            params.confirmation_hours.to_string(),
        ),
        (
            "tracking_hours".to_string(),
            params.tracking_hours.to_string(),
        ),
        (
            "profit_target_pct".to_string(),
            params.profit_target_pct.to_string(),
        ),
        (
            "stop_loss_pct".to_string(),
            params.stop_loss_pct.to_string(),
        ),
    ])
}

pub(crate) fn default_params() -> StrategyParams {
    StrategyParams {
        confirmation_hours: 4,
        tracking_hours: 48,
        profit_target_pct: rust_decimal_macros::dec!(5),
        stop_loss_pct: rust_decimal_macros::dec!(2),
    }
}
