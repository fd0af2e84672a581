use market_core::StatisticsCell;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Per-metric alert thresholds. Win rate and profitable-ratio compare in
/// absolute percentage points; the rest compare relative to the prior value.
#[derive(Debug, Clone)]
pub struct ChangeThresholds {
    pub win_rate_pp: Decimal,
    pub profitable_ratio_pp: Decimal,
    pub avg_profit_rel_pct: Decimal,
    pub avg_loss_rel_pct: Decimal,
    pub profit_factor_rel_pct: Decimal,
    pub signal_count_rel_pct: Decimal,
}

impl Default for ChangeThresholds {
    fn default() -> Self {
        Self {
            win_rate_pp: dec!(10),
            profitable_ratio_pp: dec!(10),
            avg_profit_rel_pct: dec!(25),
            avg_loss_rel_pct: dec!(25),
            profit_factor_rel_pct: dec!(25),
            signal_count_rel_pct: dec!(50),
        }
    }
}

/// One metric that moved past its threshold.
#[derive(Debug, Clone)]
pub struct ChangeAlert {
    pub metric: &'static str,
    pub prior: Decimal,
    pub current: Decimal,
    pub delta: Decimal,
}

fn profitable_ratio(cell: &StatisticsCell) -> Option<Decimal> {
    if cell.total_signals == 0 {
        return None;
    }
    Some(
        (Decimal::from(cell.profitable_signals) / Decimal::from(cell.total_signals)
            * Decimal::ONE_HUNDRED)
            .round_dp(2),
    )
}

fn absolute_delta(
    metric: &'static str,
    prior: Option<Decimal>,
    current: Option<Decimal>,
    threshold: Decimal,
) -> Option<ChangeAlert> {
    let (prior, current) = (prior?, current?);
    let delta = current - prior;
    (delta.abs() >= threshold).then_some(ChangeAlert {
        metric,
        prior,
        current,
        delta,
    })
}

fn relative_delta(
    metric: &'static str,
    prior: Option<Decimal>,
    current: Option<Decimal>,
    threshold: Decimal,
) -> Option<ChangeAlert> {
    let (prior, current) = (prior?, current?);
    if prior.is_zero() {
        return None;
    }
    let delta = ((current - prior) / prior.abs() * Decimal::ONE_HUNDRED).round_dp(2);
    (delta.abs() >= threshold).then_some(ChangeAlert {
        metric,
        prior,
        current,
        delta,
    })
}

/// Compare a freshly computed cell against the previous calculation.
/// Missing priors and zero denominators are skipped silently.
pub fn detect_changes(
    previous: &StatisticsCell,
    current: &StatisticsCell,
    thresholds: &ChangeThresholds,
) -> Vec<ChangeAlert> {
    let mut alerts = Vec::new();

    if let Some(alert) = absolute_delta(
        "win_rate",
        previous.win_rate,
        current.win_rate,
        thresholds.win_rate_pp,
    ) {
        alerts.push(alert);
    }
    if let Some(alert) = absolute_delta(
        "profitable_ratio",
        profitable_ratio(previous),
        profitable_ratio(current),
        thresholds.profitable_ratio_pp,
    ) {
        alerts.push(alert);
    }
    if let Some(alert) = relative_delta(
        "avg_profit_pct",
        previous.avg_profit_pct,
        current.avg_profit_pct,
        thresholds.avg_profit_rel_pct,
    ) {
        alerts.push(alert);
    }
    if let Some(alert) = relative_delta(
        "avg_loss_pct",
        previous.avg_loss_pct,
        current.avg_loss_pct,
        thresholds.avg_loss_rel_pct,
    ) {
        alerts.push(alert);
    }
    if let Some(alert) = relative_delta(
        "profit_factor",
        previous.profit_factor,
        current.profit_factor,
        thresholds.profit_factor_rel_pct,
    ) {
        alerts.push(alert);
    }
    if let Some(alert) = relative_delta(
        "signal_count",
        Some(Decimal::from(previous.total_signals)),
        Some(Decimal::from(current.total_signals)),
        thresholds.signal_count_rel_pct,
    ) {
        alerts.push(alert);
    }

    alerts
}
