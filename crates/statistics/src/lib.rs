//! Rolls closed signals into (strategy, symbol-or-global, period) statistics
//! cells and raises alerts when a cell moves materially against its previous
//! calculation.

mod changes;

pub use changes::{detect_changes, ChangeAlert, ChangeThresholds};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};
use market_core::{
    OutcomeKind, Signal, SignalKlineTracking, SignalOutcome, SignalStatus, StatisticsCell,
};
use notifier::{Dispatcher, Event, EventKind};
use rust_decimal::Decimal;
use signal_store::Store;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Period labels to compute, from {24h, 7d, 30d, all}.
    pub periods: Vec<String>,
    pub thresholds: ChangeThresholds,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            periods: vec!["24h".into(), "7d".into(), "30d".into(), "all".into()],
            thresholds: ChangeThresholds::default(),
        }
    }
}

pub struct Aggregator {
    store: Store,
    dispatcher: Dispatcher,
    strategy_names: Vec<String>,
    config: AggregatorConfig,
}

impl Aggregator {
    pub fn new(
        store: Store,
        dispatcher: Dispatcher,
        strategy_names: Vec<String>,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            strategy_names,
            config,
        }
    }

    /// Recompute every configured cell. Returns the number of cells written.
    pub async fn recalculate_all(&self, token: &CancellationToken) -> Result<usize> {
        let now = Utc::now();
        let mut cells_written = 0usize;

        for strategy in &self.strategy_names {
            for label in &self.config.periods {
                if token.is_cancelled() {
                    bail!("statistics pass cancelled");
                }

                let Some((start, end)) = period_window(label, now) else {
                    tracing::warn!(label, "unknown statistics period, skipped");
                    continue;
                };

                let signals = self
                    .store
                    .signals_in_window(strategy, start, end)
                    .await
                    .with_context(|| format!("loading {strategy} signals for {label}"))?;

                // Global cell plus one per symbol seen in the window.
                let mut partitions: Vec<(Option<String>, Vec<&Signal>)> =
                    vec![(None, signals.iter().collect())];
                let mut by_symbol: BTreeMap<&str, Vec<&Signal>> = BTreeMap::new();
                for signal in &signals {
                    by_symbol.entry(signal.symbol.as_str()).or_default().push(signal);
                }
                for (symbol, group) in by_symbol {
                    partitions.push((Some(symbol.to_string()), group));
                }

                for (symbol, group) in partitions {
                    let cell = self
                        .build_cell(strategy, symbol, label, start, end, &group, now)
                        .await?;

                    let previous = self
                        .store
                        .previous_statistics_cell(strategy, &cell.symbol, label, cell.calculated_at)
                        .await
                        .context("loading previous cell")?;

                    self.store
                        .upsert_statistics_cell(&cell)
                        .await
                        .context("upserting statistics cell")?;
                    cells_written += 1;

                    if let Some(previous) = previous {
                        for alert in
                            detect_changes(&previous, &cell, &self.config.thresholds)
                        {
                            tracing::warn!(
                                strategy = %cell.strategy_name,
                                symbol = cell.symbol.as_deref().unwrap_or("<global>"),
                                period = %cell.period_label,
                                metric = alert.metric,
                                prior = %alert.prior,
                                current = %alert.current,
                                delta = %alert.delta,
                                "statistics shift detected"
                            );
                            self.dispatcher
                                .dispatch(
                                    &Event::new(
                                        EventKind::StatisticsChange,
                                        format!(
                                            "{} {} shifted for {}",
                                            cell.strategy_name, alert.metric, cell.period_label
                                        ),
                                        format!(
                                            "{} moved from {} to {} (delta {})",
                                            alert.metric, alert.prior, alert.current, alert.delta
                                        ),
                                    )
                                    .with_metadata(serde_json::json!({
                                        "strategy": cell.strategy_name,
                                        "symbol": cell.symbol,
                                        "period": cell.period_label,
                                        "metric": alert.metric,
                                        "prior": alert.prior.to_string(),
                                        "current": alert.current.to_string(),
                                        "delta": alert.delta.to_string(),
                                    })),
                                )
                                .await;
                        }
                    }
                }
            }
        }

        tracing::info!(cells = cells_written, "statistics pass complete");
        Ok(cells_written)
    }

    async fn build_cell(
        &self,
        strategy: &str,
        symbol: Option<String>,
        label: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        signals: &[&Signal],
        now: DateTime<Utc>,
    ) -> Result<StatisticsCell> {
        // Performance metrics come only from CLOSED signals with an outcome.
        let mut outcomes: Vec<(&Signal, SignalOutcome)> = Vec::new();
        let mut klines: Vec<SignalKlineTracking> = Vec::new();
        for signal in signals {
            if signal.status != SignalStatus::Closed {
                continue;
            }
            match self.store.outcome_for(signal.signal_id).await? {
                Some(outcome) => outcomes.push((signal, outcome)),
                None => {
                    tracing::warn!(
                        signal_id = %signal.signal_id,
                        "closed signal has no outcome row, excluded from statistics"
                    );
                    continue;
                }
            }
            klines.extend(self.store.kline_trackings(signal.signal_id).await?);
        }

        Ok(compose_cell(
            strategy, symbol, label, start, end, signals, &outcomes, &klines, now,
        ))
    }
}

/// Deterministic window for a period label, truncated to the hour so a
/// recomputation within the same hour upserts the same cell.
pub fn period_window(label: &str, now: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let end = now
        .duration_trunc(Duration::hours(1))
        .unwrap_or(now);
    let start = match label {
        "24h" => end - Duration::hours(24),
        "7d" => end - Duration::days(7),
        "30d" => end - Duration::days(30),
        // Fixed anchor predating all data.
        "all" => Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single()?,
        _ => return None,
    };
    Some((start, end))
}

fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().copied().sum();
    Some((sum / Decimal::from(values.len() as i64)).round_dp(4))
}

#[allow(clippy::too_many_arguments)]
fn compose_cell(
    strategy: &str,
    symbol: Option<String>,
    label: &str,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    signals: &[&Signal],
    outcomes: &[(&Signal, SignalOutcome)],
    klines: &[SignalKlineTracking],
    now: DateTime<Utc>,
) -> StatisticsCell {
    let hundred = Decimal::ONE_HUNDRED;

    let total_signals = signals.len() as i64;
    let confirmed_signals = signals.iter().filter(|s| s.is_confirmed).count() as i64;
    let invalidated_signals = signals
        .iter()
        .filter(|s| s.status == SignalStatus::Invalidated)
        .count() as i64;

    let mut profitable = 0i64;
    let mut losing = 0i64;
    let mut neutral = 0i64;
    let mut profit_changes: Vec<Decimal> = Vec::new();
    let mut loss_changes: Vec<Decimal> = Vec::new();
    let mut holding_hours: Vec<Decimal> = Vec::new();

    for (signal, outcome) in outcomes {
        match outcome.outcome {
            OutcomeKind::Profit => {
                profitable += 1;
                profit_changes.push(outcome.final_price_change_pct);
            }
            OutcomeKind::Loss => {
                losing += 1;
                loss_changes.push(outcome.final_price_change_pct);
            }
            OutcomeKind::Neutral | OutcomeKind::Timeout => neutral += 1,
        }
        holding_hours.push(market_core::hours_between(
            signal.generated_at,
            outcome.closed_at,
        ));
    }

    let closed_total = profitable + losing + neutral;
    let win_rate = (closed_total > 0).then(|| {
        (Decimal::from(profitable) / Decimal::from(closed_total) * hundred).round_dp(2)
    });

    let avg_profit_pct = mean(&profit_changes);
    // Stored as a positive magnitude.
    let loss_magnitudes: Vec<Decimal> = loss_changes.iter().map(|c| c.abs()).collect();
    let avg_loss_pct = mean(&loss_magnitudes);

    let profit_sum: Decimal = profit_changes.iter().map(|c| c.abs()).sum();
    let loss_sum: Decimal = loss_magnitudes.iter().copied().sum();
    let profit_factor = (!loss_sum.is_zero()).then(|| (profit_sum / loss_sum).round_dp(4));

    let best_profit_pct = profit_changes.iter().copied().max();
    let worst_loss_pct = loss_changes.iter().copied().min();

    // Kline-derived hours.
    let total_kline_hours = klines.len() as i64;
    let profitable_kline_hours = klines.iter().filter(|k| k.is_profitable_at_high).count() as i64;
    let close_profitable_hours = klines.iter().filter(|k| k.is_profitable_at_close).count() as i64;

    let theoretical_win_rate = (total_kline_hours > 0).then(|| {
        (Decimal::from(profitable_kline_hours) / Decimal::from(total_kline_hours) * hundred)
            .round_dp(2)
    });
    let close_win_rate = (total_kline_hours > 0).then(|| {
        (Decimal::from(close_profitable_hours) / Decimal::from(total_kline_hours) * hundred)
            .round_dp(2)
    });

    let hourly_returns: Vec<Decimal> = klines.iter().map(|k| k.hourly_return_pct).collect();
    let potential_profits: Vec<Decimal> =
        klines.iter().map(|k| k.max_potential_profit_pct).collect();
    let potential_losses: Vec<Decimal> =
        klines.iter().map(|k| k.max_potential_loss_pct).collect();

    StatisticsCell {
        strategy_name: strategy.to_string(),
        symbol,
        period_label: label.to_string(),
        period_start: start,
        period_end: end,
        total_signals,
        confirmed_signals,
        invalidated_signals,
        profitable_signals: profitable,
        losing_signals: losing,
        neutral_signals: neutral,
        win_rate,
        avg_profit_pct,
        avg_loss_pct,
        avg_holding_hours: mean(&holding_hours),
        best_profit_pct,
        worst_loss_pct,
        profit_factor,
        theoretical_win_rate,
        close_win_rate,
        total_kline_hours,
        profitable_kline_hours,
        avg_hourly_return_pct: mean(&hourly_returns),
        max_hourly_return_pct: hourly_returns.iter().copied().max(),
        min_hourly_return_pct: hourly_returns.iter().copied().min(),
        avg_max_potential_profit_pct: mean(&potential_profits),
        avg_max_potential_loss_pct: mean(&potential_losses),
        calculated_at: now,
    }
}
