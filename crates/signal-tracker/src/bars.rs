use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, DurationRound, Utc};
use market_core::{direction_change_pct, pct_change, Kline, Signal, SignalKlineTracking};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::Tracker;

/// Counters for one bar-attribution pass.
#[derive(Debug, Default, Clone)]
pub struct BarStats {
    pub symbols: usize,
    pub bars_attributed: usize,
}

fn floor_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.duration_trunc(Duration::hours(1)).unwrap_or(t)
}

impl Tracker {
    /// Attribute completed hourly bars to every active signal, grouped by
    /// symbol so each symbol costs one upstream call per pass.
    pub async fn track_all_klines(&self, token: &CancellationToken) -> Result<BarStats> {
        let signals = self
            .store
            .signals_to_track()
            .await
            .context("loading signals for bar tracking")?;

        let mut by_symbol: BTreeMap<String, Vec<Signal>> = BTreeMap::new();
        for signal in signals {
            by_symbol.entry(signal.symbol.clone()).or_default().push(signal);
        }

        // Never attribute an in-progress bar.
        let cutoff = floor_hour(Utc::now());
        let mut stats = BarStats::default();

        for (symbol, signals) in by_symbol {
            if token.is_cancelled() {
                bail!("bar pass cancelled");
            }
            if stats.symbols > 0 && !self.config.pace.is_zero() {
                tokio::time::sleep(self.config.pace).await;
            }
            stats.symbols += 1;

            // Resume from wherever each signal last stopped; fetch once from
            // the earliest of those.
            let mut last_closes: Vec<(Signal, Option<DateTime<Utc>>)> = Vec::new();
            let mut earliest: Option<DateTime<Utc>> = None;
            for signal in signals {
                let last_close = self
                    .store
                    .last_kline_close(signal.signal_id)
                    .await
                    .context("loading last attributed bar")?;
                let resume = match last_close {
                    Some(close) => close + Duration::seconds(1),
                    None => floor_hour(signal.generated_at),
                };
                earliest = Some(earliest.map_or(resume, |e| e.min(resume)));
                last_closes.push((signal, last_close));
            }
            let Some(earliest) = earliest else { continue };

            let bars = match self
                .source
                .klines_since(&symbol, &self.config.kline_interval, earliest)
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    tracing::warn!(symbol, "kline fetch failed: {e}");
                    continue;
                }
            };
            let completed: Vec<Kline> =
                bars.into_iter().filter(|b| b.close_time < cutoff).collect();

            for (signal, last_close) in &last_closes {
                for bar in &completed {
                    if bar.open_time < signal.generated_at {
                        continue;
                    }
                    if let Some(last_close) = last_close {
                        if bar.close_time <= *last_close {
                            continue;
                        }
                    }

                    let tracking = attribute_bar(signal, bar);
                    if self
                        .store
                        .insert_kline_tracking(&tracking)
                        .await
                        .context("persisting bar attribution")?
                    {
                        stats.bars_attributed += 1;
                    }
                }
            }
        }

        tracing::info!(
            symbols = stats.symbols,
            bars = stats.bars_attributed,
            "bar pass complete"
        );

        Ok(stats)
    }
}

/// Project one completed bar onto a signal: per-OHLC direction-aware change
/// percents against the entry price, plus the bar's own hourly return.
pub fn attribute_bar(signal: &Signal, bar: &Kline) -> SignalKlineTracking {
    let entry = signal.price_at_signal;
    let direction = signal.direction;

    let open_change_pct = direction_change_pct(direction, entry, bar.open);
    let high_change_pct = direction_change_pct(direction, entry, bar.high);
    let low_change_pct = direction_change_pct(direction, entry, bar.low);
    let close_change_pct = direction_change_pct(direction, entry, bar.close);

    SignalKlineTracking {
        signal_id: signal.signal_id,
        open_time: bar.open_time,
        close_time: bar.close_time,
        open: bar.open,
        high: bar.high,
        low: bar.low,
        close: bar.close,
        volume: bar.volume,
        open_change_pct,
        high_change_pct,
        low_change_pct,
        close_change_pct,
        hourly_return_pct: pct_change(bar.open, bar.close),
        is_profitable_at_high: high_change_pct > Decimal::ZERO,
        is_profitable_at_close: close_change_pct > Decimal::ZERO,
        max_potential_profit_pct: high_change_pct,
        max_potential_loss_pct: low_change_pct,
    }
}
