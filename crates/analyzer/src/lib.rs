//! Orchestrates the strategy set over every active symbol and drives the
//! PENDING -> CONFIRMED / INVALIDATED transition at the confirmation
//! boundary.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use market_core::Strategy;
use notifier::{Dispatcher, Event};
use rust_decimal::Decimal;
use signal_store::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Admission gates from the `strategies.global` config section.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Symbols with a 24h quote volume below this are not analyzed.
    pub min_volume_24h: Decimal,
    /// Maximum simultaneously non-terminal signals per symbol.
    pub max_concurrent_signals_per_pair: i64,
    /// Minimum elapsed time between two signals on the same symbol.
    pub signal_cooldown_hours: i64,
    /// Width of the snapshot window handed to strategies.
    pub snapshot_window_hours: i64,
    /// When set, evaluation runs and logs but nothing is persisted.
    pub dry_run: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            min_volume_24h: Decimal::ZERO,
            max_concurrent_signals_per_pair: 1,
            signal_cooldown_hours: 4,
            snapshot_window_hours: 24,
            dry_run: false,
        }
    }
}

/// Counters for one analysis pass.
#[derive(Debug, Default, Clone)]
pub struct AnalysisStats {
    pub symbols_considered: usize,
    pub symbols_skipped: usize,
    pub signals_generated: usize,
}

/// Counters for one confirmation pass.
#[derive(Debug, Default, Clone)]
pub struct ValidationStats {
    pub checked: usize,
    pub confirmed: usize,
    pub invalidated: usize,
    pub deferred: usize,
}

pub struct Analyzer {
    store: Store,
    strategies: Vec<Arc<dyn Strategy>>,
    dispatcher: Dispatcher,
    config: AnalyzerConfig,
}

impl Analyzer {
    pub fn new(
        store: Store,
        strategies: Vec<Arc<dyn Strategy>>,
        dispatcher: Dispatcher,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            store,
            strategies,
            dispatcher,
            config,
        }
    }

    /// Run every enabled strategy over every admissible symbol.
    pub async fn analyze_all(&self, token: &CancellationToken) -> Result<AnalysisStats> {
        let pairs = self.store.active_pairs().await.context("loading pairs")?;
        let window_start = Utc::now() - Duration::hours(self.config.snapshot_window_hours);

        let mut stats = AnalysisStats::default();

        for pair in &pairs {
            if token.is_cancelled() {
                bail!("analysis pass cancelled");
            }

            let window = self
                .store
                .snapshots_since(&pair.symbol, window_start)
                .await
                .with_context(|| format!("loading snapshots for {}", pair.symbol))?;
            let Some(latest) = window.first() else {
                continue;
            };
            stats.symbols_considered += 1;

            if let Some(reason) = self.admission_block(&pair.symbol, latest.volume_24h).await? {
                tracing::debug!(symbol = %pair.symbol, reason, "symbol skipped");
                stats.symbols_skipped += 1;
                continue;
            }

            for strategy in &self.strategies {
                if !strategy.enabled() {
                    continue;
                }

                let signals = match strategy.analyze(&window).await {
                    Ok(signals) => signals,
                    Err(e) => {
                        tracing::warn!(
                            symbol = %pair.symbol,
                            strategy = strategy.name(),
                            "strategy evaluation failed: {e}"
                        );
                        continue;
                    }
                };

                for signal in signals {
                    tracing::info!(
                        symbol = %signal.symbol,
                        strategy = %signal.strategy_name,
                        direction = %signal.direction,
                        price = %signal.price_at_signal,
                        "signal generated: {}",
                        signal.reason
                    );

                    if self.config.dry_run {
                        tracing::info!(symbol = %signal.symbol, "dry run: signal not persisted");
                        continue;
                    }

                    self.store
                        .insert_signal(&signal)
                        .await
                        .context("persisting signal")?;
                    self.dispatcher.dispatch(&Event::signal_generated(&signal)).await;
                    stats.signals_generated += 1;
                }
            }
        }

        tracing::info!(
            considered = stats.symbols_considered,
            skipped = stats.symbols_skipped,
            generated = stats.signals_generated,
            "analysis pass complete"
        );

        Ok(stats)
    }

    /// The volume, cooldown and concurrency gates. Returns the blocking
    /// reason, or `None` when the symbol is admissible.
    async fn admission_block(
        &self,
        symbol: &str,
        volume_24h: Decimal,
    ) -> Result<Option<String>> {
        if volume_24h < self.config.min_volume_24h {
            return Ok(Some(format!(
                "24h volume {volume_24h} below minimum {}",
                self.config.min_volume_24h
            )));
        }

        if let Some(last) = self
            .store
            .latest_signal_generated_at(symbol)
            .await
            .context("cooldown lookup")?
        {
            let cooldown = Duration::hours(self.config.signal_cooldown_hours);
            if Utc::now() - last < cooldown {
                return Ok(Some(format!(
                    "cooldown: last signal at {last}, {}h required",
                    self.config.signal_cooldown_hours
                )));
            }
        }

        let active = self
            .store
            .active_signal_count(symbol)
            .await
            .context("concurrency lookup")?;
        if active >= self.config.max_concurrent_signals_per_pair {
            return Ok(Some(format!(
                "concurrency cap: {active} active signals (max {})",
                self.config.max_concurrent_signals_per_pair
            )));
        }

        Ok(None)
    }

    /// Transition PENDING signals whose confirmation window has elapsed.
    ///
    /// A signal without a current snapshot or without a matching strategy is
    /// left in place so a transient outage cannot mass-invalidate.
    pub async fn validate_pending_signals(
        &self,
        token: &CancellationToken,
    ) -> Result<ValidationStats> {
        let due = self
            .store
            .pending_signals_due(Utc::now())
            .await
            .context("loading due signals")?;

        let mut stats = ValidationStats::default();

        for mut signal in due {
            if token.is_cancelled() {
                bail!("confirmation pass cancelled");
            }
            stats.checked += 1;

            let Some(current) = self
                .store
                .latest_snapshot(&signal.symbol)
                .await
                .context("loading confirmation snapshot")?
            else {
                tracing::warn!(
                    symbol = %signal.symbol,
                    signal_id = %signal.signal_id,
                    "no current snapshot, leaving signal pending"
                );
                stats.deferred += 1;
                continue;
            };

            let Some(strategy) = self
                .strategies
                .iter()
                .find(|s| s.name() == signal.strategy_name)
            else {
                tracing::warn!(
                    strategy = %signal.strategy_name,
                    signal_id = %signal.signal_id,
                    "no strategy registered for signal, leaving pending"
                );
                stats.deferred += 1;
                continue;
            };

            let (holds, reason) = strategy.validate_confirmation(&signal, &current);
            if holds {
                signal.confirm(Utc::now())?;
                self.store.update_signal(&signal).await?;
                self.dispatcher.dispatch(&Event::signal_confirmed(&signal)).await;
                stats.confirmed += 1;
                tracing::info!(
                    symbol = %signal.symbol,
                    signal_id = %signal.signal_id,
                    "signal confirmed: {reason}"
                );
            } else {
                signal.invalidate(&reason)?;
                self.store.update_signal(&signal).await?;
                self.dispatcher
                    .dispatch(&Event::signal_invalidated(&signal, &reason))
                    .await;
                stats.invalidated += 1;
                tracing::info!(
                    symbol = %signal.symbol,
                    signal_id = %signal.signal_id,
                    "signal invalidated: {reason}"
                );
            }
        }

        tracing::info!(
            checked = stats.checked,
            confirmed = stats.confirmed,
            invalidated = stats.invalidated,
            deferred = stats.deferred,
            "confirmation pass complete"
        );

        Ok(stats)
    }
}
