//! Scheduled ingestion: drives the market data source over the active symbol
//! set, validates the assembled snapshots and persists them.
//!
//! The sweep is deliberately single-threaded with an inter-symbol pacing
//! delay; fanning out per-symbol requests would blow the venue's per-minute
//! request budget.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use market_core::{MarketDataSource, MarketError, Snapshot};
use rust_decimal::Decimal;
use signal_store::Store;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Quality score deduction applied when the position-ratio series is absent.
const MISSING_POSITION_RATIO_PENALTY: u32 = 20;

/// Bounded retry for one symbol's market-data assembly.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    /// Reserved for a future exponential policy; the shipped delay is
    /// linear (`delay * attempt`).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
            multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Only contracts margined in this asset are swept, e.g. `USDT`.
    pub quote_asset: String,
    pub exclude_pairs: Vec<String>,
    /// Ratio endpoint period parameter, e.g. `1h`.
    pub ratio_period: String,
    /// Inter-symbol pacing delay.
    pub pace: Duration,
    pub retry: RetryPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".into(),
            exclude_pairs: Vec::new(),
            ratio_period: "1h".into(),
            pace: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of one full sweep.
#[derive(Debug, Clone)]
pub struct SweepStats {
    pub total_symbols: usize,
    pub collected: usize,
    pub failed: usize,
    pub duration: Duration,
    pub failed_symbols: Vec<String>,
}

impl SweepStats {
    pub fn success_rate(&self) -> f64 {
        if self.total_symbols == 0 {
            return 100.0;
        }
        self.collected as f64 / self.total_symbols as f64 * 100.0
    }
}

pub struct Collector {
    source: Arc<dyn MarketDataSource>,
    store: Store,
    config: CollectorConfig,
}

impl Collector {
    pub fn new(source: Arc<dyn MarketDataSource>, store: Store, config: CollectorConfig) -> Self {
        Self {
            source,
            store,
            config,
        }
    }

    /// One full ingestion sweep over the active symbol set.
    pub async fn collect_all(&self, token: &CancellationToken) -> Result<SweepStats> {
        let started = Instant::now();

        let symbols = self.resolve_symbols().await?;
        self.store
            .sync_trading_pairs(&symbols, Utc::now())
            .await
            .context("syncing trading pair registry")?;

        let mut collected = 0usize;
        let mut failed_symbols = Vec::new();
        let mut batch: Vec<Snapshot> = Vec::with_capacity(symbols.len());

        for (index, symbol) in symbols.iter().enumerate() {
            if token.is_cancelled() {
                bail!("collection sweep cancelled");
            }
            if index > 0 && !self.config.pace.is_zero() {
                tokio::time::sleep(self.config.pace).await;
            }

            match self.assemble_with_retry(symbol, token).await {
                Ok(snapshot) => {
                    let now = Utc::now();
                    match snapshot.validate(now) {
                        Ok(()) => {
                            batch.push(snapshot);
                            collected += 1;
                        }
                        Err(e) => {
                            tracing::warn!(symbol, "snapshot failed validation: {e}");
                            failed_symbols.push(symbol.clone());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(symbol, "market data assembly failed: {e}");
                    failed_symbols.push(symbol.clone());
                }
            }
        }

        let inserted = self
            .store
            .insert_snapshots(&batch)
            .await
            .context("persisting snapshot batch")?;

        let stats = SweepStats {
            total_symbols: symbols.len(),
            collected,
            failed: failed_symbols.len(),
            duration: started.elapsed(),
            failed_symbols,
        };

        let rate = stats.success_rate();
        if rate < 80.0 {
            tracing::error!(
                total = stats.total_symbols,
                collected = stats.collected,
                failed = stats.failed,
                "collection sweep success rate {rate:.1}%"
            );
        } else if rate < 95.0 {
            tracing::warn!(
                total = stats.total_symbols,
                collected = stats.collected,
                failed = stats.failed,
                "collection sweep success rate {rate:.1}%"
            );
        } else {
            tracing::info!(
                total = stats.total_symbols,
                collected = stats.collected,
                failed = stats.failed,
                duration_ms = stats.duration.as_millis() as u64,
                inserted,
                "collection sweep complete"
            );
        }

        if stats.collected == 0 && stats.total_symbols > 0 {
            bail!(
                "collection sweep persisted zero snapshots across {} symbols",
                stats.total_symbols
            );
        }

        Ok(stats)
    }

    /// The venue symbol list intersected with the configured quote asset and
    /// minus the exclusion list.
    async fn resolve_symbols(&self) -> Result<Vec<String>> {
        let all = self
            .source
            .active_symbols()
            .await
            .context("fetching venue symbol list")?;

        let mut symbols: Vec<String> = all
            .into_iter()
            .filter(|s| s.is_trading() && s.quote_asset == self.config.quote_asset)
            .map(|s| s.symbol)
            .filter(|s| !self.config.exclude_pairs.contains(s))
            .collect();
        symbols.sort();

        Ok(symbols)
    }

    async fn assemble_with_retry(
        &self,
        symbol: &str,
        token: &CancellationToken,
    ) -> Result<Snapshot, MarketError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.assemble(symbol).await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_attempts => {
                    let delay = self.config.retry.delay * attempt;
                    tracing::debug!(
                        symbol,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying market data assembly: {e}"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return Err(MarketError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One market-data assembly: account ratio (required), position ratio
    /// (optional series), 24h ticker (required), open interest and funding
    /// rate (optional, zero when the venue declines).
    async fn assemble(&self, symbol: &str) -> Result<Snapshot, MarketError> {
        let period = &self.config.ratio_period;

        let account = self.source.global_long_short_ratio(symbol, period).await?;
        let position = self.source.top_trader_position_ratio(symbol, period).await?;
        let ticker = self.source.ticker_24h(symbol).await?;

        let open_interest = match self.source.open_interest(symbol).await {
            Ok(oi) => oi,
            Err(e) => {
                tracing::debug!(symbol, "open interest unavailable: {e}");
                Decimal::ZERO
            }
        };
        let funding_rate = match self.source.funding_rate(symbol).await {
            Ok(rate) => rate,
            Err(e) => {
                tracing::debug!(symbol, "funding rate unavailable: {e}");
                Decimal::ZERO
            }
        };

        let position_ratio_available = position.is_some();
        let (long_position, short_position) = position
            .map(|p| (p.long_ratio, p.short_ratio))
            .unwrap_or((Decimal::ZERO, Decimal::ZERO));

        let mut quality = Decimal::ONE_HUNDRED;
        if !position_ratio_available {
            quality -= Decimal::from(MISSING_POSITION_RATIO_PENALTY);
        }

        Ok(Snapshot {
            symbol: symbol.to_string(),
            timestamp: account.timestamp,
            long_account_ratio: account.long_ratio,
            short_account_ratio: account.short_ratio,
            long_position_ratio: long_position,
            short_position_ratio: short_position,
            position_ratio_available,
            data_quality_score: quality,
            price: ticker.last_price,
            volume_24h: ticker.quote_volume,
            open_interest,
            funding_rate,
        })
    }
}

#[cfg(test)]
mod tests;
