use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{MarketError, StrategyError};
use crate::signal::Signal;
use crate::types::{Kline, RatioSample, Snapshot, SymbolInfo, Ticker24h};

/// Seam over the upstream venue so collectors, trackers and strategies can
/// be exercised against fakes. `BinanceClient` is the production
/// implementation.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// All quoted contracts with their listing status.
    async fn active_symbols(&self) -> Result<Vec<SymbolInfo>, MarketError>;

    /// Global long/short account ratio, normalized to percent.
    async fn global_long_short_ratio(
        &self,
        symbol: &str,
        period: &str,
    ) -> Result<RatioSample, MarketError>;

    /// Top-trader long/short position ratio, normalized to percent.
    /// `Ok(None)` when the venue does not publish the series for `symbol`;
    /// absence is not an error.
    async fn top_trader_position_ratio(
        &self,
        symbol: &str,
        period: &str,
    ) -> Result<Option<RatioSample>, MarketError>;

    async fn open_interest(&self, symbol: &str) -> Result<Decimal, MarketError>;

    async fn funding_rate(&self, symbol: &str) -> Result<Decimal, MarketError>;

    async fn price(&self, symbol: &str) -> Result<Decimal, MarketError>;

    async fn ticker_24h(&self, symbol: &str) -> Result<Ticker24h, MarketError>;

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Kline>, MarketError>;

    async fn klines_since(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Kline>, MarketError>;
}

/// Parameters shared by every strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    pub confirmation_hours: i64,
    pub tracking_hours: i64,
    pub profit_target_pct: Decimal,
    pub stop_loss_pct: Decimal,
}

/// Contract every signal strategy satisfies. The set shipped is closed:
/// minority-follower, whale-divergence and smart-money SFP.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Stable configuration key, e.g. `minority`.
    fn key(&self) -> &'static str;

    /// Persisted strategy name, e.g. `minority_follower`.
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    fn params(&self) -> &StrategyParams;

    /// Evaluate a window of recent snapshots (newest first) and produce
    /// zero or more candidate signals.
    async fn analyze(&self, window: &[Snapshot]) -> Result<Vec<Signal>, StrategyError>;

    /// Cheap admission check on the latest snapshot, with a human-readable
    /// reason either way.
    fn should_generate(&self, latest: &Snapshot) -> (bool, String);

    /// Re-check a pending signal against the confirmation-time snapshot.
    fn validate_confirmation(&self, signal: &Signal, current: &Snapshot) -> (bool, String);
}
