//! Configurable in-memory [`MarketDataSource`] used by test suites across
//! the workspace. Not intended for production wiring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::error::MarketError;
use crate::traits::MarketDataSource;
use crate::types::{Kline, RatioSample, SymbolInfo, Ticker24h};

#[derive(Default)]
struct Inner {
    symbols: Vec<SymbolInfo>,
    account_ratios: HashMap<String, RatioSample>,
    position_ratios: HashMap<String, RatioSample>,
    position_ratio_missing: HashSet<String>,
    tickers: HashMap<String, Ticker24h>,
    open_interest: HashMap<String, Decimal>,
    funding_rates: HashMap<String, Decimal>,
    prices: HashMap<String, VecDeque<Decimal>>,
    klines: HashMap<String, Vec<Kline>>,
    failing: HashSet<String>,
}

/// Seedable fake venue. Price quotes are consumed as a sequence so tests can
/// script a tick path; the final price repeats once the queue drains.
#[derive(Default)]
pub struct FakeMarketData {
    inner: Mutex<Inner>,
}

impl FakeMarketData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_symbol(&self, symbol: &str, quote_asset: &str, status: &str) {
        self.inner.lock().unwrap().symbols.push(SymbolInfo {
            symbol: symbol.into(),
            quote_asset: quote_asset.into(),
            status: status.into(),
        });
    }

    pub fn set_account_ratio(&self, symbol: &str, long: Decimal, short: Decimal) {
        self.inner.lock().unwrap().account_ratios.insert(
            symbol.into(),
            RatioSample {
                symbol: symbol.into(),
                long_ratio: long,
                short_ratio: short,
                timestamp: Utc::now(),
            },
        );
    }

    pub fn set_position_ratio(&self, symbol: &str, long: Decimal, short: Decimal) {
        self.inner.lock().unwrap().position_ratios.insert(
            symbol.into(),
            RatioSample {
                symbol: symbol.into(),
                long_ratio: long,
                short_ratio: short,
                timestamp: Utc::now(),
            },
        );
    }

    /// Make the position-ratio series absent for `symbol` (the venue's
    /// "unavailable" sentinel, not an error).
    pub fn drop_position_ratio(&self, symbol: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.position_ratios.remove(symbol);
        inner.position_ratio_missing.insert(symbol.into());
    }

    pub fn set_ticker(&self, symbol: &str, last_price: Decimal, quote_volume: Decimal) {
        self.inner.lock().unwrap().tickers.insert(
            symbol.into(),
            Ticker24h {
                symbol: symbol.into(),
                last_price,
                quote_volume,
            },
        );
    }

    pub fn set_open_interest(&self, symbol: &str, value: Decimal) {
        self.inner
            .lock()
            .unwrap()
            .open_interest
            .insert(symbol.into(), value);
    }

    pub fn set_funding_rate(&self, symbol: &str, value: Decimal) {
        self.inner
            .lock()
            .unwrap()
            .funding_rates
            .insert(symbol.into(), value);
    }

    /// Script the sequence of prices `price()` returns for `symbol`.
    pub fn set_price_path(&self, symbol: &str, prices: &[Decimal]) {
        self.inner
            .lock()
            .unwrap()
            .prices
            .insert(symbol.into(), prices.iter().copied().collect());
    }

    pub fn set_klines(&self, symbol: &str, klines: Vec<Kline>) {
        self.inner.lock().unwrap().klines.insert(symbol.into(), klines);
    }

    /// Every upstream call for `symbol` fails until cleared.
    pub fn fail_symbol(&self, symbol: &str) {
        self.inner.lock().unwrap().failing.insert(symbol.into());
    }

    pub fn clear_failure(&self, symbol: &str) {
        self.inner.lock().unwrap().failing.remove(symbol);
    }

    fn check_failure(&self, symbol: &str) -> Result<(), MarketError> {
        if self.inner.lock().unwrap().failing.contains(symbol) {
            Err(MarketError::Upstream {
                status: 500,
                body: "injected failure".into(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MarketDataSource for FakeMarketData {
    async fn active_symbols(&self) -> Result<Vec<SymbolInfo>, MarketError> {
        Ok(self.inner.lock().unwrap().symbols.clone())
    }

    async fn global_long_short_ratio(
        &self,
        symbol: &str,
        _period: &str,
    ) -> Result<RatioSample, MarketError> {
        self.check_failure(symbol)?;
        self.inner
            .lock()
            .unwrap()
            .account_ratios
            .get(symbol)
            .cloned()
            .ok_or(MarketError::EmptyResponse)
    }

    async fn top_trader_position_ratio(
        &self,
        symbol: &str,
        _period: &str,
    ) -> Result<Option<RatioSample>, MarketError> {
        self.check_failure(symbol)?;
        let inner = self.inner.lock().unwrap();
        if inner.position_ratio_missing.contains(symbol) {
            return Ok(None);
        }
        Ok(inner.position_ratios.get(symbol).cloned())
    }

    async fn open_interest(&self, symbol: &str) -> Result<Decimal, MarketError> {
        self.check_failure(symbol)?;
        self.inner
            .lock()
            .unwrap()
            .open_interest
            .get(symbol)
            .copied()
            .ok_or(MarketError::EmptyResponse)
    }

    async fn funding_rate(&self, symbol: &str) -> Result<Decimal, MarketError> {
        self.check_failure(symbol)?;
        self.inner
            .lock()
            .unwrap()
            .funding_rates
            .get(symbol)
            .copied()
            .ok_or(MarketError::EmptyResponse)
    }

    async fn price(&self, symbol: &str) -> Result<Decimal, MarketError> {
        self.check_failure(symbol)?;
        let mut inner = self.inner.lock().unwrap();
        let path = inner
            .prices
            .get_mut(symbol)
            .ok_or(MarketError::EmptyResponse)?;
        if path.len() > 1 {
            Ok(path.pop_front().unwrap())
        } else {
            path.front().copied().ok_or(MarketError::EmptyResponse)
        }
    }

    async fn ticker_24h(&self, symbol: &str) -> Result<Ticker24h, MarketError> {
        self.check_failure(symbol)?;
        self.inner
            .lock()
            .unwrap()
            .tickers
            .get(symbol)
            .cloned()
            .ok_or(MarketError::EmptyResponse)
    }

    async fn klines(
        &self,
        symbol: &str,
        _interval: &str,
        limit: u32,
    ) -> Result<Vec<Kline>, MarketError> {
        self.check_failure(symbol)?;
        let inner = self.inner.lock().unwrap();
        let all = inner.klines.get(symbol).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit as usize);
        Ok(all.into_iter().skip(skip).collect())
    }

    async fn klines_since(
        &self,
        symbol: &str,
        _interval: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Kline>, MarketError> {
        self.check_failure(symbol)?;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .klines
            .get(symbol)
            .map(|ks| {
                ks.iter()
                    .filter(|k| k.open_time >= start)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
