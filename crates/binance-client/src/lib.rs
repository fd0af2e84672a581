use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_core::{
    Kline, MarketDataSource, MarketError, RatioSample, SymbolInfo, Ticker24h,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://fapi.binance.com";

/// Construction options for [`BinanceClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub base_url: String,
    /// Optional API key sent as `X-MBX-APIKEY`. All consumed endpoints are
    /// public, so this is only needed for raised rate-limit tiers.
    pub api_key: Option<String>,
    /// Per-call deadline.
    pub timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Read-only client for the Binance USDⓈ-M futures REST surface.
///
/// Every method is a single upstream exchange under the configured deadline.
/// The client never retries; the collector owns the retry policy.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceClient {
    pub fn new(options: ClientOptions) -> Result<Self, MarketError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = &options.api_key {
            if let Ok(val) = reqwest::header::HeaderValue::from_str(key) {
                headers.insert("X-MBX-APIKEY", val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(options.timeout)
            .build()
            .map_err(|e| MarketError::Transport(e.to_string()))?;

        Ok(Self {
            base_url: options.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn get_json(&self, path_and_query: &str) -> Result<serde_json::Value, MarketError> {
        let url = format!("{}{}", self.base_url, path_and_query);

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                MarketError::Timeout
            } else {
                MarketError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                MarketError::Timeout
            } else {
                MarketError::Transport(e.to_string())
            }
        })?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(MarketError::RateLimited {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(MarketError::Upstream {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        serde_json::from_str(&body)
            .map_err(|e| MarketError::Malformed(format!("invalid JSON: {e}")))
    }

    async fn fetch_ratio(
        &self,
        endpoint: &str,
        symbol: &str,
        period: &str,
    ) -> Result<Vec<RatioEntry>, MarketError> {
        let value = self
            .get_json(&format!(
                "/futures/data/{endpoint}?symbol={symbol}&period={period}&limit=1"
            ))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| MarketError::Malformed(format!("{endpoint} payload: {e}")))
    }
}

#[async_trait]
impl MarketDataSource for BinanceClient {
    async fn active_symbols(&self) -> Result<Vec<SymbolInfo>, MarketError> {
        let value = self.get_json("/fapi/v1/exchangeInfo").await?;
        let info: ExchangeInfo = serde_json::from_value(value)
            .map_err(|e| MarketError::Malformed(format!("exchangeInfo payload: {e}")))?;

        if info.symbols.is_empty() {
            return Err(MarketError::EmptyResponse);
        }

        Ok(info
            .symbols
            .into_iter()
            .map(|s| SymbolInfo {
                symbol: s.symbol,
                quote_asset: s.quote_asset,
                status: s.status,
            })
            .collect())
    }

    async fn global_long_short_ratio(
        &self,
        symbol: &str,
        period: &str,
    ) -> Result<RatioSample, MarketError> {
        let entries = self
            .fetch_ratio("globalLongShortAccountRatio", symbol, period)
            .await?;
        let entry = entries.first().ok_or(MarketError::EmptyResponse)?;
        entry.to_sample(symbol)
    }

    async fn top_trader_position_ratio(
        &self,
        symbol: &str,
        period: &str,
    ) -> Result<Option<RatioSample>, MarketError> {
        let entries = self
            .fetch_ratio("topLongShortPositionRatio", symbol, period)
            .await?;
        // Absence of the series is a sentinel, not an error.
        match entries.first() {
            Some(entry) => Ok(Some(entry.to_sample(symbol)?)),
            None => {
                tracing::debug!(symbol, "top trader position ratio unavailable");
                Ok(None)
            }
        }
    }

    async fn open_interest(&self, symbol: &str) -> Result<Decimal, MarketError> {
        let value = self
            .get_json(&format!(
                "/futures/data/openInterestHist?symbol={symbol}&period=5m&limit=1"
            ))
            .await?;
        let entries: Vec<OpenInterestEntry> = serde_json::from_value(value)
            .map_err(|e| MarketError::Malformed(format!("openInterestHist payload: {e}")))?;
        let entry = entries.first().ok_or(MarketError::EmptyResponse)?;
        parse_decimal(&entry.sum_open_interest, "sumOpenInterest")
    }

    async fn funding_rate(&self, symbol: &str) -> Result<Decimal, MarketError> {
        let value = self
            .get_json(&format!("/fapi/v1/premiumIndex?symbol={symbol}"))
            .await?;
        let entry: PremiumIndex = serde_json::from_value(value)
            .map_err(|e| MarketError::Malformed(format!("premiumIndex payload: {e}")))?;
        parse_decimal(&entry.last_funding_rate, "lastFundingRate")
    }

    async fn price(&self, symbol: &str) -> Result<Decimal, MarketError> {
        let value = self
            .get_json(&format!("/fapi/v1/premiumIndex?symbol={symbol}"))
            .await?;
        let entry: PremiumIndex = serde_json::from_value(value)
            .map_err(|e| MarketError::Malformed(format!("premiumIndex payload: {e}")))?;
        parse_decimal(&entry.mark_price, "markPrice")
    }

    async fn ticker_24h(&self, symbol: &str) -> Result<Ticker24h, MarketError> {
        let value = self
            .get_json(&format!("/fapi/v1/ticker/24hr?symbol={symbol}"))
            .await?;
        let entry: Ticker24hEntry = serde_json::from_value(value)
            .map_err(|e| MarketError::Malformed(format!("ticker/24hr payload: {e}")))?;
        Ok(Ticker24h {
            symbol: entry.symbol,
            last_price: parse_decimal(&entry.last_price, "lastPrice")?,
            quote_volume: parse_decimal(&entry.quote_volume, "quoteVolume")?,
        })
    }

    async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Kline>, MarketError> {
        let value = self
            .get_json(&format!(
                "/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}"
            ))
            .await?;
        parse_kline_rows(&value)
    }

    async fn klines_since(
        &self,
        symbol: &str,
        interval: &str,
        start: DateTime<Utc>,
    ) -> Result<Vec<Kline>, MarketError> {
        let start_ms = start.timestamp_millis();
        let value = self
            .get_json(&format!(
                "/fapi/v1/klines?symbol={symbol}&interval={interval}&startTime={start_ms}&limit=500"
            ))
            .await?;
        parse_kline_rows(&value)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wire payloads. All numeric fields arrive as decimal strings and are parsed
// straight into Decimal, never through a binary float.
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

#[derive(Debug, Deserialize)]
struct ExchangeSymbol {
    symbol: String,
    status: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
}

#[derive(Debug, Deserialize)]
struct RatioEntry {
    #[serde(rename = "longAccount")]
    long_account: String,
    #[serde(rename = "shortAccount")]
    short_account: String,
    timestamp: i64,
}

impl RatioEntry {
    /// Normalize the venue's `[0,1]` fractions to percent.
    fn to_sample(&self, symbol: &str) -> Result<RatioSample, MarketError> {
        let long = parse_decimal(&self.long_account, "longAccount")? * Decimal::ONE_HUNDRED;
        let short = parse_decimal(&self.short_account, "shortAccount")? * Decimal::ONE_HUNDRED;
        let timestamp = DateTime::from_timestamp_millis(self.timestamp)
            .ok_or_else(|| MarketError::Malformed(format!("bad timestamp {}", self.timestamp)))?;
        Ok(RatioSample {
            symbol: symbol.to_string(),
            long_ratio: long.round_dp(4),
            short_ratio: short.round_dp(4),
            timestamp,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenInterestEntry {
    #[serde(rename = "sumOpenInterest")]
    sum_open_interest: String,
}

#[derive(Debug, Deserialize)]
struct PremiumIndex {
    #[serde(rename = "markPrice")]
    mark_price: String,
    #[serde(rename = "lastFundingRate")]
    last_funding_rate: String,
}

#[derive(Debug, Deserialize)]
struct Ticker24hEntry {
    symbol: String,
    #[serde(rename = "lastPrice")]
    last_price: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, MarketError> {
    Decimal::from_str(raw)
        .map_err(|_| MarketError::Malformed(format!("field {field}: '{raw}' is not a decimal")))
}

/// Parse the venue's array-of-arrays kline format.
///
/// Indices: [0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume, [6] closeTime; remaining columns are ignored.
fn parse_kline_rows(value: &serde_json::Value) -> Result<Vec<Kline>, MarketError> {
    let rows = value
        .as_array()
        .ok_or_else(|| MarketError::Malformed("klines response is not an array".into()))?;

    let mut klines = Vec::with_capacity(rows.len());
    for row in rows {
        let cols = row
            .as_array()
            .ok_or_else(|| MarketError::Malformed("kline row is not an array".into()))?;
        if cols.len() < 7 {
            return Err(MarketError::Malformed(format!(
                "kline row has {} columns",
                cols.len()
            )));
        }

        let open_time_ms = cols[0]
            .as_i64()
            .ok_or_else(|| MarketError::Malformed("kline openTime is not an integer".into()))?;
        let close_time_ms = cols[6]
            .as_i64()
            .ok_or_else(|| MarketError::Malformed("kline closeTime is not an integer".into()))?;

        let field = |idx: usize, name: &str| -> Result<Decimal, MarketError> {
            let raw = cols[idx]
                .as_str()
                .ok_or_else(|| MarketError::Malformed(format!("kline {name} is not a string")))?;
            parse_decimal(raw, name)
        };

        klines.push(Kline {
            open_time: DateTime::from_timestamp_millis(open_time_ms)
                .ok_or_else(|| MarketError::Malformed(format!("bad openTime {open_time_ms}")))?,
            close_time: DateTime::from_timestamp_millis(close_time_ms)
                .ok_or_else(|| MarketError::Malformed(format!("bad closeTime {close_time_ms}")))?,
            open: field(1, "open")?,
            high: field(2, "high")?,
            low: field(3, "low")?,
            close: field(4, "close")?,
            volume: field(5, "volume")?,
        });
    }

    Ok(klines)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn ratio_entry_normalizes_to_percent() {
        let entry: RatioEntry = serde_json::from_str(
            r#"{"symbol":"BTCUSDT","longShortRatio":"4.0000","longAccount":"0.8000","shortAccount":"0.2000","timestamp":1714557600000}"#,
        )
        .unwrap();
        let sample = entry.to_sample("BTCUSDT").unwrap();
        assert_eq!(sample.long_ratio, dec!(80));
        assert_eq!(sample.short_ratio, dec!(20));
        assert_eq!(sample.timestamp.timestamp_millis(), 1714557600000);
    }

    #[test]
    fn kline_rows_parse_without_float_hop() {
        let raw = serde_json::json!([
            [
                1714557600000i64,
                "62000.10",
                "62500.00",
                "61800.50",
                "62100.00",
                "1234.567",
                1714561199999i64,
                "76000000.00",
                1000,
                "600.0",
                "37000000.0",
                "0"
            ]
        ]);
        let klines = parse_kline_rows(&raw).unwrap();
        assert_eq!(klines.len(), 1);
        assert_eq!(klines[0].open, dec!(62000.10));
        assert_eq!(klines[0].close, dec!(62100.00));
        assert_eq!(klines[0].open_time.timestamp_millis(), 1714557600000);
        assert_eq!(klines[0].close_time.timestamp_millis(), 1714561199999);
    }

    #[test]
    fn short_kline_row_is_malformed() {
        let raw = serde_json::json!([[1714557600000i64, "1", "2"]]);
        assert!(matches!(
            parse_kline_rows(&raw),
            Err(MarketError::Malformed(_))
        ));
    }

    #[test]
    fn non_decimal_field_is_malformed() {
        assert!(matches!(
            parse_decimal("not-a-number", "open"),
            Err(MarketError::Malformed(_))
        ));
    }
}
