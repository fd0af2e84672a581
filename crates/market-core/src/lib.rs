mod error;
mod math;
mod signal;
pub mod testing;
mod traits;
mod types;

pub use error::{MarketError, StoreError, StrategyError, ValidationError};
pub use math::{direction_change_pct, hours_between, pct_change};
pub use signal::{
    ExitReason, OutcomeKind, Signal, SignalDirection, SignalKlineTracking, SignalOutcome,
    SignalStatus, SignalTracking, StatisticsCell,
};
pub use traits::{MarketDataSource, Strategy, StrategyParams};
pub use types::{Kline, RatioSample, Snapshot, SymbolInfo, Ticker24h, TradingPair};
