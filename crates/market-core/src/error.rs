use thiserror::Error;

/// Errors surfaced by a market data source. The collector owns the retry
/// policy; the client itself never retries.
#[derive(Error, Debug)]
pub enum MarketError {
    #[error("upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream request timed out")]
    Timeout,

    #[error("upstream rate limit hit (HTTP {status})")]
    RateLimited { status: u16 },

    #[error("upstream returned an empty result set")]
    EmptyResponse,

    #[error("malformed upstream payload: {0}")]
    Malformed(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

impl MarketError {
    /// Whether the collector's bounded retry should attempt the call again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, MarketError::Cancelled)
    }
}

/// Domain invariant violations (snapshot constraints, signal state machine).
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("snapshot for '{symbol}' invalid: {reason}")]
    Snapshot { symbol: String, reason: String },

    #[error("illegal signal transition {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("signal {signal_id} is terminal ({status}); no further mutation allowed")]
    TerminalSignal { signal_id: String, status: String },
}

/// Errors from strategy evaluation.
#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    #[error(transparent)]
    Market(#[from] MarketError),
}

/// Persistence-layer errors that callers need to tell apart from ordinary
/// driver failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unique key violation: {0}")]
    UniqueViolation(String),

    #[error("row not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),
}
