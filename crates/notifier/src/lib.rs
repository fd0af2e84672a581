//! Typed event dispatch to pluggable notification sinks.
//!
//! Delivery is at-least-once and best-effort per sink: a failing sink is
//! logged and never stops the others.

mod sinks;

pub use sinks::{ConsoleSink, TelegramSink, WebhookSink};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use market_core::{OutcomeKind, Signal, SignalOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The event kinds the dispatcher routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    SignalGenerated,
    SignalConfirmed,
    SignalInvalidated,
    SignalOutcome,
    SystemError,
    StatisticsChange,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SignalGenerated => "signal_generated",
            EventKind::SignalConfirmed => "signal_confirmed",
            EventKind::SignalInvalidated => "signal_invalidated",
            EventKind::SignalOutcome => "signal_outcome",
            EventKind::SystemError => "system_error",
            EventKind::StatisticsChange => "statistics_change",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "signal_generated" => Some(EventKind::SignalGenerated),
            "signal_confirmed" => Some(EventKind::SignalConfirmed),
            "signal_invalidated" => Some(EventKind::SignalInvalidated),
            "signal_outcome" => Some(EventKind::SignalOutcome),
            "system_error" => Some(EventKind::SystemError),
            "statistics_change" => Some(EventKind::StatisticsChange),
            _ => None,
        }
    }
}

/// One event to be fanned out to the configured sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: EventKind, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            message: message.into(),
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn signal_generated(signal: &Signal) -> Self {
        Self::new(
            EventKind::SignalGenerated,
            format!("New {} signal: {}", signal.direction, signal.symbol),
            format!(
                "{} generated a {} signal on {} at {} ({})",
                signal.strategy_name,
                signal.direction,
                signal.symbol,
                signal.price_at_signal,
                signal.reason
            ),
        )
        .with_metadata(serde_json::json!({
            "signal_id": signal.signal_id,
            "symbol": signal.symbol,
            "strategy": signal.strategy_name,
            "direction": signal.direction.as_str(),
            "price": signal.price_at_signal.to_string(),
        }))
    }

    pub fn signal_confirmed(signal: &Signal) -> Self {
        Self::new(
            EventKind::SignalConfirmed,
            format!("Signal confirmed: {} {}", signal.symbol, signal.direction),
            format!(
                "{} {} on {} survived its confirmation window",
                signal.strategy_name, signal.direction, signal.symbol
            ),
        )
        .with_metadata(serde_json::json!({
            "signal_id": signal.signal_id,
            "symbol": signal.symbol,
        }))
    }

    pub fn signal_invalidated(signal: &Signal, reason: &str) -> Self {
        Self::new(
            EventKind::SignalInvalidated,
            format!("Signal invalidated: {} {}", signal.symbol, signal.direction),
            format!(
                "{} {} on {} failed confirmation: {}",
                signal.strategy_name, signal.direction, signal.symbol, reason
            ),
        )
        .with_metadata(serde_json::json!({
            "signal_id": signal.signal_id,
            "symbol": signal.symbol,
        }))
    }

    pub fn signal_outcome(signal: &Signal, outcome: &SignalOutcome) -> Self {
        let verdict = match outcome.outcome {
            OutcomeKind::Profit => "in profit",
            OutcomeKind::Loss => "at a loss",
            OutcomeKind::Neutral => "flat",
            OutcomeKind::Timeout => "on timeout",
        };
        Self::new(
            EventKind::SignalOutcome,
            format!("Signal closed: {} {}", signal.symbol, signal.direction),
            format!(
                "{} {} on {} closed {} ({}% after {}h)",
                signal.strategy_name,
                signal.direction,
                signal.symbol,
                verdict,
                outcome.final_price_change_pct,
                outcome.total_tracking_hours
            ),
        )
        .with_metadata(serde_json::json!({
            "signal_id": signal.signal_id,
            "symbol": signal.symbol,
            "outcome": outcome.outcome.as_str(),
            "final_change_pct": outcome.final_price_change_pct.to_string(),
        }))
    }

    pub fn system_error(source: &str, message: impl Into<String>) -> Self {
        Self::new(
            EventKind::SystemError,
            format!("System error in {source}"),
            message,
        )
        .with_metadata(serde_json::json!({ "source": source }))
    }
}

/// Errors from the notification sinks.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("sink rejected event: {0}")]
    Rejected(String),
}

/// A delivery channel. Each sink declares whether it is enabled and which
/// event kinds it subscribes to.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    fn handles(&self, kind: EventKind) -> bool;

    async fn send(&self, event: &Event) -> Result<(), NotifyError>;
}

/// Routes events to every enabled, subscribed sink.
#[derive(Clone)]
pub struct Dispatcher {
    sinks: Arc<Vec<Box<dyn NotificationSink>>>,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        if sinks.is_empty() {
            tracing::info!("no notification sinks configured");
        }
        Self {
            sinks: Arc::new(sinks),
        }
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Deliver `event` to every interested sink, awaiting completion. A sink
    /// failure is logged and does not stop the remaining sinks.
    pub async fn dispatch(&self, event: &Event) {
        for sink in self.sinks.iter() {
            if !sink.enabled() || !sink.handles(event.kind) {
                continue;
            }
            match sink.send(event).await {
                Ok(()) => {
                    tracing::debug!(sink = sink.name(), kind = event.kind.as_str(), "event sent")
                }
                Err(e) => tracing::warn!(
                    sink = sink.name(),
                    kind = event.kind.as_str(),
                    "notification failed: {e}"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        kinds: Vec<EventKind>,
        sent: Arc<AtomicUsize>,
        fail: bool,
    }

    impl RecordingSink {
        fn boxed(kinds: Vec<EventKind>, fail: bool) -> (Box<dyn NotificationSink>, Arc<AtomicUsize>) {
            let sent = Arc::new(AtomicUsize::new(0));
            let sink = Box::new(RecordingSink {
                kinds,
                sent: Arc::clone(&sent),
                fail,
            });
            (sink, sent)
        }
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        fn enabled(&self) -> bool {
            true
        }

        fn handles(&self, kind: EventKind) -> bool {
            self.kinds.contains(&kind)
        }

        async fn send(&self, _event: &Event) -> Result<(), NotifyError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotifyError::Transport("boom".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn unsubscribed_kinds_are_skipped() {
        let (sink, sent) = RecordingSink::boxed(vec![EventKind::SignalGenerated], false);
        let dispatcher = Dispatcher::new(vec![sink]);

        dispatcher
            .dispatch(&Event::new(EventKind::SystemError, "t", "m"))
            .await;
        dispatcher
            .dispatch(&Event::new(EventKind::SignalGenerated, "t", "m"))
            .await;

        assert_eq!(sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failing_sink_does_not_stop_others() {
        let (failing, _) = RecordingSink::boxed(vec![EventKind::SignalGenerated], true);
        let (healthy, healthy_sent) = RecordingSink::boxed(vec![EventKind::SignalGenerated], false);

        let dispatcher = Dispatcher::new(vec![failing, healthy]);
        dispatcher
            .dispatch(&Event::new(EventKind::SignalGenerated, "t", "m"))
            .await;

        assert_eq!(healthy_sent.load(Ordering::SeqCst), 1);
    }
}
