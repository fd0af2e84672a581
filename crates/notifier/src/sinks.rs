use async_trait::async_trait;
use std::collections::HashSet;

use crate::{Event, EventKind, NotificationSink, NotifyError};

/// Logs every subscribed event through tracing. Mostly useful in
/// development and as a last-resort channel.
pub struct ConsoleSink {
    enabled: bool,
    kinds: HashSet<EventKind>,
}

impl ConsoleSink {
    pub fn new(enabled: bool, kinds: HashSet<EventKind>) -> Self {
        Self { enabled, kinds }
    }
}

#[async_trait]
impl NotificationSink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn handles(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        tracing::info!(
            kind = event.kind.as_str(),
            title = %event.title,
            "{}",
            event.message
        );
        Ok(())
    }
}

/// Telegram bot-API channel.
pub struct TelegramSink {
    enabled: bool,
    kinds: HashSet<EventKind>,
    bot_token: String,
    chat_id: String,
    client: reqwest::Client,
}

impl TelegramSink {
    pub fn new(
        enabled: bool,
        kinds: HashSet<EventKind>,
        bot_token: String,
        chat_id: String,
    ) -> Self {
        Self {
            enabled,
            kinds,
            bot_token,
            chat_id,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn name(&self) -> &str {
        "telegram"
    }

    fn enabled(&self) -> bool {
        self.enabled && !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    fn handles(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = serde_json::json!({
            "chat_id": self.chat_id,
            "text": format!("{}\n{}", event.title, event.message),
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(format!(
                "telegram returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Generic JSON webhook channel: POSTs the whole event.
pub struct WebhookSink {
    enabled: bool,
    kinds: HashSet<EventKind>,
    url: String,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(enabled: bool, kinds: HashSet<EventKind>, url: String) -> Self {
        Self {
            enabled,
            kinds,
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.enabled && !self.url.is_empty()
    }

    fn handles(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        let payload = serde_json::json!({
            "kind": event.kind.as_str(),
            "title": event.title,
            "message": event.message,
            "metadata": event.metadata,
            "timestamp": event.timestamp.to_rfc3339(),
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}
