use async_trait::async_trait;
use notifier::{Event, EventKind, NotificationSink, NotifyError};
use signal_store::Store;

/// Records every dispatched event into the `notifications` audit table.
/// Subscribes to everything; an insert failure is reported like any other
/// sink failure and never blocks delivery elsewhere.
pub struct DbSink {
    store: Store,
}

impl DbSink {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl NotificationSink for DbSink {
    fn name(&self) -> &str {
        "database"
    }

    fn enabled(&self) -> bool {
        true
    }

    fn handles(&self, _kind: EventKind) -> bool {
        true
    }

    async fn send(&self, event: &Event) -> Result<(), NotifyError> {
        let metadata = (!event.metadata.is_null()).then_some(&event.metadata);
        self.store
            .record_notification(
                event.kind.as_str(),
                &event.title,
                &event.message,
                metadata,
                event.timestamp,
            )
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notifier::Dispatcher;

    #[tokio::test]
    async fn dispatched_events_land_in_the_audit_table() {
        let store = Store::in_memory().await.unwrap();
        let dispatcher = Dispatcher::new(vec![Box::new(DbSink::new(store.clone()))]);

        dispatcher
            .dispatch(&Event::system_error("collector", "sweep failed"))
            .await;
        dispatcher
            .dispatch(&Event::new(EventKind::SignalGenerated, "t", "m"))
            .await;

        assert_eq!(store.notification_count().await.unwrap(), 2);
    }
}
