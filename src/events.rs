//! In-process change notifications for open views.
//!
//! Every successful mutation publishes a [`CashEvent`]; subscribers (the
//! session list, the register screen) use them to refresh. Events are
//! best-effort: with no subscribers they are dropped, and a slow subscriber
//! that lags behind is told so by the channel and should reload.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CashEvent {
    SessionOpened { session: Value },
    SessionClosed { session: Value },
    SessionReopened { session: Value },
    MovementAdded { session: Value },
    SaleCreated { sale: Value },
    SaleCancelled { sale: Value },
    /// A view acted on stale data and should reload the session.
    RefreshRequested { session_id: Option<String> },
}

impl CashEvent {
    /// Name of the channel the frontend listens on.
    pub fn channel(&self) -> &'static str {
        match self {
            CashEvent::SaleCreated { .. } | CashEvent::SaleCancelled { .. } => "sale_updated",
            _ => "cash_session_updated",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CashEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CashEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: CashEvent) {
        let channel = event.channel();
        match self.tx.send(event) {
            Ok(receivers) => debug!(channel, receivers, "Event emitted"),
            Err(_) => debug!(channel, "Event dropped, no subscribers"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(CashEvent::SessionClosed {
            session: json!({ "id": "s-1" }),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.channel(), "cash_session_updated");

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["action"], "session_closed");
        assert_eq!(wire["session"]["id"], "s-1");
    }

    #[test]
    fn test_emit_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        bus.emit(CashEvent::SaleCreated { sale: json!({}) });
        assert_eq!(CashEvent::SaleCancelled { sale: json!({}) }.channel(), "sale_updated");
    }
}
