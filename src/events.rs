//! Server-pushed events for the IPC surface.
//!
//! Producers publish onto a broadcast bus; each IPC subscription forwards
//! from its own receiver. Publishing never blocks and never fails: with no
//! subscribers the event is dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::types::OrderSide;

/// Every event the surface can push, tagged by name on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    AutoLogoutWarning {
        minutes_remaining: u32,
        message: String,
    },
    AutoLogout {
        reason: String,
        timestamp: DateTime<Utc>,
    },
    OrderEvent {
        symbol: String,
        action: OrderSide,
        order_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        batch_order: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_last_order: Option<bool>,
    },
    WebhookAlert {
        strategy: String,
        message: String,
    },
    MarketTick {
        symbol: String,
        exchange: String,
        last_price: f64,
        timestamp: DateTime<Utc>,
    },
    WebsocketConnected {
        broker_id: String,
    },
    WebsocketDisconnected {
        broker_id: String,
    },
    WebsocketError {
        broker_id: String,
        message: String,
    },
    OauthCallback {
        broker_id: String,
        code: String,
        state: Option<String>,
    },
}

const EVENT_BUS_CAPACITY: usize = 256;

/// Process-wide event bus. Cheap to clone; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: Event) {
        // Send only errors when there are no receivers; that is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(Event::WebsocketConnected {
            broker_id: "fyers".into(),
        });

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                Event::WebsocketConnected { broker_id } => assert_eq!(broker_id, "fyers"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.publish(Event::WebsocketDisconnected {
            broker_id: "fyers".into(),
        });
    }

    #[test]
    fn test_wire_tag_names() {
        let event = Event::AutoLogoutWarning {
            minutes_remaining: 30,
            message: "session expires at 03:00 IST".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "auto_logout_warning");

        let event = Event::OauthCallback {
            broker_id: "upstox".into(),
            code: "abc".into(),
            state: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "oauth_callback");
    }
}
