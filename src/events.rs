// =============================================================================
// Domain event bus + recent-error ring buffer
// =============================================================================
//
// The core emits typed domain events consumed by the gateway's push layer.
// Publishing never blocks: the bus is a tokio broadcast channel, and lagging
// subscribers lose the oldest events rather than stalling the engine.
// =============================================================================

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::ValidationError;

/// Maximum number of recent errors retained for the status snapshot.
const MAX_RECENT_ERRORS: usize = 50;

/// Broadcast capacity; slow subscribers drop oldest beyond this.
const BUS_CAPACITY: usize = 1024;

/// A recorded error event for the status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Categorical error kind (e.g. `BROKER_REJECTED`, `CONNECTION`).
    pub kind: String,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Typed domain events. Each payload carries the ids needed to join back to
/// persistent state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineEvent {
    SystemStatus {
        snapshot: serde_json::Value,
    },
    CandleFinalized {
        symbol: String,
        timeframe: String,
        open_time: i64,
    },
    SignalPublished {
        signal_id: String,
        symbol: String,
        direction: String,
        deliveries: usize,
    },
    IntentApproved {
        intent_id: String,
        signal_id: String,
        user_broker_id: String,
    },
    IntentRejected {
        intent_id: String,
        signal_id: String,
        user_broker_id: String,
        errors: Vec<ValidationError>,
    },
    OrderCreated {
        trade_id: String,
        intent_id: String,
        broker_order_id: String,
    },
    OrderRejected {
        trade_id: String,
        intent_id: String,
        error_code: String,
        error_message: String,
    },
    OrderTimeout {
        trade_id: String,
    },
    ExitIntentPlaced {
        exit_intent_id: String,
        trade_id: String,
        broker_order_id: String,
    },
    ExitIntentFilled {
        exit_intent_id: String,
        trade_id: String,
    },
    ExitIntentFailed {
        exit_intent_id: String,
        trade_id: String,
        reason: String,
    },
    ExitIntentCancelled {
        exit_intent_id: String,
        trade_id: String,
    },
}

/// Fan-out bus shared by every component. Cloning is cheap.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
    recent_errors: RwLock<Vec<ErrorRecord>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            recent_errors: RwLock::new(Vec::new()),
        }
    }

    /// Publish an event. A send error only means no subscriber is currently
    /// attached, which is normal during startup and in FEED_COLLECTOR mode.
    pub fn publish(&self, event: EngineEvent) {
        debug!(event = ?event, "publishing engine event");
        let _ = self.tx.send(event);
    }

    /// Obtain a fresh subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Record an error for the status snapshot. The ring buffer is capped;
    /// oldest entries are evicted.
    pub fn push_error(&self, kind: &str, message: impl Into<String>) {
        let record = ErrorRecord {
            kind: kind.to_string(),
            message: message.into(),
            at: Utc::now().to_rfc3339(),
        };
        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    /// Snapshot of the recent error log, oldest first.
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("recent_errors", &self.recent_errors.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::OrderTimeout {
            trade_id: "t1".into(),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::OrderTimeout { trade_id } => assert_eq!(trade_id, "t1"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::OrderTimeout {
            trade_id: "t1".into(),
        });
    }

    #[test]
    fn error_ring_buffer_is_capped() {
        let bus = EventBus::new();
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            bus.push_error("CONNECTION", format!("err {i}"));
        }
        let errors = bus.recent_errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors.last().unwrap().message, "err 59");
    }

    #[test]
    fn events_serialise_with_type_tag() {
        let ev = EngineEvent::SignalPublished {
            signal_id: "s1".into(),
            symbol: "SBIN".into(),
            direction: "BUY".into(),
            deliveries: 2,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "SIGNAL_PUBLISHED");
        assert_eq!(json["symbol"], "SBIN");
    }
}
