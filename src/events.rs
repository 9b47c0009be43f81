use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

pub const EVENT_INITIALIZED: &str = "initialized";
pub const EVENT_INIT_FAILED: &str = "init_failed";
pub const EVENT_STATE_CHANGED: &str = "state_changed";
pub const EVENT_TICK: &str = "tick";
pub const EVENT_SUBMITTING: &str = "submitting";
pub const EVENT_SUBMISSION_FAILED: &str = "submission_failed";
pub const EVENT_COMPLETED: &str = "completed";
/// First message on a fresh websocket subscription.
pub const EVENT_SNAPSHOT: &str = "snapshot";

pub const DEFAULT_CHANNEL_CAPACITY: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

impl EventEnvelope {
    pub fn now(event: &str, session_id: Option<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
            session_id,
            ts: Some(Utc::now().to_rfc3339()),
        }
    }
}

/// Publish/subscribe seam for session events, injected into each session.
pub trait Notifier: Send + Sync {
    fn publish(&self, envelope: EventEnvelope);
    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope>;
}

#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<EventEnvelope>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, envelope: EventEnvelope) {
        let _ = self.tx.send(envelope);
    }

    fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serialization_roundtrip() {
        let env = EventEnvelope::now(
            EVENT_TICK,
            Some("s-1".into()),
            serde_json::json!({"timeElapsed": 12, "timeRemaining": 48}),
        );
        let raw = serde_json::to_string(&env).unwrap();
        let parsed: EventEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.event, "tick");
        assert_eq!(parsed.session_id.unwrap(), "s-1");
        assert_eq!(parsed.payload["timeRemaining"], 48);
    }

    #[test]
    fn publish_without_subscribers_is_silent() {
        let notifier = BroadcastNotifier::new(4);
        notifier.publish(EventEnvelope::now(EVENT_STATE_CHANGED, None, Value::Null));
        let mut rx = notifier.subscribe();
        notifier.publish(EventEnvelope::now(EVENT_COMPLETED, None, Value::Null));
        assert_eq!(rx.try_recv().unwrap().event, "completed");
    }
}
