//! Broker event bus.
//!
//! The broker's extension mechanism: everything of note that happens on a
//! connection is published as a typed [`PortalEvent`], and any number of
//! external subscribers can register for the stream. Application-level
//! business logic beyond pairing (telemetry handling, forwarding, audit
//! logging) lives entirely in subscribers.
//!
//! Emission is fire-and-forget: a broadcast send with no subscribers is not
//! an error, and a slow subscriber lags (dropping its oldest events) rather
//! than back-pressuring the broker.

use portal_core::DeviceIdentity;
use serde_json::Value;
use tokio::sync::broadcast;

/// Default capacity of the broadcast ring buffer.
const DEFAULT_CAPACITY: usize = 64;

/// Everything the broker reports to external subscribers.
#[derive(Debug, Clone)]
pub enum PortalEvent {
    /// A connection completed the handshake and was registered.
    AcceptConnect {
        /// The verified JWT claims, as received.
        claims: Value,
        /// The identity stamped on the connection.
        identity: DeviceIdentity,
    },
    /// A token verified, but its claims failed identity validation.
    JwtIdError { claims: Value },
    /// A handshake presented an invalid or forged token.
    HackTry {
        /// Raw request path of the rejected handshake.
        request_path: String,
    },
    /// An inbound frame parsed as JSON.
    JsonReceived {
        identity: DeviceIdentity,
        frame: Value,
    },
    /// An inbound text frame was not valid JSON. The connection stays open.
    JsonProcessError {
        identity: DeviceIdentity,
        /// The unparseable payload, verbatim.
        raw: String,
    },
    /// An introduction frame arrived (either role); emitted before any
    /// ownership side effects run.
    Introduction {
        identity: DeviceIdentity,
        frame: Value,
    },
}

impl PortalEvent {
    /// Short kind string for log messages, without payload contents.
    pub fn kind(&self) -> &'static str {
        match self {
            PortalEvent::AcceptConnect { .. } => "acceptConnect",
            PortalEvent::JwtIdError { .. } => "jwtIdError",
            PortalEvent::HackTry { .. } => "hackTry",
            PortalEvent::JsonReceived { .. } => "jsonReceived",
            PortalEvent::JsonProcessError { .. } => "jsonProcessError",
            PortalEvent::Introduction { .. } => "introduction",
        }
    }
}

/// Multi-subscriber event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PortalEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Registers a new subscriber. Each receiver sees every event emitted
    /// after the call.
    pub fn subscribe(&self) -> broadcast::Receiver<PortalEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Never blocks; a missing audience is fine.
    pub fn emit(&self, event: PortalEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use portal_core::DeviceRole;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("iot1", DeviceRole::IotDevice)
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(PortalEvent::HackTry {
            request_path: "/garbage".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(PortalEvent::JsonProcessError {
            identity: identity(),
            raw: "not json".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "jsonProcessError");
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(PortalEvent::Introduction {
            identity: identity(),
            frame: serde_json::json!({"msgType": "introduction"}),
        });

        assert_eq!(rx1.recv().await.unwrap().kind(), "introduction");
        assert_eq!(rx2.recv().await.unwrap().kind(), "introduction");
    }

    #[test]
    fn test_kind_names_match_protocol_vocabulary() {
        let cases = [
            (
                PortalEvent::AcceptConnect {
                    claims: Value::Null,
                    identity: identity(),
                },
                "acceptConnect",
            ),
            (
                PortalEvent::JwtIdError {
                    claims: Value::Null,
                },
                "jwtIdError",
            ),
            (
                PortalEvent::HackTry {
                    request_path: String::new(),
                },
                "hackTry",
            ),
            (
                PortalEvent::JsonReceived {
                    identity: identity(),
                    frame: Value::Null,
                },
                "jsonReceived",
            ),
        ];
        for (event, expected) in cases {
            assert_eq!(event.kind(), expected);
        }
    }
}
