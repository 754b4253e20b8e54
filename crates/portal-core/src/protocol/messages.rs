//! All GPortal protocol frame types.
//!
//! Every frame is a UTF-8 text WebSocket message containing a JSON object
//! with at least `id` (sender identifier) and `msgType` fields. Two kinds of
//! frames exist:
//!
//! - **Report frames** — broker-originated acknowledgements. The broker sends
//!   `connectionAccepted` once after a successful handshake, and
//!   `msgReceived` for every inbound frame.
//! - **Client frames** — anything a device sends. The broker interprets only
//!   `msgType: "introduction"`; all other kinds pass through to external
//!   subscribers untouched, so [`InboundFrame`] keeps unknown fields intact.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Reserved sender identity for broker-originated frames.
pub const PORTAL_ID: &str = "G_PORTAL";

/// `msgType` of broker acknowledgement frames.
pub const MSG_TYPE_REPORT: &str = "report";

/// `msgType` of the ownership-transfer / presence-announcement frame.
pub const MSG_TYPE_INTRODUCTION: &str = "introduction";

// ── Report frames ─────────────────────────────────────────────────────────────

/// Payload of a broker report frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportKind {
    /// Handshake succeeded; sent exactly once per connection.
    ConnectionAccepted,
    /// An inbound frame arrived; sent before the broker parses it.
    MsgReceived,
}

/// Broker-originated acknowledgement frame.
///
/// On the wire:
///
/// ```json
/// {"id": "G_PORTAL", "msgType": "report", "msg": "connectionAccepted"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFrame {
    pub id: String,
    pub msg_type: String,
    pub msg: ReportKind,
}

impl ReportFrame {
    fn new(msg: ReportKind) -> Self {
        Self {
            id: PORTAL_ID.to_string(),
            msg_type: MSG_TYPE_REPORT.to_string(),
            msg,
        }
    }

    /// The post-handshake acknowledgement.
    pub fn connection_accepted() -> Self {
        Self::new(ReportKind::ConnectionAccepted)
    }

    /// The per-frame receipt acknowledgement.
    pub fn msg_received() -> Self {
        Self::new(ReportKind::MsgReceived)
    }
}

// ── Inbound client frames ─────────────────────────────────────────────────────

/// Loosely-typed view of an inbound client frame.
///
/// Clients may send arbitrary JSON objects; the broker classifies them by
/// `msgType` and otherwise leaves them alone. Fields the broker knows about
/// are lifted into options, everything else lands in `extra` unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundFrame {
    /// Sender identifier, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Frame kind, if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_type: Option<String>,
    /// Proposed owner (control-device id) of an iot-device introduction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Every field the broker does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboundFrame {
    /// Parses a frame from an already-decoded JSON value.
    ///
    /// Returns `None` when the value is not an object or a known field has an
    /// unusable type; such frames are not interpreted by the broker (they were
    /// already surfaced to subscribers as raw JSON).
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }

    /// Whether this frame requests/announces an introduction.
    pub fn is_introduction(&self) -> bool {
        self.msg_type.as_deref() == Some(MSG_TYPE_INTRODUCTION)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
