//! Device roles and connection identities.
//!
//! A connection's identity comes from its JWT claims at handshake time and is
//! immutable for the connection's lifetime. The claim strings `"iotDevice"`
//! and `"controlDevice"` are the only recognized roles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Class of a connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceRole {
    /// Controllable endpoint; owned by at most one control device at a time.
    IotDevice,
    /// Operator endpoint; requests ownership of iot devices.
    ControlDevice,
}

impl DeviceRole {
    /// The exact claim string for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::IotDevice => "iotDevice",
            DeviceRole::ControlDevice => "controlDevice",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity stamped on a connection after a successful handshake.
///
/// Deserializes directly from the JWT claims object: the `id` claim and the
/// `type` claim (which must name a recognized role). Unknown claims such as
/// `exp` or `iat` are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device identifier (registry key within the role's table).
    pub id: String,
    /// Device class.
    #[serde(rename = "type")]
    pub role: DeviceRole,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, role: DeviceRole) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.role, self.id)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
