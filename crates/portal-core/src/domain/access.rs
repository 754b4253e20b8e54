//! Pairing access states and the persisted per-device document.
//!
//! Every iot device carries a table mapping control-device ids to an access
//! state. The table is the single source of truth for "who owns this device";
//! the control-device side only holds a derived mirror of it.
//!
//! # Wire and store representation
//!
//! Access states travel (and are persisted) as small numeric codes inside an
//! entry object, so a stored document looks like:
//!
//! ```json
//! { "id": "iot1", "controlAccess": { "ctrlA": { "access": 1 } } }
//! ```
//!
//! Code `1` means current owner, `2` means former owner. An absent entry
//! means the control device was never paired (or was revoked).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when decoding an unknown access-state code.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown access state code {0} (expected 1 or 2)")]
pub struct AccessStateError(pub u8);

/// Pairing state of one control device with respect to one iot device.
///
/// Invariant: an access table holds at most one `Owner` entry at any time.
/// The transfer algorithm is defensive and demotes every `Owner` entry it
/// finds before promoting the new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AccessState {
    /// Currently paired; this control device owns the iot device.
    Owner = 1,
    /// Previously paired; retained for history and soft access.
    FormerOwner = 2,
}

impl TryFrom<u8> for AccessState {
    type Error = AccessStateError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(AccessState::Owner),
            2 => Ok(AccessState::FormerOwner),
            other => Err(AccessStateError(other)),
        }
    }
}

impl From<AccessState> for u8 {
    fn from(state: AccessState) -> Self {
        state as u8
    }
}

/// One entry in an access table.
///
/// Kept as a struct rather than a bare state so the stored document shape
/// (`{"access": 1}`) stays stable if per-pairing metadata is added later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub access: AccessState,
}

impl AccessEntry {
    /// Entry for the current owner.
    pub fn owner() -> Self {
        Self {
            access: AccessState::Owner,
        }
    }

    /// Entry for a demoted, historical owner.
    pub fn former_owner() -> Self {
        Self {
            access: AccessState::FormerOwner,
        }
    }
}

/// Mapping from a device id to its access entry.
///
/// Used in both directions: `controlAccess` on an iot-device record (keyed by
/// control-device id) and the mirrored `iotAccess` on a control-device record
/// (keyed by iot-device id).
pub type AccessTable = HashMap<String, AccessEntry>;

/// Durable counterpart of an iot device's access table — one document per iot
/// device in the persistent store, keyed by `id`. The single source of truth
/// across broker restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IotDeviceDoc {
    /// Iot-device identifier (the `id` claim it connected with).
    pub id: String,
    /// Control-device access table. Absent in older documents; defaults to empty.
    #[serde(default)]
    pub control_access: AccessTable,
}

impl IotDeviceDoc {
    /// Fresh document for a never-before-seen iot device.
    pub fn new_empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            control_access: AccessTable::new(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
