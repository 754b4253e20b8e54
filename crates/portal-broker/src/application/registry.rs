//! DeviceRegistry: the broker's in-memory tables of iot and control devices.
//!
//! The registry holds two independent key-value tables, one per device role.
//! Each entry tracks the live connection handle (if any) and the pairing
//! state:
//!
//! - An iot-device record owns the authoritative `controlAccess` table,
//!   loaded from the persistent store when the device connects.
//! - A control-device record holds `iotAccess`, a *derived mirror* rebuilt
//!   only as a side effect of owner transfers. A control device's mirror
//!   therefore reflects only iot devices it has been introduced to during
//!   this process lifetime (plus whatever the store returned for those iot
//!   devices) — never a full scan. That partial view is a deliberate design
//!   property.
//!
//! Records are created lazily and never deleted; reconnects replace the
//! connection handle (last registration wins), and transport close clears
//! the handle without touching access tables.
//!
//! All mutation goes through the single coordinator's lock — the registry
//! itself is a plain synchronous structure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portal_core::{AccessEntry, AccessState, AccessTable, DeviceIdentity, DeviceRole};
use serde::Serialize;
use tokio::sync::{mpsc, watch};

// ── Connection handle ─────────────────────────────────────────────────────────

/// Shareable handle to a live WebSocket connection.
///
/// The identity is stamped at handshake time and immutable thereafter. The
/// sender feeds the connection's writer task; the `connected` flag tracks the
/// transport state for snapshot reporting.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    identity: DeviceIdentity,
    sender: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(identity: DeviceIdentity, sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            identity,
            sender,
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Queues a text frame for the connection's writer task.
    ///
    /// Returns `false` when the writer task is gone (connection closed).
    pub fn send_text(&self, frame: String) -> bool {
        self.sender.send(frame).is_ok()
    }

    /// Current transport state as reported in snapshots.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Marks the transport as closed. Called by the connection task on close.
    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Whether two handles refer to the same underlying connection.
    ///
    /// Used to guard registry cleanup: after a reconnect replaces the stored
    /// handle, the *old* connection's close handler must not clear the fresh
    /// reference.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

// ── Records ───────────────────────────────────────────────────────────────────

/// Registry entry for an iot device.
#[derive(Debug)]
struct IotDeviceRecord {
    connection: Option<ConnectionHandle>,
    /// Authoritative access table; `None` until the registration-time load
    /// from the persistent store completes.
    control_access: Option<AccessTable>,
    /// One-shot readiness signal, flipped to `true` exactly once when the
    /// load completes. Introductions arriving earlier wait on it.
    loaded: watch::Sender<bool>,
}

impl IotDeviceRecord {
    fn new() -> Self {
        let (loaded, _) = watch::channel(false);
        Self {
            connection: None,
            control_access: None,
            loaded,
        }
    }
}

/// Registry entry for a control device.
#[derive(Debug, Default)]
struct ControlDeviceRecord {
    connection: Option<ConnectionHandle>,
    /// Derived mirror of the iot-side tables, keyed by iot-device id.
    iot_access: AccessTable,
}

// ── Snapshots ─────────────────────────────────────────────────────────────────

/// Redacted view of an iot-device record for external reporting.
///
/// Built field by field: the connection handle itself is never exposed, only
/// the derived `connected` flag (omitted entirely when no connection was ever
/// registered for the record).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IotDeviceSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    pub control_access: AccessTable,
}

/// Redacted view of a control-device record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlDeviceSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    pub iot_access: AccessTable,
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// The two mirrored device tables.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    iot: HashMap<String, IotDeviceRecord>,
    control: HashMap<String, ControlDeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration and lookup ───────────────────────────────────────────────

    /// Upserts the connection reference of an iot device, creating the record
    /// if absent. A later registration for the same id replaces the prior
    /// handle.
    pub fn register_iot(&mut self, id: &str, handle: ConnectionHandle) {
        let record = self
            .iot
            .entry(id.to_string())
            .or_insert_with(IotDeviceRecord::new);
        record.connection = Some(handle);
    }

    /// Upserts the connection reference of a control device.
    pub fn register_control(&mut self, id: &str, handle: ConnectionHandle) {
        let record = self.control.entry(id.to_string()).or_default();
        record.connection = Some(handle);
    }

    pub fn iot_connection(&self, id: &str) -> Option<ConnectionHandle> {
        self.iot.get(id).and_then(|r| r.connection.clone())
    }

    pub fn control_connection(&self, id: &str) -> Option<ConnectionHandle> {
        self.control.get(id).and_then(|r| r.connection.clone())
    }

    /// Clears the connection reference for an identity, leaving access tables
    /// untouched. No-op when the stored handle is not the same underlying
    /// connection (a reconnect has already replaced it).
    pub fn clear_connection(&mut self, handle: &ConnectionHandle) {
        let identity = handle.identity();
        let slot = match identity.role {
            DeviceRole::IotDevice => self.iot.get_mut(&identity.id).map(|r| &mut r.connection),
            DeviceRole::ControlDevice => {
                self.control.get_mut(&identity.id).map(|r| &mut r.connection)
            }
        };
        if let Some(slot) = slot {
            if slot
                .as_ref()
                .is_some_and(|stored| stored.same_connection(handle))
            {
                *slot = None;
            }
        }
    }

    // ── Readiness and saved state ─────────────────────────────────────────────

    /// Readiness receiver for an iot device's registration-time load.
    pub fn readiness(&self, id: &str) -> Option<watch::Receiver<bool>> {
        self.iot.get(id).map(|r| r.loaded.subscribe())
    }

    /// Merges the access table loaded from the persistent store into the
    /// record and resolves the readiness signal.
    ///
    /// Entries already present in memory are overwritten by their saved
    /// counterparts; in-memory entries the store does not know about survive.
    /// Returns `false` when the iot device has no registry record.
    pub fn apply_saved_access(&mut self, id: &str, saved: AccessTable) -> bool {
        let Some(record) = self.iot.get_mut(id) else {
            return false;
        };
        let table = record.control_access.get_or_insert_with(AccessTable::new);
        for (control_id, entry) in saved {
            table.insert(control_id, entry);
        }
        record.loaded.send_replace(true);
        true
    }

    // ── Ownership mutation (called by the ownership controller) ───────────────

    /// Demotes every current owner to former owner, then promotes `new_owner`.
    ///
    /// Demotion runs first so that re-introducing the current owner leaves a
    /// single `Owner` entry rather than a self-demoted one. Returns a copy of
    /// the updated table for persistence, or `None` when the iot device has
    /// no registry record.
    pub fn transfer_owner(&mut self, iot_id: &str, new_owner: &str) -> Option<AccessTable> {
        let record = self.iot.get_mut(iot_id)?;
        let table = record.control_access.get_or_insert_with(AccessTable::new);

        // Demote step: at most one entry should be Owner, but demote all found.
        for entry in table.values_mut() {
            if entry.access == AccessState::Owner {
                entry.access = AccessState::FormerOwner;
            }
        }

        // Promote step.
        table.insert(new_owner.to_string(), AccessEntry::owner());

        Some(table.clone())
    }

    /// Upserts the mirrored `iotAccess` entry of every control device named
    /// in the iot device's table, copying the access state only — never a
    /// connection reference (the iot-side record stays authoritative for its
    /// own connection).
    ///
    /// Control-device records are created lazily here, so a control device
    /// that has never connected still appears in the mirror once an iot
    /// device grants it access.
    pub fn rebuild_mirror(&mut self, iot_id: &str) {
        let Some(table) = self.iot.get(iot_id).and_then(|r| r.control_access.clone()) else {
            return;
        };
        for (control_id, entry) in table {
            let record = self.control.entry(control_id).or_default();
            record.iot_access.insert(iot_id.to_string(), entry);
        }
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    /// Redacted copy of the iot table for external consumption.
    pub fn snapshot_iot(&self) -> HashMap<String, IotDeviceSnapshot> {
        self.iot
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    IotDeviceSnapshot {
                        connected: record.connection.as_ref().map(|h| h.is_connected()),
                        control_access: record.control_access.clone().unwrap_or_default(),
                    },
                )
            })
            .collect()
    }

    /// Redacted copy of the control table for external consumption.
    pub fn snapshot_control(&self) -> HashMap<String, ControlDeviceSnapshot> {
        self.control
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    ControlDeviceSnapshot {
                        connected: record.connection.as_ref().map(|h| h.is_connected()),
                        iot_access: record.iot_access.clone(),
                    },
                )
            })
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use portal_core::DeviceRole;

    fn iot_handle(id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle::new(DeviceIdentity::new(id, DeviceRole::IotDevice), tx),
            rx,
        )
    }

    fn control_handle(id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle::new(DeviceIdentity::new(id, DeviceRole::ControlDevice), tx),
            rx,
        )
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = DeviceRegistry::new();
        assert!(registry.snapshot_iot().is_empty());
        assert!(registry.snapshot_control().is_empty());
    }

    #[test]
    fn test_register_iot_creates_record_and_stores_connection() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");

        registry.register_iot("iot1", handle.clone());

        let stored = registry.iot_connection("iot1").unwrap();
        assert!(stored.same_connection(&handle));
        assert_eq!(stored.identity().id, "iot1");
    }

    #[test]
    fn test_later_registration_replaces_prior_connection() {
        let mut registry = DeviceRegistry::new();
        let (first, _rx1) = iot_handle("iot1");
        let (second, _rx2) = iot_handle("iot1");

        registry.register_iot("iot1", first.clone());
        registry.register_iot("iot1", second.clone());

        let stored = registry.iot_connection("iot1").unwrap();
        assert!(stored.same_connection(&second));
        assert!(!stored.same_connection(&first));
    }

    #[test]
    fn test_clear_connection_drops_reference_but_keeps_access_table() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle.clone());
        registry.apply_saved_access(
            "iot1",
            AccessTable::from([("ctrlA".to_string(), AccessEntry::owner())]),
        );

        registry.clear_connection(&handle);

        assert!(registry.iot_connection("iot1").is_none());
        let snapshot = registry.snapshot_iot();
        assert_eq!(snapshot["iot1"].connected, None);
        assert_eq!(
            snapshot["iot1"].control_access["ctrlA"],
            AccessEntry::owner()
        );
    }

    #[test]
    fn test_clear_connection_ignores_stale_handle_after_reconnect() {
        let mut registry = DeviceRegistry::new();
        let (old, _rx1) = iot_handle("iot1");
        let (new, _rx2) = iot_handle("iot1");
        registry.register_iot("iot1", old.clone());
        registry.register_iot("iot1", new.clone());

        // The old connection's close handler fires after the reconnect.
        registry.clear_connection(&old);

        let stored = registry.iot_connection("iot1").unwrap();
        assert!(stored.same_connection(&new));
    }

    #[test]
    fn test_readiness_flips_once_when_saved_access_applied() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);

        let rx = registry.readiness("iot1").unwrap();
        assert!(!*rx.borrow());

        assert!(registry.apply_saved_access("iot1", AccessTable::new()));
        assert!(*rx.borrow());
    }

    #[test]
    fn test_apply_saved_access_merges_without_losing_memory_entries() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);

        // An in-memory entry exists (e.g. from a prior load on reconnect).
        registry.apply_saved_access(
            "iot1",
            AccessTable::from([("ctrlA".to_string(), AccessEntry::owner())]),
        );
        // The store returns a different set: ctrlA demoted, ctrlB added.
        registry.apply_saved_access(
            "iot1",
            AccessTable::from([
                ("ctrlA".to_string(), AccessEntry::former_owner()),
                ("ctrlB".to_string(), AccessEntry::owner()),
            ]),
        );

        let table = &registry.snapshot_iot()["iot1"].control_access;
        assert_eq!(table["ctrlA"], AccessEntry::former_owner());
        assert_eq!(table["ctrlB"], AccessEntry::owner());
    }

    #[test]
    fn test_apply_saved_access_unknown_device_returns_false() {
        let mut registry = DeviceRegistry::new();
        assert!(!registry.apply_saved_access("ghost", AccessTable::new()));
    }

    #[test]
    fn test_transfer_owner_demotes_then_promotes() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);
        registry.apply_saved_access(
            "iot1",
            AccessTable::from([("ctrlA".to_string(), AccessEntry::owner())]),
        );

        let table = registry.transfer_owner("iot1", "ctrlB").unwrap();

        assert_eq!(table["ctrlA"], AccessEntry::former_owner());
        assert_eq!(table["ctrlB"], AccessEntry::owner());
    }

    #[test]
    fn test_transfer_owner_never_leaves_two_owners() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);
        registry.apply_saved_access("iot1", AccessTable::new());

        registry.transfer_owner("iot1", "ctrlA");
        registry.transfer_owner("iot1", "ctrlB");
        let table = registry.transfer_owner("iot1", "ctrlC").unwrap();

        let owners = table
            .values()
            .filter(|e| e.access == AccessState::Owner)
            .count();
        assert_eq!(owners, 1);
        assert_eq!(table["ctrlC"], AccessEntry::owner());
        assert_eq!(table["ctrlA"], AccessEntry::former_owner());
        assert_eq!(table["ctrlB"], AccessEntry::former_owner());
    }

    #[test]
    fn test_transfer_owner_reintroducing_current_owner_is_idempotent() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);
        registry.apply_saved_access("iot1", AccessTable::new());

        registry.transfer_owner("iot1", "ctrlA");
        let table = registry.transfer_owner("iot1", "ctrlA").unwrap();

        // No spurious self-demotion survives the promote step.
        assert_eq!(table.len(), 1);
        assert_eq!(table["ctrlA"], AccessEntry::owner());
    }

    #[test]
    fn test_transfer_owner_unknown_device_returns_none() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.transfer_owner("ghost", "ctrlA").is_none());
    }

    #[test]
    fn test_rebuild_mirror_copies_every_state() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);
        registry.apply_saved_access(
            "iot1",
            AccessTable::from([("ctrlA".to_string(), AccessEntry::owner())]),
        );
        registry.transfer_owner("iot1", "ctrlB");

        registry.rebuild_mirror("iot1");

        let control = registry.snapshot_control();
        assert_eq!(
            control["ctrlA"].iot_access["iot1"],
            AccessEntry::former_owner()
        );
        assert_eq!(control["ctrlB"].iot_access["iot1"], AccessEntry::owner());
    }

    #[test]
    fn test_rebuild_mirror_does_not_attach_connections() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);
        registry.apply_saved_access("iot1", AccessTable::new());
        registry.transfer_owner("iot1", "ctrlA");

        registry.rebuild_mirror("iot1");

        // ctrlA never connected; its lazily-created record has no handle.
        assert!(registry.control_connection("ctrlA").is_none());
        assert_eq!(registry.snapshot_control()["ctrlA"].connected, None);
    }

    #[test]
    fn test_mirror_only_covers_introduced_iot_devices() {
        let mut registry = DeviceRegistry::new();
        let (h1, _rx1) = iot_handle("iot1");
        let (h2, _rx2) = iot_handle("iot2");
        registry.register_iot("iot1", h1);
        registry.register_iot("iot2", h2);
        registry.apply_saved_access(
            "iot1",
            AccessTable::from([("ctrlA".to_string(), AccessEntry::owner())]),
        );
        registry.apply_saved_access(
            "iot2",
            AccessTable::from([("ctrlA".to_string(), AccessEntry::owner())]),
        );

        // Only iot1 goes through a transfer; iot2 never does.
        registry.transfer_owner("iot1", "ctrlA");
        registry.rebuild_mirror("iot1");

        let mirror = &registry.snapshot_control()["ctrlA"].iot_access;
        assert!(mirror.contains_key("iot1"));
        assert!(
            !mirror.contains_key("iot2"),
            "mirror must not be rebuilt from a full scan"
        );
    }

    #[test]
    fn test_snapshot_reports_connected_states() {
        let mut registry = DeviceRegistry::new();
        let (live, _rx1) = control_handle("ctrlA");
        let (dead, _rx2) = control_handle("ctrlB");
        dead.mark_disconnected();
        registry.register_control("ctrlA", live);
        registry.register_control("ctrlB", dead);

        let snapshot = registry.snapshot_control();
        assert_eq!(snapshot["ctrlA"].connected, Some(true));
        assert_eq!(snapshot["ctrlB"].connected, Some(false));
    }

    #[test]
    fn test_snapshot_serialization_never_exposes_connection() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);
        registry.apply_saved_access(
            "iot1",
            AccessTable::from([("ctrlA".to_string(), AccessEntry::owner())]),
        );

        let json = serde_json::to_value(registry.snapshot_iot()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "iot1": {
                    "connected": true,
                    "controlAccess": {"ctrlA": {"access": 1}}
                }
            })
        );
    }

    #[test]
    fn test_snapshot_before_load_shows_empty_access_table() {
        let mut registry = DeviceRegistry::new();
        let (handle, _rx) = iot_handle("iot1");
        registry.register_iot("iot1", handle);

        let snapshot = registry.snapshot_iot();
        assert!(snapshot["iot1"].control_access.is_empty());
        assert_eq!(snapshot["iot1"].connected, Some(true));
    }
}
