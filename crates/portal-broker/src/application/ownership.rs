//! OwnershipController: owner transfer and registry/store reconciliation.
//!
//! The only component that mutates pairing state. Two flows live here:
//!
//! 1. **Registration-time load** — when an iot device connects, its durable
//!    access table is fetched from the document store (or created empty for
//!    a first-time device) and merged into the registry record. Completion
//!    resolves the record's one-shot readiness signal.
//!
//! 2. **Owner transfer** — when an iot device sends an introduction naming a
//!    proposed owner:
//!
//!    ```text
//!    wait for readiness (bounded)
//!      → demote every current Owner to FormerOwner
//!      → promote the proposed owner
//!      → persist the full table (update_one)
//!      → on success only: rebuild the control-side mirror
//!    ```
//!
//! An introduction can arrive before the registration-time load has finished
//! (the device fires it straight after connecting). The transfer defers on
//! the readiness signal rather than running against an unloaded table — but
//! the wait is bounded, failing with [`OwnershipError::RegistrationTimeout`]
//! instead of hanging forever.
//!
//! # Failure semantics
//!
//! A failed persist leaves the in-memory table in its new state: no retry,
//! no rollback, and no mirror rebuild. Memory and store diverge until the
//! next successful write (or the next registration-time load re-reads the
//! durable state). The caller logs the error; nothing reaches the client.

use std::sync::Arc;
use std::time::Duration;

use portal_core::{AccessTable, IotDeviceDoc};
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::application::registry::DeviceRegistry;
use crate::domain::BrokerConfig;
use crate::infrastructure::store::{DocumentStore, StoreError};

/// Error type for ownership operations.
///
/// All variants are local-only: the dispatcher logs them and the triggering
/// client never sees an error frame.
#[derive(Debug, Error)]
pub enum OwnershipError {
    /// The iot device has no registry record (was never registered).
    #[error("iot device {0} has no registry record")]
    UnknownDevice(String),

    /// The registration-time load did not complete within the bounded wait.
    #[error("timed out after {timeout:?} waiting for saved access state of {id}")]
    RegistrationTimeout { id: String, timeout: Duration },

    /// The stored device document did not match the expected schema.
    #[error("stored document for {id} is malformed: {source}")]
    InvalidDocument {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// The persistence gateway failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Coordinates access-state mutation between the registry and the store.
pub struct OwnershipController {
    registry: Arc<Mutex<DeviceRegistry>>,
    store: Arc<dyn DocumentStore>,
    db_name: String,
    collection: String,
    registration_timeout: Duration,
}

impl OwnershipController {
    pub fn new(
        registry: Arc<Mutex<DeviceRegistry>>,
        store: Arc<dyn DocumentStore>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            db_name: config.db_name.clone(),
            collection: config.collection.clone(),
            registration_timeout: config.registration_timeout,
        }
    }

    // ── Registration-time load ────────────────────────────────────────────────

    /// Loads the durable access table for a freshly connected iot device.
    ///
    /// First-time devices get an empty document inserted; known devices get
    /// their saved table merged into the registry record. Either way the
    /// record's readiness signal resolves, releasing any deferred
    /// introductions.
    ///
    /// # Errors
    ///
    /// Store and schema failures leave readiness unresolved, so deferred
    /// introductions fail with a registration timeout instead of mutating
    /// unloaded state.
    pub async fn load_saved_access(&self, iot_id: &str) -> Result<(), OwnershipError> {
        let filter = json!({ "id": iot_id });
        let found = self
            .store
            .find_one(&self.db_name, &self.collection, &filter)
            .await?;

        let saved = match found {
            Some(doc) => {
                let doc: IotDeviceDoc =
                    serde_json::from_value(doc).map_err(|source| OwnershipError::InvalidDocument {
                        id: iot_id.to_string(),
                        source,
                    })?;
                debug!(
                    "loaded {} saved control device(s) for iot device {iot_id}",
                    doc.control_access.len()
                );
                doc.control_access
            }
            None => {
                // First contact: create the durable document before the
                // registry reports the device as loaded.
                let doc = IotDeviceDoc::new_empty(iot_id);
                let value = serde_json::to_value(&doc).map_err(StoreError::Serialize)?;
                self.store
                    .insert_one(&self.db_name, &self.collection, value)
                    .await?;
                info!("created store document for new iot device {iot_id}");
                AccessTable::new()
            }
        };

        let mut registry = self.registry.lock().await;
        if !registry.apply_saved_access(iot_id, saved) {
            return Err(OwnershipError::UnknownDevice(iot_id.to_string()));
        }
        Ok(())
    }

    // ── Owner transfer ────────────────────────────────────────────────────────

    /// Runs the owner-transfer pipeline for an iot device's introduction.
    pub async fn transfer_owner(
        &self,
        iot_id: &str,
        new_owner: &str,
    ) -> Result<(), OwnershipError> {
        // Step 1: wait until the registration-time load has settled the table.
        // The receiver is grabbed under the lock, awaited outside it.
        let mut readiness = {
            let registry = self.registry.lock().await;
            registry
                .readiness(iot_id)
                .ok_or_else(|| OwnershipError::UnknownDevice(iot_id.to_string()))?
        };
        timeout(self.registration_timeout, readiness.wait_for(|loaded| *loaded))
            .await
            .map_err(|_| OwnershipError::RegistrationTimeout {
                id: iot_id.to_string(),
                timeout: self.registration_timeout,
            })?
            // The sender lives in the registry record, which is never
            // removed; a closed channel means the record vanished.
            .map_err(|_| OwnershipError::UnknownDevice(iot_id.to_string()))?;

        // Steps 2–3: demote then promote, synchronously under the lock.
        let table = {
            let mut registry = self.registry.lock().await;
            registry
                .transfer_owner(iot_id, new_owner)
                .ok_or_else(|| OwnershipError::UnknownDevice(iot_id.to_string()))?
        };

        // Step 4: persist the full updated table. A failure propagates to the
        // caller with the in-memory table already mutated (see module docs).
        let filter = json!({ "id": iot_id });
        let patch = json!({
            "controlAccess": serde_json::to_value(&table).map_err(StoreError::Serialize)?
        });
        self.store
            .update_one(&self.db_name, &self.collection, &filter, patch)
            .await?;

        // Step 5: reconcile the control-side mirror, only after the persist
        // succeeded.
        {
            let mut registry = self.registry.lock().await;
            registry.rebuild_mirror(iot_id);
        }
        info!("iot device {iot_id} is now owned by control device {new_owner}");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
