//! Application layer: the portal coordinator and its collaborators.
//!
//! [`Portal`] is the single entry point the transport layer talks to. It owns
//! the device registry behind one async mutex, wires the ownership controller
//! and message dispatcher together, and publishes every notable occurrence on
//! the event bus. The transport layer (infrastructure) stays a dumb pipe:
//! accept, authenticate, then forward text frames here.

pub mod dispatcher;
pub mod events;
pub mod ownership;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;

use portal_core::{DeviceRole, ReportFrame};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::domain::BrokerConfig;
use crate::infrastructure::store::DocumentStore;
use dispatcher::MessageDispatcher;
use events::{EventBus, PortalEvent};
use ownership::OwnershipController;
use registry::{ConnectionHandle, ControlDeviceSnapshot, DeviceRegistry, IotDeviceSnapshot};

/// The broker's application core.
///
/// One instance per process, shared across all connection tasks via `Arc`.
pub struct Portal {
    registry: Arc<Mutex<DeviceRegistry>>,
    ownership: Arc<OwnershipController>,
    dispatcher: MessageDispatcher,
    events: EventBus,
}

impl Portal {
    pub fn new(store: Arc<dyn DocumentStore>, config: &BrokerConfig) -> Arc<Self> {
        let registry = Arc::new(Mutex::new(DeviceRegistry::new()));
        let events = EventBus::default();
        let ownership = Arc::new(OwnershipController::new(
            Arc::clone(&registry),
            store,
            config,
        ));
        let dispatcher = MessageDispatcher::new(Arc::clone(&ownership), events.clone());
        Arc::new(Self {
            registry,
            ownership,
            dispatcher,
            events,
        })
    }

    /// Registers a new subscriber on the event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<PortalEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Registers an authenticated connection and acknowledges it.
    ///
    /// For iot devices the registration-time load of saved access state runs
    /// as a background task; introductions arriving before it completes defer
    /// on the registry's readiness signal.
    pub async fn accept_connection(self: &Arc<Self>, claims: Value, handle: ConnectionHandle) {
        let identity = handle.identity().clone();
        info!("accepted {identity}");

        {
            let mut registry = self.registry.lock().await;
            match identity.role {
                DeviceRole::IotDevice => registry.register_iot(&identity.id, handle.clone()),
                DeviceRole::ControlDevice => {
                    registry.register_control(&identity.id, handle.clone())
                }
            }
        }

        if identity.role == DeviceRole::IotDevice {
            let portal = Arc::clone(self);
            let id = identity.id.clone();
            tokio::spawn(async move {
                if let Err(e) = portal.ownership.load_saved_access(&id).await {
                    error!("failed to load saved access state for iot device {id}: {e}");
                }
            });
        }

        if !send_frame(&handle, &ReportFrame::connection_accepted()) {
            warn!("{identity} closed before the acceptance report was queued");
        }
        self.events
            .emit(PortalEvent::AcceptConnect { claims, identity });
    }

    /// Clears the connection reference when a transport closes.
    ///
    /// Access tables survive; only the handle is dropped, and only if the
    /// closing connection is still the registered one (a reconnect may have
    /// replaced it already).
    pub async fn connection_closed(&self, handle: &ConnectionHandle) {
        handle.mark_disconnected();
        let mut registry = self.registry.lock().await;
        registry.clear_connection(handle);
        debug!("{} disconnected", handle.identity());
    }

    // ── Inbound frames ────────────────────────────────────────────────────────

    /// Processes one inbound text frame from an authenticated connection.
    ///
    /// Every frame is acknowledged with a `msgReceived` report before
    /// parsing, on the connection it arrived on — never on whatever handle
    /// the registry currently holds for the sender's identity (a reconnect
    /// may have replaced it while this frame was in flight). Unparseable
    /// payloads are reported on the event bus and otherwise ignored; the
    /// connection stays open.
    pub async fn handle_text(&self, handle: &ConnectionHandle, raw: &str) {
        self.acknowledge(handle);
        let identity = handle.identity();

        match serde_json::from_str::<Value>(raw) {
            Ok(frame) => {
                self.events.emit(PortalEvent::JsonReceived {
                    identity: identity.clone(),
                    frame: frame.clone(),
                });
                self.dispatcher.dispatch(identity, &frame).await;
            }
            Err(e) => {
                warn!("unparseable frame from {identity}: {e}");
                self.events.emit(PortalEvent::JsonProcessError {
                    identity: identity.clone(),
                    raw: raw.to_string(),
                });
            }
        }
    }

    /// Queues a `msgReceived` report on the connection a frame arrived on.
    pub fn acknowledge(&self, handle: &ConnectionHandle) {
        send_frame(handle, &ReportFrame::msg_received());
    }

    // ── Reporting ─────────────────────────────────────────────────────────────

    /// Redacted view of the iot-device table.
    pub async fn snapshot_iot(&self) -> HashMap<String, IotDeviceSnapshot> {
        self.registry.lock().await.snapshot_iot()
    }

    /// Redacted view of the control-device table.
    pub async fn snapshot_control(&self) -> HashMap<String, ControlDeviceSnapshot> {
        self.registry.lock().await.snapshot_control()
    }
}

/// Serializes and queues a report frame, returning `false` on a closed
/// connection.
fn send_frame(handle: &ConnectionHandle, frame: &ReportFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => handle.send_text(text),
        // ReportFrame serialization cannot fail in practice.
        Err(e) => {
            error!("failed to serialize report frame: {e}");
            false
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
