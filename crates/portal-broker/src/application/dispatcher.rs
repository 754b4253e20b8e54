//! MessageDispatcher: classifies inbound frames and triggers side effects.
//!
//! The broker interprets exactly one frame kind, `msgType: "introduction"`.
//! Everything else is opaque payload that external subscribers consume from
//! the event bus; the dispatcher never rejects or answers it.
//!
//! Introductions fan out by sender role:
//!
//! - **iot device with an `owner` field** — runs the owner-transfer pipeline
//!   via the [`OwnershipController`]. Transfer failures are logged and
//!   swallowed; the sender never receives an error frame.
//! - **iot device without an `owner` field** — presence announcement only.
//! - **control device** — presence announcement only; control devices cannot
//!   change pairing state.
//!
//! The `introduction` event is emitted at classification time, before any
//! ownership side effects, so subscribers always see the frame even when the
//! transfer later fails.

use std::sync::Arc;

use portal_core::{DeviceIdentity, DeviceRole, InboundFrame};
use serde_json::Value;
use tracing::{debug, error};

use crate::application::events::{EventBus, PortalEvent};
use crate::application::ownership::OwnershipController;

/// Routes parsed frames to their handlers.
pub struct MessageDispatcher {
    ownership: Arc<OwnershipController>,
    events: EventBus,
}

impl MessageDispatcher {
    pub fn new(ownership: Arc<OwnershipController>, events: EventBus) -> Self {
        Self { ownership, events }
    }

    /// Processes one parsed frame from an authenticated connection.
    ///
    /// Frames that are not objects, or not introductions, are left to the
    /// event-bus subscribers; this method only acts on introductions.
    pub async fn dispatch(&self, identity: &DeviceIdentity, frame: &Value) {
        let Some(parsed) = InboundFrame::from_value(frame) else {
            debug!("uninterpretable frame from {identity}, leaving it to subscribers");
            return;
        };
        if !parsed.is_introduction() {
            return;
        }

        self.events.emit(PortalEvent::Introduction {
            identity: identity.clone(),
            frame: frame.clone(),
        });

        match identity.role {
            DeviceRole::ControlDevice => {
                // Presence announcement; pairing state is owned by iot devices.
                debug!("introduction from control device {}", identity.id);
            }
            DeviceRole::IotDevice => match parsed.owner.as_deref() {
                Some(new_owner) => {
                    if let Err(e) = self.ownership.transfer_owner(&identity.id, new_owner).await {
                        error!("owner transfer for iot device {} failed: {e}", identity.id);
                    }
                }
                None => {
                    debug!("ownerless introduction from iot device {}", identity.id);
                }
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
