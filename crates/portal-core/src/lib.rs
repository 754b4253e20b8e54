//! # portal-core
//!
//! Shared library for the GPortal device broker containing the wire frame
//! types and the access-state domain model.
//!
//! This crate is used by the broker itself and by any Rust client that wants
//! to speak the broker's JSON protocol. It has zero dependencies on sockets,
//! async runtimes, or OS APIs.
//!
//! # Architecture overview
//!
//! GPortal is an identity-gated WebSocket broker. Two classes of clients
//! connect to it:
//!
//! - **iot devices** — controllable endpoints, each owned by at most one
//!   control device at a time.
//! - **control devices** — operator endpoints granted ownership when an iot
//!   device names them in an "introduction" message.
//!
//! This crate defines:
//!
//! - **`protocol`** – The JSON frames exchanged over WebSocket: the loose
//!   inbound client frame and the broker's `report` acknowledgement frames.
//!
//! - **`domain`** – Pure business types: device roles and identities, the
//!   `Owner` / `FormerOwner` access states, and the persisted per-device
//!   document that survives broker restarts.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `portal_core::AccessState` instead of `portal_core::domain::access::AccessState`.
pub use domain::access::{AccessEntry, AccessState, AccessTable, IotDeviceDoc};
pub use domain::identity::{DeviceIdentity, DeviceRole};
pub use protocol::messages::{InboundFrame, ReportFrame, ReportKind, PORTAL_ID};
