//! Domain layer: pure business-logic types with no I/O dependencies.
//!
//! - `access` – the `Owner` / `FormerOwner` pairing states, the per-iot-device
//!   access table, and its persisted document form.
//! - `identity` – device roles and the identity stamped on a connection at
//!   handshake time.

pub mod access;
pub mod identity;
