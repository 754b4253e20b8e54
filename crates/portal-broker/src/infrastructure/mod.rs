//! Infrastructure layer: everything that touches the outside world.
//!
//! - [`ws_server`] — TCP listener, WebSocket upgrade, per-connection tasks.
//! - [`auth`] — path-carried JWT verification for the handshake.
//! - [`store`] — the async document-store seam and its JSON-file
//!   implementation.

pub mod auth;
pub mod store;
pub mod ws_server;
