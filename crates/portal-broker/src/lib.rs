//! portal-broker library crate.
//!
//! This crate implements the GPortal broker: an identity-gated WebSocket
//! server that pairs two classes of clients — iot devices and control
//! devices — and tracks, per iot device, which control device currently owns
//! it, persisting that ownership across restarts.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Devices (JSON over WebSocket, JWT in the request path)
//!         ↕
//! [portal-broker]
//!   ├── domain/           BrokerConfig (pure, no I/O)
//!   ├── application/
//!   │     ├── registry/   The two mirrored device tables + snapshots
//!   │     ├── ownership/  Owner transfer + mirror reconciliation
//!   │     ├── dispatcher/ Frame classification and routing
//!   │     └── events/     Enumerated broker event bus
//!   └── infrastructure/
//!         ├── auth/       JWT handshake verification
//!         ├── store/      DocumentStore trait + JSON-file implementation
//!         └── ws_server/  Listener, handshake gatekeeping, connection tasks
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no external dependencies (no I/O, no async, no frameworks).
//! - `application` depends on `domain` and `portal-core`, plus tokio sync
//!   primitives (channels and locks, never sockets).
//! - `infrastructure` depends on all other layers plus `tokio`,
//!   `tungstenite`, and `jsonwebtoken`.

/// Domain layer: pure configuration types.
pub mod domain;

/// Application layer: registries, ownership transfer, dispatch, events.
pub mod application;

/// Infrastructure layer: WebSocket server, JWT verification, document store.
pub mod infrastructure;
