//! Domain layer for portal-broker.
//!
//! Pure configuration types with no dependencies on I/O, networking, or
//! external frameworks. Parsing CLI arguments and environment variables into
//! these types is `main.rs`'s job; everything below `main` consumes the
//! already-validated struct.

pub mod config;

pub use config::BrokerConfig;
