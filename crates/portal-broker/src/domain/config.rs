//! Broker configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the broker.
///
/// Built by `main.rs` from CLI arguments / environment variables, or directly
/// in tests.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: SocketAddr,
    /// Shared HMAC secret the handshake tokens are verified against.
    pub secret: String,
    /// Logical database name passed to the document store.
    pub db_name: String,
    /// Collection holding one document per iot device.
    pub collection: String,
    /// Root directory of the JSON-file document store.
    pub data_dir: PathBuf,
    /// Bounded wait for an iot device's registration-time load before an
    /// introduction fails with a registration timeout.
    pub registration_timeout: Duration,
}

impl BrokerConfig {
    /// Default database name (`gportal`).
    pub const DEFAULT_DB_NAME: &'static str = "gportal";
    /// Default iot-device collection name (`iotDevices`).
    pub const DEFAULT_COLLECTION: &'static str = "iotDevices";
    /// Default registration-load wait bound.
    pub const DEFAULT_REGISTRATION_TIMEOUT: Duration = Duration::from_secs(10);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
