//! GPortal broker — entry point.
//!
//! This binary runs the identity-gated WebSocket broker that pairs iot
//! devices with the control devices allowed to reach them. Devices
//! authenticate by presenting a JWT as the request path of the WebSocket
//! upgrade; pairing (ownership) state survives restarts via a JSON-file
//! document store.
//!
//! # Usage
//!
//! ```text
//! portal-broker --secret <SECRET> [OPTIONS]
//!
//! Options:
//!   --port <PORT>                  Listener port [default: 8882]
//!   --bind <ADDR>                  Bind address [default: 0.0.0.0]
//!   --secret <SECRET>              Shared JWT secret (required)
//!   --data-dir <DIR>               Document store root [default: ./portal-data]
//!   --db-name <NAME>               Logical database name [default: gportal]
//!   --collection <NAME>            Iot-device collection [default: iotDevices]
//!   --registration-timeout <SECS>  Saved-state load wait bound [default: 10]
//! ```
//!
//! # Environment variable overrides
//!
//! Every option can also come from the environment; CLI args take precedence
//! when both are present.
//!
//! | Variable                      | Default         |
//! |-------------------------------|-----------------|
//! | `PORTAL_PORT`                 | `8882`          |
//! | `PORTAL_BIND`                 | `0.0.0.0`       |
//! | `PORTAL_SECRET`               | — (required)    |
//! | `PORTAL_DATA_DIR`             | `./portal-data` |
//! | `PORTAL_DB_NAME`              | `gportal`       |
//! | `PORTAL_COLLECTION`           | `iotDevices`    |
//! | `PORTAL_REGISTRATION_TIMEOUT` | `10`            |
//!
//! # Architecture overview
//!
//! ```text
//! Devices  (JSON over WebSocket, JWT in the request path)
//!       ↕
//! portal-broker  ← this process
//!   domain/          BrokerConfig
//!   application/     Portal coordinator, registry, ownership, events
//!   infrastructure/
//!     ws_server/     accept loop + handshake gatekeeping
//!     auth/          JWT verification
//!     store/         JSON-file document store
//!       ↕
//! <data-dir>/<db>/<collection>.json  (durable pairing state)
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use portal_broker::application::events::PortalEvent;
use portal_broker::application::Portal;
use portal_broker::domain::BrokerConfig;
use portal_broker::infrastructure::auth::TokenVerifier;
use portal_broker::infrastructure::store::JsonFileStore;
use portal_broker::infrastructure::ws_server::PortalServer;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// GPortal device-pairing broker.
#[derive(Debug, Parser)]
#[command(
    name = "portal-broker",
    about = "Identity-gated WebSocket broker pairing iot devices with control devices",
    version
)]
struct Cli {
    /// TCP port for the WebSocket listener.
    #[arg(long, default_value_t = 8882, env = "PORTAL_PORT")]
    port: u16,

    /// IP address to bind the listener to.
    ///
    /// Use `0.0.0.0` to accept connections from any interface, or
    /// `127.0.0.1` for local connections only.
    #[arg(long, default_value = "0.0.0.0", env = "PORTAL_BIND")]
    bind: String,

    /// Shared secret the path-carried JWTs are verified against (HS256).
    #[arg(long, env = "PORTAL_SECRET")]
    secret: String,

    /// Root directory of the JSON-file document store.
    #[arg(long, default_value = "./portal-data", env = "PORTAL_DATA_DIR")]
    data_dir: PathBuf,

    /// Logical database name inside the document store.
    #[arg(long, default_value = BrokerConfig::DEFAULT_DB_NAME, env = "PORTAL_DB_NAME")]
    db_name: String,

    /// Collection holding one document per iot device.
    #[arg(long, default_value = BrokerConfig::DEFAULT_COLLECTION, env = "PORTAL_COLLECTION")]
    collection: String,

    /// How long an introduction waits for the device's saved pairing state to
    /// load, in seconds, before failing.
    #[arg(long, default_value_t = 10, env = "PORTAL_REGISTRATION_TIMEOUT")]
    registration_timeout: u64,
}

impl Cli {
    /// Converts the parsed CLI arguments into a [`BrokerConfig`].
    ///
    /// # Errors
    ///
    /// Returns an error if `--bind` is not a valid IP address.
    fn into_broker_config(self) -> anyhow::Result<BrokerConfig> {
        let bind_addr: SocketAddr = format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("invalid bind address: '{}:{}'", self.bind, self.port))?;
        Ok(BrokerConfig {
            bind_addr,
            secret: self.secret,
            db_name: self.db_name,
            collection: self.collection,
            data_dir: self.data_dir,
            registration_timeout: Duration::from_secs(self.registration_timeout),
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log level comes from RUST_LOG, falling back to `info`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_broker_config()?;
    info!(
        "GPortal broker starting — bind={}, store={}",
        config.bind_addr,
        config.data_dir.display()
    );

    // ── Wire the core together ────────────────────────────────────────────────
    let store = Arc::new(JsonFileStore::new(&config.data_dir));
    let portal = Portal::new(store, &config);
    let verifier = TokenVerifier::new(&config.secret);

    // A built-in event subscriber surfaces security-relevant events in the
    // log; application-level consumers subscribe the same way.
    let mut events = portal.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match &event {
                PortalEvent::HackTry { request_path } => {
                    warn!("handshake with an invalid token, path {request_path:?}");
                }
                PortalEvent::JwtIdError { claims } => {
                    warn!("verified token with unusable claims: {claims}");
                }
                _ => {}
            }
        }
    });

    // ── Graceful shutdown flag ────────────────────────────────────────────────
    //
    // Ctrl+C clears the flag; the accept loop polls it every 200 ms and
    // exits cleanly.
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C — initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!("failed to listen for Ctrl+C signal: {e}");
            }
        }
    });

    // ── Main server loop ──────────────────────────────────────────────────────
    let server = PortalServer::bind(config.bind_addr, portal, verifier).await?;
    server.serve(running).await?;

    info!("GPortal broker stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
