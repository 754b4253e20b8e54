//! WebSocket server: accept loop, handshake gatekeeping, connection tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections from devices.
//! 3. Gatekeeping the WebSocket upgrade: the request path carries the JWT,
//!    and the upgrade is rejected with HTTP 403 before it completes when the
//!    token or its claims fail (see [`crate::infrastructure::auth`]).
//! 4. Running one reader task and one writer task per accepted connection.
//! 5. Gracefully shutting down when the `running` flag is cleared.
//!
//! All interpretation of frames lives in the application layer; this module
//! only moves text in and out and reports connection lifecycle to the
//! [`Portal`].
//!
//! # Scalability
//!
//! Each device connection runs in its own Tokio task. The accept loop never
//! blocks on a session: it accepts, spawns, and immediately returns to
//! accepting, so one slow device never stalls the others.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::StatusCode,
        Error as WsError, Message as WsMessage,
    },
};
use tracing::{debug, error, info, warn};

use portal_core::DeviceIdentity;
use serde_json::Value;

use crate::application::events::PortalEvent;
use crate::application::registry::ConnectionHandle;
use crate::application::Portal;
use crate::infrastructure::auth::{AuthError, TokenVerifier};

// ── Public API ────────────────────────────────────────────────────────────────

/// The broker's WebSocket listener.
///
/// Binding and serving are split so callers (and tests) can learn the actual
/// bound address before the accept loop starts — binding to port 0 picks a
/// free port.
pub struct PortalServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    portal: Arc<Portal>,
    verifier: TokenVerifier,
}

impl PortalServer {
    /// Binds the TCP listener.
    ///
    /// # Errors
    ///
    /// Returns an error when the address cannot be bound (port in use,
    /// insufficient permission).
    pub async fn bind(
        addr: SocketAddr,
        portal: Arc<Portal>,
        verifier: TokenVerifier,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read bound listener address")?;
        info!("portal listening on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
            portal,
            verifier,
        })
    }

    /// The actually bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the accept loop until `running` is set to `false`.
    ///
    /// A short timeout on `accept()` lets the loop poll the shutdown flag
    /// even when no devices are connecting.
    pub async fn serve(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer_addr))) => {
                    debug!("new connection from {peer_addr}");
                    let portal = Arc::clone(&self.portal);
                    let verifier = self.verifier.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer_addr, portal, verifier).await;
                    });
                }
                Ok(Err(e)) => {
                    // Transient accept error; keep the broker alive.
                    error!("accept error: {e}");
                }
                Err(_) => {
                    // Timeout — loop back to check the running flag.
                }
            }
        }
        Ok(())
    }
}

// ── Per-connection handler ────────────────────────────────────────────────────

/// Top-level handler for one device connection.
///
/// Wraps [`run_connection`] and logs the outcome; the outer/inner pair keeps
/// `?` propagation clean in the inner function.
async fn handle_connection(
    raw_stream: TcpStream,
    peer_addr: SocketAddr,
    portal: Arc<Portal>,
    verifier: TokenVerifier,
) {
    match run_connection(raw_stream, peer_addr, portal, verifier).await {
        Ok(()) => debug!("connection {peer_addr} closed"),
        Err(e) => warn!("connection {peer_addr} ended with error: {e:#}"),
    }
}

/// Runs the complete lifecycle of one device connection.
async fn run_connection(
    raw_stream: TcpStream,
    peer_addr: SocketAddr,
    portal: Arc<Portal>,
    verifier: TokenVerifier,
) -> anyhow::Result<()> {
    // ── Step 1: gatekept WebSocket upgrade ────────────────────────────────────
    //
    // The callback runs while the HTTP upgrade request is on the wire: it
    // authenticates the path-carried token and either lets the upgrade
    // proceed or replaces the response with a 403 before any frame flows.
    let mut authenticated: Option<(Value, DeviceIdentity)> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        match verifier.authenticate_path(path) {
            Ok(outcome) => {
                authenticated = Some(outcome);
                Ok(response)
            }
            Err(e) => {
                match &e {
                    AuthError::InvalidToken(cause) => {
                        warn!("rejected handshake from {peer_addr}: {cause}");
                        portal.events().emit(PortalEvent::HackTry {
                            request_path: path.to_string(),
                        });
                    }
                    AuthError::InvalidClaims { claims } => {
                        warn!("rejected handshake from {peer_addr}: unusable claims");
                        portal.events().emit(PortalEvent::JwtIdError {
                            claims: claims.clone(),
                        });
                    }
                }
                let mut reject = ErrorResponse::new(Some(e.rejection_reason().to_string()));
                *reject.status_mut() = StatusCode::FORBIDDEN;
                Err(reject)
            }
        }
    };

    let ws_stream = match accept_hdr_async(raw_stream, callback).await {
        Ok(stream) => stream,
        Err(e) => {
            // Either our own 403 or a client that never spoke WebSocket;
            // both are routine.
            debug!("handshake with {peer_addr} did not complete: {e}");
            return Ok(());
        }
    };
    let (claims, identity) = authenticated
        .context("handshake completed without an authentication outcome")?;

    // ── Step 2: register with the portal ──────────────────────────────────────
    //
    // The outbound path is an unbounded channel drained by the writer task;
    // the portal and the registry only ever hold the cheap sender side.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let handle = ConnectionHandle::new(identity.clone(), outbound_tx);
    portal.accept_connection(claims, handle.clone()).await;

    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // ── Writer task ───────────────────────────────────────────────────────────
    let writer_identity = identity.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(text) = outbound_rx.recv().await {
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                debug!("{writer_identity}: outbound send failed (peer gone)");
                break;
            }
        }
    });

    // ── Reader loop ───────────────────────────────────────────────────────────
    loop {
        let message = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => {
                debug!("{identity}: peer closed the connection");
                break;
            }
            Some(Err(e)) => {
                warn!("{identity}: WebSocket error: {e}");
                break;
            }
            None => break,
        };

        match message {
            WsMessage::Text(text) => {
                portal.handle_text(&handle, &text).await;
            }
            WsMessage::Binary(data) => {
                // Acknowledged like any other inbound frame, but only text
                // frames go through the JSON layer.
                portal.acknowledge(&handle);
                debug!("{identity}: binary frame ({} bytes) ignored", data.len());
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => {
                // Protocol-level keepalive; tungstenite answers pings itself.
            }
            WsMessage::Close(_) => {
                debug!("{identity}: close frame received");
                break;
            }
            WsMessage::Frame(_) => {
                debug!("{identity}: raw frame (ignored)");
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────
    portal.connection_closed(&handle).await;
    writer_task.abort();
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BrokerConfig;
    use crate::infrastructure::store::MockDocumentStore;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "ws-test-secret";

    fn config() -> BrokerConfig {
        BrokerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            secret: SECRET.to_string(),
            db_name: BrokerConfig::DEFAULT_DB_NAME.to_string(),
            collection: BrokerConfig::DEFAULT_COLLECTION.to_string(),
            data_dir: std::env::temp_dir(),
            registration_timeout: Duration::from_secs(1),
        }
    }

    fn token(claims: &Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    async fn start_server() -> (Arc<Portal>, SocketAddr) {
        let mut store = MockDocumentStore::new();
        store.expect_find_one().returning(|_, _, _| Ok(None));
        store.expect_insert_one().returning(|_, _, _| Ok(()));
        store.expect_update_one().returning(|_, _, _, _| Ok(()));

        let portal = Portal::new(Arc::new(store), &config());
        let server = PortalServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&portal),
            TokenVerifier::new(SECRET),
        )
        .await
        .unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(Arc::new(AtomicBool::new(true))));
        (portal, addr)
    }

    #[tokio::test]
    async fn test_handshake_with_forged_token_is_rejected_with_403() {
        let (portal, addr) = start_server().await;
        let mut events = portal.subscribe();

        let result =
            tokio_tungstenite::connect_async(format!("ws://{addr}/not-a-real-token")).await;

        let err = result.expect_err("forged token must not complete the handshake");
        match err {
            WsError::Http(response) => {
                assert_eq!(response.status(), StatusCode::FORBIDDEN);
            }
            other => panic!("expected an HTTP rejection, got {other:?}"),
        }
        assert_eq!(events.recv().await.unwrap().kind(), "hackTry");
    }

    #[tokio::test]
    async fn test_handshake_with_unusable_claims_is_rejected_with_403() {
        let (portal, addr) = start_server().await;
        let mut events = portal.subscribe();
        let bad = token(&json!({"name": "no id or type here"}));

        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/{bad}")).await;

        match result.expect_err("unusable claims must not complete the handshake") {
            WsError::Http(response) => assert_eq!(response.status(), StatusCode::FORBIDDEN),
            other => panic!("expected an HTTP rejection, got {other:?}"),
        }
        assert_eq!(events.recv().await.unwrap().kind(), "jwtIdError");
    }

    #[tokio::test]
    async fn test_valid_token_connects_and_receives_acceptance_report() {
        let (_portal, addr) = start_server().await;
        let good = token(&json!({"id": "ctrlA", "type": "controlDevice"}));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/{good}"))
            .await
            .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(
            frame,
            json!({"id": "G_PORTAL", "msgType": "report", "msg": "connectionAccepted"})
        );
    }

    #[tokio::test]
    async fn test_binary_frames_are_acknowledged_but_never_parsed() {
        let (portal, addr) = start_server().await;
        let mut events = portal.subscribe();
        let good = token(&json!({"id": "ctrlA", "type": "controlDevice"}));
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/{good}"))
            .await
            .unwrap();
        ws.next().await.unwrap().unwrap(); // acceptance report

        ws.send(WsMessage::Binary(vec![0xde, 0xad, 0xbe, 0xef]))
            .await
            .unwrap();

        let ack = ws.next().await.unwrap().unwrap();
        let frame: Value = serde_json::from_str(ack.to_text().unwrap()).unwrap();
        assert_eq!(frame["msg"], json!("msgReceived"));

        // acceptConnect is the only event: the bytes never reached the JSON
        // layer, so no jsonProcessError (or jsonReceived) was emitted.
        assert_eq!(events.recv().await.unwrap().kind(), "acceptConnect");
        assert!(events.try_recv().is_err());
    }
}
