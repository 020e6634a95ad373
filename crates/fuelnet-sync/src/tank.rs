//! # Tank Service
//!
//! Serves a [`ResourceLedger`] over the line protocol, and the client pumps
//! use to draw fuel from it.
//!
//! ```text
//! EXTRAER 95 10   → OK: Extracted 10 L of 95. Level: 990 L
//! EXTRAER 95 5000 → ERROR: Insufficient 95: available 990 L, requested 5000 L
//! REPONER 95 200  → OK: Replenished 200 L of 95. Level: 1190 L
//! CONSULTAR 95    → OK: 95 level: 1190 L
//! ESTADO          → OK: 93=1000 L; 95=1190 L; 97=1000 L; Diesel=1000 L; Kerosene=1000 L
//! SALIR           → (connection closed)
//! ```
//!
//! There is no handshake. Every reply is one line; a bad request gets an
//! `ERROR:` line and the connection stays open. The client opens a fresh
//! connection per request.

use std::sync::Arc;
use std::time::Duration;

use fuelnet_core::{Commodity, Liters};
use fuelnet_store::ResourceLedger;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::hub::ServerHandle;
use crate::protocol::WireMessage;
use crate::transport::LineConnection;

// =============================================================================
// Server
// =============================================================================

/// Line server in front of a tank ledger.
pub struct TankServer {
    ledger: Arc<ResourceLedger>,
}

impl TankServer {
    pub fn new(ledger: Arc<ResourceLedger>) -> Self {
        TankServer { ledger }
    }

    /// Binds `bind` (`host:port`) and serves until `shutdown` fires.
    pub async fn start(self, bind: &str, shutdown: CancellationToken) -> SyncResult<ServerHandle> {
        let shutdown = shutdown.child_token();
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: bind.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "Tank listening");

        let ledger = self.ledger;
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let ledger = Arc::clone(&ledger);
                        let token = token.clone();
                        tokio::spawn(async move {
                            match LineConnection::from_stream(stream) {
                                Ok(connection) => {
                                    tokio::select! {
                                        _ = token.cancelled() => {}
                                        _ = serve(&ledger, connection) => {}
                                    }
                                }
                                Err(e) => warn!(%peer, error = %e, "Could not set up connection"),
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
            info!("Tank stopped");
        });

        Ok(ServerHandle::new(local_addr, shutdown, task))
    }
}

async fn serve(ledger: &ResourceLedger, connection: LineConnection) {
    let LineConnection { mut reader, link } = connection;
    let peer = link.peer();
    debug!(%peer, "Tank client connected");

    loop {
        let message = match reader.next_message().await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                link.send(e.to_reply());
                continue;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(%peer, error = %e, "Tank connection failed");
                break;
            }
        };

        if message == WireMessage::Quit {
            break;
        }
        link.send(handle_request(ledger, message));
    }

    link.close();
    debug!(%peer, "Tank client disconnected");
}

/// Applies one request to the ledger and builds the reply.
pub fn handle_request(ledger: &ResourceLedger, message: WireMessage) -> WireMessage {
    match message {
        WireMessage::Extract {
            commodity,
            quantity,
        } => match ledger.try_extract(commodity, quantity) {
            Ok(level) => {
                info!(%commodity, %quantity, %level, "Fuel extracted");
                WireMessage::ok(format!(
                    "Extracted {} L of {}. Level: {} L",
                    quantity, commodity, level
                ))
            }
            Err(e) => {
                warn!(%commodity, %quantity, error = %e, "Extraction refused");
                WireMessage::error(e.to_string())
            }
        },
        WireMessage::Replenish {
            commodity,
            quantity,
        } => match ledger.try_replenish(commodity, quantity) {
            Ok(level) => {
                info!(%commodity, %quantity, %level, "Fuel replenished");
                WireMessage::ok(format!(
                    "Replenished {} L of {}. Level: {} L",
                    quantity, commodity, level
                ))
            }
            Err(e) => WireMessage::error(e.to_string()),
        },
        WireMessage::LevelQuery { commodity } => {
            WireMessage::ok(format!("{} level: {} L", commodity, ledger.level(commodity)))
        }
        WireMessage::TankStatus => WireMessage::ok(
            ledger
                .snapshot()
                .iter()
                .map(|(c, l)| format!("{}={} L", c, l))
                .collect::<Vec<_>>()
                .join("; "),
        ),
        other => WireMessage::error(format!("Unsupported command: {}", other.kind())),
    }
}

// =============================================================================
// Client
// =============================================================================

/// One-request-per-connection tank client.
#[derive(Debug, Clone)]
pub struct TankClient {
    addr: String,
    timeout: Duration,
}

impl TankClient {
    pub fn new(addr: impl Into<String>) -> Self {
        TankClient {
            addr: addr.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one request and returns the tank's reply.
    pub async fn request(&self, message: WireMessage) -> SyncResult<WireMessage> {
        let LineConnection { mut reader, link } =
            LineConnection::connect(&self.addr, self.timeout).await?;
        link.send(message);

        let reply = match timeout(self.timeout, reader.next_message()).await {
            Err(_) => Err(SyncError::Timeout(self.timeout.as_secs())),
            Ok(Ok(Some(Ok(reply)))) => Ok(reply),
            Ok(Ok(Some(Err(e)))) => Err(SyncError::InvalidMessage(e.to_string())),
            Ok(Ok(None)) => Err(SyncError::Disconnected),
            Ok(Err(e)) => Err(e),
        };

        link.send(WireMessage::Quit);
        link.close();
        reply
    }

    /// Draws fuel. `Ok(false)` means the tank refused.
    pub async fn extract(&self, commodity: Commodity, quantity: Liters) -> SyncResult<bool> {
        match self.request(WireMessage::Extract { commodity, quantity }).await? {
            WireMessage::Ok(_) => Ok(true),
            WireMessage::Error(reason) => {
                warn!(%commodity, %quantity, %reason, "Tank refused extraction");
                Ok(false)
            }
            other => Err(SyncError::UnexpectedMessage {
                expected: "OK or ERROR".into(),
                actual: other.kind().into(),
            }),
        }
    }

    pub async fn replenish(&self, commodity: Commodity, quantity: Liters) -> SyncResult<WireMessage> {
        self.request(WireMessage::Replenish { commodity, quantity }).await
    }

    pub async fn level(&self, commodity: Commodity) -> SyncResult<WireMessage> {
        self.request(WireMessage::LevelQuery { commodity }).await
    }

    pub async fn status(&self) -> SyncResult<WireMessage> {
        self.request(WireMessage::TankStatus).await
    }
}

// =============================================================================
// Tests
// =============================================================================
