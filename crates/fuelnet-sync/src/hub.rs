//! # Hub Server
//!
//! Inbound side of the hierarchy: distributors accept pumps, the company
//! accepts distributors. The hub owns the accept loop, the parent half of the
//! handshake and the registry bookkeeping; the node decides what each message
//! means through [`ChildSessionHandler`].
//!
//! ## Per-Connection Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  accept ──► send IDENTIFY ──► read ID:<id> (handshake timeout)          │
//! │                                   │                                     │
//! │                  anything else ───┼──► ERROR: ... , close               │
//! │                                   ▼                                     │
//! │                     registry.register(id, link)                         │
//! │                     handler.on_registered   (OK + price snapshot)       │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │             ┌──────────── read loop (no timeout) ───────────┐           │
//! │             │ malformed line  → ERROR: <reason>             │           │
//! │             │ SALIR           → close                       │           │
//! │             │ anything else   → handler.on_message          │           │
//! │             └───────────────────────┬───────────────────────┘           │
//! │                                     ▼                                   │
//! │          registry.deregister(id, link) (only if still ours)             │
//! │          handler.on_disconnected                                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::WireMessage;
use crate::registry::ConnectionRegistry;
use crate::transport::{LineConnection, LineReader, OutboundHandle};

// =============================================================================
// Hub Configuration
// =============================================================================

/// Listener settings for a hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Bind address (default: 0.0.0.0).
    pub bind_addr: String,

    /// Port to listen on. 0 picks a free port.
    pub port: u16,

    /// How long a new child has to answer IDENTIFY.
    pub handshake_timeout: Duration,
}

impl HubConfig {
    pub fn new(port: u16) -> Self {
        HubConfig {
            bind_addr: "0.0.0.0".to_string(),
            port,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Returns the full bind address.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

// =============================================================================
// Session Handler
// =============================================================================

/// What the read loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    Close,
}

/// Node-specific handling of registered children.
#[async_trait]
pub trait ChildSessionHandler: Send + Sync + 'static {
    /// Name used in logs.
    fn hub_name(&self) -> String;

    /// The child completed the handshake and is in the registry.
    async fn on_registered(&self, child_id: &str, link: &OutboundHandle);

    /// A decoded line from a registered child.
    async fn on_message(
        &self,
        child_id: &str,
        message: WireMessage,
        link: &OutboundHandle,
    ) -> SessionControl;

    /// The child's registry entry was removed.
    async fn on_disconnected(&self, _child_id: &str) {}
}

// =============================================================================
// Hub Server
// =============================================================================

/// Accept loop for one hub node.
pub struct HubServer<H: ChildSessionHandler> {
    config: HubConfig,
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
}

/// Handle to a running listener (hub or tank).
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub(crate) fn new(local_addr: SocketAddr, shutdown: CancellationToken, task: JoinHandle<()>) -> Self {
        ServerHandle {
            local_addr,
            shutdown,
            task,
        }
    }

    /// Address actually bound, useful when the port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes every open session.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

impl<H: ChildSessionHandler> HubServer<H> {
    pub fn new(config: HubConfig, handler: Arc<H>, registry: Arc<ConnectionRegistry>) -> Self {
        HubServer {
            config,
            handler,
            registry,
        }
    }

    /// Binds the listener and starts accepting in the background.
    pub async fn start(self, shutdown: CancellationToken) -> SyncResult<ServerHandle> {
        let shutdown = shutdown.child_token();
        let bind = self.config.bind_address();
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| SyncError::BindFailed {
                addr: bind.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;

        info!(hub = %self.handler.hub_name(), %local_addr, "Hub listening");

        let task = tokio::spawn(self.accept_loop(listener, shutdown.clone()));
        Ok(ServerHandle::new(local_addr, shutdown, task))
    }

    async fn accept_loop(self, listener: TcpListener, shutdown: CancellationToken) {
        let this = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Accepted connection");
                    let this = Arc::clone(&this);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let connection = match LineConnection::from_stream(stream) {
                            Ok(c) => c,
                            Err(e) => {
                                warn!(%peer, error = %e, "Could not set up connection");
                                return;
                            }
                        };
                        this.serve(connection, shutdown).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        info!(hub = %this.handler.hub_name(), "Hub stopped");
    }

    async fn serve(&self, connection: LineConnection, shutdown: CancellationToken) {
        let LineConnection { mut reader, link } = connection;
        let peer = link.peer();

        let child_id = match self.handshake(&mut reader, &link).await {
            Ok(id) => id,
            Err(e) => {
                warn!(%peer, error = %e, "Handshake failed");
                link.close();
                return;
            }
        };

        self.registry.register(&child_id, link.clone());
        info!(hub = %self.handler.hub_name(), %child_id, %peer, "Child connected");
        self.handler.on_registered(&child_id, &link).await;

        tokio::select! {
            _ = shutdown.cancelled() => {}
            result = self.read_loop(&child_id, &mut reader, &link) => {
                if let Err(e) = result {
                    debug!(%child_id, error = %e, "Read loop ended with error");
                }
            }
        }

        link.close();
        if self.registry.deregister(&child_id, &link) {
            self.handler.on_disconnected(&child_id).await;
        }
        info!(hub = %self.handler.hub_name(), %child_id, %peer, "Child disconnected");
    }

    async fn handshake(&self, reader: &mut LineReader, link: &OutboundHandle) -> SyncResult<String> {
        link.send(WireMessage::Identify);

        let limit = self.config.handshake_timeout;
        let reply = match timeout(limit, reader.next_message()).await {
            Err(_) => return Err(SyncError::Timeout(limit.as_secs())),
            Ok(reply) => reply?,
        };

        match reply {
            Some(Ok(WireMessage::Id(id))) => Ok(id),
            Some(Ok(other)) => {
                link.send(WireMessage::error("Expected ID:<id>"));
                Err(SyncError::UnexpectedMessage {
                    expected: "ID".into(),
                    actual: other.kind().into(),
                })
            }
            Some(Err(e)) => {
                link.send(e.to_reply());
                Err(SyncError::HandshakeFailed(e.to_string()))
            }
            None => Err(SyncError::Disconnected),
        }
    }

    async fn read_loop(
        &self,
        child_id: &str,
        reader: &mut LineReader,
        link: &OutboundHandle,
    ) -> SyncResult<()> {
        loop {
            match reader.next_message().await? {
                None => return Ok(()),
                Some(Err(e)) => {
                    debug!(%child_id, error = %e, "Malformed line");
                    link.send(e.to_reply());
                }
                Some(Ok(WireMessage::Quit)) => return Ok(()),
                Some(Ok(message)) => {
                    if self.handler.on_message(child_id, message, link).await
                        == SessionControl::Close
                    {
                        return Ok(());
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Echo {
        gone: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChildSessionHandler for Echo {
        fn hub_name(&self) -> String {
            "echo".into()
        }

        async fn on_registered(&self, child_id: &str, link: &OutboundHandle) {
            link.send(WireMessage::ok(format!("hello {}", child_id)));
        }

        async fn on_message(
            &self,
            _child_id: &str,
            message: WireMessage,
            link: &OutboundHandle,
        ) -> SessionControl {
            match message {
                WireMessage::Report(text) if text == "bye" => SessionControl::Close,
                WireMessage::Report(_) => {
                    link.send(WireMessage::Ack);
                    SessionControl::Continue
                }
                _ => SessionControl::Continue,
            }
        }

        async fn on_disconnected(&self, child_id: &str) {
            self.gone.lock().unwrap().push(child_id.to_string());
        }
    }

    async fn start() -> (ServerHandle, Arc<Echo>, Arc<ConnectionRegistry>) {
        let handler = Arc::new(Echo::default());
        let registry = Arc::new(ConnectionRegistry::new());
        let mut config = HubConfig::new(0);
        config.bind_addr = "127.0.0.1".into();
        config.handshake_timeout = Duration::from_secs(1);
        let hub = HubServer::new(config, Arc::clone(&handler), Arc::clone(&registry))
            .start(CancellationToken::new())
            .await
            .unwrap();
        (hub, handler, registry)
    }

    async fn next(conn: &mut LineConnection) -> WireMessage {
        conn.reader.next_message().await.unwrap().unwrap().unwrap()
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_handshake_registers_child() {
        let (hub, handler, registry) = start().await;
        let addr = hub.local_addr().to_string();
        let mut child = LineConnection::connect(&addr, Duration::from_secs(2)).await.unwrap();

        assert_eq!(next(&mut child).await, WireMessage::Identify);
        child.link.send(WireMessage::Id("4".into()));
        assert_eq!(next(&mut child).await, WireMessage::ok("hello 4"));
        assert_eq!(registry.ids(), vec!["4".to_string()]);

        child.link.send(WireMessage::Report("x".into()));
        assert_eq!(next(&mut child).await, WireMessage::Ack);

        child.link.send(WireMessage::Other("TRANSACCION 4 93".into()));
        assert!(matches!(next(&mut child).await, WireMessage::Error(_)));

        child.link.send(WireMessage::Quit);
        wait_until(|| registry.is_empty()).await;
        wait_until(|| !handler.gone.lock().unwrap().is_empty()).await;
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_handshake_reply_is_rejected() {
        let (hub, _handler, registry) = start().await;
        let addr = hub.local_addr().to_string();
        let mut child = LineConnection::connect(&addr, Duration::from_secs(2)).await.unwrap();

        next(&mut child).await;
        child.link.send(WireMessage::Ack);
        assert!(matches!(next(&mut child).await, WireMessage::Error(_)));
        assert!(child.reader.next_line().await.unwrap().is_none());
        assert!(registry.is_empty());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_id_keeps_newest() {
        let (hub, handler, registry) = start().await;
        let addr = hub.local_addr().to_string();

        let mut first = LineConnection::connect(&addr, Duration::from_secs(2)).await.unwrap();
        next(&mut first).await;
        first.link.send(WireMessage::Id("1".into()));
        next(&mut first).await;

        let mut second = LineConnection::connect(&addr, Duration::from_secs(2)).await.unwrap();
        next(&mut second).await;
        second.link.send(WireMessage::Id("1".into()));
        next(&mut second).await;

        first.link.send(WireMessage::Report("bye".into()));
        assert!(first.reader.next_line().await.unwrap().is_none());

        assert_eq!(registry.len(), 1);
        assert!(handler.gone.lock().unwrap().is_empty());

        second.link.send(WireMessage::Report("ping".into()));
        assert_eq!(next(&mut second).await, WireMessage::Ack);
        hub.shutdown().await;
    }
}
