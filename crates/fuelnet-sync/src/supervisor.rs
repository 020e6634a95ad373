//! # Connection Supervisor
//!
//! Keeps a child (pump or distributor) connected to its parent forever.
//!
//! ## State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  ┌──────────────┐  connect ok   ┌─────────────┐  IDENTIFY → ID:<id>     │
//! │  │ Disconnected │ ────────────► │ Handshaking │ ──────────────────┐     │
//! │  └──────────────┘               └─────────────┘   OK / ERROR read │     │
//! │     ▲       ▲                          │ wrong first line         │     │
//! │     │       │   backoff.delay(attempt) │                          ▼     │
//! │     │       └──────────────────────────┘                   ┌─────────┐  │
//! │     │                                                      │ Syncing │  │
//! │     │  read error / EOF / SALIR     ┌───────────┐          │ replay  │  │
//! │     └────────────────────────────── │ Streaming │ ◄────────│ queue   │  │
//! │                                     └───────────┘  flushed └─────────┘  │
//! │                                                                         │
//! │  attempt resets to 0 after every completed handshake.                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! What happens in `Syncing` and how streamed messages are handled belongs to
//! the node; it plugs in through [`UplinkSession`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{SyncError, SyncResult};
use crate::protocol::WireMessage;
use crate::transport::{LineConnection, LineReader, OutboundHandle};

// =============================================================================
// Supervisor State
// =============================================================================

/// Where the supervisor is in its connection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No connection; connecting or waiting out a backoff.
    Disconnected,
    /// Connected, exchanging IDENTIFY / ID.
    Handshaking,
    /// Replaying work queued while offline.
    Syncing,
    /// Live: new work is sent immediately.
    Streaming,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorState::Disconnected => write!(f, "disconnected"),
            SupervisorState::Handshaking => write!(f, "handshaking"),
            SupervisorState::Syncing => write!(f, "syncing"),
            SupervisorState::Streaming => write!(f, "streaming"),
        }
    }
}

// =============================================================================
// Uplink Session
// =============================================================================

/// Node-specific behaviour of a supervised uplink.
#[async_trait]
pub trait UplinkSession: Send + Sync + 'static {
    /// Id sent in the `ID:` handshake reply.
    fn node_id(&self) -> String;

    /// Called once per connection after the handshake.
    ///
    /// Must replay queued work through `link` and make `link` the node's
    /// live outbound path. An error drops the connection and triggers a
    /// backoff.
    async fn on_connected(&self, link: &OutboundHandle) -> SyncResult<()>;

    /// A decoded line from the parent while streaming.
    async fn on_message(&self, message: WireMessage, link: &OutboundHandle);

    /// The connection is gone. Stop using the link handed to `on_connected`.
    async fn on_disconnected(&self);
}

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Parent address, `host:port`.
    pub parent_addr: String,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Time allowed for each handshake line.
    pub handshake_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(parent_addr: impl Into<String>) -> Self {
        SupervisorConfig {
            parent_addr: parent_addr.into(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

// =============================================================================
// Supervisor Handle
// =============================================================================

/// Handle to a running supervisor.
pub struct SupervisorHandle {
    state_rx: watch::Receiver<SupervisorState>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == SupervisorState::Streaming
    }

    /// Waits until the supervisor reaches `target`.
    pub async fn wait_for(&self, target: SupervisorState, limit: Duration) -> SyncResult<()> {
        let mut rx = self.state_rx.clone();
        let result = match timeout(limit, rx.wait_for(|s| *s == target)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SyncError::ShuttingDown),
            Err(_) => Err(SyncError::Timeout(limit.as_secs())),
        };
        result
    }

    /// Stops the supervisor and waits for it to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

// =============================================================================
// Connection Supervisor
// =============================================================================

/// Reconnecting uplink driver, generic over the node's session logic.
pub struct ConnectionSupervisor<S: UplinkSession> {
    config: SupervisorConfig,
    session: Arc<S>,
    backoff: Arc<dyn BackoffPolicy>,
    state_tx: watch::Sender<SupervisorState>,
    shutdown: CancellationToken,
}

impl<S: UplinkSession> ConnectionSupervisor<S> {
    /// Starts the supervisor on the current runtime.
    ///
    /// Runs until `shutdown` is cancelled or [`SupervisorHandle::shutdown`]
    /// is called.
    pub fn spawn(
        config: SupervisorConfig,
        session: Arc<S>,
        backoff: Arc<dyn BackoffPolicy>,
        shutdown: CancellationToken,
    ) -> SupervisorHandle {
        let shutdown = shutdown.child_token();
        let (state_tx, state_rx) = watch::channel(SupervisorState::Disconnected);
        let supervisor = ConnectionSupervisor {
            config,
            session,
            backoff,
            state_tx,
            shutdown: shutdown.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        SupervisorHandle {
            state_rx,
            shutdown,
            task,
        }
    }

    async fn run(self) {
        let node_id = self.session.node_id();
        let parent = self.config.parent_addr.clone();
        info!(%node_id, %parent, "Connection supervisor started");

        let mut attempt: u32 = 0;
        loop {
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                result = self.connect_once(&mut attempt) => Some(result),
            };

            self.session.on_disconnected().await;
            self.set_state(SupervisorState::Disconnected);

            match outcome {
                None => break,
                Some(Ok(())) => info!(%node_id, %parent, "Parent closed the connection"),
                Some(Err(e)) => warn!(%node_id, %parent, attempt, error = %e, "Uplink attempt failed"),
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Backing off");

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(%node_id, "Connection supervisor stopped");
    }

    /// One full connection: connect, handshake, sync, stream until it ends.
    async fn connect_once(&self, attempt: &mut u32) -> SyncResult<()> {
        let LineConnection { mut reader, link } =
            LineConnection::connect(&self.config.parent_addr, self.config.connect_timeout).await?;

        let result = self.drive(&mut reader, &link, attempt).await;
        link.close();
        result
    }

    async fn drive(
        &self,
        reader: &mut LineReader,
        link: &OutboundHandle,
        attempt: &mut u32,
    ) -> SyncResult<()> {
        self.set_state(SupervisorState::Handshaking);
        let early = self.handshake(reader, link).await?;
        *attempt = 0;

        self.set_state(SupervisorState::Syncing);
        self.session.on_connected(link).await?;

        self.set_state(SupervisorState::Streaming);
        info!(node_id = %self.session.node_id(), parent = %link.peer(), "Streaming to parent");

        if let Some(message) = early {
            self.session.on_message(message, link).await;
        }

        loop {
            match reader.next_message().await? {
                None => return Ok(()),
                Some(Err(e)) => {
                    debug!(error = %e, "Malformed line from parent");
                    link.send(e.to_reply());
                }
                Some(Ok(WireMessage::Quit)) => return Ok(()),
                Some(Ok(message)) => self.session.on_message(message, link).await,
            }
        }
    }

    /// Child side of the handshake.
    ///
    /// Returns a message that arrived in place of the parent's OK/ERROR
    /// confirmation, to be handled once streaming starts.
    async fn handshake(
        &self,
        reader: &mut LineReader,
        link: &OutboundHandle,
    ) -> SyncResult<Option<WireMessage>> {
        match self.read_handshake_line(reader).await? {
            WireMessage::Identify => {}
            other => {
                return Err(SyncError::UnexpectedMessage {
                    expected: "IDENTIFY".into(),
                    actual: other.kind().into(),
                });
            }
        }

        let node_id = self.session.node_id();
        link.send(WireMessage::Id(node_id.clone()));

        match self.read_handshake_line(reader).await? {
            WireMessage::Ok(text) => {
                info!(%node_id, reply = %text, "Parent accepted handshake");
                Ok(None)
            }
            WireMessage::Error(text) => {
                warn!(%node_id, reply = %text, "Parent rejected handshake, continuing");
                Ok(None)
            }
            other => {
                debug!(%node_id, kind = other.kind(), "No handshake confirmation");
                Ok(Some(other))
            }
        }
    }

    async fn read_handshake_line(&self, reader: &mut LineReader) -> SyncResult<WireMessage> {
        let limit = self.config.handshake_timeout;
        match timeout(limit, reader.next_message()).await {
            Err(_) => Err(SyncError::Timeout(limit.as_secs())),
            Ok(Err(e)) => Err(e),
            Ok(Ok(None)) => Err(SyncError::Disconnected),
            Ok(Ok(Some(Err(e)))) => Err(SyncError::HandshakeFailed(e.to_string())),
            Ok(Ok(Some(Ok(message)))) => Ok(message),
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Supervisor state");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
