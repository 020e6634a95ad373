//! # Line Transport
//!
//! TCP connection framed as newline-terminated text, split into a reader the
//! owner polls and a writer task fed through a channel.
//!
//! ## Connection Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   OutboundHandle (Clone)                                                │
//! │     send(msg) ──┐                                                       │
//! │     flush() ────┼──► unbounded mpsc ──► writer task ──► SplitSink ──►   │
//! │     close() ────┘                        (one per conn)      TCP        │
//! │                                                                         │
//! │   LineReader                                                            │
//! │     next_message() ◄── decode once ◄── SplitStream<LinesCodec> ◄── TCP │
//! │                                                                         │
//! │  send() never waits on the socket: it returns false once the writer    │
//! │  has stopped, which is how a caller learns the connection is gone.     │
//! │  flush() resolves only after everything sent before it is written.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ProtocolError, WireMessage};

/// Longest accepted line, in bytes.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

type LineFramed = Framed<TcpStream, LinesCodec>;

// =============================================================================
// Outbound Handle
// =============================================================================

enum Outbound {
    Message(WireMessage),
    Flush(oneshot::Sender<()>),
    Close,
}

/// Cheap, cloneable handle for pushing lines to one peer.
#[derive(Debug, Clone)]
pub struct OutboundHandle {
    tx: mpsc::UnboundedSender<Outbound>,
    peer: SocketAddr,
}

impl OutboundHandle {
    /// Queues a message for the writer task.
    ///
    /// Returns `false` if the connection's writer has already stopped.
    pub fn send(&self, message: WireMessage) -> bool {
        self.tx.send(Outbound::Message(message)).is_ok()
    }

    /// Waits until every message queued before this call has been written.
    pub async fn flush(&self) -> SyncResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Flush(ack_tx))
            .map_err(|_| SyncError::Disconnected)?;
        ack_rx.await.map_err(|_| SyncError::Disconnected)
    }

    /// Asks the writer to close the socket after draining what is queued.
    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Whether two handles feed the same connection.
    pub fn same_connection(&self, other: &OutboundHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Receiving half of a line connection.
pub struct LineReader {
    stream: SplitStream<LineFramed>,
    peer: SocketAddr,
}

impl LineReader {
    /// Next raw line, or `None` when the peer closed the connection.
    pub async fn next_line(&mut self) -> SyncResult<Option<String>> {
        match self.stream.next().await {
            Some(Ok(line)) => {
                trace!(peer = %self.peer, %line, "<-");
                Ok(Some(line))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Next non-blank line, decoded.
    ///
    /// The outer `Result` is the connection; the inner one is the line. A
    /// malformed line leaves the connection usable.
    pub async fn next_message(
        &mut self,
    ) -> SyncResult<Option<Result<WireMessage, ProtocolError>>> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            match WireMessage::decode(&line) {
                Ok(Some(message)) => return Ok(Some(Ok(message))),
                Ok(None) => continue,
                Err(e) => return Ok(Some(Err(e))),
            }
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

// =============================================================================
// Connection
// =============================================================================

/// A framed TCP connection with its writer task already running.
pub struct LineConnection {
    pub reader: LineReader,
    pub link: OutboundHandle,
}

impl LineConnection {
    /// Wraps an accepted or connected socket.
    pub fn from_stream(stream: TcpStream) -> SyncResult<Self> {
        let peer = stream.peer_addr()?;
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (sink, stream) = framed.split();

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(sink, rx, peer));

        Ok(LineConnection {
            reader: LineReader { stream, peer },
            link: OutboundHandle { tx, peer },
        })
    }

    /// Connects to `addr` (`host:port`) within `connect_timeout`.
    pub async fn connect(addr: &str, connect_timeout: Duration) -> SyncResult<Self> {
        debug!(%addr, "Connecting");
        let stream = match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(SyncError::ConnectionFailed(format!("{}: {}", addr, e)));
            }
            Err(_) => return Err(SyncError::Timeout(connect_timeout.as_secs())),
        };
        LineConnection::from_stream(stream)
    }

    pub fn peer(&self) -> SocketAddr {
        self.link.peer
    }
}

async fn run_writer(
    mut sink: SplitSink<LineFramed, String>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    peer: SocketAddr,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Message(message) => {
                let line = message.to_string();
                trace!(%peer, %line, "->");
                if let Err(e) = sink.send(line).await {
                    warn!(%peer, error = %e, "Write failed, stopping writer");
                    break;
                }
            }
            Outbound::Flush(ack) => {
                if sink.flush().await.is_err() {
                    break;
                }
                let _ = ack.send(());
            }
            Outbound::Close => break,
        }
    }

    let _ = sink.close().await;
    debug!(%peer, "Writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (LineConnection, LineConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, accepted) = tokio::join!(
            LineConnection::connect(&addr, Duration::from_secs(5)),
            listener.accept()
        );
        let server = LineConnection::from_stream(accepted.unwrap().0).unwrap();
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (client, mut server) = pair().await;

        assert!(client.link.send(WireMessage::Identify));
        assert!(client.link.send(WireMessage::Id("7".into())));
        client.link.flush().await.unwrap();

        let first = server.reader.next_message().await.unwrap().unwrap().unwrap();
        let second = server.reader.next_message().await.unwrap().unwrap().unwrap();
        assert_eq!(first, WireMessage::Identify);
        assert_eq!(second, WireMessage::Id("7".into()));
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection() {
        let (client, mut server) = pair().await;

        client.link.send(WireMessage::Other("PRICE 93".into()));
        client.link.send(WireMessage::Ack);

        let bad = server.reader.next_message().await.unwrap().unwrap();
        assert!(bad.is_err());
        let good = server.reader.next_message().await.unwrap().unwrap().unwrap();
        assert_eq!(good, WireMessage::Ack);
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_rejects_sends() {
        let (client, mut server) = pair().await;

        client.link.close();
        assert!(server.reader.next_line().await.unwrap().is_none());

        // Writer has exited; the channel is closed.
        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.link.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(!client.link.send(WireMessage::Ack));
        assert!(client.link.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = LineConnection::connect(&addr, Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::ConnectionFailed(_)));
    }
}
