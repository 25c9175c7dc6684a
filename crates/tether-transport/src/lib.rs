//! Transport abstraction layer for Tether.
//!
//! A [`Transport`] accepts sockets and hands each one back split into a
//! [`ConnectionReader`] and a [`ConnectionWriter`], so the server can run
//! one read task and one write task per connection without sharing a lock
//! between them.
//!
//! Both halves are byte-oriented. Message boundaries are restored above
//! this layer by the frame codec, so a WebSocket message may carry any
//! number of frames (or part of one).
//!
//! # Cancel safety
//!
//! The server wraps every `recv` and `send` in `tokio::time::timeout`.
//! Implementations must therefore be cancel safe: a cancelled `recv`
//! loses no data and a cancelled `send` has written nothing.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`

mod error;
mod tcp;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use tcp::{TcpReader, TcpTransport, TcpWriter};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketReader, WebSocketTransport, WebSocketWriter};

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique connection IDs across all transports.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-wide id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A freshly accepted connection, already split.
#[derive(Debug)]
pub struct Accepted<R, W> {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub reader: R,
    pub writer: W,
}

/// Accepts new incoming connections.
pub trait Transport: Send + Sync + 'static {
    type Reader: ConnectionReader;
    type Writer: ConnectionWriter;

    /// Short name used in log fields (`transport = "tcp"`).
    fn kind(&self) -> &'static str;

    /// Waits for and accepts the next incoming connection.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Accepted<Self::Reader, Self::Writer>, TransportError>> + Send;

    /// The address the listener is bound to.
    fn local_addr(&self) -> Result<SocketAddr, TransportError>;
}

/// Receiving half of a connection.
pub trait ConnectionReader: Send + 'static {
    /// Receives the next chunk of bytes from the peer.
    ///
    /// Returns `Ok(None)` when the peer closed the connection cleanly.
    fn recv(&mut self) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;
}

/// Sending half of a connection.
pub trait ConnectionWriter: Send + 'static {
    /// Writes a prefix of `data` and returns its length. The caller keeps
    /// the rest and retries.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<usize, TransportError>> + Send;

    /// Pushes anything the half buffers internally onto the socket.
    fn flush(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Sends a keep-alive probe if the protocol has one.
    fn ping(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send {
        async { Ok(()) }
    }

    /// Closes the sending side. The peer sees end of stream.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
