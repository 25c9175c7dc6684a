//! Plain TCP transport.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::{Accepted, ConnectionId, ConnectionReader, ConnectionWriter, Transport, TransportError};

const READ_CHUNK: usize = 8 * 1024;

/// A TCP [`Transport`]. Each accepted stream is split with
/// `TcpStream::into_split`, so the halves need no shared lock.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Binds a new TCP transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(addr, "TCP transport listening");
        Ok(Self { listener })
    }
}

impl Transport for TcpTransport {
    type Reader = TcpReader;
    type Writer = TcpWriter;

    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn accept(&mut self) -> Result<Accepted<TcpReader, TcpWriter>, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "set_nodelay failed");
        }

        let id = ConnectionId::next();
        tracing::debug!(%id, %peer, "accepted TCP connection");

        let (read, write) = stream.into_split();
        Ok(Accepted {
            id,
            peer,
            reader: TcpReader {
                half: read,
                buf: vec![0; READ_CHUNK],
            },
            writer: TcpWriter { half: write },
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(TransportError::AcceptFailed)
    }
}

/// Receiving half of a TCP connection.
pub struct TcpReader {
    half: OwnedReadHalf,
    buf: Vec<u8>,
}

impl ConnectionReader for TcpReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let n = self
            .half
            .read(&mut self.buf)
            .await
            .map_err(TransportError::ReceiveFailed)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf[..n].to_vec()))
    }
}

/// Sending half of a TCP connection.
pub struct TcpWriter {
    half: OwnedWriteHalf,
}

impl ConnectionWriter for TcpWriter {
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let n = self
            .half
            .write(data)
            .await
            .map_err(TransportError::SendFailed)?;
        if n == 0 && !data.is_empty() {
            return Err(TransportError::ConnectionClosed("write returned zero".into()));
        }
        Ok(n)
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.half.flush().await.map_err(TransportError::SendFailed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.half.shutdown().await.map_err(TransportError::SendFailed)
    }
}
