//! WebSocket transport implementation using `tokio-tungstenite`.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;

use crate::{Accepted, ConnectionId, ConnectionReader, ConnectionWriter, Transport, TransportError};

/// Upper bound on the HTTP upgrade, so one silent client cannot stall the
/// accept loop.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<TcpStream>;

fn ws_error(kind: std::io::ErrorKind, e: tokio_tungstenite::tungstenite::Error) -> std::io::Error {
    std::io::Error::new(kind, e)
}

/// A WebSocket-based [`Transport`] that listens for incoming connections.
pub struct WebSocketTransport {
    listener: TcpListener,
}

impl WebSocketTransport {
    /// Binds a new WebSocket transport to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        tracing::info!(addr, "WebSocket transport listening");
        Ok(Self { listener })
    }
}

impl Transport for WebSocketTransport {
    type Reader = WebSocketReader;
    type Writer = WebSocketWriter;

    fn kind(&self) -> &'static str {
        "ws"
    }

    async fn accept(
        &mut self,
    ) -> Result<Accepted<WebSocketReader, WebSocketWriter>, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let ws = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
            .await
            .map_err(|_| {
                TransportError::Handshake(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "websocket upgrade timed out",
                ))
            })?
            .map_err(|e| {
                TransportError::Handshake(ws_error(std::io::ErrorKind::ConnectionRefused, e))
            })?;

        let id = ConnectionId::next();
        tracing::debug!(%id, %peer, "accepted WebSocket connection");

        let (sink, stream) = ws.split();
        Ok(Accepted {
            id,
            peer,
            reader: WebSocketReader { stream },
            writer: WebSocketWriter { sink },
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener.local_addr().map_err(TransportError::AcceptFailed)
    }
}

/// Receiving half of a WebSocket connection.
pub struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

impl ConnectionReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(Message::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/raw frame
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(ws_error(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }
}

/// Sending half of a WebSocket connection.
///
/// `send` only queues one binary message into the sink (`feed`), which
/// either accepts the whole message or nothing; `flush` moves it out.
pub struct WebSocketWriter {
    sink: SplitSink<WsStream, Message>,
}

impl WebSocketWriter {
    fn send_error(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
        TransportError::SendFailed(ws_error(std::io::ErrorKind::BrokenPipe, e))
    }
}

impl ConnectionWriter for WebSocketWriter {
    async fn send(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        self.sink
            .feed(Message::Binary(data.to_vec().into()))
            .await
            .map_err(Self::send_error)?;
        Ok(data.len())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.sink.flush().await.map_err(Self::send_error)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Default::default()))
            .await
            .map_err(Self::send_error)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.sink.close().await.map_err(Self::send_error)
    }
}
