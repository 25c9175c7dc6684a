//! Per-connection I/O: one read task and one write task.
//!
//! ```text
//! socket ─▶ read loop ─▶ FrameCodec::decode ─┬─ ClientAuth ─▶ SessionHub
//!                                            └─ other ──────▶ Connection::deliver
//!
//! outbound mediator ─▶ write loop ─▶ FrameCodec::encode ─▶ socket
//! ```
//!
//! Each loop latches its half closed on the connection's mediators and
//! calls `half_finished` exactly once on the way out. Whichever finishes
//! second reclaims the connection.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tether_protocol::{CloseReason, FrameCodec, Payload, ProtocolError};
use tether_session::{ConnEvent, Connection, SessionHub, Shutdown};
use tether_transport::{Accepted, ConnectionReader, ConnectionWriter, TransportError};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::TetherError;

/// Wait for one outbound message before re-checking the latches.
const TAKE_WAIT: Duration = Duration::from_millis(5);
/// Bound on one write attempt while the connection is running.
const WRITE_ATTEMPT: Duration = Duration::from_millis(50);
const READ_BUF: usize = 8 * 1024;

/// What every connection task needs from the server.
pub(crate) struct ConnContext {
    pub(crate) hub: Arc<SessionHub>,
    pub(crate) codec: FrameCodec,
    pub(crate) shutdown: Shutdown,
    pub(crate) ping_interval: Duration,
}

/// Registers the connection and spawns its two I/O tasks.
pub(crate) fn spawn_connection<R, W>(ctx: &Arc<ConnContext>, accepted: Accepted<R, W>)
where
    R: ConnectionReader,
    W: ConnectionWriter,
{
    let conn = ctx.hub.open_connection(accepted.id);
    debug!(conn_id = %accepted.id, peer = %accepted.peer, "connection registered");
    tokio::spawn(read_loop(Arc::clone(ctx), Arc::clone(&conn), accepted.reader));
    tokio::spawn(write_loop(Arc::clone(ctx), conn, accepted.writer));
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

async fn read_loop<R>(ctx: Arc<ConnContext>, conn: Arc<Connection>, reader: R)
where
    R: ConnectionReader,
{
    let end = read_until_closed(&ctx, &conn, reader).await;
    debug!(conn_id = %conn.id(), reason = end.as_str(), "read loop exited");

    conn.inbound().notify_client_read_closed();
    // On shutdown the write loop sends the goodbye and closes on its own.
    if end != ReadEnd::Shutdown {
        conn.request_close();
    }
    conn.half_finished();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    CloseRequested,
    Shutdown,
    PeerClosed,
    ReadError,
    BadFrame,
}

impl ReadEnd {
    fn as_str(self) -> &'static str {
        match self {
            Self::CloseRequested => "close requested",
            Self::Shutdown => "shutdown",
            Self::PeerClosed => "peer closed",
            Self::ReadError => "read error",
            Self::BadFrame => "framing error",
        }
    }
}

async fn read_until_closed<R: ConnectionReader>(
    ctx: &ConnContext,
    conn: &Arc<Connection>,
    mut reader: R,
) -> ReadEnd {
    let read_poll = ctx.hub.config().read_poll;
    let mut buf = BytesMut::with_capacity(READ_BUF);

    loop {
        if conn.inbound().should_close() {
            return ReadEnd::CloseRequested;
        }
        if ctx.shutdown.is_triggered() {
            return ReadEnd::Shutdown;
        }

        let chunk = match tokio::time::timeout(read_poll, reader.recv()).await {
            Err(_) => continue,
            Ok(Ok(Some(chunk))) => chunk,
            Ok(Ok(None)) => return ReadEnd::PeerClosed,
            Ok(Err(e)) => {
                debug!(conn_id = %conn.id(), error = %e, "read failed");
                return ReadEnd::ReadError;
            }
        };
        buf.extend_from_slice(&chunk);

        if let Err(e) = dispatch_frames(ctx, conn, &mut buf) {
            debug!(conn_id = %conn.id(), error = %e, "bad frame");
            return ReadEnd::BadFrame;
        }
    }
}

/// Decodes every complete frame in `buf` and routes it.
fn dispatch_frames(
    ctx: &ConnContext,
    conn: &Arc<Connection>,
    buf: &mut BytesMut,
) -> Result<(), ProtocolError> {
    while let Some(msg) = ctx.codec.decode(buf)? {
        trace!(conn_id = %conn.id(), protocol_id = %msg.protocol_id, "frame received");
        match &msg.payload {
            Payload::ClientAuth(auth) => {
                ctx.hub.handle_client_auth(conn, auth);
                ctx.codec.registry().release(msg);
            }
            _ => conn.deliver(msg),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

async fn write_loop<W>(ctx: Arc<ConnContext>, conn: Arc<Connection>, mut writer: W)
where
    W: ConnectionWriter,
{
    let mut buf = BytesMut::new();

    match write_until_closed(&ctx, &conn, &mut writer, &mut buf).await {
        Ok(()) => {
            let deadline = Instant::now() + ctx.hub.config().flush_deadline;
            let flush = flush_and_close(&ctx, &conn, &mut writer, &mut buf);
            let flushed = tokio::time::timeout_at(deadline, flush).await;
            match flushed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(conn_id = %conn.id(), error = %e, "final flush failed"),
                Err(_) => debug!(conn_id = %conn.id(), pending = buf.len(), "final flush timed out"),
            }
        }
        Err(e) => debug!(conn_id = %conn.id(), error = %e, "write failed"),
    }

    conn.outbound().notify_client_write_closed();
    conn.request_close();
    conn.half_finished();
    debug!(conn_id = %conn.id(), "write loop exited");
}

/// Runs until a close is requested. Returns `Err` only when the socket
/// failed, in which case nothing more can be flushed.
async fn write_until_closed<W: ConnectionWriter>(
    ctx: &ConnContext,
    conn: &Connection,
    writer: &mut W,
    buf: &mut BytesMut,
) -> Result<(), TetherError> {
    let out = conn.outbound();
    let mut bound = false;
    let mut last_ping = Instant::now();

    loop {
        if !bound && out.is_bind_success() {
            bound = true;
            conn.handle(ConnEvent::BindSuccess);
        }
        if out.should_close() {
            return Ok(());
        }
        if ctx.shutdown.is_triggered() {
            conn.send(Payload::force_close(CloseReason::ServerShuttingDown));
            conn.request_close();
            return Ok(());
        }

        if let Some(msg) = out.take_message(TAKE_WAIT).await {
            ctx.codec.encode(msg, buf)?;
            while let Some(msg) = out.try_take_message() {
                ctx.codec.encode(msg, buf)?;
            }
        }
        if !buf.is_empty() {
            write_some(writer, buf).await?;
        }

        if last_ping.elapsed() >= ctx.ping_interval {
            last_ping = Instant::now();
            match tokio::time::timeout(WRITE_ATTEMPT, writer.ping()).await {
                Ok(result) => result?,
                Err(_) => trace!(conn_id = %conn.id(), "ping timed out"),
            }
        }
    }
}

/// Writes as much of `buf` as fits in one attempt window. What is left
/// stays in `buf` for the next round.
async fn write_some<W: ConnectionWriter>(
    writer: &mut W,
    buf: &mut BytesMut,
) -> Result<(), TransportError> {
    let deadline = Instant::now() + WRITE_ATTEMPT;
    while !buf.is_empty() {
        match tokio::time::timeout_at(deadline, writer.send(buf)).await {
            Ok(sent) => buf.advance(sent?),
            Err(_) => return Ok(()),
        }
    }
    match tokio::time::timeout_at(deadline, writer.flush()).await {
        Ok(result) => result,
        Err(_) => Ok(()),
    }
}

/// Sends everything still queued, then closes the sending side.
async fn flush_and_close<W: ConnectionWriter>(
    ctx: &ConnContext,
    conn: &Connection,
    writer: &mut W,
    buf: &mut BytesMut,
) -> Result<(), TetherError> {
    while let Some(msg) = conn.outbound().try_take_message() {
        ctx.codec.encode(msg, buf)?;
    }
    while !buf.is_empty() {
        let sent = writer.send(buf).await?;
        buf.advance(sent);
    }
    writer.flush().await?;
    writer.close().await?;
    Ok(())
}
