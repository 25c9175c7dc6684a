//! Message types for the Tether wire protocol.
//!
//! The protocol has exactly four control messages. Each has a fixed numeric
//! [`ProtocolId`] carried in the frame header and a JSON body whose field
//! names are part of the client contract.
//!
//! | Id  | Direction | Body                     |
//! |-----|-----------|--------------------------|
//! | 100 | C → S     | `{"uid":42,"token":"…"}` |
//! | 101 | C → S     | `{}`                     |
//! | 500 | S → C     | `{"passed":true}`        |
//! | 501 | S → C     | `{"reason":2}`           |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A durable player identity, independent of any connection.
///
/// Serialized as a plain number (`42`, not `{"0":42}`) so it can sit in the
/// `uid` field of [`ClientAuth`] directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub u64);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

/// Numeric message id from the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProtocolId(pub i16);

impl ProtocolId {
    pub const CLIENT_AUTH: Self = Self(100);
    pub const CLIENT_HEARTBEAT: Self = Self(101);
    pub const SERVER_AUTH_RESULT: Self = Self(500);
    pub const SERVER_FORCE_CLOSE: Self = Self(501);
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Close reasons
// ---------------------------------------------------------------------------

/// Why the server is closing a connection. Sent as a single signed byte
/// value in [`ServerForceClose`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i8", try_from = "i8")]
pub enum CloseReason {
    /// No heartbeat arrived within the kick threshold.
    HeartbeatTimeout,
    /// Another connection authenticated as the same player.
    SupersededByNewConnection,
    /// The server is shutting down.
    ServerShuttingDown,
}

impl CloseReason {
    pub fn code(self) -> i8 {
        match self {
            Self::HeartbeatTimeout => 1,
            Self::SupersededByNewConnection => 2,
            Self::ServerShuttingDown => 3,
        }
    }
}

impl From<CloseReason> for i8 {
    fn from(reason: CloseReason) -> Self {
        reason.code()
    }
}

impl TryFrom<i8> for CloseReason {
    type Error = ProtocolError;

    fn try_from(code: i8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Self::HeartbeatTimeout),
            2 => Ok(Self::SupersededByNewConnection),
            3 => Ok(Self::ServerShuttingDown),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown close reason {other}"
            ))),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HeartbeatTimeout => "heartbeat timeout",
            Self::SupersededByNewConnection => "superseded by new connection",
            Self::ServerShuttingDown => "server shutting down",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Payload bodies
// ---------------------------------------------------------------------------

/// First message on every connection: claims an identity with a token
/// issued out of band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAuth {
    pub uid: PlayerId,
    pub token: String,
}

/// Keep-alive from a bound client. Empty body (`{}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientHeartbeat {}

/// Reply to [`ClientAuth`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAuthResult {
    pub passed: bool,
}

/// Last message the server sends before closing a connection on purpose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerForceClose {
    pub reason: CloseReason,
}

/// A typed message body.
///
/// The body is not self-describing on the wire: the frame's [`ProtocolId`]
/// says which variant to parse, so this enum carries no serde tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    ClientAuth(ClientAuth),
    ClientHeartbeat(ClientHeartbeat),
    ServerAuthResult(ServerAuthResult),
    ServerForceClose(ServerForceClose),
}

impl Payload {
    pub fn protocol_id(&self) -> ProtocolId {
        match self {
            Self::ClientAuth(_) => ProtocolId::CLIENT_AUTH,
            Self::ClientHeartbeat(_) => ProtocolId::CLIENT_HEARTBEAT,
            Self::ServerAuthResult(_) => ProtocolId::SERVER_AUTH_RESULT,
            Self::ServerForceClose(_) => ProtocolId::SERVER_FORCE_CLOSE,
        }
    }

    pub fn auth_result(passed: bool) -> Self {
        Self::ServerAuthResult(ServerAuthResult { passed })
    }

    pub fn force_close(reason: CloseReason) -> Self {
        Self::ServerForceClose(ServerForceClose { reason })
    }
}

/// One decoded message: its id and typed body.
///
/// A `Message` obtained from a [`PayloadRegistry`](crate::PayloadRegistry)
/// holds a lease on that registry and must end in either
/// [`FrameCodec::encode`](crate::FrameCodec::encode) or
/// [`PayloadRegistry::release`](crate::PayloadRegistry::release).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol_id: ProtocolId,
    pub payload: Payload,
}

impl Message {
    pub fn is_auth(&self) -> bool {
        self.protocol_id == ProtocolId::CLIENT_AUTH
    }
}
