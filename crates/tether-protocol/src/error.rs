//! Error types for the protocol layer.
//!
//! Every variant here is fatal to the connection that produced the bytes:
//! once a stream is out of frame sync there is no way to resynchronise it.

use crate::ProtocolId;

/// Errors that can occur while framing or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The length prefix is below the 6 bytes every frame needs
    /// (protocol id plus checksum), or negative.
    #[error("frame length {0} is below the minimum of 6")]
    FrameTooShort(i64),

    /// The length prefix exceeds the configured maximum.
    #[error("frame length {len} exceeds the maximum of {max}")]
    FrameTooLong { len: usize, max: usize },

    /// The trailing checksum does not match the frame contents.
    #[error("checksum mismatch: frame carries {carried:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { carried: u32, computed: u32 },

    /// No payload type is registered for this protocol id.
    #[error("no payload registered for protocol {0}")]
    UnknownProtocol(ProtocolId),

    /// Serialization of an outgoing payload failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// The payload body could not be parsed as the type its id names.
    #[cfg(feature = "json")]
    #[error("decode of protocol {id} failed: {source}")]
    Decode {
        id: ProtocolId,
        source: serde_json::Error,
    },

    /// The message parsed but carries a value the protocol does not allow.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
