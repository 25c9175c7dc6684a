//! Wire protocol for Tether.
//!
//! This crate defines what travels between a client and the server:
//!
//! - **Types** ([`Message`], [`Payload`], [`ProtocolId`], [`CloseReason`]):
//!   the four control messages and their numeric ids.
//! - **Registry** ([`PayloadRegistry`] trait, [`JsonRegistry`]): how a
//!   payload body is turned into a typed [`Payload`] and back, with lease
//!   accounting for every message the core holds.
//! - **Framing** ([`FrameCodec`], [`encode_frame`], [`split_frame`]): the
//!   length-prefixed, checksummed frame around each body.
//! - **Errors** ([`ProtocolError`]).
//!
//! # Frame layout
//!
//! ```text
//! +--------------+---------------+-----------------+---------------+
//! | i32 BE len   | i16 BE id     | payload (len-6) | u32 BE adler  |
//! +--------------+---------------+-----------------+---------------+
//!                 \_______ checksummed ___________/
//! ```
//!
//! `len` counts everything after itself, so it is always at least 6.
//!
//! The protocol layer knows nothing about sockets or players; it only turns
//! bytes into messages and messages into bytes.

// ---------------------------------------------------------------------------
// Module declarations
// ---------------------------------------------------------------------------

mod error;
mod frame;
mod registry;
mod types;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

pub use error::ProtocolError;
pub use frame::{
    CHECKSUM_LEN, DEFAULT_MAX_FRAME_LEN, FrameCodec, LENGTH_PREFIX_LEN, MIN_FRAME_LEN,
    PROTOCOL_ID_LEN, RawFrame, checksum, encode_frame, split_frame,
};
#[cfg(feature = "json")]
pub use registry::JsonRegistry;
pub use registry::PayloadRegistry;
pub use types::{
    ClientAuth, ClientHeartbeat, CloseReason, Message, Payload, PlayerId, ProtocolId,
    ServerAuthResult, ServerForceClose,
};
