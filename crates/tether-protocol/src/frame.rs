//! Length-prefixed, checksummed framing.
//!
//! Two layers:
//!
//! - [`encode_frame`] / [`split_frame`] move raw `(id, body)` pairs in and
//!   out of a byte stream and enforce the length bounds and checksum.
//! - [`FrameCodec`] puts a [`PayloadRegistry`] on top so callers deal in
//!   [`Message`]s.
//!
//! Neither layer does I/O. The read loop appends whatever the socket
//! produced to a `BytesMut` and calls [`FrameCodec::decode`] until it
//! returns `Ok(None)`.

use std::fmt;
use std::sync::Arc;

use adler2::Adler32;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Message, PayloadRegistry, ProtocolError, ProtocolId};

pub const LENGTH_PREFIX_LEN: usize = 4;
pub const PROTOCOL_ID_LEN: usize = 2;
pub const CHECKSUM_LEN: usize = 4;
/// Smallest legal value of the length prefix: an empty body.
pub const MIN_FRAME_LEN: usize = PROTOCOL_ID_LEN + CHECKSUM_LEN;
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A frame whose checksum has been verified but whose body is still bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub protocol_id: ProtocolId,
    pub body: Bytes,
}

/// Adler-32 over the big-endian protocol id followed by the body.
pub fn checksum(protocol_id: ProtocolId, body: &[u8]) -> u32 {
    let mut adler = Adler32::new();
    adler.write_slice(&protocol_id.0.to_be_bytes());
    adler.write_slice(body);
    adler.checksum()
}

/// Appends one frame to `dst`.
pub fn encode_frame(
    protocol_id: ProtocolId,
    body: &[u8],
    max_frame_len: usize,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let len = MIN_FRAME_LEN + body.len();
    let too_long = || ProtocolError::FrameTooLong {
        len,
        max: max_frame_len,
    };
    if len > max_frame_len {
        return Err(too_long());
    }
    let prefix = i32::try_from(len).map_err(|_| too_long())?;

    dst.reserve(LENGTH_PREFIX_LEN + len);
    dst.put_i32(prefix);
    dst.put_i16(protocol_id.0);
    dst.put_slice(body);
    dst.put_u32(checksum(protocol_id, body));
    Ok(())
}

/// Removes one complete frame from the front of `src`.
///
/// Returns `Ok(None)` and leaves `src` untouched when the frame is not
/// complete yet. The length prefix is validated as soon as it is readable,
/// so an oversized frame is rejected before its body is buffered.
pub fn split_frame(
    src: &mut BytesMut,
    max_frame_len: usize,
) -> Result<Option<RawFrame>, ProtocolError> {
    if src.len() < LENGTH_PREFIX_LEN {
        return Ok(None);
    }

    let mut prefix = &src[..LENGTH_PREFIX_LEN];
    let declared = prefix.get_i32();
    if declared < MIN_FRAME_LEN as i32 {
        return Err(ProtocolError::FrameTooShort(i64::from(declared)));
    }
    let len = declared as usize;
    if len > max_frame_len {
        return Err(ProtocolError::FrameTooLong {
            len,
            max: max_frame_len,
        });
    }

    let total = LENGTH_PREFIX_LEN + len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(LENGTH_PREFIX_LEN);
    let mut frame = src.split_to(len);

    let summed = len - CHECKSUM_LEN;
    let carried = (&frame[summed..]).get_u32();
    let computed = {
        let mut adler = Adler32::new();
        adler.write_slice(&frame[..summed]);
        adler.checksum()
    };
    if carried != computed {
        return Err(ProtocolError::ChecksumMismatch { carried, computed });
    }

    frame.truncate(summed);
    let protocol_id = ProtocolId(frame.get_i16());
    Ok(Some(RawFrame {
        protocol_id,
        body: frame.freeze(),
    }))
}

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// Frames [`Message`]s through a [`PayloadRegistry`].
///
/// Cheap to clone; every connection's read and write loop holds one.
#[derive(Clone)]
pub struct FrameCodec {
    registry: Arc<dyn PayloadRegistry>,
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(registry: Arc<dyn PayloadRegistry>) -> Self {
        Self {
            registry,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Overrides the maximum value of the length prefix. Values below
    /// [`MIN_FRAME_LEN`] are raised to it.
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len.max(MIN_FRAME_LEN);
        self
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn registry(&self) -> &Arc<dyn PayloadRegistry> {
        &self.registry
    }

    /// Decodes the next message from `src`, if a whole frame is buffered.
    ///
    /// Order: length bounds, completeness, checksum, registry decode.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        match split_frame(src, self.max_frame_len)? {
            Some(raw) => self.registry.decode(raw.protocol_id, &raw.body).map(Some),
            None => Ok(None),
        }
    }

    /// Appends `message` to `dst` and ends its lease, whether or not the
    /// encoding succeeded.
    pub fn encode(&self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let protocol_id = message.protocol_id;
        let body = self.registry.encode(&message.payload);
        self.registry.release(message);
        encode_frame(protocol_id, &body?, self.max_frame_len, dst)
    }
}

impl fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_len", &self.max_frame_len)
            .field("outstanding", &self.registry.outstanding())
            .finish()
    }
}
