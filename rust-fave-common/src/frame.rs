//! Length-prefixed framing for producer messages.
//!
//! A frame is a 4-byte big-endian payload length followed by the UTF-8 JSON
//! payload.

use crate::error::Error;
use crate::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Append one frame holding `payload` to `buf`.
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Frame(format!("payload of {} bytes does not fit a frame", payload.len())))?;
    buf.reserve(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.extend_from_slice(payload);
    Ok(())
}

/// A single frame as an owned buffer.
pub fn frame(payload: &[u8]) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    encode_frame(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Split the next complete frame off the front of `buf`.
///
/// Returns `Ok(None)` while the frame is incomplete. A length above
/// `max_len` is an error; the caller should drop the connection.
pub fn decode_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<Bytes>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max_len {
        return Err(Error::Frame(format!(
            "frame of {} bytes exceeds limit of {} bytes",
            len, max_len
        )));
    }
    // Incomplete; the reader grows `buf` as bytes arrive.
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    Ok(Some(buf.split_to(len).freeze()))
}
