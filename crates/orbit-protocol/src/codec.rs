//! Codec for encoding and decoding Orbit frames.
//!
//! Text WebSocket messages carry a frame as JSON. Binary messages carry a
//! MessagePack-encoded frame behind a 4-byte big-endian length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::Frame;

/// Largest frame accepted in either encoding (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Width of the big-endian length header on binary frames.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Errors raised while turning frames into bytes and back.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    /// The buffer ends before the frame does.
    #[error("incomplete frame, {0} more bytes needed")]
    Incomplete(usize),

    #[error("msgpack encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown event {0}")]
    UnknownEvent(String),
}

/// Reads the length header and returns the body length, or `None` while the
/// header itself is still short.
fn body_len(data: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let Some(header) = data.get(..LENGTH_PREFIX_SIZE) else {
        return Ok(None);
    };
    let mut header = header;
    let len = header.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(Some(len))
}

/// Encode a frame as a length-prefixed MessagePack binary message.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode(frame: &Frame) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Append a length-prefixed frame to `buf`.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails. `buf` is
/// left untouched in that case.
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let body = rmp_serde::to_vec_named(frame)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_SIZE)
        .ok_or(ProtocolError::FrameTooLarge(body.len()))?;

    buf.reserve(LENGTH_PREFIX_SIZE + body.len());
    buf.put_u32(len);
    buf.put_slice(&body);
    Ok(())
}

/// Decode exactly one binary frame from the start of `data`.
///
/// # Errors
///
/// Returns [`ProtocolError::Incomplete`] when `data` is shorter than the frame
/// it announces, or a size/decode error.
pub fn decode(data: &[u8]) -> Result<Frame, ProtocolError> {
    let len = body_len(data)?
        .ok_or(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE.saturating_sub(data.len())))?;
    let body = data
        .get(LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len)
        .ok_or(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE + len - data.len()))?;
    Ok(rmp_serde::from_slice(body)?)
}

/// Pull the next complete binary frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` alone until a whole frame is buffered.
///
/// # Errors
///
/// Returns an error if the announced length is too large or the body does
/// not decode. The offending frame is consumed in the latter case.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
    let Some(len) = body_len(buf)? else {
        return Ok(None);
    };
    if buf.len() < LENGTH_PREFIX_SIZE + len {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let body = buf.split_to(len);
    Ok(Some(rmp_serde::from_slice(&body)?))
}

/// Encode a frame as JSON text.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode_text(frame: &Frame) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large, not JSON, or names an unknown event.
pub fn decode_text(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }
    Ok(serde_json::from_str(text)?)
}
