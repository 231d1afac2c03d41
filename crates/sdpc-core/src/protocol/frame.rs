//! Wire framing for control channel envelopes.
//!
//! Format: 4-byte little-endian length prefix + UTF-8 JSON envelope.
//!
//! The framing ensures:
//! - Messages are length-prefixed for stream transport
//! - Maximum message size is enforced
//! - Partial reads return Ok(None) to support incremental polling

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_MESSAGE_SIZE;
use crate::error::{Error, Result};

/// Length of the frame header (4 bytes, little-endian u32).
pub const FRAME_HEADER_LEN: usize = 4;

/// Encode an envelope to bytes with length prefix.
pub fn encode(text: &str) -> Result<Bytes> {
    let payload = text.as_bytes();

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Codec {
            message: format!(
                "message too large: {} bytes (max {})",
                payload.len(),
                MAX_MESSAGE_SIZE
            ),
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Decode one envelope from a buffer.
///
/// Returns:
/// - Ok(Some(text)) if a complete frame was decoded (buffer is advanced)
/// - Ok(None) if more data is needed (buffer unchanged)
/// - Err if the frame is oversized or not UTF-8
///
/// The buffer is only consumed on successful decode.
pub fn decode(buf: &mut BytesMut) -> Result<Option<String>> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(Error::Codec {
            message: format!("frame too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        });
    }

    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(len);

    let text = String::from_utf8(payload.to_vec()).map_err(|e| Error::Codec {
        message: format!("frame is not UTF-8: {e}"),
    })?;

    Ok(Some(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let encoded = encode(r#"{"subject":"keep_alive"}"#).unwrap();
        let mut buf = BytesMut::from(&encoded[..]);

        let decoded = decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, r#"{"subject":"keep_alive"}"#);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_needs_more() {
        let mut buf = BytesMut::from(&[1u8, 0][..]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_payload_needs_more() {
        let encoded = encode("hello").unwrap();
        let mut buf = BytesMut::from(&encoded[..encoded.len() - 1]);

        assert!(decode(&mut buf).unwrap().is_none());
        // Buffer untouched; completing it decodes.
        buf.put_u8(encoded[encoded.len() - 1]);
        assert_eq!(decode(&mut buf).unwrap().as_deref(), Some("hello"));
    }

    #[test]
    fn two_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        buf.put_slice(&encode("first").unwrap());
        buf.put_slice(&encode("second").unwrap());

        assert_eq!(decode(&mut buf).unwrap().as_deref(), Some("first"));
        assert_eq!(decode(&mut buf).unwrap().as_deref(), Some("second"));
        assert!(decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le((MAX_MESSAGE_SIZE + 1) as u32);
        buf.put_slice(b"xx");

        assert!(matches!(decode(&mut buf), Err(Error::Codec { .. })));
    }

    #[test]
    fn oversized_encode_rejected() {
        let big = "x".repeat(MAX_MESSAGE_SIZE + 1);
        assert!(matches!(encode(&big), Err(Error::Codec { .. })));
    }

    #[test]
    fn non_utf8_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(2);
        buf.put_slice(&[0xFF, 0xFE]);

        assert!(matches!(decode(&mut buf), Err(Error::Codec { .. })));
    }
}
