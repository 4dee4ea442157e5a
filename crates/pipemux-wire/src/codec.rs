use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// Frame header: magic (2) + kind (1) + reserved (1) + route (8) + length (4) = 16 bytes.
pub const HEADER_SIZE: usize = 16;

/// Magic bytes: "PX" (0x50 0x58).
pub const MAGIC: [u8; 2] = [0x50, 0x58];

/// Maximum frame payload size: 64 MiB. Enforced symmetrically by
/// [`encode_frame`] and [`decode_frame`], so a frame one side produces is
/// never rejected as malformed by the other. Leaves headroom over the
/// per-message payload cap for descriptor overhead and transferred pipes'
/// pending queues.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// The kind of traffic a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A message for the pipe registered at the frame's route.
    Data = 0,
    /// A JSON control message (route lifecycle).
    Control = 1,
    /// A token claim binding a reserved pipe to a route.
    TokenBind = 2,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Data),
            1 => Ok(FrameKind::Control),
            2 => Ok(FrameKind::TokenBind),
            other => Err(WireError::InvalidKind(other)),
        }
    }
}

/// A routed frame on a channel.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    /// Route id; identifies the logical pipe this frame belongs to.
    pub route: u64,
    pub payload: Bytes,
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬──────────┬──────────┬────────────┬───────────┬──────────────────┐
/// │ Magic (2B) │ Kind (1B)│ Rsvd (1B)│ Route (8B  │ Length    │ Payload          │
/// │ 0x50 0x58  │          │ 0x00     │ LE)        │ (4B LE)   │ (Length bytes)   │
/// └────────────┴──────────┴──────────┴────────────┴───────────┴──────────────────┘
/// ```
pub fn encode_frame(kind: FrameKind, route: u64, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > DEFAULT_MAX_PAYLOAD {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: DEFAULT_MAX_PAYLOAD,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u8(kind as u8);
    dst.put_u8(0);
    dst.put_u64_le(route);
    dst.put_u32_le(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    if src[0..2] != MAGIC {
        return Err(WireError::InvalidMagic);
    }

    let kind = FrameKind::try_from(src[2])?;
    let route = u64::from_le_bytes(src[4..12].try_into().expect("slice length is 8"));
    let payload_len =
        u32::from_le_bytes(src[12..16].try_into().expect("slice length is 4")) as usize;

    if payload_len > max_payload {
        return Err(WireError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        kind,
        route,
        payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut buf = BytesMut::new();
        let payload = b"hello, pipemux!";

        encode_frame(FrameKind::Data, 0x1122334455667788, payload, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + payload.len());

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, FrameKind::Data);
        assert_eq!(frame.route, 0x1122334455667788);
        assert_eq!(frame.payload.as_ref(), payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_incomplete_header() {
        let mut buf = BytesMut::from(&[0x50, 0x58, 0x00][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Control, 7, b"hello", &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn decode_invalid_magic() {
        let mut buf = BytesMut::from(&[0xFF; HEADER_SIZE][..]);
        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(WireError::InvalidMagic)));
    }

    #[test]
    fn decode_unknown_kind() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(0xEE);
        buf.put_u8(0);
        buf.put_u64_le(0);
        buf.put_u32_le(0);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(WireError::InvalidKind(0xEE))));
    }

    #[test]
    fn decode_payload_too_large() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u8(FrameKind::Data as u8);
        buf.put_u8(0);
        buf.put_u64_le(1);
        buf.put_u32_le(1024 * 1024 * 128); // 128 MiB

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(WireError::PayloadTooLarge { .. })));
    }

    #[test]
    fn encode_enforces_the_same_cap_as_decode() {
        let oversized = vec![0u8; DEFAULT_MAX_PAYLOAD + 1];
        let mut buf = BytesMut::new();
        let result = encode_frame(FrameKind::Data, 1, &oversized, &mut buf);
        assert!(matches!(result, Err(WireError::PayloadTooLarge { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_frames() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Data, 1, b"first", &mut buf).unwrap();
        encode_frame(FrameKind::TokenBind, 2, b"second", &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(f1.route, 1);
        assert_eq!(f1.payload.as_ref(), b"first");

        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert_eq!(f2.kind, FrameKind::TokenBind);
        assert_eq!(f2.payload.as_ref(), b"second");

        assert!(buf.is_empty());
    }

    #[test]
    fn empty_payload() {
        let mut buf = BytesMut::new();
        encode_frame(FrameKind::Control, 0, b"", &mut buf).unwrap();

        let frame = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD)
            .unwrap()
            .unwrap();
        assert!(frame.payload.is_empty());
    }
}
