use std::collections::VecDeque;
use std::os::fd::OwnedFd;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use pipemux_platform::PlatformHandle;

use crate::error::{Result, WireError};

/// A decoded message body: payload plus attached handle descriptors in order.
#[derive(Debug)]
pub struct WireMessage {
    pub data: Bytes,
    pub handles: Vec<HandleDescriptor>,
}

/// One attached handle on the wire.
#[derive(Debug)]
pub enum HandleDescriptor {
    Pipe(PipeDescriptor),
    Buffer(BufferDescriptor),
    Platform(PlatformHandle),
}

/// A transferred message-pipe endpoint.
///
/// The sender registers the endpoint's surviving local peer under `route`
/// before the carrying frame is sent; the receiver registers its rebuilt
/// endpoint under the same route. Unread messages travel inline so nothing
/// queued at transfer time is lost.
#[derive(Debug)]
pub struct PipeDescriptor {
    /// Route id binding the two rebuilt halves; `None` when the peer was
    /// already closed and no traffic will ever flow.
    pub route: Option<u64>,
    pub peer_closed: bool,
    /// Messages queued at the endpoint when it was serialized, oldest first.
    pub pending: Vec<WireMessage>,
}

/// A transferred shared-memory buffer. Consumes one passed descriptor.
#[derive(Debug)]
pub struct BufferDescriptor {
    pub fd: OwnedFd,
    pub size: u64,
    pub read_only: bool,
    pub shareable_read_only: bool,
}

const TAG_PIPE: u8 = 0;
const TAG_BUFFER: u8 = 1;
const TAG_PLATFORM: u8 = 2;

const PLATFORM_NULL: u8 = 0;
const PLATFORM_FD: u8 = 1;
const PLATFORM_MACH_PORT: u8 = 2;
const PLATFORM_MACH_MEMORY: u8 = 3;

const PIPE_FLAG_HAS_ROUTE: u8 = 0b0000_0001;
const PIPE_FLAG_PEER_CLOSED: u8 = 0b0000_0010;

const BUFFER_FLAG_READ_ONLY: u8 = 0b0000_0001;
const BUFFER_FLAG_SHAREABLE_RO: u8 = 0b0000_0010;

/// Encode a message body.
///
/// Descriptor-owned file descriptors are moved into `fds` in encounter order;
/// the caller attaches them as ancillary data on the carrying frame.
///
/// Body layout (all integers LE):
/// handle count (4B), then each descriptor, then payload length (4B) + payload.
pub fn encode_message(msg: WireMessage, dst: &mut BytesMut, fds: &mut Vec<OwnedFd>) -> Result<()> {
    if msg.handles.len() > u32::MAX as usize {
        return Err(WireError::MalformedDescriptor("too many handles"));
    }
    dst.put_u32_le(msg.handles.len() as u32);
    for handle in msg.handles {
        encode_descriptor(handle, dst, fds)?;
    }
    if msg.data.len() > u32::MAX as usize {
        return Err(WireError::PayloadTooLarge {
            size: msg.data.len(),
            max: u32::MAX as usize,
        });
    }
    dst.put_u32_le(msg.data.len() as u32);
    dst.put_slice(&msg.data);
    Ok(())
}

/// Decode a message body, claiming passed descriptors from `fds` in order.
///
/// The body is expected to be complete; running out of bytes is an error,
/// not a retry.
pub fn decode_message(src: &mut Bytes, fds: &mut VecDeque<OwnedFd>) -> Result<WireMessage> {
    let count = take_u32(src)? as usize;
    let mut handles = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        handles.push(decode_descriptor(src, fds)?);
    }
    let data_len = take_u32(src)? as usize;
    if src.remaining() < data_len {
        return Err(WireError::Truncated);
    }
    let data = src.split_to(data_len);
    Ok(WireMessage { data, handles })
}

fn encode_descriptor(
    handle: HandleDescriptor,
    dst: &mut BytesMut,
    fds: &mut Vec<OwnedFd>,
) -> Result<()> {
    match handle {
        HandleDescriptor::Pipe(pipe) => {
            dst.put_u8(TAG_PIPE);
            let mut flags = 0u8;
            if pipe.route.is_some() {
                flags |= PIPE_FLAG_HAS_ROUTE;
            }
            if pipe.peer_closed {
                flags |= PIPE_FLAG_PEER_CLOSED;
            }
            dst.put_u8(flags);
            if let Some(route) = pipe.route {
                dst.put_u64_le(route);
            }
            if pipe.pending.len() > u32::MAX as usize {
                return Err(WireError::MalformedDescriptor("too many pending messages"));
            }
            dst.put_u32_le(pipe.pending.len() as u32);
            for pending in pipe.pending {
                encode_message(pending, dst, fds)?;
            }
        }
        HandleDescriptor::Buffer(buffer) => {
            dst.put_u8(TAG_BUFFER);
            dst.put_u64_le(buffer.size);
            let mut flags = 0u8;
            if buffer.read_only {
                flags |= BUFFER_FLAG_READ_ONLY;
            }
            if buffer.shareable_read_only {
                flags |= BUFFER_FLAG_SHAREABLE_RO;
            }
            dst.put_u8(flags);
            fds.push(buffer.fd);
        }
        HandleDescriptor::Platform(platform) => {
            dst.put_u8(TAG_PLATFORM);
            match platform {
                PlatformHandle::Null => dst.put_u8(PLATFORM_NULL),
                PlatformHandle::Fd(fd) => {
                    dst.put_u8(PLATFORM_FD);
                    fds.push(fd);
                }
                PlatformHandle::MachPort(name) => {
                    dst.put_u8(PLATFORM_MACH_PORT);
                    dst.put_u32_le(name);
                }
                PlatformHandle::MachMemoryObject(name) => {
                    dst.put_u8(PLATFORM_MACH_MEMORY);
                    dst.put_u32_le(name);
                }
            }
        }
    }
    Ok(())
}

fn decode_descriptor(src: &mut Bytes, fds: &mut VecDeque<OwnedFd>) -> Result<HandleDescriptor> {
    match take_u8(src)? {
        TAG_PIPE => {
            let flags = take_u8(src)?;
            let route = if flags & PIPE_FLAG_HAS_ROUTE != 0 {
                Some(take_u64(src)?)
            } else {
                None
            };
            let peer_closed = flags & PIPE_FLAG_PEER_CLOSED != 0;
            let pending_count = take_u32(src)? as usize;
            let mut pending = Vec::with_capacity(pending_count.min(64));
            for _ in 0..pending_count {
                pending.push(decode_message(src, fds)?);
            }
            Ok(HandleDescriptor::Pipe(PipeDescriptor {
                route,
                peer_closed,
                pending,
            }))
        }
        TAG_BUFFER => {
            let size = take_u64(src)?;
            let flags = take_u8(src)?;
            let fd = fds.pop_front().ok_or(WireError::MissingHandle)?;
            Ok(HandleDescriptor::Buffer(BufferDescriptor {
                fd,
                size,
                read_only: flags & BUFFER_FLAG_READ_ONLY != 0,
                shareable_read_only: flags & BUFFER_FLAG_SHAREABLE_RO != 0,
            }))
        }
        TAG_PLATFORM => match take_u8(src)? {
            PLATFORM_NULL => Ok(HandleDescriptor::Platform(PlatformHandle::Null)),
            PLATFORM_FD => {
                let fd = fds.pop_front().ok_or(WireError::MissingHandle)?;
                Ok(HandleDescriptor::Platform(PlatformHandle::Fd(fd)))
            }
            PLATFORM_MACH_PORT => Ok(HandleDescriptor::Platform(PlatformHandle::MachPort(
                take_u32(src)?,
            ))),
            PLATFORM_MACH_MEMORY => Ok(HandleDescriptor::Platform(
                PlatformHandle::MachMemoryObject(take_u32(src)?),
            )),
            _ => Err(WireError::MalformedDescriptor("unknown platform subtype")),
        },
        _ => Err(WireError::MalformedDescriptor("unknown descriptor tag")),
    }
}

/// Encode a token-bind body: the claimed token plus the pipe being bound.
pub fn encode_token_bind(
    token: &str,
    pipe: PipeDescriptor,
    dst: &mut BytesMut,
    fds: &mut Vec<OwnedFd>,
) -> Result<()> {
    let token_bytes = token.as_bytes();
    if token_bytes.len() > u16::MAX as usize {
        return Err(WireError::InvalidToken);
    }
    dst.put_u16_le(token_bytes.len() as u16);
    dst.put_slice(token_bytes);
    encode_descriptor(HandleDescriptor::Pipe(pipe), dst, fds)
}

/// Decode a token-bind body.
pub fn decode_token_bind(
    src: &mut Bytes,
    fds: &mut VecDeque<OwnedFd>,
) -> Result<(String, PipeDescriptor)> {
    let token_len = take_u16(src)? as usize;
    if src.remaining() < token_len {
        return Err(WireError::Truncated);
    }
    let token_bytes = src.split_to(token_len);
    let token = std::str::from_utf8(&token_bytes)
        .map_err(|_| WireError::InvalidToken)?
        .to_owned();
    match decode_descriptor(src, fds)? {
        HandleDescriptor::Pipe(pipe) => Ok((token, pipe)),
        _ => Err(WireError::MalformedDescriptor("token bind must carry a pipe")),
    }
}

fn take_u8(src: &mut Bytes) -> Result<u8> {
    if src.remaining() < 1 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u8())
}

fn take_u16(src: &mut Bytes) -> Result<u16> {
    if src.remaining() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u16_le())
}

fn take_u32(src: &mut Bytes) -> Result<u32> {
    if src.remaining() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u32_le())
}

fn take_u64(src: &mut Bytes) -> Result<u64> {
    if src.remaining() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(src.get_u64_le())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: WireMessage) -> WireMessage {
        let mut dst = BytesMut::new();
        let mut fds = Vec::new();
        encode_message(msg, &mut dst, &mut fds).unwrap();
        let mut fd_queue: VecDeque<OwnedFd> = fds.into_iter().collect();
        let mut src = dst.freeze();
        let decoded = decode_message(&mut src, &mut fd_queue).unwrap();
        assert!(src.is_empty());
        assert!(fd_queue.is_empty());
        decoded
    }

    #[test]
    fn payload_only_roundtrip() {
        let decoded = roundtrip(WireMessage {
            data: Bytes::from_static(b"hello world"),
            handles: Vec::new(),
        });
        assert_eq!(decoded.data.as_ref(), b"hello world");
        assert!(decoded.handles.is_empty());
    }

    #[test]
    fn pipe_descriptor_with_pending_messages() {
        let msg = WireMessage {
            data: Bytes::from_static(b"carrier"),
            handles: vec![HandleDescriptor::Pipe(PipeDescriptor {
                route: Some(0xDEAD_BEEF),
                peer_closed: false,
                pending: vec![
                    WireMessage {
                        data: Bytes::from_static(b"queued-1"),
                        handles: Vec::new(),
                    },
                    WireMessage {
                        data: Bytes::from_static(b"queued-2"),
                        handles: Vec::new(),
                    },
                ],
            })],
        };

        let decoded = roundtrip(msg);
        assert_eq!(decoded.handles.len(), 1);
        let HandleDescriptor::Pipe(pipe) = &decoded.handles[0] else {
            panic!("expected pipe descriptor");
        };
        assert_eq!(pipe.route, Some(0xDEAD_BEEF));
        assert!(!pipe.peer_closed);
        assert_eq!(pipe.pending.len(), 2);
        assert_eq!(pipe.pending[0].data.as_ref(), b"queued-1");
        assert_eq!(pipe.pending[1].data.as_ref(), b"queued-2");
    }

    #[test]
    fn peer_closed_pipe_has_no_route() {
        let decoded = roundtrip(WireMessage {
            data: Bytes::new(),
            handles: vec![HandleDescriptor::Pipe(PipeDescriptor {
                route: None,
                peer_closed: true,
                pending: Vec::new(),
            })],
        });
        let HandleDescriptor::Pipe(pipe) = &decoded.handles[0] else {
            panic!("expected pipe descriptor");
        };
        assert_eq!(pipe.route, None);
        assert!(pipe.peer_closed);
    }

    #[test]
    fn mach_handles_need_no_fd() {
        let decoded = roundtrip(WireMessage {
            data: Bytes::new(),
            handles: vec![
                HandleDescriptor::Platform(PlatformHandle::MachPort(77)),
                HandleDescriptor::Platform(PlatformHandle::Null),
                HandleDescriptor::Platform(PlatformHandle::MachMemoryObject(99)),
            ],
        });
        assert!(matches!(
            decoded.handles[0],
            HandleDescriptor::Platform(PlatformHandle::MachPort(77))
        ));
        assert!(matches!(
            decoded.handles[1],
            HandleDescriptor::Platform(PlatformHandle::Null)
        ));
        assert!(matches!(
            decoded.handles[2],
            HandleDescriptor::Platform(PlatformHandle::MachMemoryObject(99))
        ));
    }

    #[test]
    fn buffer_descriptor_missing_fd_fails() {
        let mut dst = BytesMut::new();
        dst.put_u32_le(1);
        dst.put_u8(TAG_BUFFER);
        dst.put_u64_le(4096);
        dst.put_u8(0);
        dst.put_u32_le(0);

        let mut fds = VecDeque::new();
        let mut src = dst.freeze();
        let result = decode_message(&mut src, &mut fds);
        assert!(matches!(result, Err(WireError::MissingHandle)));
    }

    #[test]
    fn truncated_body_fails() {
        let mut dst = BytesMut::new();
        let mut fds = Vec::new();
        encode_message(
            WireMessage {
                data: Bytes::from_static(b"some payload"),
                handles: Vec::new(),
            },
            &mut dst,
            &mut fds,
        )
        .unwrap();
        dst.truncate(dst.len() - 3);

        let mut src = dst.freeze();
        let mut fd_queue = VecDeque::new();
        let result = decode_message(&mut src, &mut fd_queue);
        assert!(matches!(result, Err(WireError::Truncated)));
    }

    #[test]
    fn token_bind_roundtrip() {
        let mut dst = BytesMut::new();
        let mut fds = Vec::new();
        encode_token_bind(
            "a1b2c3",
            PipeDescriptor {
                route: Some(42),
                peer_closed: false,
                pending: vec![WireMessage {
                    data: Bytes::from_static(b"early"),
                    handles: Vec::new(),
                }],
            },
            &mut dst,
            &mut fds,
        )
        .unwrap();

        let mut src = dst.freeze();
        let mut fd_queue: VecDeque<OwnedFd> = fds.into_iter().collect();
        let (token, pipe) = decode_token_bind(&mut src, &mut fd_queue).unwrap();
        assert_eq!(token, "a1b2c3");
        assert_eq!(pipe.route, Some(42));
        assert_eq!(pipe.pending.len(), 1);
        assert_eq!(pipe.pending[0].data.as_ref(), b"early");
    }
}
