use std::io::{Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::debug;

use crate::error::{PlatformError, Result};

/// Upper bound on descriptors attached to a single message.
///
/// Linux caps SCM_RIGHTS at 253 fds per control message; stay well under it.
pub const MAX_FDS_PER_MESSAGE: usize = 128;

/// A connected Unix stream socket that can pass file descriptors.
///
/// Descriptors ride SCM_RIGHTS ancillary data attached to the first byte of
/// each message, so a receiver that reads a message's bytes is guaranteed to
/// have already collected its descriptors.
#[derive(Debug)]
pub struct ScmSocket {
    stream: UnixStream,
}

impl ScmSocket {
    /// Create a connected pair, the two ends of one socket.
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = UnixStream::pair().map_err(|source| PlatformError::Os {
            call: "socketpair",
            source,
        })?;
        Ok((Self::from_stream(a), Self::from_stream(b)))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        let sock = Self { stream };
        sock.disable_sigpipe();
        sock
    }

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    fn disable_sigpipe(&self) {
        let one: libc::c_int = 1;
        // SAFETY: the fd is an open socket and `one` outlives the call.
        unsafe {
            libc::setsockopt(
                self.stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                (&one as *const libc::c_int).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    fn disable_sigpipe(&self) {
        // MSG_NOSIGNAL is passed per send instead.
    }

    /// Send `bytes`, attaching `fds` to the first byte.
    ///
    /// Blocks until every byte is written. The descriptors are duplicated
    /// into the receiving process by the kernel; the caller keeps ownership
    /// of its copies.
    pub fn send_with_fds(&self, bytes: &[u8], fds: &[RawFd]) -> Result<()> {
        if bytes.is_empty() {
            // Descriptors ride on the first byte; with no bytes they would
            // silently never leave this process.
            if !fds.is_empty() {
                return Err(PlatformError::Os {
                    call: "sendmsg",
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "cannot attach fds to an empty message",
                    ),
                });
            }
            return Ok(());
        }
        if fds.len() > MAX_FDS_PER_MESSAGE {
            return Err(PlatformError::Os {
                call: "sendmsg",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} fds exceeds per-message limit", fds.len()),
                ),
            });
        }

        let mut sent = if fds.is_empty() {
            0
        } else {
            self.sendmsg_with_fds(bytes, fds)?
        };

        while sent < bytes.len() {
            match (&self.stream).write(&bytes[sent..]) {
                Ok(0) => {
                    return Err(PlatformError::Os {
                        call: "send",
                        source: std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "socket closed mid-message",
                        ),
                    })
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(source) => return Err(PlatformError::Os { call: "send", source }),
            }
        }
        Ok(())
    }

    fn sendmsg_with_fds(&self, bytes: &[u8], fds: &[RawFd]) -> Result<usize> {
        let mut iov = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };

        let space = cmsg_space(fds.len());
        let mut cmsg_buf = vec![0u8; space];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        // SAFETY: msg_control points at a buffer of msg_controllen bytes and
        // CMSG_FIRSTHDR stays within it.
        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN((fds.len() * mem::size_of::<RawFd>()) as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr(),
                libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                fds.len(),
            );
        }

        #[cfg(target_os = "linux")]
        let flags = libc::MSG_NOSIGNAL;
        #[cfg(not(target_os = "linux"))]
        let flags = 0;

        loop {
            // SAFETY: msg and its iovec/control buffers are valid for the call.
            let n = unsafe { libc::sendmsg(self.stream.as_raw_fd(), &msg, flags) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(PlatformError::Os {
                call: "sendmsg",
                source: err,
            });
        }
    }

    /// Receive bytes into `buf`, appending any passed descriptors to `fds`.
    ///
    /// Returns the byte count; 0 means the peer closed its end.
    pub fn recv(&self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> Result<usize> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        };

        let space = cmsg_space(MAX_FDS_PER_MESSAGE);
        let mut cmsg_buf = vec![0u8; space];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cmsg_buf.as_mut_ptr().cast();
        msg.msg_controllen = space as _;

        let n = loop {
            // SAFETY: msg and its iovec/control buffers are valid for the call.
            let n = unsafe { libc::recvmsg(self.stream.as_raw_fd(), &mut msg, 0) };
            if n >= 0 {
                break n as usize;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(PlatformError::Os {
                call: "recvmsg",
                source: err,
            });
        };

        if msg.msg_flags & libc::MSG_CTRUNC != 0 {
            return Err(PlatformError::Os {
                call: "recvmsg",
                source: std::io::Error::other("ancillary data truncated"),
            });
        }

        // SAFETY: the kernel filled msg_control within our buffer; the CMSG
        // macros walk only initialized headers.
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::SOL_SOCKET
                    && (*cmsg).cmsg_type == libc::SCM_RIGHTS
                {
                    let data_len = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                    let count = data_len / mem::size_of::<RawFd>();
                    let data = libc::CMSG_DATA(cmsg).cast::<RawFd>();
                    for i in 0..count {
                        let fd = std::ptr::read_unaligned(data.add(i));
                        fds.push(OwnedFd::from_raw_fd(fd));
                    }
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok(n)
    }

    /// Plain blocking read with no descriptor collection.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match (&self.stream).read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(source) => return Err(PlatformError::Os { call: "recv", source }),
            }
        }
    }

    /// Shut down both directions, waking any blocked reader.
    pub fn shutdown(&self) {
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            debug!(error = %e, "socket shutdown failed");
        }
    }

    pub fn into_stream(self) -> UnixStream {
        self.stream
    }
}

impl AsRawFd for ScmSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

fn cmsg_space(fds: usize) -> usize {
    // SAFETY: CMSG_SPACE is a pure size computation.
    unsafe { libc::CMSG_SPACE((fds * mem::size_of::<RawFd>()) as u32) as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let (a, b) = ScmSocket::pair().unwrap();
        a.send_with_fds(b"ping", &[]).unwrap();

        let mut buf = [0u8; 16];
        let mut fds = Vec::new();
        let n = b.recv(&mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert!(fds.is_empty());
    }

    #[test]
    fn fd_passes_and_stays_usable() {
        let (a, b) = ScmSocket::pair().unwrap();
        let (inner_a, inner_b) = ScmSocket::pair().unwrap();

        a.send_with_fds(b"x", &[inner_b.as_raw_fd()]).unwrap();
        drop(inner_b);

        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        let n = b.recv(&mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"x");
        assert_eq!(fds.len(), 1);

        let received = ScmSocket::from_stream(UnixStream::from(fds.remove(0)));
        inner_a.send_with_fds(b"through", &[]).unwrap();
        let mut buf2 = [0u8; 16];
        let mut fds2 = Vec::new();
        let n2 = received.recv(&mut buf2, &mut fds2).unwrap();
        assert_eq!(&buf2[..n2], b"through");
    }

    #[test]
    fn recv_zero_on_peer_close() {
        let (a, b) = ScmSocket::pair().unwrap();
        drop(a);
        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        assert_eq!(b.recv(&mut buf, &mut fds).unwrap(), 0);
    }

    #[test]
    fn fds_on_an_empty_message_rejected() {
        let (a, _b) = ScmSocket::pair().unwrap();
        let (keep, _other) = ScmSocket::pair().unwrap();
        assert!(a.send_with_fds(b"", &[keep.as_raw_fd()]).is_err());
        assert!(a.send_with_fds(b"", &[]).is_ok());
    }

    #[test]
    fn too_many_fds_rejected() {
        let (a, _b) = ScmSocket::pair().unwrap();
        let fds = vec![0; MAX_FDS_PER_MESSAGE + 1];
        assert!(a.send_with_fds(b"x", &fds).is_err());
    }
}
