use std::path::PathBuf;

use crate::handle::PlatformHandleType;

/// Errors that can occur in platform-level operations.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// A raw OS call failed.
    #[error("{call} failed: {source}")]
    Os {
        call: &'static str,
        source: std::io::Error,
    },

    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the underlying socket.
    #[error("platform I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// A handle of one type was used where another type was required.
    #[error("wrong handle type: expected {expected:?}, got {actual:?}")]
    WrongHandleType {
        expected: PlatformHandleType,
        actual: PlatformHandleType,
    },

    /// A size argument was invalid (for example, a zero-byte region).
    #[error("invalid size: {0}")]
    InvalidSize(u64),

    /// A requested mapping extends past the end of the region.
    #[error("mapping out of range: offset {offset} + length {len} > size {size}")]
    MapOutOfRange { offset: u64, len: usize, size: u64 },

    /// The socket has been shut down.
    #[error("socket shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, PlatformError>;
