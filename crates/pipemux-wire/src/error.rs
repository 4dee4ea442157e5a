/// Errors that can occur encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The frame header does not start with the expected magic bytes.
    #[error("invalid magic bytes")]
    InvalidMagic,

    /// The frame kind byte is not a known kind.
    #[error("unknown frame kind: {0:#04x}")]
    InvalidKind(u8),

    /// The payload exceeds the maximum allowed size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The body ended before a complete structure was decoded.
    #[error("truncated body")]
    Truncated,

    /// A handle descriptor is structurally invalid.
    #[error("malformed descriptor: {0}")]
    MalformedDescriptor(&'static str),

    /// A descriptor requires a passed file descriptor that did not arrive.
    #[error("descriptor refers to a file descriptor that was not received")]
    MissingHandle,

    /// A rendezvous token is not valid UTF-8 or has a bad length.
    #[error("invalid token encoding")]
    InvalidToken,

    /// An I/O error occurred while moving wire data.
    #[error("wire I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WireError>;
