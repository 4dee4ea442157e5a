/// Errors that can occur in node-level operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// The token is already registered with a peer connection.
    #[error("peer token already in use")]
    TokenInUse,

    /// No peer connection is registered under the token.
    #[error("unknown peer token")]
    UnknownToken,

    /// The token was already claimed by another pipe.
    #[error("token already claimed")]
    TokenAlreadyClaimed,

    /// The channel has shut down.
    #[error("channel closed")]
    ChannelClosed,

    /// Platform-level error.
    #[error("platform error: {0}")]
    Platform(#[from] pipemux_platform::PlatformError),

    /// Wire codec error.
    #[error("wire error: {0}")]
    Wire(#[from] pipemux_wire::WireError),

    /// Core handle or pipe error.
    #[error("core error: {0}")]
    Core(#[from] pipemux_core::CoreError),

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NodeError>;
