use crate::signals::SignalsState;

/// Errors that can occur in core handle and pipe operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The handle does not refer to a live table entry.
    #[error("invalid handle")]
    InvalidHandle,

    /// The operation cannot proceed in the object's current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(&'static str),

    /// An argument is invalid regardless of object state.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The operation requires a capability the object does not grant.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// A range argument extends past the end of the object.
    #[error("out of range")]
    OutOfRange,

    /// A message payload exceeds the maximum a channel can carry.
    #[error("message payload of {size} bytes exceeds the {max} byte maximum")]
    MessageTooLarge { size: usize, max: usize },

    /// A platform-level operation failed.
    #[error(transparent)]
    Platform(#[from] pipemux_platform::PlatformError),
}

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors returned by [`wait`](crate::api::wait).
///
/// Peer closure is a signal, never an error; these cover the cases where the
/// wait itself cannot produce the requested signals.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The handle does not refer to a live table entry.
    #[error("invalid handle")]
    InvalidHandle,

    /// None of the requested signals can ever become satisfied.
    #[error("requested signals can never be satisfied")]
    Unsatisfiable(SignalsState),

    /// The deadline passed with no requested signal satisfied.
    #[error("deadline expired")]
    DeadlineExpired(SignalsState),

    /// The handle was closed while the wait was blocked.
    #[error("handle closed during wait")]
    Cancelled,
}
