//! Platform primitives for pipemux.
//!
//! Owned OS resources and the Unix transports everything else builds on:
//! - [`PlatformHandle`]: typed ownership of fds and Mach port names
//! - [`SharedMemoryRegion`]: anonymous shared memory with mapped views
//! - [`ScmSocket`]: a stream socket that passes file descriptors
//! - [`UnixDomainSocket`]: filesystem-path listener with cleanup

pub mod error;
pub mod handle;
pub mod scm;
pub mod shmem;
pub mod uds;

pub use error::{PlatformError, Result};
pub use handle::{PlatformHandle, PlatformHandleType};
pub use scm::{ScmSocket, MAX_FDS_PER_MESSAGE};
pub use shmem::{Mapping, SharedMemoryRegion};
pub use uds::UnixDomainSocket;
