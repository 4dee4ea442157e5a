use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use crate::error::{PlatformError, Result};

/// Discriminates the kind of resource a [`PlatformHandle`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformHandleType {
    /// No resource.
    Null,
    /// A POSIX file descriptor.
    Fd,
    /// A Mach send-right port name.
    MachPort,
    /// A Mach memory-object port name.
    MachMemoryObject,
}

/// An owned OS-level resource with an immutable type tag.
///
/// Wrapping a native resource is a move: the handle owns it from then on and
/// releases it when dropped. Extraction is typed; asking a Mach-typed handle
/// for its file descriptor fails rather than returning garbage.
#[derive(Debug)]
pub enum PlatformHandle {
    Null,
    Fd(OwnedFd),
    /// A Mach port name. Port lifetime management is the embedder's concern;
    /// the name is carried opaquely across process boundaries.
    MachPort(u32),
    MachMemoryObject(u32),
}

impl PlatformHandle {
    /// Wrap a raw file descriptor, taking ownership.
    ///
    /// # Safety
    ///
    /// `fd` must be an open descriptor not owned elsewhere.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        PlatformHandle::Fd(OwnedFd::from_raw_fd(fd))
    }

    pub fn handle_type(&self) -> PlatformHandleType {
        match self {
            PlatformHandle::Null => PlatformHandleType::Null,
            PlatformHandle::Fd(_) => PlatformHandleType::Fd,
            PlatformHandle::MachPort(_) => PlatformHandleType::MachPort,
            PlatformHandle::MachMemoryObject(_) => PlatformHandleType::MachMemoryObject,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PlatformHandle::Null)
    }

    /// Extract the owned file descriptor, consuming the handle.
    pub fn into_fd(self) -> Result<OwnedFd> {
        match self {
            PlatformHandle::Fd(fd) => Ok(fd),
            other => Err(PlatformError::WrongHandleType {
                expected: PlatformHandleType::Fd,
                actual: other.handle_type(),
            }),
        }
    }

    /// Duplicate an fd-backed handle. Null and Mach variants copy the name.
    pub fn try_clone(&self) -> Result<Self> {
        match self {
            PlatformHandle::Null => Ok(PlatformHandle::Null),
            PlatformHandle::Fd(fd) => {
                let dup = fd.try_clone().map_err(|source| PlatformError::Os {
                    call: "dup",
                    source,
                })?;
                Ok(PlatformHandle::Fd(dup))
            }
            PlatformHandle::MachPort(name) => Ok(PlatformHandle::MachPort(*name)),
            PlatformHandle::MachMemoryObject(name) => Ok(PlatformHandle::MachMemoryObject(*name)),
        }
    }

    /// Raw fd view without transferring ownership; fails on non-fd variants.
    pub fn as_raw_fd(&self) -> Result<RawFd> {
        match self {
            PlatformHandle::Fd(fd) => Ok(fd.as_raw_fd()),
            other => Err(PlatformError::WrongHandleType {
                expected: PlatformHandleType::Fd,
                actual: other.handle_type(),
            }),
        }
    }

    /// Release ownership of the fd to the caller; fails on non-fd variants.
    pub fn into_raw_fd(self) -> Result<RawFd> {
        Ok(self.into_fd()?.into_raw_fd())
    }
}

impl From<OwnedFd> for PlatformHandle {
    fn from(fd: OwnedFd) -> Self {
        PlatformHandle::Fd(fd)
    }
}
