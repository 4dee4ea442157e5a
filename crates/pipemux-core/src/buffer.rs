use std::sync::Arc;

use pipemux_platform::{Mapping, SharedMemoryRegion};

use crate::error::{CoreError, Result};

/// A handle-table entry for a shared memory buffer.
///
/// Clones share one region descriptor; duplicated handles get an
/// independently closable region via fd duplication.
#[derive(Debug, Clone)]
pub struct BufferDispatcher {
    region: Arc<SharedMemoryRegion>,
    read_only: bool,
    /// Whether read-only duplicates may be minted from this buffer. Fixed at
    /// creation; transfers carry it along.
    shareable_read_only: bool,
}

impl BufferDispatcher {
    pub fn create(size: u64, shareable_read_only: bool) -> Result<Self> {
        if size == 0 {
            return Err(CoreError::InvalidArgument("buffer size must be nonzero"));
        }
        let region = SharedMemoryRegion::create(size)?;
        Ok(Self {
            region: Arc::new(region),
            read_only: false,
            shareable_read_only,
        })
    }

    pub fn from_region(region: SharedMemoryRegion) -> Self {
        Self {
            region: Arc::new(region),
            read_only: false,
            shareable_read_only: false,
        }
    }

    pub fn from_parts(region: SharedMemoryRegion, read_only: bool, shareable_read_only: bool) -> Self {
        Self {
            region: Arc::new(region),
            read_only,
            shareable_read_only,
        }
    }

    pub fn size(&self) -> u64 {
        self.region.size()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_shareable_read_only(&self) -> bool {
        self.shareable_read_only
    }

    /// Mint a new buffer over the same memory.
    ///
    /// A read-only duplicate requires the buffer to have been created
    /// shareable-read-only; otherwise a writer could hand out a "read-only"
    /// view while keeping writable access an attacker could regain.
    pub fn duplicate(&self, read_only: bool) -> Result<Self> {
        if read_only && !self.shareable_read_only {
            return Err(CoreError::PermissionDenied(
                "buffer was not created shareable read-only",
            ));
        }
        let region = self.region.duplicate()?;
        Ok(Self {
            region: Arc::new(region),
            read_only: self.read_only || read_only,
            shareable_read_only: self.shareable_read_only,
        })
    }

    /// Map `len` bytes at `offset`.
    pub fn map(&self, offset: u64, len: usize) -> Result<Mapping> {
        self.region
            .map(offset, len, self.read_only)
            .map_err(|e| match e {
                pipemux_platform::PlatformError::MapOutOfRange { .. } => CoreError::OutOfRange,
                pipemux_platform::PlatformError::InvalidSize(_) => {
                    CoreError::InvalidArgument("mapping length must be nonzero")
                }
                other => CoreError::Platform(other),
            })
    }

    /// Extract a standalone region for transfer or unwrapping, consuming this
    /// dispatcher's share.
    pub fn into_region(self) -> Result<SharedMemoryRegion> {
        match Arc::try_unwrap(self.region) {
            Ok(region) => Ok(region),
            Err(shared) => Ok(shared.duplicate()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_rejected() {
        assert!(matches!(
            BufferDispatcher::create(0, false),
            Err(CoreError::InvalidArgument(_))
        ));
    }

    #[test]
    fn read_only_duplicate_needs_shareable_flag() {
        let plain = BufferDispatcher::create(64, false).unwrap();
        assert!(matches!(
            plain.duplicate(true),
            Err(CoreError::PermissionDenied(_))
        ));
        assert!(plain.duplicate(false).is_ok());

        let shareable = BufferDispatcher::create(64, true).unwrap();
        let ro = shareable.duplicate(true).unwrap();
        assert!(ro.is_read_only());
        // Read-only propagates to further duplicates.
        assert!(ro.duplicate(false).unwrap().is_read_only());
    }

    #[test]
    fn map_bounds_map_to_out_of_range() {
        let buffer = BufferDispatcher::create(100, false).unwrap();
        assert!(buffer.map(0, 100).is_ok());
        assert!(matches!(buffer.map(1, 100), Err(CoreError::OutOfRange)));
    }

    #[test]
    fn duplicate_sees_writes() {
        let buffer = BufferDispatcher::create(32, false).unwrap();
        let dup = buffer.duplicate(false).unwrap();

        let mut mapping = buffer.map(0, 32).unwrap();
        mapping.as_mut_slice()[0] = 0x5A;
        drop(mapping);
        drop(buffer);

        let view = dup.map(0, 32).unwrap();
        assert_eq!(view[0], 0x5A);
    }
}
