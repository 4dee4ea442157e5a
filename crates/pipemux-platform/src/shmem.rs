use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use tracing::debug;

use crate::error::{PlatformError, Result};

/// An owned shared memory region backed by an anonymous file descriptor.
///
/// The kernel frees the backing memory once the last descriptor referring to
/// it is closed and the last mapping is unmapped, so regions and their
/// duplicates can be closed independently and in any order.
#[derive(Debug)]
pub struct SharedMemoryRegion {
    fd: OwnedFd,
    size: u64,
}

impl SharedMemoryRegion {
    /// Create a new region of exactly `size` bytes.
    pub fn create(size: u64) -> Result<Self> {
        if size == 0 {
            return Err(PlatformError::InvalidSize(0));
        }
        let fd = create_backing_fd(size)?;
        debug!(size, fd = fd.as_raw_fd(), "created shared memory region");
        Ok(Self { fd, size })
    }

    /// Adopt an existing backing descriptor of known size.
    pub fn from_fd(fd: OwnedFd, size: u64) -> Result<Self> {
        if size == 0 {
            return Err(PlatformError::InvalidSize(0));
        }
        Ok(Self { fd, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Duplicate the region. The result refers to the same memory but is
    /// independently closable.
    pub fn duplicate(&self) -> Result<Self> {
        let fd = self.fd.try_clone().map_err(|source| PlatformError::Os {
            call: "dup",
            source,
        })?;
        Ok(Self {
            fd,
            size: self.size,
        })
    }

    /// Release ownership of the backing descriptor.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }

    /// Map `len` bytes starting at `offset` into this process.
    ///
    /// Fails with `MapOutOfRange` when the requested window extends past the
    /// end of the region. Mapping exactly up to the end is valid. Multiple
    /// concurrent mappings of one region are allowed; callers that need
    /// ordering synchronize externally.
    pub fn map(&self, offset: u64, len: usize, read_only: bool) -> Result<Mapping> {
        if len == 0 {
            return Err(PlatformError::InvalidSize(0));
        }
        if offset.checked_add(len as u64).is_none_or(|end| end > self.size) {
            return Err(PlatformError::MapOutOfRange {
                offset,
                len,
                size: self.size,
            });
        }

        // mmap requires a page-aligned file offset; map from the page
        // boundary below `offset` and point past the slack.
        let page = page_size();
        let misalign = (offset % page as u64) as usize;
        let map_offset = offset - misalign as u64;
        let map_len = len + misalign;

        let prot = if read_only {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        // SAFETY: fd is an open descriptor owned by this region, map_offset
        // is page-aligned, and map_len is nonzero and within the file.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                prot,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                map_offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(PlatformError::Os {
                call: "mmap",
                source: std::io::Error::last_os_error(),
            });
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or_else(|| PlatformError::Os {
            call: "mmap",
            source: std::io::Error::other("mmap returned null"),
        })?;
        // SAFETY: misalign < map_len, so the offset stays inside the mapping.
        let data = unsafe { NonNull::new_unchecked(base.as_ptr().add(misalign)) };
        Ok(Mapping {
            base,
            map_len,
            data,
            len,
            read_only,
        })
    }
}

/// A live memory mapping of (part of) a [`SharedMemoryRegion`].
///
/// Unmapped on drop. Dereferences to the mapped bytes.
#[derive(Debug)]
pub struct Mapping {
    base: NonNull<u8>,
    map_len: usize,
    data: NonNull<u8>,
    len: usize,
    read_only: bool,
}

// SAFETY: the mapping is a plain byte range with no thread affinity; access
// races on the shared bytes are the caller's coordination problem, as with
// any shared memory.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: data..data+len lies inside the mapping for its lifetime.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    /// Mutable view of the mapped bytes.
    ///
    /// # Panics
    ///
    /// Panics if the mapping was created read-only; writing through it would
    /// fault anyway, this fails earlier and more clearly.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(!self.read_only, "mapping is read-only");
        // SAFETY: data..data+len lies inside a writable mapping.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl std::ops::Deref for Mapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: base/map_len are exactly what mmap returned.
        let rc = unsafe { libc::munmap(self.base.as_ptr().cast(), self.map_len) };
        if rc != 0 {
            debug!(
                error = %std::io::Error::last_os_error(),
                "munmap failed on mapping drop"
            );
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

#[cfg(target_os = "linux")]
fn create_backing_fd(size: u64) -> Result<OwnedFd> {
    let name = std::ffi::CString::new("pipemux-shmem").map_err(|_| PlatformError::Os {
        call: "memfd_create",
        source: std::io::Error::other("bad region name"),
    })?;
    // SAFETY: name is a valid NUL-terminated string.
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(PlatformError::Os {
            call: "memfd_create",
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: memfd_create returned a fresh descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    // SAFETY: fd is open and size fits in off_t for supported region sizes.
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
    if rc != 0 {
        return Err(PlatformError::Os {
            call: "ftruncate",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
fn create_backing_fd(size: u64) -> Result<OwnedFd> {
    let name = format!(
        "/pipemux-{}-{:x}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    );
    let cname = std::ffi::CString::new(name).map_err(|_| PlatformError::Os {
        call: "shm_open",
        source: std::io::Error::other("bad region name"),
    })?;
    // SAFETY: cname is a valid NUL-terminated string.
    let fd = unsafe {
        libc::shm_open(
            cname.as_ptr(),
            libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
            0o600 as libc::mode_t,
        )
    };
    if fd < 0 {
        return Err(PlatformError::Os {
            call: "shm_open",
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: shm_open returned a fresh descriptor we now own.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    // The name is only needed to hand out the fd; unlink immediately so the
    // region dies with its descriptors.
    // SAFETY: cname is the name we just created.
    unsafe { libc::shm_unlink(cname.as_ptr()) };
    // SAFETY: fd is open.
    let rc = unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) };
    if rc != 0 {
        return Err(PlatformError::Os {
            call: "ftruncate",
            source: std::io::Error::last_os_error(),
        });
    }
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_zero_size_fails() {
        assert!(matches!(
            SharedMemoryRegion::create(0),
            Err(PlatformError::InvalidSize(0))
        ));
    }

    #[test]
    fn write_visible_through_duplicate() {
        let region = SharedMemoryRegion::create(128).unwrap();
        let dup = region.duplicate().unwrap();

        let mut writer = region.map(0, 128, false).unwrap();
        writer.as_mut_slice()[..5].copy_from_slice(b"hello");
        drop(writer);
        drop(region);

        let reader = dup.map(0, 128, false).unwrap();
        assert_eq!(&reader[..5], b"hello");
    }

    #[test]
    fn map_bounds() {
        let region = SharedMemoryRegion::create(100).unwrap();
        assert!(region.map(0, 100, false).is_ok());
        assert!(region.map(50, 50, false).is_ok());
        assert!(matches!(
            region.map(50, 51, false),
            Err(PlatformError::MapOutOfRange { .. })
        ));
        assert!(matches!(
            region.map(101, 1, false),
            Err(PlatformError::MapOutOfRange { .. })
        ));
    }

    #[test]
    fn unaligned_offset_maps_correct_window() {
        let region = SharedMemoryRegion::create(8192).unwrap();
        let mut whole = region.map(0, 8192, false).unwrap();
        whole.as_mut_slice()[100..104].copy_from_slice(b"mark");
        drop(whole);

        let window = region.map(100, 4, false).unwrap();
        assert_eq!(&window[..], b"mark");
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn read_only_mapping_rejects_writes() {
        let region = SharedMemoryRegion::create(64).unwrap();
        let mut mapping = region.map(0, 64, true).unwrap();
        let _ = mapping.as_mut_slice();
    }
}
