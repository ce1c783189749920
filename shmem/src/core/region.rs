use std::io;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use log::{debug, warn};
use shared_memory::{Shmem, ShmemConf};

use super::{SharedBuffer, PAYLOAD_CAPACITY, REGION_SIZE};
use crate::errors::ShmemLibError;

/// `MAP_SHARED | MAP_ANONYMOUS` memory, visible to children forked after it exists.
pub(crate) struct AnonymousMapping {
    ptr: *mut u8,
    len: usize,
}

impl AnonymousMapping {
    pub(crate) fn new(len: usize) -> Result<AnonymousMapping, ShmemLibError> {
        if len == 0 {
            return Err(ShmemLibError::Mapping(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot map a zero-sized region",
            )));
        }
        // Safety: no file descriptor is involved and the kernel picks the address.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmemLibError::Mapping(io::Error::last_os_error()));
        }
        Ok(AnonymousMapping { ptr: ptr as *mut u8, len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for AnonymousMapping {
    fn drop(&mut self) {
        // Safety: ptr/len come from the mmap call in `new`.
        if unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) } != 0 {
            warn!("munmap of anonymous region failed: {}", io::Error::last_os_error());
        }
    }
}

enum Backing {
    Linked(Shmem),
    Anonymous(AnonymousMapping),
}

/// Memory shared between the producer and the worker, laid out as a [`SharedBuffer`].
pub struct SharedRegion {
    backing: Backing,
    identifier: String,
}

impl SharedRegion {
    /// Creates a path-addressable store of `capacity` bytes and maps it.
    ///
    /// Fails if `path` already exists: a leftover link from another run is
    /// never silently attached to.
    pub fn create_linked<P: AsRef<Path>>(path: P, capacity: usize) -> Result<SharedRegion, ShmemLibError> {
        let path = path.as_ref();
        check_capacity(capacity)?;
        let shmem = ShmemConf::new().size(capacity).flink(path).create()?;
        debug!("created shared region {} ({} bytes, os id {})", path.display(), shmem.len(), shmem.get_os_id());
        Ok(SharedRegion {
            backing: Backing::Linked(shmem),
            identifier: path.display().to_string(),
        })
    }

    /// Maps a store created by [`SharedRegion::create_linked`] in another process.
    pub fn open_linked<P: AsRef<Path>>(path: P) -> Result<SharedRegion, ShmemLibError> {
        let path = path.as_ref();
        let mut shmem = ShmemConf::new().flink(path).open()?;
        shmem.set_owner(false);
        check_capacity(shmem.len())?;
        debug!("opened shared region {} ({} bytes)", path.display(), shmem.len());
        Ok(SharedRegion {
            backing: Backing::Linked(shmem),
            identifier: path.display().to_string(),
        })
    }

    /// Creates an unnamed region for the fork-only strategy.
    pub fn create_anonymous(capacity: usize) -> Result<SharedRegion, ShmemLibError> {
        check_capacity(capacity)?;
        let mapping = AnonymousMapping::new(capacity)?;
        debug!("created anonymous shared region ({} bytes)", capacity);
        Ok(SharedRegion {
            backing: Backing::Anonymous(mapping),
            identifier: "<anonymous>".to_string(),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_owner(&self) -> bool {
        match &self.backing {
            Backing::Linked(shmem) => shmem.is_owner(),
            Backing::Anonymous(_) => true,
        }
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Linked(shmem) => shmem.len(),
            Backing::Anonymous(mapping) => mapping.len,
        }
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        match &self.backing {
            Backing::Linked(shmem) => shmem.as_ptr(),
            Backing::Anonymous(mapping) => mapping.as_ptr(),
        }
    }

    pub fn view(&self) -> RegionView<'_> {
        RegionView { region: self }
    }

    /// Removes the backing store. Only the creator may do this, and only once
    /// the peer has been reaped.
    pub fn destroy(self) -> Result<(), ShmemLibError> {
        if !self.is_owner() {
            return Err(ShmemLibError::Logic(format!(
                "region {} is not owned by this process",
                self.identifier
            )));
        }
        let identifier = self.identifier;
        match self.backing {
            Backing::Linked(shmem) => {
                drop(shmem);
                if Path::new(&identifier).exists() {
                    return Err(ShmemLibError::release(
                        "region link",
                        identifier,
                        io::Error::new(io::ErrorKind::Other, "link file still present"),
                    ));
                }
            }
            Backing::Anonymous(mapping) => drop(mapping),
        }
        debug!("destroyed shared region {}", identifier);
        Ok(())
    }
}

#[inline]
fn check_capacity(capacity: usize) -> Result<(), ShmemLibError> {
    if capacity < REGION_SIZE {
        return Err(ShmemLibError::Logic(format!(
            "region of {} bytes cannot hold the {} byte shared buffer",
            capacity, REGION_SIZE
        )));
    }
    Ok(())
}

/// Accessors over a mapped [`SharedRegion`].
///
/// Nothing here locks: exclusive access comes from the handshake, and a
/// peer's writes are only trustworthy after `wait` followed by [`RegionView::subscribe`].
pub struct RegionView<'r> {
    region: &'r SharedRegion,
}

impl<'r> RegionView<'r> {
    #[inline]
    fn buffer(&self) -> *mut SharedBuffer {
        self.region.as_ptr() as *mut SharedBuffer
    }

    #[inline]
    fn payload(&self) -> *mut u8 {
        // Safety: the region is at least REGION_SIZE bytes (checked at creation).
        unsafe { ptr::addr_of_mut!((*self.buffer()).payload) as *mut u8 }
    }

    pub fn capacity(&self) -> usize {
        PAYLOAD_CAPACITY
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), ShmemLibError> {
        offset
            .checked_add(bytes.len())
            .filter(|end| *end <= PAYLOAD_CAPACITY)
            .ok_or_else(|| {
                ShmemLibError::Logic(format!(
                    "write of {} bytes at offset {} exceeds the {} byte payload",
                    bytes.len(),
                    offset,
                    PAYLOAD_CAPACITY
                ))
            })?;
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.payload().add(offset), bytes.len());
        }
        Ok(())
    }

    pub fn set_size(&self, size: usize) -> Result<(), ShmemLibError> {
        if size > PAYLOAD_CAPACITY {
            return Err(ShmemLibError::Logic(format!(
                "size {} exceeds the {} byte payload",
                size, PAYLOAD_CAPACITY
            )));
        }
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*self.buffer()).size), size as u64) };
        Ok(())
    }

    pub fn size(&self) -> Result<usize, ShmemLibError> {
        let size = unsafe { ptr::read_volatile(ptr::addr_of!((*self.buffer()).size)) };
        if size > PAYLOAD_CAPACITY as u64 {
            return Err(ShmemLibError::Logic(format!(
                "corrupt region {}: size {} exceeds the {} byte payload",
                self.region.identifier, size, PAYLOAD_CAPACITY
            )));
        }
        Ok(size as usize)
    }

    /// Writes the whole message and then its size. Rejects oversized
    /// messages before touching the region.
    pub fn commit(&self, bytes: &[u8]) -> Result<(), ShmemLibError> {
        if bytes.len() > PAYLOAD_CAPACITY {
            return Err(ShmemLibError::Logic(format!(
                "message of {} bytes exceeds the {} byte payload",
                bytes.len(),
                PAYLOAD_CAPACITY
            )));
        }
        self.write(0, bytes)?;
        self.set_size(bytes.len())
    }

    /// Copies `payload[0..size)` out of the region.
    pub fn read(&self) -> Result<Vec<u8>, ShmemLibError> {
        let size = self.size()?;
        let mut out = vec![0u8; size];
        unsafe { ptr::copy_nonoverlapping(self.payload(), out.as_mut_ptr(), size) };
        Ok(out)
    }

    /// Flushes this side's writes. Call after writing and before `signal`.
    pub fn publish(&self) -> Result<(), ShmemLibError> {
        fence(Ordering::SeqCst);
        self.msync()
    }

    /// Refreshes this side's view. Call after `wait` and before reading.
    pub fn subscribe(&self) -> Result<(), ShmemLibError> {
        self.msync()?;
        fence(Ordering::SeqCst);
        Ok(())
    }

    fn msync(&self) -> Result<(), ShmemLibError> {
        // Safety: the whole mapping starts page aligned and is len() bytes long.
        let rc = unsafe {
            libc::msync(self.region.as_ptr() as *mut libc::c_void, self.region.len(), libc::MS_SYNC)
        };
        if rc != 0 {
            return Err(ShmemLibError::Mapping(io::Error::last_os_error()));
        }
        Ok(())
    }
}
