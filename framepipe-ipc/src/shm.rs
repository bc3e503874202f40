// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared buffer arena: a POSIX named shared memory region holding a fixed
//! count of fixed-size frame buffers behind a small header. The receiver
//! creates the region; processors open it by name. Buffer ownership is a
//! logical handshake between the two processes, not enforced here.

use framepipe_common::error::{BufferError, ConfigError};
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

/// Region layout at offset zero: three platform-sized unsigned integers in
/// host byte order. Buffers follow the header, contiguous.
#[repr(C)]
struct Header {
    manager_id: usize,
    num_buffers: usize,
    buffer_size: usize,
}

static LAST_MANAGER_ID: AtomicUsize = AtomicUsize::new(0);

pub struct SharedBufferManager {
    name: String,
    ptr: NonNull<libc::c_void>,
    region_size: usize,
    remove_on_drop: bool,
    // Keeps the region's fd alive for the lifetime of the mapping
    _fd: OwnedFd,
}

// The mapping is valid for the manager's lifetime and all mutation goes
// through raw pointers with caller-side ownership of buffer ids.
unsafe impl Send for SharedBufferManager {}
unsafe impl Sync for SharedBufferManager {}

impl SharedBufferManager {
    /// Create (or replace) a named region sized for `shared_mem_size` bytes
    /// of buffer space. The number of buffers is derived from `buffer_size`.
    pub fn create(
        name: &str,
        shared_mem_size: usize,
        buffer_size: usize,
        remove_on_drop: bool,
    ) -> Result<SharedBufferManager, ConfigError> {
        if buffer_size == 0 {
            return Err(ConfigError::new("zero shared memory buffer size specified"));
        }
        let num_buffers = shared_mem_size / buffer_size;
        if num_buffers == 0 {
            return Err(ConfigError::new(
                "buffer size requested exceeds size of shared memory",
            ));
        }

        let region_size = page_aligned(std::mem::size_of::<Header>() + shared_mem_size);
        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| ConfigError::new(format!("failed to create shared buffer region: {e}")))?;
        ftruncate(&fd, region_size as libc::off_t)
            .map_err(|e| ConfigError::new(format!("failed to size shared buffer region: {e}")))?;

        let ptr = map_region(&fd, region_size)
            .map_err(|e| ConfigError::new(format!("failed to map shared buffer region: {e}")))?;

        touch_pages(ptr.as_ptr(), region_size);

        // SAFETY: region starts with a Header and is at least that large.
        unsafe {
            let header = ptr.as_ptr() as *mut Header;
            (*header).manager_id = LAST_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
            (*header).num_buffers = num_buffers;
            (*header).buffer_size = buffer_size;
        }

        info!(
            "created shared buffer region {name}: {num_buffers} buffers of {buffer_size} bytes"
        );
        Ok(SharedBufferManager {
            name: name.to_string(),
            ptr,
            region_size,
            remove_on_drop,
            _fd: fd,
        })
    }

    /// Open an existing named region; geometry is read from its header.
    pub fn open(name: &str) -> Result<SharedBufferManager, ConfigError> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|e| ConfigError::new(format!("failed to open shared buffer region: {e}")))?;
        let region_size = {
            let file = std::fs::File::from(fd.try_clone().map_err(|e| {
                ConfigError::new(format!("failed to duplicate shared buffer fd: {e}"))
            })?);
            file.metadata()
                .map_err(|e| ConfigError::new(format!("failed to stat shared buffer region: {e}")))?
                .len() as usize
        };
        if region_size < std::mem::size_of::<Header>() {
            return Err(ConfigError::new(
                "shared buffer region smaller than its header",
            ));
        }
        let ptr = map_region(&fd, region_size)
            .map_err(|e| ConfigError::new(format!("failed to map shared buffer region: {e}")))?;

        touch_pages(ptr.as_ptr(), region_size);

        debug!("mapped existing shared buffer region {name} ({region_size} bytes)");
        Ok(SharedBufferManager {
            name: name.to_string(),
            ptr,
            region_size,
            remove_on_drop: false,
            _fd: fd,
        })
    }

    fn header(&self) -> &Header {
        // SAFETY: the header is written before either constructor returns.
        unsafe { &*(self.ptr.as_ptr() as *const Header) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn manager_id(&self) -> usize {
        self.header().manager_id
    }

    pub fn num_buffers(&self) -> usize {
        self.header().num_buffers
    }

    pub fn buffer_size(&self) -> usize {
        self.header().buffer_size
    }

    /// Raw address of a buffer. Fails for an id outside the arena.
    pub fn buffer_address(&self, buffer_id: usize) -> Result<*mut u8, BufferError> {
        let header = self.header();
        if buffer_id >= header.num_buffers {
            return Err(BufferError::InvalidBuffer(buffer_id));
        }
        let offset = std::mem::size_of::<Header>() + buffer_id * header.buffer_size;
        // SAFETY: offset is within the mapped region by the check above.
        Ok(unsafe { (self.ptr.as_ptr() as *mut u8).add(offset) })
    }

    /// Mutable view of one buffer.
    ///
    /// # Safety
    /// The caller must hold logical ownership of `buffer_id`; the arena does
    /// not arbitrate concurrent access to a buffer.
    pub unsafe fn buffer_mut(&self, buffer_id: usize) -> Result<&mut [u8], BufferError> {
        let address = self.buffer_address(buffer_id)?;
        Ok(std::slice::from_raw_parts_mut(address, self.buffer_size()))
    }

    /// Shared view of one buffer.
    ///
    /// # Safety
    /// As for [`Self::buffer_mut`].
    pub unsafe fn buffer(&self, buffer_id: usize) -> Result<&[u8], BufferError> {
        let address = self.buffer_address(buffer_id)?;
        Ok(std::slice::from_raw_parts(address, self.buffer_size()))
    }
}

impl Drop for SharedBufferManager {
    fn drop(&mut self) {
        // SAFETY: ptr/region_size describe the live mapping created above.
        unsafe {
            let _ = munmap(self.ptr, self.region_size);
        }
        if self.remove_on_drop {
            let _ = shm_unlink(self.name.as_str());
        }
    }
}

fn map_region(fd: &OwnedFd, size: usize) -> nix::Result<NonNull<libc::c_void>> {
    let length = NonZeroUsize::new(size).ok_or(nix::errno::Errno::EINVAL)?;
    // SAFETY: fd refers to a shared memory object of at least `size` bytes.
    unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
}

fn page_aligned(size: usize) -> usize {
    let page = page_size::get();
    ((size - 1) & !(page - 1)) + page
}

/// Read one word per stride across the region so every page is faulted in
/// before the first frame arrives. Measured to flatten first-frame latency.
fn touch_pages(ptr: *mut libc::c_void, size: usize) {
    let words = size / 8;
    let base = ptr as *const u64;
    let mut total: u64 = 0;
    let stride = (page_size::get() / 8).max(1);
    let mut idx = 0;
    while idx < words {
        // SAFETY: idx stays below size/8 words of the mapped region.
        total = total.wrapping_add(unsafe { std::ptr::read_volatile(base.add(idx)) });
        idx += stride;
    }
    std::hint::black_box(total);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    fn unique_name(tag: &str) -> String {
        format!("/fp_test_{tag}_{}", process::id())
    }

    #[test]
    fn create_and_reopen() {
        let name = unique_name("reopen");
        let manager = SharedBufferManager::create(&name, 40000, 1000, true).unwrap();
        assert_eq!(manager.num_buffers(), 40);
        assert_eq!(manager.buffer_size(), 1000);

        // SAFETY: single-threaded test owns every buffer.
        unsafe {
            manager.buffer_mut(0).unwrap()[..4].copy_from_slice(&[1, 2, 3, 4]);
            manager.buffer_mut(39).unwrap()[0] = 0xAB;
        }

        let opened = SharedBufferManager::open(&name).unwrap();
        assert_eq!(opened.num_buffers(), 40);
        assert_eq!(opened.buffer_size(), 1000);
        assert_eq!(opened.manager_id(), manager.manager_id());
        unsafe {
            assert_eq!(&opened.buffer(0).unwrap()[..4], &[1, 2, 3, 4]);
            assert_eq!(opened.buffer(39).unwrap()[0], 0xAB);
        }
    }

    #[test]
    fn invalid_buffer_id() {
        let name = unique_name("invalid");
        let manager = SharedBufferManager::create(&name, 4000, 1000, true).unwrap();
        assert!(manager.buffer_address(3).is_ok());
        assert!(matches!(
            manager.buffer_address(4),
            Err(BufferError::InvalidBuffer(4))
        ));
    }

    #[test]
    fn oversized_buffer_rejected() {
        let name = unique_name("oversize");
        let result = SharedBufferManager::create(&name, 1000, 4000, true);
        assert!(result.is_err());
    }

    #[test]
    fn zero_buffer_size_rejected() {
        let name = unique_name("zero");
        assert!(SharedBufferManager::create(&name, 1000, 0, true).is_err());
    }
}
