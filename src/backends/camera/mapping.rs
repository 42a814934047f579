// SPDX-License-Identifier: GPL-3.0-only

//! Owned memory regions used by the buffer strategies
//!
//! Every region unmaps or frees itself on drop, and tracked regions keep a
//! shared live count so tests can assert nothing leaked.

use crate::errors::{ServiceError, ServiceResult};
use crate::ring::SlotRegion;
use std::alloc::{self, Layout};
use std::os::unix::io::RawFd;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

/// Alignment of host blocks handed to the device
const HOST_BLOCK_ALIGN: usize = 4096;

/// A `mmap`ed range of a file descriptor.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    live: Option<Arc<AtomicUsize>>,
}

// SAFETY: the region owns its mapping exclusively.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Map `len` bytes of `fd` starting at `offset` (shared mapping).
    pub fn map(fd: RawFd, offset: i64, len: usize, writable: bool) -> ServiceResult<Self> {
        if len == 0 {
            return Err(ServiceError::InvalidParameter(
                "cannot map an empty region".to_string(),
            ));
        }
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        // SAFETY: a null hint lets the kernel choose the address; the result
        // is checked before use.
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(ServiceError::last_os_error("mmap"));
        }
        let ptr = NonNull::new(raw as *mut u8)
            .ok_or_else(|| ServiceError::IoFailure("mmap returned null".to_string()))?;
        Ok(Self {
            ptr,
            len,
            live: None,
        })
    }

    /// Count this region in `counter` until it is dropped.
    pub fn tracked(mut self, counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        self.live = Some(Arc::clone(counter));
        self
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is readable for `len` bytes while self lives.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: ptr/len come from a successful mmap.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        if rc < 0 {
            warn!(len = self.len, error = %std::io::Error::last_os_error(), "munmap failed");
        }
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Memory a device fills by address in `UserPointer` mode.
#[derive(Debug)]
pub enum HostBlock {
    /// Page-aligned heap block owned by the buffer manager
    Owned { ptr: NonNull<u8>, layout: Layout },
    /// A ring channel slot; the channel owns the bytes
    Slot(SlotRegion),
}

// SAFETY: owned blocks are exclusively owned; slot blocks point into shared
// memory whose lifetime the preview pipeline manages.
unsafe impl Send for HostBlock {}

impl HostBlock {
    /// Allocate a zeroed, page-aligned block of `len` bytes.
    pub fn allocate(len: usize) -> ServiceResult<Self> {
        let layout = Layout::from_size_align(len.max(1), HOST_BLOCK_ALIGN)
            .map_err(|e| ServiceError::InvalidParameter(format!("host block layout: {e}")))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            ServiceError::ResourceExhausted(format!("allocating {} byte host block", len))
        })?;
        Ok(HostBlock::Owned { ptr, layout })
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        match self {
            HostBlock::Owned { ptr, .. } => ptr.as_ptr(),
            HostBlock::Slot(region) => region.as_mut_ptr(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostBlock::Owned { layout, .. } => layout.size(),
            HostBlock::Slot(region) => region.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First `len` bytes of the block.
    pub fn bytes(&self, len: usize) -> &[u8] {
        let len = len.min(self.len());
        // SAFETY: the block is valid for `self.len()` bytes.
        unsafe { std::slice::from_raw_parts(self.as_mut_ptr(), len) }
    }
}

impl Drop for HostBlock {
    fn drop(&mut self) {
        if let HostBlock::Owned { ptr, layout } = self {
            // SAFETY: allocated with this layout in `allocate`.
            unsafe { alloc::dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

/// Transient mapping of an exported buffer, owned by the dequeue caller.
///
/// Dropping it unmaps the buffer.
#[derive(Debug)]
pub struct ExportedMapping {
    index: u32,
    bytes_used: usize,
    region: MappedRegion,
}

impl ExportedMapping {
    pub(crate) fn new(index: u32, bytes_used: usize, region: MappedRegion) -> Self {
        Self {
            index,
            bytes_used: bytes_used.min(region.len()),
            region,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.region.as_slice()[..self.bytes_used]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    fn memfd(len: usize) -> std::fs::File {
        use std::os::unix::io::FromRawFd;
        let fd = unsafe { libc::memfd_create(c"mapping-test".as_ptr(), libc::MFD_CLOEXEC) };
        assert!(fd >= 0);
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        file.set_len(len as u64).unwrap();
        file
    }

    #[test]
    fn test_tracked_region_counts() {
        let file = memfd(8192);
        let live = Arc::new(AtomicUsize::new(0));
        let a = MappedRegion::map(file.as_raw_fd(), 0, 4096, true)
            .unwrap()
            .tracked(&live);
        let b = MappedRegion::map(file.as_raw_fd(), 4096, 4096, false)
            .unwrap()
            .tracked(&live);
        assert_eq!(live.load(Ordering::SeqCst), 2);

        unsafe { *a.as_ptr().add(4096 - 1) = 7 };
        drop(a);
        assert_eq!(live.load(Ordering::SeqCst), 1);

        let exported = ExportedMapping::new(3, 10, b);
        assert_eq!(exported.as_slice().len(), 10);
        drop(exported);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_map_rejects_empty() {
        let file = memfd(4096);
        assert!(matches!(
            MappedRegion::map(file.as_raw_fd(), 0, 0, false),
            Err(ServiceError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_host_block_is_page_aligned() {
        let block = HostBlock::allocate(1000).unwrap();
        assert_eq!(block.as_mut_ptr() as usize % HOST_BLOCK_ALIGN, 0);
        assert_eq!(block.len(), 1000);
        assert!(block.bytes(2000).iter().all(|b| *b == 0));
    }
}
