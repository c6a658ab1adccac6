//! Pinned host allocations
//!
//! A host allocation is a host-visible native buffer mapped for read/write.
//! The mapping is padded so an aligned pointer of the requested length fits
//! anywhere inside it:
//!
//! ```text
//!   mapped                aligned
//!   │◄─ pad (< align) ──►│◄──────── len ────────►│◄─ rest ─►│
//!   └──────────────────── alloc_size = len + align - 1 ───────┘
//! ```
//!
//! The wrapper carries the native handle so freeing never has to search.
//! When the device supports shared virtual memory the buffer is created over
//! an SVM allocation, which the wrapper also remembers.

use crate::ptr::DevicePtr;
use crate::registry::MemoryInfo;
use accel_backends::BufferHandle;
use std::fmt;
use std::ptr::NonNull;

const HUGE_PAGE: usize = 2 << 20;
const CACHE_LINE: usize = 64;

/// Alignment for a host allocation of `nbytes`
pub fn host_alignment(nbytes: usize) -> usize {
    if nbytes >= 8 * HUGE_PAGE {
        HUGE_PAGE
    } else if nbytes >= 8 * CACHE_LINE {
        CACHE_LINE
    } else {
        std::mem::size_of::<usize>()
    }
}

/// Host memory returned by [`crate::Context::host_alloc`]. Must be returned
/// through [`crate::Context::host_free`]; dropping it leaks the native buffer.
pub struct HostBuffer {
    pub(crate) device: usize,
    pub(crate) buffer: BufferHandle,
    pub(crate) mapped: NonNull<u8>,
    pub(crate) alloc_size: usize,
    /// SVM allocation backing `buffer`, freed after it
    pub(crate) svm: Option<NonNull<u8>>,
    ptr: NonNull<u8>,
    len: usize,
    alignment: usize,
}

// SAFETY: the mapping stays valid until `host_free` and is owned exclusively
// by this value; access goes through `&self` / `&mut self`.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub(crate) fn new(device: usize, buffer: BufferHandle, mapped: NonNull<u8>, len: usize, alignment: usize) -> Self {
        let pad = mapped.as_ptr().align_offset(alignment);
        // SAFETY: pad < alignment and the mapping is len + alignment - 1 bytes.
        let ptr = unsafe { NonNull::new_unchecked(mapped.as_ptr().add(pad)) };
        Self {
            device,
            buffer,
            mapped,
            alloc_size: len + alignment - 1,
            svm: None,
            ptr,
            len,
            alignment,
        }
    }

    pub(crate) fn with_svm(mut self, svm: Option<NonNull<u8>>) -> Self {
        self.svm = svm;
        self
    }

    /// Backed by shared virtual memory
    pub fn is_shared(&self) -> bool {
        self.svm.is_some()
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Device the buffer was allocated on
    pub fn device(&self) -> usize {
        self.device
    }

    /// Native buffer and host mapping behind this allocation
    pub fn info(&self) -> MemoryInfo {
        MemoryInfo {
            buffer: self.buffer,
            address: DevicePtr::new(self.mapped.as_ptr() as u64),
            size: self.alloc_size,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `len` bytes at `ptr` lie inside the live mapping.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("buffer", &self.buffer)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("alignment", &self.alignment)
            .field("svm", &self.svm)
            .finish()
    }
}
