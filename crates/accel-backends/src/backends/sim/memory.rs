//! Buffer storage and the simulated device address space

use crate::backend::{BufferHandle, MemFlags};
use crate::error::{codes, BackendError, Result};
use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Device allocations are placed on this granularity. No guard gap: two
/// buffers may be adjacent in the device address space, as on real drivers.
pub(crate) const ADDRESS_ALIGNMENT: u64 = 256;

/// Heap bytes reachable only through raw pointers.
///
/// Device commands, mapped host pointers and asynchronous host transfers all
/// alias this memory, so no `&[u8]` is ever formed over it.
pub(crate) struct SimStorage {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

enum Backing {
    /// Leaked `Box<[u8]>` of exactly `len` bytes
    Owned,
    /// Window into a shared virtual memory region, kept alive by the buffer
    Shared(Arc<SvmRegion>),
}

// SAFETY: the allocation is owned by this struct and freed only on drop.
// Concurrent access goes through `ptr::copy`/`ptr::write_bytes`; ordering
// between conflicting accesses is the caller's responsibility, exactly as for
// device memory.
unsafe impl Send for SimStorage {}
unsafe impl Sync for SimStorage {}

impl SimStorage {
    fn zeroed(len: usize) -> Self {
        let leaked: &'static mut [u8] = Box::leak(vec![0u8; len].into_boxed_slice());
        Self {
            ptr: NonNull::from(leaked).cast::<u8>(),
            len,
            backing: Backing::Owned,
        }
    }

    fn over(region: Arc<SvmRegion>, ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            backing: Backing::Shared(region),
        }
    }

    pub(crate) fn host_ptr(&self) -> Option<NonNull<u8>> {
        matches!(self.backing, Backing::Shared(_)).then_some(self.ptr)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn check(&self, offset: usize, size: usize) -> Result<()> {
        match offset.checked_add(size) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(BackendError::BufferOutOfBounds {
                offset,
                size,
                buffer_size: self.len,
            }),
        }
    }

    /// Pointer to byte `offset`; caller has checked the range.
    pub(crate) fn at(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.len);
        // SAFETY: offset is within (or one past) the allocation.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }

    /// # Safety
    ///
    /// `src` valid for `len` reads; range checked.
    pub(crate) unsafe fn write_from(&self, offset: usize, src: *const u8, len: usize) {
        ptr::copy(src, self.at(offset).as_ptr(), len);
    }

    /// # Safety
    ///
    /// `dst` valid for `len` writes; range checked.
    pub(crate) unsafe fn read_into(&self, offset: usize, dst: *mut u8, len: usize) {
        ptr::copy(self.at(offset).as_ptr(), dst, len);
    }

    pub(crate) fn copy_to(&self, src_offset: usize, dst: &SimStorage, dst_offset: usize, len: usize) {
        debug_assert!(self.check(src_offset, len).is_ok() && dst.check(dst_offset, len).is_ok());
        // SAFETY: both ranges were checked at enqueue; `copy` tolerates overlap.
        unsafe { ptr::copy(self.at(src_offset).as_ptr(), dst.at(dst_offset).as_ptr(), len) }
    }

    pub(crate) fn fill(&self, offset: usize, len: usize, pattern: &[u8]) {
        debug_assert!(self.check(offset, len).is_ok());
        if let [byte] = pattern {
            // SAFETY: range checked at enqueue.
            unsafe { ptr::write_bytes(self.at(offset).as_ptr(), *byte, len) };
            return;
        }
        for chunk_start in (offset..offset + len).step_by(pattern.len()) {
            let n = pattern.len().min(offset + len - chunk_start);
            // SAFETY: chunk lies inside the checked range.
            unsafe { ptr::copy_nonoverlapping(pattern.as_ptr(), self.at(chunk_start).as_ptr(), n) };
        }
    }
}

impl Drop for SimStorage {
    fn drop(&mut self) {
        if let Backing::Owned = self.backing {
            // SAFETY: ptr/len came from a leaked Box<[u8]> of exactly this length.
            unsafe { drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len))) }
        }
    }
}

/// Zeroed host allocation handed out by `svm_alloc`.
///
/// Freed when the last holder goes away: the SVM table and every buffer
/// created over it share ownership.
pub(crate) struct SvmRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: same access discipline as `SimStorage`.
unsafe impl Send for SvmRegion {}
unsafe impl Sync for SvmRegion {}

impl SvmRegion {
    pub(crate) fn zeroed(size: usize, alignment: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, alignment.max(1))
            .map_err(|err| BackendError::invalid_value(format!("svm layout: {err}")))?;
        if size == 0 {
            return Err(BackendError::invalid_value("zero-sized svm allocation"));
        }
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| BackendError::allocation_failed(size, "host out of memory"))?;
        Ok(Self { ptr, layout })
    }

    pub(crate) fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Whether `size` bytes at `host` lie inside this region
    fn contains(&self, host: NonNull<u8>, size: usize) -> bool {
        let base = self.ptr.as_ptr() as usize;
        let start = host.as_ptr() as usize;
        start >= base && start.checked_add(size).is_some_and(|end| end <= base + self.layout.size())
    }
}

impl Drop for SvmRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// One device buffer
pub(crate) struct SimBuffer {
    pub(crate) handle: BufferHandle,
    pub(crate) flags: MemFlags,
    /// Base address in the simulated device address space
    pub(crate) address: u64,
    pub(crate) storage: SimStorage,
    pub(crate) maps: AtomicUsize,
}

impl SimBuffer {
    pub(crate) fn size(&self) -> usize {
        self.storage.len()
    }
}

/// Buffer table plus a bump allocator for device addresses.
pub(crate) struct SimMemory {
    buffers: HashMap<u64, Arc<SimBuffer>>,
    /// Live SVM regions by base host address
    svm: HashMap<usize, Arc<SvmRegion>>,
    next_id: u64,
    next_address: u64,
    allocated: u64,
    capacity: u64,
}

impl SimMemory {
    pub(crate) fn new(address_base: u64, capacity: u64) -> Self {
        Self {
            buffers: HashMap::new(),
            svm: HashMap::new(),
            next_id: 1,
            next_address: align_up(address_base.max(ADDRESS_ALIGNMENT), ADDRESS_ALIGNMENT),
            allocated: 0,
            capacity,
        }
    }

    pub(crate) fn allocate(&mut self, flags: MemFlags, size: usize) -> Result<Arc<SimBuffer>> {
        self.reserve(size)?;
        Ok(self.insert(flags, SimStorage::zeroed(size)))
    }

    /// Buffer whose storage is `size` bytes of a live SVM region at `host`
    pub(crate) fn allocate_over(&mut self, flags: MemFlags, size: usize, host: NonNull<u8>) -> Result<Arc<SimBuffer>> {
        let region = self
            .svm
            .values()
            .find(|region| region.contains(host, size))
            .cloned()
            .ok_or_else(|| BackendError::invalid_value("host pointer is not shared virtual memory of this device"))?;
        self.reserve(size)?;
        Ok(self.insert(flags, SimStorage::over(region, host, size)))
    }

    fn reserve(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(BackendError::Native {
                call: "create_buffer",
                code: codes::INVALID_BUFFER_SIZE,
            });
        }
        if self.allocated + size as u64 > self.capacity {
            return Err(BackendError::allocation_failed(
                size,
                format!("{} of {} bytes in use", self.allocated, self.capacity),
            ));
        }
        Ok(())
    }

    fn insert(&mut self, flags: MemFlags, storage: SimStorage) -> Arc<SimBuffer> {
        let size = storage.len();
        let handle = BufferHandle::new(self.next_id);
        self.next_id += 1;
        let address = self.next_address;
        self.next_address = align_up(address + size as u64, ADDRESS_ALIGNMENT);
        self.allocated += size as u64;

        let buffer = Arc::new(SimBuffer {
            handle,
            flags,
            address,
            storage,
            maps: AtomicUsize::new(0),
        });
        self.buffers.insert(handle.id(), Arc::clone(&buffer));
        buffer
    }

    pub(crate) fn svm_insert(&mut self, region: SvmRegion) -> NonNull<u8> {
        let ptr = region.ptr();
        self.svm.insert(ptr.as_ptr() as usize, Arc::new(region));
        ptr
    }

    pub(crate) fn svm_remove(&mut self, ptr: NonNull<u8>) -> Result<()> {
        self.svm
            .remove(&(ptr.as_ptr() as usize))
            .map(|_| ())
            .ok_or_else(|| BackendError::invalid_value(format!("{ptr:p} is not an svm allocation")))
    }

    pub(crate) fn svm_len(&self) -> usize {
        self.svm.len()
    }

    pub(crate) fn release(&mut self, handle: BufferHandle) -> Result<()> {
        let buffer = self
            .buffers
            .remove(&handle.id())
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))?;
        self.allocated -= buffer.size() as u64;
        if buffer.maps.load(Ordering::Acquire) != 0 {
            tracing::warn!(buffer = %handle, "releasing a buffer that is still mapped");
        }
        Ok(())
    }

    pub(crate) fn get(&self, handle: BufferHandle) -> Result<Arc<SimBuffer>> {
        self.buffers
            .get(&handle.id())
            .cloned()
            .ok_or(BackendError::InvalidBufferHandle(handle.id()))
    }

    pub(crate) fn len(&self) -> usize {
        self.buffers.len()
    }

    pub(crate) fn allocated(&self) -> u64 {
        self.allocated
    }

    pub(crate) fn available(&self) -> u64 {
        self.capacity - self.allocated
    }
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}
