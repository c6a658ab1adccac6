//! Backend trait for buffer, queue, event and kernel management
//!
//! The memory-and-synchronization layer in `accel-core` talks to a compute
//! API only through this trait.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  accel-core::Context                      │
//! │   registry · allocator · transfers · streams · events     │
//! └─────────────────────────┬────────────────────────────────┘
//!                           │ Arc<dyn Backend>
//!            ┌──────────────┼──────────────┐
//!            ▼              ▼              ▼
//!      ┌───────────┐  ┌───────────┐  ┌───────────┐
//!      │    Sim    │  │  OpenCL   │  │  Level0   │
//!      │  Backend  │  │  (extern) │  │  (extern) │
//!      └───────────┘  └───────────┘  └───────────┘
//! ```

use super::types::{
    BufferHandle, DeviceInfo, EventHandle, EventStatus, KernelArg, KernelHandle, MapFlags, MemFlags, NdRange,
    QueueHandle, QueuePriority,
};
use crate::error::{BackendError, Result};
use std::ptr::NonNull;

/// Compute API seam
///
/// All methods take `&self`; implementations synchronize internally so the
/// layer above can call them from many host threads at once. Commands on one
/// queue execute in submission order. Nothing here is reference counted: a
/// released handle is gone.
///
/// Kernel objects carry their bound arguments as shared state, so callers must
/// serialize `set_kernel_arg` + `enqueue_kernel` sequences per kernel.
pub trait Backend: Send + Sync {
    // ============================================================================================
    // Device
    // ============================================================================================

    /// Static description of the device behind this backend
    fn device_info(&self) -> DeviceInfo;

    /// Bytes currently available for new allocations, if the API reports it
    fn available_memory(&self) -> Option<u64> {
        None
    }

    // ============================================================================================
    // Buffers
    // ============================================================================================

    /// Create a buffer of `size` bytes
    fn create_buffer(&self, flags: MemFlags, size: usize) -> Result<BufferHandle>;

    /// Release a buffer. Commands already enqueued against it still complete.
    fn release_buffer(&self, buffer: BufferHandle) -> Result<()>;

    /// Allocated size in bytes
    fn buffer_size(&self, buffer: BufferHandle) -> Result<usize>;

    /// Device address of the buffer when the API exposes one natively
    /// (shared virtual memory, buffer device address). `Ok(None)` means the
    /// caller has to discover it another way.
    fn device_address(&self, _buffer: BufferHandle) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Allocate `size` bytes of shared virtual memory, visible to host and
    /// device at the same address. Devices without SVM support refuse.
    fn svm_alloc(&self, _flags: MemFlags, size: usize, _alignment: usize) -> Result<NonNull<u8>> {
        Err(BackendError::unsupported(format!("svm_alloc of {size} bytes")))
    }

    /// Free memory returned by [`Backend::svm_alloc`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `svm_alloc` on this backend and must not be
    /// accessed by the host afterwards. Buffers created over it may still be
    /// released later.
    unsafe fn svm_free(&self, ptr: NonNull<u8>) -> Result<()> {
        Err(BackendError::unsupported(format!("svm_free of {ptr:p}")))
    }

    /// Create a buffer of `size` bytes whose storage is the caller's memory
    /// at `host` ([`MemFlags::USE_HOST_PTR`]).
    ///
    /// # Safety
    ///
    /// `host` must be valid for `size` bytes for the lifetime of the buffer.
    unsafe fn create_buffer_from_host(&self, flags: MemFlags, size: usize, _host: NonNull<u8>) -> Result<BufferHandle> {
        Err(BackendError::unsupported(format!("create_buffer_from_host {flags:?} of {size} bytes")))
    }

    /// Host memory a buffer was created over, if any
    fn buffer_host_ptr(&self, _buffer: BufferHandle) -> Result<Option<NonNull<u8>>> {
        Ok(None)
    }

    /// Blocking map of `size` bytes at `offset` into host memory
    fn map_buffer(
        &self,
        queue: QueueHandle,
        buffer: BufferHandle,
        flags: MapFlags,
        offset: usize,
        size: usize,
    ) -> Result<NonNull<u8>>;

    /// Unmap a pointer previously returned by [`Backend::map_buffer`]
    fn unmap_buffer(&self, queue: QueueHandle, buffer: BufferHandle, mapped: NonNull<u8>) -> Result<()>;

    // ============================================================================================
    // Queues
    // ============================================================================================

    /// Create an in-order command queue
    fn create_queue(&self, priority: QueuePriority) -> Result<QueueHandle>;

    /// Release a queue after draining it
    fn release_queue(&self, queue: QueueHandle) -> Result<()>;

    /// Submit pending commands without waiting
    fn flush(&self, queue: QueueHandle) -> Result<()>;

    /// Block until every command on the queue has completed
    fn finish(&self, queue: QueueHandle) -> Result<()>;

    // ============================================================================================
    // Transfers
    // ============================================================================================

    /// Write `len` bytes from host memory at `src` into the buffer at `offset`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `len` bytes until the write has
    /// completed: until return when `blocking`, otherwise until the queue is
    /// finished or a later marker on it has completed.
    unsafe fn enqueue_write(
        &self,
        queue: QueueHandle,
        buffer: BufferHandle,
        blocking: bool,
        offset: usize,
        src: *const u8,
        len: usize,
    ) -> Result<()>;

    /// Read `len` bytes at `offset` from the buffer into host memory at `dst`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `len` bytes and not otherwise
    /// accessed until the read has completed (see [`Backend::enqueue_write`]).
    unsafe fn enqueue_read(
        &self,
        queue: QueueHandle,
        buffer: BufferHandle,
        blocking: bool,
        offset: usize,
        dst: *mut u8,
        len: usize,
    ) -> Result<()>;

    /// Buffer-to-buffer copy
    fn enqueue_copy(
        &self,
        queue: QueueHandle,
        src: BufferHandle,
        dst: BufferHandle,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()>;

    /// Fill `len` bytes at `offset` by repeating `pattern`. `len` and
    /// `offset` must be multiples of the pattern size.
    fn enqueue_fill(
        &self,
        queue: QueueHandle,
        buffer: BufferHandle,
        pattern: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<()>;

    // ============================================================================================
    // Kernels
    // ============================================================================================

    /// Build `name` from `source`
    fn build_kernel(&self, source: &str, name: &str, build_flags: Option<&str>) -> Result<KernelHandle>;

    /// Bind an argument. Shared state: see the trait docs.
    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, arg: KernelArg) -> Result<()>;

    /// Launch with the currently bound arguments
    fn enqueue_kernel(&self, queue: QueueHandle, kernel: KernelHandle, range: NdRange) -> Result<()>;

    /// Drop a built kernel
    fn release_kernel(&self, kernel: KernelHandle) -> Result<()>;

    // ============================================================================================
    // Events
    // ============================================================================================

    /// Marker that completes once all earlier commands on the queue have
    fn enqueue_marker(&self, queue: QueueHandle) -> Result<EventHandle>;

    /// Make later commands on `queue` wait for `wait_list`
    fn enqueue_barrier(&self, queue: QueueHandle, wait_list: &[EventHandle]) -> Result<()>;

    /// Current status of an event
    fn event_status(&self, event: EventHandle) -> Result<EventStatus>;

    /// Block the calling thread until every event has completed
    fn wait_for_events(&self, events: &[EventHandle]) -> Result<()>;

    /// Release an event
    fn release_event(&self, event: EventHandle) -> Result<()>;

    /// Allow downcasting to the concrete backend
    fn as_any(&self) -> &dyn std::any::Any;
}
