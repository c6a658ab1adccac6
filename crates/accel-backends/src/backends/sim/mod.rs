//! Simulated device backend
//!
//! Reference implementation of the [`Backend`] trait. It behaves like a
//! discrete accelerator as far as the memory layer can observe:
//!
//! ```text
//! SimBackend
//! ├── SimMemory   - buffers in a private device address space (bump allocated)
//! ├── SimQueue    - one worker thread per queue, commands run in order
//! ├── SimEvent    - markers completed by the worker, waitable from any thread
//! └── SimKernel   - `memptr` / `memcpy` / `memset` micro-kernels
//! ```
//!
//! Buffer addresses are not handed out unless [`SimConfig::native_addresses`]
//! is set, so the address-discovery path of the layer above is exercised by
//! default. Vendor identity, quirk flags and failure injection are all
//! configurable to reach the fallback paths.
//!
//! # Usage
//!
//! ```rust
//! use accel_backends::{Backend, MemFlags, QueuePriority, SimBackend};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = SimBackend::new();
//! let queue = backend.create_queue(QueuePriority::Normal)?;
//! let buffer = backend.create_buffer(MemFlags::READ_WRITE, 16)?;
//!
//! backend.enqueue_fill(queue, buffer, &[7], 0, 16)?;
//! let mut out = [0u8; 16];
//! unsafe { backend.enqueue_read(queue, buffer, true, 0, out.as_mut_ptr(), 16)? };
//! assert_eq!(out, [7; 16]);
//!
//! backend.release_buffer(buffer)?;
//! backend.release_queue(queue)?;
//! # Ok(())
//! # }
//! ```

mod kernels;
mod memory;
mod queue;

use crate::backend::{
    Backend, BufferHandle, DeviceInfo, DeviceQuirks, EventHandle, EventStatus, KernelArg, KernelHandle, MapFlags,
    MemFlags, NdRange, QueueHandle, QueuePriority, Vendor,
};
use crate::error::{codes, BackendError, Result};
use kernels::{Builtin, SimKernel};
use memory::{SimBuffer, SimMemory, SvmRegion};
use parking_lot::{Mutex, RwLock};
use queue::{Command, HostPtr, HostPtrMut, SimEvent, SimQueue};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Behaviour of a [`SimBackend`]
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub name: String,
    pub vendor: Vendor,
    pub uid: u32,
    pub global_mem_size: u64,
    pub unified_memory: bool,
    pub quirks: DeviceQuirks,
    /// Report buffer addresses through [`Backend::device_address`]
    pub native_addresses: bool,
    /// Refuse buffers created with [`MemFlags::PLACEMENT_HINT`]
    pub reject_placement_hint: bool,
    /// Refuse non-blocking reads
    pub reject_async_reads: bool,
    /// Fail every `flush`
    pub reject_flush: bool,
    /// Advertise and serve shared virtual memory
    pub svm: bool,
    /// Advertise shared virtual memory but fail every `svm_alloc`
    pub reject_svm_alloc: bool,
    /// First address of the device address space
    pub address_base: u64,
    /// Delay applied to every command on the queue worker
    pub command_latency: Option<Duration>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            name: "sim-device".to_string(),
            vendor: Vendor::Other,
            uid: 0,
            global_mem_size: 1 << 30,
            unified_memory: false,
            quirks: DeviceQuirks::empty(),
            native_addresses: false,
            reject_placement_hint: false,
            reject_async_reads: false,
            reject_flush: false,
            svm: false,
            reject_svm_alloc: false,
            address_base: 0x7f00_0000_0000,
            command_latency: None,
        }
    }
}

impl SimConfig {
    /// Discrete Intel device with the given PCI device id
    pub fn intel(uid: u32) -> Self {
        Self {
            name: format!("sim-intel-{uid:04x}"),
            vendor: Vendor::Intel,
            uid,
            ..Self::default()
        }
    }
}

struct SimDevice {
    config: SimConfig,
    memory: RwLock<SimMemory>,
    queues: RwLock<HashMap<u64, SimQueue>>,
    events: Mutex<HashMap<u64, Arc<SimEvent>>>,
    kernels: RwLock<HashMap<u64, Arc<SimKernel>>>,
    next_handle: AtomicU64,
    hint_rejections: AtomicU64,
}

impl SimDevice {
    fn next_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn buffer(&self, handle: BufferHandle) -> Result<Arc<SimBuffer>> {
        self.memory.read().get(handle)
    }

    fn with_queue<T>(&self, queue: QueueHandle, f: impl FnOnce(&SimQueue) -> Result<T>) -> Result<T> {
        let queues = self.queues.read();
        let queue = queues
            .get(&queue.id())
            .ok_or(BackendError::InvalidQueueHandle(queue.id()))?;
        f(queue)
    }

    fn submit(&self, queue: QueueHandle, command: Command) -> Result<()> {
        self.with_queue(queue, |q| q.submit(command))
    }

    fn submit_blocking(&self, queue: QueueHandle, command: Command) -> Result<()> {
        let marker = self.with_queue(queue, |q| {
            q.submit(command)?;
            q.marker()
        })?;
        marker.wait();
        Ok(())
    }

    fn check_hint(&self, flags: MemFlags, size: usize) -> Result<()> {
        if flags.contains(MemFlags::PLACEMENT_HINT) && self.config.reject_placement_hint {
            self.hint_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(BackendError::allocation_failed(size, "placement hint not supported for this size"));
        }
        Ok(())
    }

    fn event(&self, event: EventHandle) -> Result<Arc<SimEvent>> {
        self.events
            .lock()
            .get(&event.id())
            .cloned()
            .ok_or(BackendError::InvalidEventHandle(event.id()))
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        for (_, queue) in self.queues.get_mut().drain() {
            queue.shutdown();
        }
    }
}

/// In-process reference device
#[derive(Clone)]
pub struct SimBackend {
    device: Arc<SimDevice>,
}

impl SimBackend {
    /// Simulated device with default settings
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let memory = SimMemory::new(config.address_base, config.global_mem_size);
        Self {
            device: Arc::new(SimDevice {
                config,
                memory: RwLock::new(memory),
                queues: RwLock::new(HashMap::new()),
                events: Mutex::new(HashMap::new()),
                kernels: RwLock::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                hint_rejections: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SimConfig {
        &self.device.config
    }

    /// Buffers not yet released
    pub fn live_buffers(&self) -> usize {
        self.device.memory.read().len()
    }

    /// Queues not yet released
    pub fn live_queues(&self) -> usize {
        self.device.queues.read().len()
    }

    /// Events not yet released
    pub fn live_events(&self) -> usize {
        self.device.events.lock().len()
    }

    /// Kernels built and not released
    pub fn live_kernels(&self) -> usize {
        self.device.kernels.read().len()
    }

    /// Bytes held by live buffers
    pub fn allocated_bytes(&self) -> u64 {
        self.device.memory.read().allocated()
    }

    /// Shared virtual memory regions not yet freed
    pub fn live_svm(&self) -> usize {
        self.device.memory.read().svm_len()
    }

    /// Allocations refused because of the placement hint
    pub fn hint_rejections(&self) -> u64 {
        self.device.hint_rejections.load(Ordering::Relaxed)
    }

    /// Address of a buffer, bypassing the device-address capability.
    /// For verification only.
    pub fn peek_address(&self, buffer: BufferHandle) -> Result<u64> {
        Ok(self.device.buffer(buffer)?.address)
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for SimBackend {
    fn device_info(&self) -> DeviceInfo {
        let config = &self.device.config;
        DeviceInfo {
            name: config.name.clone(),
            vendor: config.vendor,
            uid: config.uid,
            global_mem_size: config.global_mem_size,
            unified_memory: config.unified_memory,
            svm: config.svm || config.reject_svm_alloc,
            quirks: config.quirks,
        }
    }

    fn available_memory(&self) -> Option<u64> {
        Some(self.device.memory.read().available())
    }

    fn create_buffer(&self, flags: MemFlags, size: usize) -> Result<BufferHandle> {
        self.device.check_hint(flags, size)?;
        let buffer = self.device.memory.write().allocate(flags, size)?;
        tracing::trace!(buffer = %buffer.handle, size, address = buffer.address, flags = ?buffer.flags, "sim buffer created");
        Ok(buffer.handle)
    }

    fn release_buffer(&self, buffer: BufferHandle) -> Result<()> {
        self.device.memory.write().release(buffer)
    }

    fn svm_alloc(&self, flags: MemFlags, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let config = &self.device.config;
        if config.reject_svm_alloc {
            return Err(BackendError::allocation_failed(size, "svm allocation refused"));
        }
        if !config.svm {
            return Err(BackendError::unsupported("device has no shared virtual memory"));
        }
        self.device.check_hint(flags, size)?;
        let alignment = if alignment == 0 { memory::ADDRESS_ALIGNMENT as usize } else { alignment };
        let region = SvmRegion::zeroed(size, alignment)?;
        let ptr = self.device.memory.write().svm_insert(region);
        tracing::trace!(size, alignment, ptr = ?ptr, "sim svm allocated");
        Ok(ptr)
    }

    unsafe fn svm_free(&self, ptr: NonNull<u8>) -> Result<()> {
        self.device.memory.write().svm_remove(ptr)
    }

    unsafe fn create_buffer_from_host(&self, flags: MemFlags, size: usize, host: NonNull<u8>) -> Result<BufferHandle> {
        if !flags.contains(MemFlags::USE_HOST_PTR) {
            return Err(BackendError::invalid_value("host pointer given without USE_HOST_PTR"));
        }
        let buffer = self.device.memory.write().allocate_over(flags, size, host)?;
        tracing::trace!(buffer = %buffer.handle, size, address = buffer.address, "sim buffer created over svm");
        Ok(buffer.handle)
    }

    fn buffer_host_ptr(&self, buffer: BufferHandle) -> Result<Option<NonNull<u8>>> {
        Ok(self.device.buffer(buffer)?.storage.host_ptr())
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Result<usize> {
        Ok(self.device.buffer(buffer)?.size())
    }

    fn device_address(&self, buffer: BufferHandle) -> Result<Option<u64>> {
        let buffer = self.device.buffer(buffer)?;
        Ok(self.device.config.native_addresses.then_some(buffer.address))
    }

    fn map_buffer(
        &self,
        queue: QueueHandle,
        buffer: BufferHandle,
        flags: MapFlags,
        offset: usize,
        size: usize,
    ) -> Result<NonNull<u8>> {
        if flags.is_empty() {
            return Err(BackendError::invalid_value("map flags must request access"));
        }
        let buffer = self.device.buffer(buffer)?;
        buffer.storage.check(offset, size)?;
        self.finish(queue)?;
        buffer.maps.fetch_add(1, Ordering::AcqRel);
        Ok(buffer.storage.at(offset))
    }

    fn unmap_buffer(&self, queue: QueueHandle, buffer: BufferHandle, mapped: NonNull<u8>) -> Result<()> {
        let buffer = self.device.buffer(buffer)?;
        let base = buffer.storage.at(0).as_ptr() as usize;
        let addr = mapped.as_ptr() as usize;
        if addr < base || addr > base + buffer.size() {
            return Err(BackendError::invalid_value("pointer was not mapped from this buffer"));
        }
        let previous = buffer
            .maps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |maps| maps.checked_sub(1));
        if previous.is_err() {
            return Err(BackendError::invalid_value("buffer is not mapped"));
        }
        self.device.with_queue(queue, |_| Ok(()))
    }

    fn create_queue(&self, priority: QueuePriority) -> Result<QueueHandle> {
        let id = self.device.next_id();
        let queue = SimQueue::spawn(id, priority, self.device.config.command_latency)?;
        self.device.queues.write().insert(id, queue);
        Ok(QueueHandle::new(id))
    }

    fn release_queue(&self, queue: QueueHandle) -> Result<()> {
        let removed = self
            .device
            .queues
            .write()
            .remove(&queue.id())
            .ok_or(BackendError::InvalidQueueHandle(queue.id()))?;
        tracing::trace!(%queue, priority = ?removed.priority, "sim queue released");
        removed.shutdown();
        Ok(())
    }

    fn flush(&self, queue: QueueHandle) -> Result<()> {
        // Commands reach the worker on submission.
        self.device.with_queue(queue, |_| Ok(()))?;
        if self.device.config.reject_flush {
            return Err(BackendError::Native {
                call: "flush",
                code: codes::OUT_OF_RESOURCES,
            });
        }
        Ok(())
    }

    fn finish(&self, queue: QueueHandle) -> Result<()> {
        let marker = self.device.with_queue(queue, |q| q.marker())?;
        marker.wait();
        Ok(())
    }

    unsafe fn enqueue_write(
        &self,
        queue: QueueHandle,
        buffer: BufferHandle,
        blocking: bool,
        offset: usize,
        src: *const u8,
        len: usize,
    ) -> Result<()> {
        if src.is_null() {
            return Err(BackendError::invalid_value("null host pointer"));
        }
        let buffer = self.device.buffer(buffer)?;
        buffer.storage.check(offset, len)?;
        let command = Command::Write {
            buffer,
            offset,
            src: HostPtr(src),
            len,
        };
        if blocking {
            self.device.submit_blocking(queue, command)
        } else {
            self.device.submit(queue, command)
        }
    }

    unsafe fn enqueue_read(
        &self,
        queue: QueueHandle,
        buffer: BufferHandle,
        blocking: bool,
        offset: usize,
        dst: *mut u8,
        len: usize,
    ) -> Result<()> {
        if dst.is_null() {
            return Err(BackendError::invalid_value("null host pointer"));
        }
        if !blocking && self.device.config.reject_async_reads {
            return Err(BackendError::Native {
                call: "enqueue_read",
                code: codes::OUT_OF_RESOURCES,
            });
        }
        let buffer = self.device.buffer(buffer)?;
        buffer.storage.check(offset, len)?;
        let command = Command::Read {
            buffer,
            offset,
            dst: HostPtrMut(dst),
            len,
        };
        if blocking {
            self.device.submit_blocking(queue, command)
        } else {
            self.device.submit(queue, command)
        }
    }

    fn enqueue_copy(
        &self,
        queue: QueueHandle,
        src: BufferHandle,
        dst: BufferHandle,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    ) -> Result<()> {
        let src = self.device.buffer(src)?;
        let dst = self.device.buffer(dst)?;
        src.storage.check(src_offset, len)?;
        dst.storage.check(dst_offset, len)?;
        if Arc::ptr_eq(&src, &dst) && src_offset.abs_diff(dst_offset) < len {
            return Err(BackendError::Native {
                call: "enqueue_copy",
                code: codes::MEM_COPY_OVERLAP,
            });
        }
        self.device.submit(
            queue,
            Command::Copy {
                src,
                dst,
                src_offset,
                dst_offset,
                len,
            },
        )
    }

    fn enqueue_fill(
        &self,
        queue: QueueHandle,
        buffer: BufferHandle,
        pattern: &[u8],
        offset: usize,
        len: usize,
    ) -> Result<()> {
        if !matches!(pattern.len(), 1 | 2 | 4 | 8 | 16 | 32 | 64 | 128) {
            return Err(BackendError::invalid_value(format!("pattern size {}", pattern.len())));
        }
        if offset % pattern.len() != 0 || len % pattern.len() != 0 {
            return Err(BackendError::invalid_value("offset and size must be multiples of the pattern size"));
        }
        let buffer = self.device.buffer(buffer)?;
        buffer.storage.check(offset, len)?;
        self.device.submit(
            queue,
            Command::Fill {
                buffer,
                pattern: pattern.to_vec(),
                offset,
                len,
            },
        )
    }

    fn build_kernel(&self, source: &str, name: &str, build_flags: Option<&str>) -> Result<KernelHandle> {
        let builtin = Builtin::from_source(source, name)?;
        let id = self.device.next_id();
        self.device
            .kernels
            .write()
            .insert(id, Arc::new(SimKernel::new(name, builtin)));
        tracing::debug!(kernel = name, flags = build_flags.unwrap_or(""), "sim kernel built");
        Ok(KernelHandle::new(id))
    }

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, arg: KernelArg) -> Result<()> {
        let kernel = self
            .device
            .kernels
            .read()
            .get(&kernel.id())
            .cloned()
            .ok_or(BackendError::InvalidKernelHandle(kernel.id()))?;
        kernel.set_arg(index, arg)
    }

    fn enqueue_kernel(&self, queue: QueueHandle, kernel: KernelHandle, range: NdRange) -> Result<()> {
        let kernel = self
            .device
            .kernels
            .read()
            .get(&kernel.id())
            .cloned()
            .ok_or(BackendError::InvalidKernelHandle(kernel.id()))?;
        let launch = kernel.prepare(range, |handle| self.device.buffer(handle))?;
        tracing::trace!(kernel = %kernel.name, ?range, "sim kernel enqueued");
        self.device.submit(queue, Command::Kernel(launch))
    }

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()> {
        self.device
            .kernels
            .write()
            .remove(&kernel.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidKernelHandle(kernel.id()))
    }

    fn enqueue_marker(&self, queue: QueueHandle) -> Result<EventHandle> {
        let event = self.device.with_queue(queue, |q| q.marker())?;
        let id = self.device.next_id();
        self.device.events.lock().insert(id, event);
        Ok(EventHandle::new(id))
    }

    fn enqueue_barrier(&self, queue: QueueHandle, wait_list: &[EventHandle]) -> Result<()> {
        let events = wait_list
            .iter()
            .map(|event| self.device.event(*event))
            .collect::<Result<Vec<_>>>()?;
        self.device.submit(queue, Command::Barrier(events))
    }

    fn event_status(&self, event: EventHandle) -> Result<EventStatus> {
        Ok(self.device.event(event)?.status())
    }

    fn wait_for_events(&self, events: &[EventHandle]) -> Result<()> {
        let events = events
            .iter()
            .map(|event| self.device.event(*event))
            .collect::<Result<Vec<_>>>()?;
        for event in events {
            event.wait();
        }
        Ok(())
    }

    fn release_event(&self, event: EventHandle) -> Result<()> {
        self.device
            .events
            .lock()
            .remove(&event.id())
            .map(|_| ())
            .ok_or(BackendError::InvalidEventHandle(event.id()))
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(config: SimConfig) -> (SimBackend, QueueHandle) {
        let backend = SimBackend::with_config(config);
        let queue = backend.create_queue(QueuePriority::Normal).unwrap();
        (backend, queue)
    }

    #[test]
    fn write_then_read_round_trip() {
        let (backend, queue) = setup(SimConfig::default());
        let buffer = backend.create_buffer(MemFlags::READ_WRITE, 64).unwrap();
        let data: Vec<u8> = (0..32).collect();
        let mut out = vec![0u8; 32];
        unsafe {
            backend.enqueue_write(queue, buffer, false, 16, data.as_ptr(), 32).unwrap();
            backend.enqueue_read(queue, buffer, true, 16, out.as_mut_ptr(), 32).unwrap();
        }
        assert_eq!(out, data);
    }

    #[test]
    fn addresses_hidden_unless_native() {
        let (backend, _) = setup(SimConfig::default());
        let buffer = backend.create_buffer(MemFlags::READ_WRITE, 8).unwrap();
        assert_eq!(backend.device_address(buffer).unwrap(), None);

        let (native, _) = setup(SimConfig {
            native_addresses: true,
            ..SimConfig::default()
        });
        let buffer = native.create_buffer(MemFlags::READ_WRITE, 8).unwrap();
        assert_eq!(native.device_address(buffer).unwrap(), Some(native.peek_address(buffer).unwrap()));
    }

    #[test]
    fn memptr_kernel_writes_address() {
        let (backend, queue) = setup(SimConfig::default());
        let buffer = backend.create_buffer(MemFlags::READ_WRITE, 16).unwrap();
        let kernel = backend
            .build_kernel("kernel void memptr(global ulong* ptr, ulong offset) {}", "memptr", None)
            .unwrap();
        backend.set_kernel_arg(kernel, 0, KernelArg::Buffer(buffer)).unwrap();
        backend.set_kernel_arg(kernel, 1, KernelArg::U64(5)).unwrap();
        backend.enqueue_kernel(queue, kernel, NdRange::linear(1)).unwrap();

        let mut word = [0u8; 8];
        unsafe { backend.enqueue_read(queue, buffer, true, 0, word.as_mut_ptr(), 8).unwrap() };
        assert_eq!(u64::from_le_bytes(word), backend.peek_address(buffer).unwrap() + 5);
    }

    #[test]
    fn memptr_kernel_rejects_short_buffer() {
        let (backend, queue) = setup(SimConfig::default());
        let buffer = backend.create_buffer(MemFlags::READ_WRITE, 4).unwrap();
        let kernel = backend
            .build_kernel("kernel void memptr(global ulong* ptr, ulong offset) {}", "memptr", None)
            .unwrap();
        backend.set_kernel_arg(kernel, 0, KernelArg::Buffer(buffer)).unwrap();
        backend.set_kernel_arg(kernel, 1, KernelArg::U64(0)).unwrap();
        assert!(matches!(
            backend.enqueue_kernel(queue, kernel, NdRange::linear(1)),
            Err(BackendError::BufferOutOfBounds { .. })
        ));
    }

    #[test]
    fn placement_hint_rejection_is_counted() {
        let (backend, _) = setup(SimConfig {
            reject_placement_hint: true,
            ..SimConfig::intel(0x4905)
        });
        assert!(backend
            .create_buffer(MemFlags::READ_WRITE | MemFlags::PLACEMENT_HINT, 64)
            .is_err());
        assert!(backend.create_buffer(MemFlags::READ_WRITE, 64).is_ok());
        assert_eq!(backend.hint_rejections(), 1);
    }

    #[test]
    fn svm_backed_buffer_shares_host_memory() {
        let (backend, queue) = setup(SimConfig {
            svm: true,
            ..SimConfig::default()
        });
        assert!(backend.device_info().svm);

        let host = backend.svm_alloc(MemFlags::READ_WRITE, 32, 0).unwrap();
        let buffer = unsafe { backend.create_buffer_from_host(MemFlags::USE_HOST_PTR, 32, host) }.unwrap();
        assert_eq!(backend.buffer_host_ptr(buffer).unwrap(), Some(host));

        backend.enqueue_fill(queue, buffer, &[5], 0, 32).unwrap();
        backend.finish(queue).unwrap();
        assert_eq!(unsafe { *host.as_ptr() }, 5);

        backend.release_buffer(buffer).unwrap();
        unsafe { backend.svm_free(host) }.unwrap();
        assert_eq!(backend.live_svm(), 0);
    }

    #[test]
    fn svm_unavailable_or_refused() {
        let (plain, _) = setup(SimConfig::default());
        assert!(!plain.device_info().svm);
        assert!(matches!(
            plain.svm_alloc(MemFlags::READ_WRITE, 32, 0),
            Err(BackendError::UnsupportedOperation(_))
        ));
        let plain_buffer = plain.create_buffer(MemFlags::READ_WRITE, 32).unwrap();
        assert_eq!(plain.buffer_host_ptr(plain_buffer).unwrap(), None);

        let (refusing, _) = setup(SimConfig {
            reject_svm_alloc: true,
            ..SimConfig::default()
        });
        assert!(refusing.device_info().svm);
        assert!(matches!(
            refusing.svm_alloc(MemFlags::READ_WRITE, 32, 0),
            Err(BackendError::AllocationFailed { size: 32, .. })
        ));
    }

    #[test]
    fn map_and_unmap() {
        let (backend, queue) = setup(SimConfig::default());
        let buffer = backend.create_buffer(MemFlags::READ_WRITE | MemFlags::ALLOC_HOST_PTR, 32).unwrap();
        let mapped = backend
            .map_buffer(queue, buffer, MapFlags::READ | MapFlags::WRITE, 0, 32)
            .unwrap();
        unsafe { std::ptr::write_bytes(mapped.as_ptr(), 0x5A, 32) };
        backend.unmap_buffer(queue, buffer, mapped).unwrap();
        assert!(backend.unmap_buffer(queue, buffer, mapped).is_err());

        let mut out = [0u8; 32];
        unsafe { backend.enqueue_read(queue, buffer, true, 0, out.as_mut_ptr(), 32).unwrap() };
        assert_eq!(out, [0x5A; 32]);
    }

    #[test]
    fn events_and_barriers() {
        let (backend, queue) = setup(SimConfig {
            command_latency: Some(Duration::from_millis(5)),
            ..SimConfig::default()
        });
        let other = backend.create_queue(QueuePriority::High).unwrap();
        let event = backend.enqueue_marker(queue).unwrap();
        backend.enqueue_barrier(other, &[event]).unwrap();
        backend.finish(other).unwrap();
        assert_eq!(backend.event_status(event).unwrap(), EventStatus::Complete);
        backend.release_event(event).unwrap();
        assert!(backend.event_status(event).is_err());
        assert_eq!(backend.live_events(), 0);
    }

    #[test]
    fn release_drains_queue() {
        let (backend, queue) = setup(SimConfig::default());
        let buffer = backend.create_buffer(MemFlags::READ_WRITE, 8).unwrap();
        backend.enqueue_fill(queue, buffer, &[1, 2], 0, 8).unwrap();
        backend.release_queue(queue).unwrap();
        assert_eq!(backend.live_queues(), 0);
        assert!(backend.finish(queue).is_err());
    }

    #[test]
    fn fill_rejects_misaligned_pattern() {
        let (backend, queue) = setup(SimConfig::default());
        let buffer = backend.create_buffer(MemFlags::READ_WRITE, 8).unwrap();
        assert!(backend.enqueue_fill(queue, buffer, &[0; 4], 0, 6).is_err());
        assert!(backend.enqueue_fill(queue, buffer, &[0; 3], 0, 6).is_err());
    }
}
