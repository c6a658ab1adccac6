//! Host and device allocation
//!
//! Device allocations are registered by device address so that any interior
//! address can later be traced back to its buffer. Host allocations are
//! pinned, mapped buffers handed out as [`HostBuffer`]s and never registered.
//!
//! On devices with shared virtual memory both kinds are created over an SVM
//! allocation. The first refused SVM allocation turns that off for the device
//! and later allocations take the plain path.

use crate::context::Context;
use crate::device::DeviceConfig;
use crate::error::{Error, Result};
use crate::host::{host_alignment, HostBuffer};
use crate::ptr::DevicePtr;
use crate::registry::{MemoryInfo, Registry, Resolved};
use crate::resolve::{AddressResolver, MIN_BUFFER_SIZE};
use crate::stream::StreamId;
use accel_backends::{BufferHandle, MapFlags, MemFlags};
use accel_tracing::performance::record_allocation;
use std::ptr::NonNull;
use std::time::Instant;

/// Everything behind the memory lock
#[derive(Debug)]
pub(crate) struct MemoryState {
    pub(crate) registry: Registry,
    pub(crate) resolver: AddressResolver,
}

impl MemoryState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            registry: Registry::new(capacity),
            resolver: AddressResolver::default(),
        }
    }
}

/// Device memory totals in bytes, capped by what the host can back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub free: u64,
    pub total: u64,
}

impl Context {
    /// Allocate `nbytes` of pinned host memory.
    ///
    /// The mapping happens on `stream`'s queue; on the default queue the call
    /// also waits for it to finish.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn host_alloc(&self, nbytes: usize, stream: Option<StreamId>) -> Result<HostBuffer> {
        if nbytes == 0 {
            return Err(Error::invalid_argument("host allocation of zero bytes"));
        }
        let start = Instant::now();
        let device = self.device()?;
        let backend = device.backend();
        let alignment = host_alignment(nbytes);
        let alloc_size = nbytes
            .checked_add(alignment - 1)
            .ok_or_else(|| Error::allocation_failed(nbytes, "size overflow"))?;
        let target = self.queue_for(&device, stream)?;

        let (buffer, svm) = create_backed_buffer(
            &device,
            MemFlags::READ_WRITE | MemFlags::ALLOC_HOST_PTR,
            alloc_size,
            std::mem::size_of::<usize>(),
            self.config.verbosity,
        )
        .map_err(|err| Error::allocation_failed(nbytes, err))?;
        let mapped = match backend.map_buffer(target.queue, buffer, MapFlags::READ | MapFlags::WRITE, 0, alloc_size) {
            Ok(mapped) => mapped,
            Err(err) => {
                release_quietly(&device, buffer, svm);
                return Err(Error::allocation_failed(nbytes, err));
            }
        };
        if let Err(err) = self.finish_default(&device, target) {
            if let Err(unmap) = backend.unmap_buffer(target.queue, buffer, mapped) {
                tracing::warn!(%buffer, error = %unmap, "failed to unmap");
            }
            release_quietly(&device, buffer, svm);
            return Err(Error::allocation_failed(nbytes, err));
        }

        let host = HostBuffer::new(device.id(), buffer, mapped, nbytes, alignment).with_svm(svm);
        record_allocation(nbytes, alloc_size, alignment, "host", start.elapsed().as_micros() as u64);
        Ok(host)
    }

    /// Unmap and release a host allocation.
    ///
    /// Every step is attempted even when an earlier one fails; the first
    /// failure is reported.
    pub fn host_free(&self, host: HostBuffer, stream: Option<StreamId>) -> Result<()> {
        let device = self.device()?;
        if host.device != device.id() {
            return Err(Error::invalid_argument(format!(
                "host buffer belongs to device {}, active device is {}",
                host.device,
                device.id()
            )));
        }
        let backend = device.backend();
        let target = self.queue_for(&device, stream)?;
        let unmapped = backend.unmap_buffer(target.queue, host.buffer, host.mapped).map_err(Error::from);
        let released = backend.release_buffer(host.buffer).map_err(Error::from);
        let freed = match host.svm {
            // SAFETY: the buffer over this allocation was released above
            Some(ptr) => unsafe { backend.svm_free(ptr) }.map_err(Error::from),
            None => Ok(()),
        };
        let finished = self.finish_default(&device, target);
        for step in [&unmapped, &released, &freed] {
            if let Err(err) = step {
                tracing::warn!(buffer = %host.buffer, error = %err, "host free step failed");
            }
        }
        unmapped.and(released).and(freed).and(finished)
    }

    /// Allocate `nbytes` of device memory and return its device address
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn dev_mem_alloc(&self, nbytes: usize) -> Result<DevicePtr> {
        if nbytes == 0 {
            return Err(Error::invalid_argument("device allocation of zero bytes"));
        }
        let start = Instant::now();
        let device = self.device()?;
        let native_size = nbytes.max(MIN_BUFFER_SIZE);
        let (buffer, svm) = create_device_buffer(&device, native_size, self.config.verbosity)
            .map_err(|err| Error::allocation_failed(nbytes, err))?;

        match self.register(&device, buffer, nbytes, native_size) {
            Ok(ptr) => {
                record_allocation(nbytes, native_size, 0, "device", start.elapsed().as_micros() as u64);
                tracing::debug!(%ptr, %buffer, bytes = nbytes, "device allocation");
                Ok(ptr)
            }
            Err(err) => {
                release_quietly(&device, buffer, svm);
                Err(err)
            }
        }
    }

    /// Resolve the new buffer's address and record it
    fn register(&self, device: &DeviceConfig, buffer: BufferHandle, nbytes: usize, native_size: usize) -> Result<DevicePtr> {
        let target = self.queue_for(device, None)?;
        let mut memory = self.memory.lock();
        let ptr = memory.resolver.resolve(device.backend(), target.queue, buffer, 0)?;
        memory.registry.insert(MemoryInfo {
            buffer,
            address: ptr,
            size: native_size,
        })?;

        if cfg!(debug_assertions) {
            let middle = memory.registry.lookup(ptr.byte_add(nbytes / 2), 1, None);
            let consistent = middle.is_some_and(|hit| hit.info.buffer == buffer && hit.offset == nbytes / 2);
            if !consistent {
                let _ = memory.registry.remove(ptr);
                return Err(Error::InvalidPointer {
                    ptr: ptr.byte_add(nbytes / 2),
                });
            }
        }
        Ok(ptr)
    }

    /// Free a device allocation by its base address. Null is a no-op.
    pub fn dev_mem_free(&self, ptr: DevicePtr) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        let device = self.device()?;
        let info = self.memory.lock().registry.remove(ptr)?;
        release_device_buffer(&device, info.buffer)?;
        tracing::debug!(%ptr, buffer = %info.buffer, "device free");
        Ok(())
    }

    /// Free and total device memory.
    ///
    /// Both are capped by the host's physical and available memory.
    pub fn dev_mem_info(&self) -> Result<MemInfo> {
        let device = self.device()?;
        Ok(cap_by_host(
            device.info().global_mem_size,
            device.backend().available_memory(),
            host_memory(),
        ))
    }

    /// Interior pointer `offset` bytes past `base`
    pub fn dev_mem_set_ptr(&self, base: DevicePtr, offset: usize) -> Result<DevicePtr> {
        if base.is_null() && offset != 0 {
            return Err(Error::invalid_argument("offset from a null device pointer"));
        }
        Ok(base.byte_add(offset))
    }

    /// Allocation containing `ptr`, with the offset in `elsize` units
    pub fn lookup(&self, ptr: DevicePtr, elsize: usize) -> Option<Resolved> {
        self.memory.lock().registry.lookup(ptr, elsize, None)
    }

    /// Snapshot of the live device allocations
    pub fn live_allocations(&self) -> Vec<MemoryInfo> {
        self.memory.lock().registry.entries()
    }

    /// Snapshot of the allocation covering `nbytes` at `ptr`
    pub(crate) fn resolve_range(&self, ptr: DevicePtr, nbytes: usize) -> Result<Resolved> {
        self.memory
            .lock()
            .registry
            .lookup(ptr, 1, Some(nbytes))
            .ok_or(Error::InvalidPointer { ptr })
    }
}

type Backed = (BufferHandle, Option<NonNull<u8>>);

/// Create the native buffer, trying the placement hint first when the
/// device wants it
fn create_device_buffer(device: &DeviceConfig, size: usize, verbosity: u32) -> accel_backends::Result<Backed> {
    if device.placement_hint() {
        match create_backed_buffer(device, MemFlags::READ_WRITE | MemFlags::PLACEMENT_HINT, size, 0, verbosity) {
            Ok(backed) => return Ok(backed),
            Err(err) if verbosity >= 2 => {
                tracing::warn!(bytes = size, error = %err, "placement hint refused, retrying without")
            }
            Err(err) => tracing::debug!(bytes = size, error = %err, "placement hint refused, retrying without"),
        }
    }
    create_backed_buffer(device, MemFlags::READ_WRITE, size, 0, verbosity)
}

/// Create a buffer over fresh shared virtual memory while the device allows
/// it, otherwise a plain one with `flags`.
///
/// A refused SVM allocation without the placement hint disables SVM for the
/// device. A refusal with the hint is returned so the caller can retry.
fn create_backed_buffer(
    device: &DeviceConfig,
    flags: MemFlags,
    size: usize,
    alignment: usize,
    verbosity: u32,
) -> accel_backends::Result<Backed> {
    let backend = device.backend();
    if device.svm_interop() {
        let shared = (flags - MemFlags::ALLOC_HOST_PTR) | MemFlags::USE_HOST_PTR;
        match backend.svm_alloc(flags - MemFlags::ALLOC_HOST_PTR, size, alignment) {
            Ok(ptr) => {
                // SAFETY: `ptr` spans `size` bytes and is freed only after the buffer
                return match unsafe { backend.create_buffer_from_host(shared, size, ptr) } {
                    Ok(buffer) => Ok((buffer, Some(ptr))),
                    Err(err) => {
                        free_svm_quietly(device, ptr);
                        Err(err)
                    }
                };
            }
            Err(err) if flags.contains(MemFlags::PLACEMENT_HINT) => return Err(err),
            Err(err) => {
                if device.disable_svm_interop() {
                    if verbosity >= 1 {
                        tracing::warn!(bytes = size, error = %err, "svm allocation refused, disabling svm interop");
                    } else {
                        tracing::debug!(bytes = size, error = %err, "svm allocation refused, disabling svm interop");
                    }
                }
            }
        }
    }
    backend.create_buffer(flags, size).map(|buffer| (buffer, None))
}

/// Release a device buffer and the shared virtual memory under it
pub(crate) fn release_device_buffer(device: &DeviceConfig, buffer: BufferHandle) -> Result<()> {
    let backend = device.backend();
    let svm = backend.buffer_host_ptr(buffer)?;
    backend.release_buffer(buffer)?;
    if let Some(ptr) = svm {
        // SAFETY: the only buffer over `ptr` was released above
        unsafe { backend.svm_free(ptr)? };
    }
    Ok(())
}

fn release_quietly(device: &DeviceConfig, buffer: BufferHandle, svm: Option<NonNull<u8>>) {
    if let Err(err) = device.backend().release_buffer(buffer) {
        tracing::warn!(%buffer, error = %err, "failed to release buffer while unwinding");
    }
    if let Some(ptr) = svm {
        free_svm_quietly(device, ptr);
    }
}

fn free_svm_quietly(device: &DeviceConfig, ptr: NonNull<u8>) {
    // SAFETY: no live buffer uses `ptr`
    if let Err(err) = unsafe { device.backend().svm_free(ptr) } {
        tracing::warn!(ptr = ?ptr, error = %err, "failed to free svm while unwinding");
    }
}

/// Host memory as (physical, available) bytes, if the platform reports it
fn host_memory() -> Option<(u64, u64)> {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let total = system.total_memory();
    (total != 0).then(|| (total, system.available_memory()))
}

fn cap_by_host(device_total: u64, device_free: Option<u64>, host: Option<(u64, u64)>) -> MemInfo {
    let (host_total, host_free) = host.unwrap_or((u64::MAX, u64::MAX));
    let total = device_total.min(host_total);
    let free = device_free.unwrap_or(total).min(host_free).min(total);
    MemInfo { free, total }
}
