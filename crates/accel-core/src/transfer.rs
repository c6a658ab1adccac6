//! Transfers between host memory and device allocations
//!
//! Every transfer names device memory by flat address. The address is
//! resolved to `(buffer, offset)` through the registry, the registry lock is
//! dropped, and the native command is enqueued on the chosen queue:
//!
//! ```text
//!   DevicePtr ─► registry.lookup ─► (buffer, offset) ─► enqueue_* ─► finish?
//! ```
//!
//! On the default queue (`stream == None`) every transfer completes before
//! returning. On an explicit stream, host-to-device writes and
//! device-to-host reads are non-blocking when enabled by `async_flags`,
//! while device-side copies and fills are always asynchronous.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::ptr::DevicePtr;
use crate::stream::StreamId;
use accel_backends::{KernelArg, NdRange};
use accel_tracing::performance::{record_transfer, Direction};
use std::sync::atomic::Ordering;
use std::time::Instant;

impl Context {
    /// Copy `nbytes` from host memory into device memory at `dst`.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of `nbytes` bytes until the copy has
    /// completed: until return on the default queue, otherwise until `stream`
    /// has been synchronized.
    pub unsafe fn memcpy_h2d(&self, src: *const u8, dst: DevicePtr, nbytes: usize, stream: Option<StreamId>) -> Result<()> {
        if nbytes == 0 {
            return Ok(());
        }
        if src.is_null() {
            return Err(Error::invalid_argument("null host source"));
        }
        let start = Instant::now();
        let device = self.device()?;
        let target_range = self.resolve_range(dst, nbytes)?;
        let target = self.queue_for(&device, stream)?;
        let blocking = target.default || !self.config.async_h2d();

        device.backend().enqueue_write(
            target.queue,
            target_range.info.buffer,
            blocking,
            target_range.offset,
            src,
            nbytes,
        )?;
        self.finish_default(&device, target)?;
        record_transfer(nbytes, Direction::HostToDevice, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Copy `nbytes` from device memory at `src` into host memory.
    ///
    /// If the device refuses a non-blocking read the copy is retried as a
    /// blocking one and later reads on this context stay blocking.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `nbytes` bytes and left untouched
    /// until the copy has completed (see [`Context::memcpy_h2d`]).
    pub unsafe fn memcpy_d2h(&self, src: DevicePtr, dst: *mut u8, nbytes: usize, stream: Option<StreamId>) -> Result<()> {
        if nbytes == 0 {
            return Ok(());
        }
        if dst.is_null() {
            return Err(Error::invalid_argument("null host destination"));
        }
        let start = Instant::now();
        let device = self.device()?;
        let backend = device.backend();
        let source = self.resolve_range(src, nbytes)?;
        let target = self.queue_for(&device, stream)?;
        let blocking = target.default || !self.async_d2h.load(Ordering::Relaxed);

        let read = backend.enqueue_read(target.queue, source.info.buffer, blocking, source.offset, dst, nbytes);
        match read {
            Ok(()) => {}
            Err(err) if !blocking && self.config.readback_fallback => {
                backend.enqueue_read(target.queue, source.info.buffer, true, source.offset, dst, nbytes)?;
                self.async_d2h.store(false, Ordering::Relaxed);
                if self.config.verbosity >= 1 {
                    tracing::warn!(error = %err, "non-blocking read refused; reads are now blocking");
                } else {
                    tracing::debug!(error = %err, "non-blocking read refused; reads are now blocking");
                }
            }
            Err(err) => return Err(err.into()),
        }
        self.finish_default(&device, target)?;
        record_transfer(nbytes, Direction::DeviceToHost, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Copy `nbytes` between two device allocations
    pub fn memcpy_d2d(&self, src: DevicePtr, dst: DevicePtr, nbytes: usize, stream: Option<StreamId>) -> Result<()> {
        if nbytes == 0 {
            return Ok(());
        }
        let start = Instant::now();
        let device = self.device()?;
        let backend = device.backend();
        let source = self.resolve_range(src, nbytes)?;
        let destination = self.resolve_range(dst, nbytes)?;
        let target = self.queue_for(&device, stream)?;

        if device.memcpy_kernel() {
            let mut slot = self.memcpy.lock();
            let kernel = slot.get_or_build(backend)?;
            backend.set_kernel_arg(kernel, 0, KernelArg::Buffer(source.info.buffer))?;
            backend.set_kernel_arg(kernel, 1, KernelArg::U64(source.offset as u64))?;
            backend.set_kernel_arg(kernel, 2, KernelArg::Buffer(destination.info.buffer))?;
            backend.set_kernel_arg(kernel, 3, KernelArg::U64(destination.offset as u64))?;
            backend.enqueue_kernel(target.queue, kernel, NdRange::linear(nbytes))?;
        } else {
            backend.enqueue_copy(
                target.queue,
                source.info.buffer,
                destination.info.buffer,
                source.offset,
                destination.offset,
                nbytes,
            )?;
        }
        self.finish_default(&device, target)?;
        record_transfer(nbytes, Direction::DeviceToDevice, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Set `nbytes` starting `offset` bytes past `ptr` to `value`.
    ///
    /// `ptr + offset` must lie in the same allocation as `ptr`.
    pub fn memset(&self, ptr: DevicePtr, value: u8, offset: usize, nbytes: usize, stream: Option<StreamId>) -> Result<()> {
        if nbytes == 0 {
            return Ok(());
        }
        let start = Instant::now();
        let device = self.device()?;
        let backend = device.backend();
        let resolved = self.resolve_range(ptr.byte_add(offset), nbytes)?;
        if resolved.offset < offset {
            return Err(Error::InvalidRange {
                ptr,
                offset,
                resolved: resolved.offset,
            });
        }
        let target = self.queue_for(&device, stream)?;

        if device.memset_kernel() {
            let mut slot = self.memset.lock();
            let kernel = slot.get_or_build(backend)?;
            backend.set_kernel_arg(kernel, 0, KernelArg::Buffer(resolved.info.buffer))?;
            backend.set_kernel_arg(kernel, 1, KernelArg::U8(value))?;
            backend.enqueue_kernel(target.queue, kernel, NdRange::with_offset(resolved.offset, nbytes))?;
        } else {
            let width = fill_width(resolved.offset, nbytes);
            let pattern = [value; 4];
            accel_tracing::perf_event!("fill", bytes = nbytes, pattern = width, offset = resolved.offset);
            backend.enqueue_fill(target.queue, resolved.info.buffer, &pattern[..width], resolved.offset, nbytes)?;
        }
        self.finish_default(&device, target)?;
        record_transfer(nbytes, Direction::Fill, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// [`Context::memset`] with zero
    pub fn memset_zero(&self, ptr: DevicePtr, offset: usize, nbytes: usize, stream: Option<StreamId>) -> Result<()> {
        self.memset(ptr, 0, offset, nbytes, stream)
    }

    /// Blocking copy of `src` to device memory at `dst`
    pub fn copy_to_device(&self, src: &[u8], dst: DevicePtr) -> Result<()> {
        // SAFETY: the default queue completes the copy before returning.
        unsafe { self.memcpy_h2d(src.as_ptr(), dst, src.len(), None) }
    }

    /// Blocking copy of device memory at `src` into `dst`
    pub fn copy_from_device(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        // SAFETY: as above.
        unsafe { self.memcpy_d2h(src, dst.as_mut_ptr(), dst.len(), None) }
    }

    /// Blocking typed upload
    pub fn write_slice<T: bytemuck::Pod>(&self, dst: DevicePtr, values: &[T]) -> Result<()> {
        self.copy_to_device(bytemuck::cast_slice(values), dst)
    }

    /// Blocking typed download
    pub fn read_slice<T: bytemuck::Pod>(&self, src: DevicePtr, values: &mut [T]) -> Result<()> {
        self.copy_from_device(src, bytemuck::cast_slice_mut(values))
    }
}

/// Widest fill pattern (4, 2 or 1 bytes) that divides both the offset and
/// the length
fn fill_width(offset: usize, nbytes: usize) -> usize {
    [4, 2]
        .into_iter()
        .find(|width| offset % width == 0 && nbytes % width == 0)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::fill_width;
    use crate::config::{ASYNC_D2H, ASYNC_H2D, DEVCOPY_MEMCPY, DEVCOPY_MEMSET};
    use crate::{AccConfig, Context, Error};
    use accel_backends::{DeviceQuirks, SimBackend, SimConfig};

    fn context_with(config: AccConfig, sim: SimConfig) -> (SimBackend, Context) {
        let sim = SimBackend::with_config(sim);
        let context = Context::with_device(config, sim.clone()).unwrap();
        (sim, context)
    }

    fn context() -> (SimBackend, Context) {
        context_with(AccConfig::for_testing(), SimConfig::default())
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn round_trip_sizes() {
        let (_, context) = context();
        for n in [1, 8, 4096, 2_097_155] {
            let ptr = context.dev_mem_alloc(n).unwrap();
            let data = pattern(n);
            context.copy_to_device(&data, ptr).unwrap();
            let mut back = vec![0u8; n];
            context.copy_from_device(ptr, &mut back).unwrap();
            assert!(back == data, "round trip of {n} bytes");
            context.dev_mem_free(ptr).unwrap();
        }
    }

    #[test]
    fn interior_pointers_address_the_right_bytes() {
        let (_, context) = context();
        let ptr = context.dev_mem_alloc(64).unwrap();
        context.copy_to_device(&pattern(64), ptr).unwrap();

        let mut tail = [0u8; 16];
        context.copy_from_device(ptr.byte_add(48), &mut tail).unwrap();
        assert_eq!(&tail[..], &pattern(64)[48..]);
    }

    #[test]
    fn zero_length_is_a_no_op() {
        let (_, context) = context();
        let bogus = crate::DevicePtr::new(0xdead_0000);
        context.copy_to_device(&[], bogus).unwrap();
        context.memset_zero(bogus, 0, 0, None).unwrap();
        context.memcpy_d2d(bogus, bogus, 0, None).unwrap();
    }

    #[test]
    fn unknown_pointer_is_reported() {
        let (_, context) = context();
        let bogus = crate::DevicePtr::new(0xdead_0000);
        assert!(matches!(
            context.copy_to_device(&[1, 2, 3], bogus),
            Err(Error::InvalidPointer { ptr }) if ptr == bogus
        ));
    }

    #[test]
    fn typed_slices() {
        let (_, context) = context();
        let values: Vec<f32> = (0..256).map(|i| i as f32 * 0.5).collect();
        let ptr = context.dev_mem_alloc(values.len() * 4).unwrap();
        context.write_slice(ptr, &values).unwrap();
        let mut back = vec![0f32; 256];
        context.read_slice(ptr, &mut back).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn memset_zero_sizes() {
        let (_, context) = context();
        for n in [1, 3, 4, 4097] {
            let ptr = context.dev_mem_alloc(n).unwrap();
            context.copy_to_device(&vec![0xff; n], ptr).unwrap();
            context.memset_zero(ptr, 0, n, None).unwrap();
            let mut back = vec![0xffu8; n];
            context.copy_from_device(ptr, &mut back).unwrap();
            assert!(back.iter().all(|&b| b == 0), "{n}");
        }
    }

    #[test]
    fn memset_with_offset_leaves_the_prefix() {
        let (_, context) = context();
        let ptr = context.dev_mem_alloc(32).unwrap();
        context.copy_to_device(&[1u8; 32], ptr).unwrap();
        context.memset(ptr, 7, 5, 11, None).unwrap();

        let mut back = [0u8; 32];
        context.copy_from_device(ptr, &mut back).unwrap();
        assert_eq!(&back[..5], &[1; 5]);
        assert_eq!(&back[5..16], &[7; 11]);
        assert_eq!(&back[16..], &[1; 16]);
    }

    #[test]
    fn memset_offset_may_not_cross_into_the_next_allocation() {
        let (_, context) = context();
        let first = context.dev_mem_alloc(256).unwrap();
        let second = context.dev_mem_alloc(256).unwrap();
        assert_eq!(second, first.byte_add(256));

        assert!(matches!(
            context.memset(first, 0, 256, 16, None),
            Err(Error::InvalidRange { offset: 256, resolved: 0, .. })
        ));
        // Addressed directly, the second allocation is fine.
        context.memset(second, 0, 0, 16, None).unwrap();
    }

    #[test]
    fn kernel_fallbacks_match_native_results() {
        let native = context().1;
        let (_, kernel) = context_with(
            AccConfig {
                devcopy: DEVCOPY_MEMSET | DEVCOPY_MEMCPY,
                ..AccConfig::for_testing()
            },
            SimConfig::default(),
        );
        let (quirky_sim, quirky) = context_with(
            AccConfig::for_testing(),
            SimConfig {
                quirks: DeviceQuirks::BUGGY_FILL | DeviceQuirks::BUGGY_COPY,
                ..SimConfig::default()
            },
        );

        let mut results = Vec::new();
        for context in [&native, &kernel, &quirky] {
            let src = context.dev_mem_alloc(300).unwrap();
            let dst = context.dev_mem_alloc(300).unwrap();
            context.copy_to_device(&pattern(300), src).unwrap();
            context.memset(dst, 0x11, 0, 300, None).unwrap();
            context.memcpy_d2d(src.byte_add(10), dst.byte_add(3), 200, None).unwrap();
            context.memset(dst, 0xee, 250, 33, None).unwrap();
            let mut out = vec![0u8; 300];
            context.copy_from_device(dst, &mut out).unwrap();
            results.push(out);
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], results[2]);
        // Resolver plus both fallbacks.
        assert_eq!(quirky_sim.live_kernels(), 3);
    }

    #[test]
    fn async_transfers_on_a_stream() {
        let (_, context) = context_with(
            AccConfig {
                async_flags: ASYNC_H2D | ASYNC_D2H,
                ..AccConfig::for_testing()
            },
            SimConfig::default(),
        );
        let stream = context.stream_create(0).unwrap();
        let ptr = context.dev_mem_alloc(1024).unwrap();
        let data = pattern(1024);
        let mut back = vec![0u8; 1024];
        unsafe {
            context.memcpy_h2d(data.as_ptr(), ptr, data.len(), Some(stream)).unwrap();
            context.memcpy_d2h(ptr, back.as_mut_ptr(), back.len(), Some(stream)).unwrap();
        }
        context.stream_sync(stream).unwrap();
        assert_eq!(back, data);
        assert!(context.async_readback());
    }

    #[test]
    fn refused_async_read_falls_back_to_blocking() {
        let (_, context) = context_with(
            AccConfig {
                async_flags: ASYNC_D2H,
                ..AccConfig::for_testing()
            },
            SimConfig {
                reject_async_reads: true,
                ..SimConfig::default()
            },
        );
        let stream = context.stream_create(0).unwrap();
        let ptr = context.dev_mem_alloc(64).unwrap();
        context.copy_to_device(&pattern(64), ptr).unwrap();

        let mut back = vec![0u8; 64];
        unsafe { context.memcpy_d2h(ptr, back.as_mut_ptr(), 64, Some(stream)).unwrap() };
        assert_eq!(back, pattern(64));
        assert!(!context.async_readback());
    }

    #[test]
    fn refused_async_read_without_fallback_fails() {
        let (_, context) = context_with(
            AccConfig {
                async_flags: ASYNC_D2H,
                readback_fallback: false,
                ..AccConfig::for_testing()
            },
            SimConfig {
                reject_async_reads: true,
                ..SimConfig::default()
            },
        );
        let stream = context.stream_create(0).unwrap();
        let ptr = context.dev_mem_alloc(64).unwrap();
        let mut back = vec![0u8; 64];
        let result = unsafe { context.memcpy_d2h(ptr, back.as_mut_ptr(), 64, Some(stream)) };
        assert!(matches!(result, Err(Error::Backend(_))));
        assert!(context.async_readback());
    }

    #[test]
    fn fill_width_divides_offset_and_length() {
        assert_eq!(fill_width(0, 4096), 4);
        assert_eq!(fill_width(2, 4096), 2);
        assert_eq!(fill_width(0, 6), 2);
        assert_eq!(fill_width(5, 11), 1);
        assert_eq!(fill_width(0, 3), 1);
    }
}
