//! Device-address discovery for new buffers
//!
//! Buffer objects are opaque; kernels see flat addresses. When the backend can
//! report a buffer's address directly that answer is used. Otherwise the
//! `memptr` micro-kernel writes the buffer's own address into its first word,
//! which is then read back:
//!
//! ```text
//!   set_kernel_arg(0, buffer) ─► set_kernel_arg(1, offset)
//!     ─► enqueue_kernel(global = 1) ─► blocking read of 8 bytes ─► finish
//! ```
//!
//! This clobbers the first word of the buffer, which is fine for a fresh
//! allocation. The buffer must be at least 8 bytes.

use crate::error::{Error, Result};
use crate::kernels::{KernelSlot, MicroKernel};
use crate::ptr::DevicePtr;
use accel_backends::{Backend, BufferHandle, KernelArg, NdRange, QueueHandle};

/// Smallest buffer the resolver can handle
pub const MIN_BUFFER_SIZE: usize = std::mem::size_of::<u64>();

#[derive(Debug)]
pub struct AddressResolver {
    kernel: KernelSlot,
}

impl Default for AddressResolver {
    fn default() -> Self {
        Self {
            kernel: KernelSlot::new(MicroKernel::MemPtr),
        }
    }
}

impl AddressResolver {
    /// Device address of `buffer` plus `offset` bytes
    pub fn resolve(
        &mut self,
        backend: &dyn Backend,
        queue: QueueHandle,
        buffer: BufferHandle,
        offset: u64,
    ) -> Result<DevicePtr> {
        if let Some(base) = backend.device_address(buffer)? {
            return Ok(DevicePtr::new(base.wrapping_add(offset)));
        }

        let kernel = self.kernel.get_or_build(backend)?;
        backend.set_kernel_arg(kernel, 0, KernelArg::Buffer(buffer))?;
        backend.set_kernel_arg(kernel, 1, KernelArg::U64(offset))?;
        backend.enqueue_kernel(queue, kernel, NdRange::linear(1))?;

        let mut word = [0u8; MIN_BUFFER_SIZE];
        // SAFETY: blocking read into a local that outlives the call.
        unsafe { backend.enqueue_read(queue, buffer, true, 0, word.as_mut_ptr(), word.len())? };
        backend.finish(queue)?;

        match u64::from_le_bytes(word) {
            0 => Err(Error::AddressResolution(buffer)),
            address => Ok(DevicePtr::new(address)),
        }
    }

    /// Release the cached kernel
    pub fn release(&mut self, backend: &dyn Backend) {
        self.kernel.release(backend);
    }
}
