//! Micro-kernels built on demand
//!
//! Three tiny kernels back operations the native API cannot do or does badly
//! on some devices. Each is built the first time it is needed and kept until
//! the active device changes. A [`KernelSlot`] is not synchronized itself: it
//! lives inside the named lock of its category, and whoever holds that lock
//! also owns the kernel's argument state for the duration.

use crate::error::Result;
use accel_backends::{Backend, KernelHandle};

pub const MEMPTR_SOURCE: &str = "\
kernel void memptr(global ulong* ptr, ulong offset) {
  const size_t i = get_global_id(0);
  ptr[i] = (ulong)ptr + offset + i;
}
";

pub const MEMCPY_SOURCE: &str = "\
kernel void memcpy(global const uchar* src, ulong src_offset, global uchar* dst, ulong dst_offset) {
  const size_t i = get_global_id(0);
  dst[dst_offset + i] = src[src_offset + i];
}
";

pub const MEMSET_SOURCE: &str = "\
kernel void memset(global uchar* buffer, uchar value) {
  buffer[get_global_id(0)] = value;
}
";

/// The built-in kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicroKernel {
    /// Writes its own buffer's device address (plus offset) into the buffer
    MemPtr,
    MemCpy,
    MemSet,
}

impl MicroKernel {
    pub const fn name(self) -> &'static str {
        match self {
            MicroKernel::MemPtr => "memptr",
            MicroKernel::MemCpy => "memcpy",
            MicroKernel::MemSet => "memset",
        }
    }

    pub const fn source(self) -> &'static str {
        match self {
            MicroKernel::MemPtr => MEMPTR_SOURCE,
            MicroKernel::MemCpy => MEMCPY_SOURCE,
            MicroKernel::MemSet => MEMSET_SOURCE,
        }
    }
}

/// Lazily built kernel handle for one device
#[derive(Debug)]
pub struct KernelSlot {
    kernel: MicroKernel,
    handle: Option<KernelHandle>,
}

impl KernelSlot {
    pub const fn new(kernel: MicroKernel) -> Self {
        Self { kernel, handle: None }
    }

    pub fn is_built(&self) -> bool {
        self.handle.is_some()
    }

    /// Cached handle, building it on first use
    pub fn get_or_build(&mut self, backend: &dyn Backend) -> Result<KernelHandle> {
        if let Some(handle) = self.handle {
            return Ok(handle);
        }
        let (built, duration_us) = accel_tracing::timed_block!("build_kernel", {
            backend.build_kernel(self.kernel.source(), self.kernel.name(), None)
        });
        let handle = built?;
        tracing::debug!(kernel = self.kernel.name(), %handle, duration_us, "built micro-kernel");
        self.handle = Some(handle);
        Ok(handle)
    }

    /// Drop the cached handle, if any
    pub fn release(&mut self, backend: &dyn Backend) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = backend.release_kernel(handle) {
                tracing::warn!(kernel = self.kernel.name(), %handle, error = %err, "failed to release micro-kernel");
            }
        }
    }
}
