//! Built-in micro-kernels understood by the simulated device
//!
//! The simulator does not compile device code. `build_kernel` accepts a
//! source only when it declares one of the kernels below under the requested
//! name; launches then run a native equivalent.
//!
//! | name     | arguments                                 | work item `i`                          |
//! |----------|-------------------------------------------|----------------------------------------|
//! | `memptr` | `ulong* ptr, ulong offset`                | `ptr[i] = address(ptr) + offset + i`    |
//! | `memcpy` | `uchar* src, ulong so, uchar* dst, ulong do` | `dst[i + do] = src[i + so]`         |
//! | `memset` | `uchar* buffer, uchar value`              | `buffer[i] = value`                    |

use super::memory::SimBuffer;
use crate::backend::{BufferHandle, KernelArg, NdRange};
use crate::error::{BackendError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    MemPtr,
    MemCpy,
    MemSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Buffer,
    U64,
    U8,
}

impl Builtin {
    pub(crate) fn from_source(source: &str, name: &str) -> Result<Self> {
        let builtin = match name {
            "memptr" => Builtin::MemPtr,
            "memcpy" => Builtin::MemCpy,
            "memset" => Builtin::MemSet,
            other => {
                return Err(BackendError::BuildFailed {
                    name: other.to_string(),
                    reason: "no such kernel on the simulated device".to_string(),
                })
            }
        };
        let declared = source
            .split("kernel")
            .skip(1)
            .any(|tail| tail.trim_start().strip_prefix("void").is_some_and(|rest| declares(rest, name)));
        if !declared {
            return Err(BackendError::BuildFailed {
                name: name.to_string(),
                reason: format!("source does not declare `kernel void {name}(`"),
            });
        }
        Ok(builtin)
    }

    fn signature(self) -> &'static [ArgKind] {
        match self {
            Builtin::MemPtr => &[ArgKind::Buffer, ArgKind::U64],
            Builtin::MemCpy => &[ArgKind::Buffer, ArgKind::U64, ArgKind::Buffer, ArgKind::U64],
            Builtin::MemSet => &[ArgKind::Buffer, ArgKind::U8],
        }
    }
}

fn declares(rest: &str, name: &str) -> bool {
    rest.trim_start()
        .strip_prefix(name)
        .is_some_and(|after| after.trim_start().starts_with('('))
}

/// A built kernel and its bound arguments
pub(crate) struct SimKernel {
    pub(crate) name: String,
    builtin: Builtin,
    args: Mutex<Vec<Option<KernelArg>>>,
}

impl SimKernel {
    pub(crate) fn new(name: &str, builtin: Builtin) -> Self {
        Self {
            name: name.to_string(),
            builtin,
            args: Mutex::new(vec![None; builtin.signature().len()]),
        }
    }

    pub(crate) fn set_arg(&self, index: u32, arg: KernelArg) -> Result<()> {
        let signature = self.builtin.signature();
        let expected = signature
            .get(index as usize)
            .ok_or_else(|| self.arg_error(index, format!("kernel takes {} arguments", signature.len())))?;
        let matches = matches!(
            (expected, arg),
            (ArgKind::Buffer, KernelArg::Buffer(_)) | (ArgKind::U64, KernelArg::U64(_)) | (ArgKind::U8, KernelArg::U8(_))
        );
        if !matches {
            return Err(self.arg_error(index, format!("expected {expected:?}, got {arg:?}")));
        }
        self.args.lock()[index as usize] = Some(arg);
        Ok(())
    }

    /// Snapshot the bound arguments into a launch, validating every range.
    pub(crate) fn prepare(
        &self,
        range: NdRange,
        resolve: impl Fn(BufferHandle) -> Result<Arc<SimBuffer>>,
    ) -> Result<KernelLaunch> {
        let args = self.args.lock().clone();
        let mut bound = Vec::with_capacity(args.len());
        for (index, arg) in args.into_iter().enumerate() {
            bound.push(arg.ok_or_else(|| self.arg_error(index as u32, "argument not set".to_string()))?);
        }
        let end = range
            .offset
            .checked_add(range.global)
            .ok_or_else(|| BackendError::InvalidLaunch(format!("{range:?} overflows")))?;
        if range.global == 0 {
            return Err(BackendError::InvalidLaunch("global size must be non-zero".to_string()));
        }

        let launch = match (self.builtin, bound.as_slice()) {
            (Builtin::MemPtr, [KernelArg::Buffer(buffer), KernelArg::U64(offset)]) => {
                let buffer = resolve(*buffer)?;
                buffer.storage.check(0, end * std::mem::size_of::<u64>())?;
                KernelLaunch::MemPtr {
                    buffer,
                    offset: *offset,
                    range,
                }
            }
            (
                Builtin::MemCpy,
                [KernelArg::Buffer(src), KernelArg::U64(src_offset), KernelArg::Buffer(dst), KernelArg::U64(dst_offset)],
            ) => {
                let src = resolve(*src)?;
                let dst = resolve(*dst)?;
                let src_offset = *src_offset as usize + range.offset;
                let dst_offset = *dst_offset as usize + range.offset;
                src.storage.check(src_offset, range.global)?;
                dst.storage.check(dst_offset, range.global)?;
                KernelLaunch::MemCpy {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    len: range.global,
                }
            }
            (Builtin::MemSet, [KernelArg::Buffer(buffer), KernelArg::U8(value)]) => {
                let buffer = resolve(*buffer)?;
                buffer.storage.check(range.offset, range.global)?;
                KernelLaunch::MemSet {
                    buffer,
                    value: *value,
                    range,
                }
            }
            _ => return Err(BackendError::InvalidLaunch(format!("argument mismatch for `{}`", self.name))),
        };
        Ok(launch)
    }

    fn arg_error(&self, index: u32, reason: String) -> BackendError {
        BackendError::InvalidKernelArg {
            kernel: self.name.clone(),
            index,
            reason,
        }
    }
}

/// A validated launch, executed on the queue worker
pub(crate) enum KernelLaunch {
    MemPtr {
        buffer: Arc<SimBuffer>,
        offset: u64,
        range: NdRange,
    },
    MemCpy {
        src: Arc<SimBuffer>,
        src_offset: usize,
        dst: Arc<SimBuffer>,
        dst_offset: usize,
        len: usize,
    },
    MemSet {
        buffer: Arc<SimBuffer>,
        value: u8,
        range: NdRange,
    },
}

impl KernelLaunch {
    pub(crate) fn run(&self) {
        match self {
            KernelLaunch::MemPtr { buffer, offset, range } => {
                let word = std::mem::size_of::<u64>();
                for gid in range.offset..range.offset + range.global {
                    let value = buffer.address.wrapping_add(*offset).wrapping_add(gid as u64);
                    let bytes = value.to_le_bytes();
                    // SAFETY: prepare() checked (offset + global) words fit.
                    unsafe { buffer.storage.write_from(gid * word, bytes.as_ptr(), word) };
                }
            }
            KernelLaunch::MemCpy {
                src,
                src_offset,
                dst,
                dst_offset,
                len,
            } => src.storage.copy_to(*src_offset, &dst.storage, *dst_offset, *len),
            KernelLaunch::MemSet { buffer, value, range } => buffer.storage.fill(range.offset, range.global, &[*value]),
        }
    }
}
