//! # accel-core - Accelerator Memory and Synchronization
//!
//! Gives a compute library flat device addresses it can do arithmetic on,
//! while the compute API underneath only knows opaque buffer objects.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Context                              │
//! │                                                               │
//! │  host_alloc / dev_mem_alloc ──► AddressResolver ──► Registry  │
//! │                                    (memptr kernel)     ▲      │
//! │  memcpy_* / memset ─────────────── lookup ─────────────┘      │
//! │                                                               │
//! │  streams ─ events ─ per-thread default queues                 │
//! └──────────────────────────────┬───────────────────────────────┘
//!                                │ Arc<dyn Backend>
//!                                ▼
//!                        accel-backends
//! ```
//!
//! - **Handle pools**: fixed-capacity, O(1) acquire/release ([`pool`])
//! - **Pointer registry**: device address → `(buffer, offset)` ([`registry`])
//! - **Address resolution**: native query or the `memptr` micro-kernel
//!   ([`resolve`])
//! - **Allocator**: pinned host memory and registered device memory
//! - **Transfers**: H2D, D2H, D2D and fills, with kernel fallbacks for
//!   devices whose native copy or fill is unreliable
//! - **Streams and events**: thread-affine queues and completion markers
//!
//! ## Example
//!
//! ```
//! use accel_backends::SimBackend;
//! use accel_core::{AccConfig, Context};
//!
//! let context = Context::with_device(AccConfig::default(), SimBackend::new())?;
//! let ptr = context.dev_mem_alloc(64)?;
//!
//! context.write_slice(ptr, &[1u32, 2, 3, 4])?;
//! let mut back = [0u32; 2];
//! context.read_slice(ptr.byte_add(8), &mut back)?;
//! assert_eq!(back, [3, 4]);
//!
//! context.dev_mem_free(ptr)?;
//! # Ok::<(), accel_core::Error>(())
//! ```
//!
//! ## Status codes
//!
//! Every operation returns [`Result`]. Callers that need integer status
//! codes use [`Error::status`] or [`status_of`]: native codes pass through,
//! failures of this layer map to [`STATUS_FAILURE`].

pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod event;
pub mod host;
pub mod kernels;
pub mod lock;
pub mod memory;
pub mod pool;
pub mod ptr;
pub mod registry;
pub mod resolve;
pub mod stream;
mod transfer;

pub use config::AccConfig;
pub use context::Context;
pub use device::DeviceConfig;
pub use error::{status_of, Error, Result, STATUS_FAILURE, STATUS_SUCCESS};
pub use event::EventId;
pub use host::HostBuffer;
pub use lock::LockKind;
pub use memory::MemInfo;
pub use pool::{HandlePool, SlotId};
pub use ptr::DevicePtr;
pub use registry::{MemoryInfo, Registry, Resolved};
pub use stream::StreamId;
