//! Compute-API seam for the accelerator memory layer
//!
//! This crate provides:
//! - **Backend trait**: buffers, queues, events and kernels, the only surface
//!   `accel-core` needs from a compute API
//! - **SimBackend**: in-process reference device with its own address space
//!   and asynchronous queues
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              accel-core (registry, transfers)            │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │ Backend trait
//!                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │   SimBackend  ·  vendor runtimes implemented out of tree │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod backends;
pub mod error;

pub use backend::{
    Backend, BufferHandle, DeviceInfo, DeviceQuirks, EventHandle, EventStatus, KernelArg, KernelHandle, MapFlags,
    MemFlags, NdRange, QueueHandle, QueuePriority, Vendor,
};
pub use backends::{SimBackend, SimConfig};
pub use error::{codes, BackendError, Result};
