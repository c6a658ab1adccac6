//! Backend trait and the types it speaks

mod traits;
mod types;

pub use traits::Backend;
pub use types::{
    BufferHandle, DeviceInfo, DeviceQuirks, EventHandle, EventStatus, KernelArg, KernelHandle, MapFlags, MemFlags,
    NdRange, QueueHandle, QueuePriority, Vendor,
};
