//! Handles, flags and descriptors shared by every backend

use bitflags::bitflags;
use std::fmt;

macro_rules! define_handle {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Wrap a raw backend id
            pub const fn new(id: u64) -> Self {
                $name(id)
            }

            /// Get the raw backend id
            pub const fn id(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

define_handle!(
    /// Native buffer object. Opaque; the device address behind it is not
    /// necessarily visible to the host.
    BufferHandle,
    "buf"
);
define_handle!(
    /// In-order command queue
    QueueHandle,
    "queue"
);
define_handle!(
    /// Marker token produced by a queue
    EventHandle,
    "event"
);
define_handle!(
    /// Built kernel object. Arguments bound to it are shared state.
    KernelHandle,
    "kernel"
);

bitflags! {
    /// Buffer creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        /// Use caller-provided host (or shared virtual) memory as storage.
        const USE_HOST_PTR = 1 << 3;
        /// Back the buffer with host-visible pinned memory.
        const ALLOC_HOST_PTR = 1 << 4;
        /// Vendor placement hint. Some device generations reject it for
        /// particular sizes, so callers must be ready to retry without it.
        const PLACEMENT_HINT = 1 << 22;
    }
}

bitflags! {
    /// Host access requested by a map.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Known misbehaviour of a device/driver combination.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceQuirks: u32 {
        /// Native fill command produces wrong results.
        const BUGGY_FILL = 1 << 0;
        /// Native buffer-to-buffer copy produces wrong results.
        const BUGGY_COPY = 1 << 1;
    }
}

/// Device vendor as reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Intel,
    Amd,
    Nvidia,
    Other,
}

impl Vendor {
    /// PCI vendor id
    pub fn from_pci_id(id: u32) -> Self {
        match id {
            0x8086 => Vendor::Intel,
            0x1002 | 0x1022 => Vendor::Amd,
            0x10de => Vendor::Nvidia,
            _ => Vendor::Other,
        }
    }
}

/// Static description of a device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: Vendor,
    /// Device id within the vendor's range (PCI device id)
    pub uid: u32,
    /// Global memory in bytes
    pub global_mem_size: u64,
    /// Host and device share one physical memory
    pub unified_memory: bool,
    /// Shared virtual memory allocations are supported
    pub svm: bool,
    pub quirks: DeviceQuirks,
}

/// Observed state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Queued,
    Running,
    Complete,
    /// Command failed; carries the native status code
    Error(i32),
}

impl EventStatus {
    pub fn is_complete(self) -> bool {
        matches!(self, EventStatus::Complete)
    }
}

/// Value bound to a kernel argument slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferHandle),
    U64(u64),
    U8(u8),
}

/// One-dimensional launch geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NdRange {
    /// Global id of the first work item
    pub offset: usize,
    /// Number of work items
    pub global: usize,
}

impl NdRange {
    pub const fn linear(global: usize) -> Self {
        Self { offset: 0, global }
    }

    pub const fn with_offset(offset: usize, global: usize) -> Self {
        Self { offset, global }
    }
}

/// Queue scheduling priority; higher runs first where supported
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl QueuePriority {
    /// Map a signed priority (negative = low, positive = high)
    pub fn from_level(level: i32) -> Self {
        match level {
            l if l < 0 => QueuePriority::Low,
            0 => QueuePriority::Normal,
            _ => QueuePriority::High,
        }
    }
}
