//! Active-device descriptor

use crate::config::AccConfig;
use accel_backends::{Backend, DeviceInfo, DeviceQuirks, Vendor};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Intel device ids whose allocations want the placement hint
const PLACEMENT_HINT_UIDS: &[u32] = &[0x4905, 0x020a];
const PLACEMENT_HINT_UID_RANGE: std::ops::RangeInclusive<u32> = 0x0bd0..=0x0bdb;

/// Everything derived once when a device becomes active
pub struct DeviceConfig {
    id: usize,
    backend: Arc<dyn Backend>,
    info: DeviceInfo,
    placement_hint: bool,
    memset_kernel: bool,
    memcpy_kernel: bool,
    svm_interop: AtomicBool,
}

impl DeviceConfig {
    pub fn new(id: usize, backend: Arc<dyn Backend>, config: &AccConfig) -> Self {
        let info = backend.device_info();
        Self {
            id,
            placement_hint: wants_placement_hint(&info),
            memset_kernel: config.memset_kernel() || info.quirks.contains(DeviceQuirks::BUGGY_FILL),
            memcpy_kernel: config.memcpy_kernel() || info.quirks.contains(DeviceQuirks::BUGGY_COPY),
            svm_interop: AtomicBool::new(config.svm_interop && info.svm),
            backend,
            info,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Device allocations first try with the vendor placement hint
    pub fn placement_hint(&self) -> bool {
        self.placement_hint
    }

    /// Fill through the `memset` micro-kernel instead of the native fill
    pub fn memset_kernel(&self) -> bool {
        self.memset_kernel
    }

    /// Copy through the `memcpy` micro-kernel instead of the native copy
    pub fn memcpy_kernel(&self) -> bool {
        self.memcpy_kernel
    }

    /// Allocations are backed by shared virtual memory
    pub fn svm_interop(&self) -> bool {
        self.svm_interop.load(Ordering::Relaxed)
    }

    /// Stop using shared virtual memory after the device refused it once.
    /// Returns whether the flag was still set.
    pub(crate) fn disable_svm_interop(&self) -> bool {
        self.svm_interop.swap(false, Ordering::Relaxed)
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConfig")
            .field("id", &self.id)
            .field("info", &self.info)
            .field("placement_hint", &self.placement_hint)
            .field("memset_kernel", &self.memset_kernel)
            .field("memcpy_kernel", &self.memcpy_kernel)
            .field("svm_interop", &self.svm_interop())
            .finish_non_exhaustive()
    }
}

fn wants_placement_hint(info: &DeviceInfo) -> bool {
    info.vendor == Vendor::Intel
        && !info.unified_memory
        && (PLACEMENT_HINT_UIDS.contains(&info.uid) || PLACEMENT_HINT_UID_RANGE.contains(&info.uid))
}
