//! Device addresses as seen by kernels

use std::fmt;

/// Flat device address. Valid for pointer arithmetic on the device side; the
/// host never dereferences it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DevicePtr(u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub const fn new(addr: u64) -> Self {
        DevicePtr(addr)
    }

    pub const fn addr(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one
    pub const fn byte_add(self, bytes: usize) -> Self {
        DevicePtr(self.0.wrapping_add(bytes as u64))
    }

    /// Bytes from `base` to this address, if it is not below `base`
    pub fn offset_from(self, base: DevicePtr) -> Option<u64> {
        self.0.checked_sub(base.0)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<DevicePtr> for u64 {
    fn from(ptr: DevicePtr) -> u64 {
        ptr.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let base = DevicePtr::new(0x1000);
        let inner = base.byte_add(0x40);
        assert_eq!(inner.offset_from(base), Some(0x40));
        assert_eq!(base.offset_from(inner), None);
        assert_eq!(inner.to_string(), "0x1040");
        assert!(DevicePtr::NULL.is_null());
        assert!(!base.is_null());
    }
}
