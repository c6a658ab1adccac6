//! Error types for accel-core operations

use crate::lock::LockKind;
use crate::ptr::DevicePtr;
use accel_backends::BackendError;

/// Result type for accel-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Status reported for a successful call
pub const STATUS_SUCCESS: i32 = 0;

/// Status reported for failures that carry no native code
pub const STATUS_FAILURE: i32 = 1;

/// Errors that can occur in accel-core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Native API failure
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Fixed-capacity handle pool has no free slot
    #[error("{pool} pool exhausted (capacity {capacity})")]
    PoolExhausted { pool: LockKind, capacity: usize },

    /// Handle not acquired from this pool, or already released
    #[error("invalid {pool} handle: slot {slot}")]
    InvalidHandle { pool: LockKind, slot: u32 },

    /// Address not covered by any live device allocation
    #[error("invalid device pointer: {ptr}")]
    InvalidPointer { ptr: DevicePtr },

    /// The allocation containing `ptr + offset` does not start at or before `ptr`
    #[error("offset {offset} from {ptr} leaves the allocation (resolved offset {resolved})")]
    InvalidRange {
        ptr: DevicePtr,
        offset: usize,
        resolved: usize,
    },

    /// Allocation failed; partial resources have been released
    #[error("allocation of {requested} bytes failed: {reason}")]
    AllocationFailed { requested: usize, reason: String },

    /// Device did not report a usable address for a new buffer
    #[error("could not resolve a device address for {0}")]
    AddressResolution(accel_backends::BufferHandle),

    /// No device has been selected
    #[error("no active device")]
    NoActiveDevice,

    /// Device index out of range
    #[error("device {0} does not exist")]
    InvalidDevice(usize),

    /// Device switch refused while resources are live
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Argument rejected before reaching the device
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be loaded
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid-argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an allocation failure
    pub fn allocation_failed(requested: usize, reason: impl std::fmt::Display) -> Self {
        Self::AllocationFailed {
            requested,
            reason: reason.to_string(),
        }
    }

    /// Integer status for callers that speak status codes. Native failures
    /// keep their backend code; everything else is [`STATUS_FAILURE`].
    pub fn status(&self) -> i32 {
        match self {
            Error::Backend(err) => err.code(),
            _ => STATUS_FAILURE,
        }
    }
}

/// Collapse a result into its status code
pub fn status_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(err) => err.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_backends::codes;

    #[test]
    fn native_codes_pass_through() {
        let err: Error = BackendError::InvalidBufferHandle(4).into();
        assert_eq!(err.status(), codes::INVALID_MEM_OBJECT);
        assert_eq!(status_of::<()>(&Err(err)), codes::INVALID_MEM_OBJECT);
    }

    #[test]
    fn layer_errors_are_generic_failures() {
        let err = Error::PoolExhausted {
            pool: LockKind::Event,
            capacity: 4,
        };
        assert_eq!(err.status(), STATUS_FAILURE);
        assert_eq!(err.to_string(), "event pool exhausted (capacity 4)");
        assert_eq!(status_of(&Ok(3)), STATUS_SUCCESS);
    }
}
