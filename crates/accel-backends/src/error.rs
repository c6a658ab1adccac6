//! Error types for backend operations

use std::fmt;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Native status codes, numbered like the OpenCL error space so that status
/// values passed through to a consuming library keep their usual meaning.
pub mod codes {
    pub const MEM_OBJECT_ALLOCATION_FAILURE: i32 = -4;
    pub const OUT_OF_RESOURCES: i32 = -5;
    pub const OUT_OF_HOST_MEMORY: i32 = -6;
    pub const MEM_COPY_OVERLAP: i32 = -8;
    pub const MAP_FAILURE: i32 = -12;
    pub const BUILD_PROGRAM_FAILURE: i32 = -11;
    pub const INVALID_VALUE: i32 = -30;
    pub const INVALID_DEVICE: i32 = -33;
    pub const INVALID_COMMAND_QUEUE: i32 = -36;
    pub const INVALID_MEM_OBJECT: i32 = -38;
    pub const INVALID_KERNEL_NAME: i32 = -46;
    pub const INVALID_KERNEL: i32 = -48;
    pub const INVALID_ARG_INDEX: i32 = -49;
    pub const INVALID_ARG_VALUE: i32 = -50;
    pub const INVALID_KERNEL_ARGS: i32 = -52;
    pub const INVALID_WORK_DIMENSION: i32 = -53;
    pub const INVALID_EVENT: i32 = -58;
    pub const INVALID_OPERATION: i32 = -59;
    pub const INVALID_BUFFER_SIZE: i32 = -61;
}

/// Errors reported by a compute backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// Unknown or already released buffer
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(u64),

    /// Unknown or already released command queue
    #[error("invalid queue handle: {0}")]
    InvalidQueueHandle(u64),

    /// Unknown or already released event
    #[error("invalid event handle: {0}")]
    InvalidEventHandle(u64),

    /// Unknown kernel handle
    #[error("invalid kernel handle: {0}")]
    InvalidKernelHandle(u64),

    /// Range outside the buffer
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Native allocation refused
    #[error("allocation of {size} bytes failed: {reason}")]
    AllocationFailed { size: usize, reason: String },

    /// Mapping a buffer into host memory failed
    #[error("map failed: {0}")]
    MapFailed(String),

    /// Kernel source could not be built
    #[error("building kernel `{name}` failed: {reason}")]
    BuildFailed { name: String, reason: String },

    /// Kernel argument index or value rejected
    #[error("invalid argument {index} for kernel `{kernel}`: {reason}")]
    InvalidKernelArg {
        kernel: String,
        index: u32,
        reason: String,
    },

    /// Launch geometry rejected
    #[error("invalid launch configuration: {0}")]
    InvalidLaunch(String),

    /// Argument value rejected
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Operation unsupported by this backend or device
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Native call failed with a raw status code
    #[error("{call} failed with status {code}")]
    Native { call: &'static str, code: i32 },
}

impl BackendError {
    /// Create an invalid-value error
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::InvalidValue(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// Create an allocation failure
    pub fn allocation_failed(size: usize, reason: impl fmt::Display) -> Self {
        Self::AllocationFailed {
            size,
            reason: reason.to_string(),
        }
    }

    /// Status code for this error
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidBufferHandle(_) => codes::INVALID_MEM_OBJECT,
            Self::InvalidQueueHandle(_) => codes::INVALID_COMMAND_QUEUE,
            Self::InvalidEventHandle(_) => codes::INVALID_EVENT,
            Self::InvalidKernelHandle(_) => codes::INVALID_KERNEL,
            Self::BufferOutOfBounds { .. } => codes::INVALID_VALUE,
            Self::AllocationFailed { .. } => codes::MEM_OBJECT_ALLOCATION_FAILURE,
            Self::MapFailed(_) => codes::MAP_FAILURE,
            Self::BuildFailed { .. } => codes::BUILD_PROGRAM_FAILURE,
            Self::InvalidKernelArg { .. } => codes::INVALID_ARG_VALUE,
            Self::InvalidLaunch(_) => codes::INVALID_WORK_DIMENSION,
            Self::InvalidValue(_) => codes::INVALID_VALUE,
            Self::UnsupportedOperation(_) => codes::INVALID_OPERATION,
            Self::Native { code, .. } => *code,
        }
    }
}
