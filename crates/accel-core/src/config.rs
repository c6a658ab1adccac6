//! Context configuration
//!
//! Values come from, in increasing precedence: [`AccConfig::default`], a JSON
//! file named by `ACCEL_CONFIG`, and individual `ACCEL_*` variables.
//!
//! | Variable            | Field               | Default |
//! |---------------------|---------------------|---------|
//! | `ACCEL_VERBOSE`     | `verbosity`         | 0       |
//! | `ACCEL_HANDLES`     | `handle_capacity`   | 1024    |
//! | `ACCEL_DEVCOPY`     | `devcopy`           | 0       |
//! | `ACCEL_ASYNC`       | `async_flags`       | 3       |
//! | `ACCEL_EVENT_FLUSH` | `event_flush`       | off     |
//! | `ACCEL_CPYSYNC`     | `readback_fallback` | on      |
//! | `ACCEL_DEVICE`      | `device`            | 0       |
//! | `ACCEL_SVM`         | `svm_interop`       | on      |

use crate::error::{Error, Result};
use accel_tracing::parse_flag;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// `devcopy` bit: fill with the micro-kernel instead of the native fill
pub const DEVCOPY_MEMSET: u32 = 1 << 0;
/// `devcopy` bit: copy with the micro-kernel instead of the native copy
pub const DEVCOPY_MEMCPY: u32 = 1 << 1;

/// `async_flags` bit: host-to-device writes do not block
pub const ASYNC_H2D: u32 = 1 << 0;
/// `async_flags` bit: device-to-host reads do not block
pub const ASYNC_D2H: u32 = 1 << 1;

pub const DEFAULT_HANDLE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccConfig {
    /// 0 is quiet; 1 warns on transparent fallbacks; 2 also on hint retries;
    /// 3 also on synchronizing an event that was never recorded
    pub verbosity: u32,
    /// Capacity of each of the registry, stream and event pools
    pub handle_capacity: usize,
    /// `DEVCOPY_*` bits
    pub devcopy: u32,
    /// `ASYNC_*` bits. Only applies to transfers on an explicit stream.
    pub async_flags: u32,
    /// Flush the queue after recording an event
    pub event_flush: bool,
    /// Retry a rejected non-blocking read as a blocking one
    pub readback_fallback: bool,
    /// Device made active by `Context::new`
    pub device: usize,
    /// Back allocations with shared virtual memory on devices that support it
    pub svm_interop: bool,
}

impl Default for AccConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
            devcopy: 0,
            async_flags: ASYNC_H2D | ASYNC_D2H,
            event_flush: false,
            readback_fallback: true,
            device: 0,
            svm_interop: true,
        }
    }
}

impl AccConfig {
    /// Defaults for tests: small pools, everything synchronous
    pub fn for_testing() -> Self {
        Self {
            handle_capacity: 64,
            async_flags: 0,
            ..Self::default()
        }
    }

    /// Build from `ACCEL_CONFIG` and `ACCEL_*` variables. Unparseable values
    /// are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = match env::var("ACCEL_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()).unwrap_or_else(|err| {
                tracing::warn!(path = %path, error = %err, "ignoring config file");
                Self::default()
            }),
            _ => Self::default(),
        };

        if let Some(verbosity) = env_number("ACCEL_VERBOSE") {
            config.verbosity = verbosity;
        }
        if let Some(capacity) = env_number::<usize>("ACCEL_HANDLES") {
            config.handle_capacity = capacity;
        }
        if let Some(devcopy) = env_number("ACCEL_DEVCOPY") {
            config.devcopy = devcopy;
        }
        if let Some(flags) = env_number("ACCEL_ASYNC") {
            config.async_flags = flags;
        }
        if let Ok(flush) = env::var("ACCEL_EVENT_FLUSH") {
            config.event_flush = parse_flag(&flush);
        }
        if let Ok(fallback) = env::var("ACCEL_CPYSYNC") {
            config.readback_fallback = parse_flag(&fallback);
        }
        if let Some(device) = env_number("ACCEL_DEVICE") {
            config.device = device;
        }
        if let Ok(svm) = env::var("ACCEL_SVM") {
            config.svm_interop = parse_flag(&svm);
        }

        config
    }

    /// Parse a JSON document; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn memset_kernel(&self) -> bool {
        self.devcopy & DEVCOPY_MEMSET != 0
    }

    pub fn memcpy_kernel(&self) -> bool {
        self.devcopy & DEVCOPY_MEMCPY != 0
    }

    pub fn async_h2d(&self) -> bool {
        self.async_flags & ASYNC_H2D != 0
    }

    pub fn async_d2h(&self) -> bool {
        self.async_flags & ASYNC_D2H != 0
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring non-numeric setting");
            None
        }
    }
}
