//! Timing helpers for allocation and transfer paths.
//!
//! ```rust
//! use accel_tracing::performance::{record_transfer, Direction, PerformanceSpan};
//!
//! let span = PerformanceSpan::new("memcpy_d2h", Some(100));
//! // ... copy ...
//! drop(span); // logged only when it took at least 100us
//!
//! record_transfer(4096, Direction::HostToDevice, 250);
//! ```

use std::fmt;
use std::time::Instant;

/// Which way bytes moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    /// Device-side fill, counted as bytes written.
    Fill,
}

impl Direction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::HostToDevice => "H2D",
            Direction::DeviceToHost => "D2H",
            Direction::DeviceToDevice => "D2D",
            Direction::Fill => "FILL",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RAII timer; logs `performance_span_complete` on drop when the elapsed time
/// reaches the threshold (or always, without one).
pub struct PerformanceSpan {
    name: String,
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    pub fn new(name: impl Into<String>, threshold_us: Option<u64>) -> Self {
        let name = name.into();
        let span = tracing::debug_span!("perf", name = %name);
        Self {
            name,
            threshold_us,
            start_time: Instant::now(),
            span,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    fn should_log(&self, elapsed_us: u64) -> bool {
        self.threshold_us.is_none_or(|t| elapsed_us >= t)
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        let elapsed_us = self.elapsed_us();
        if self.should_log(elapsed_us) {
            let _entered = self.span.enter();
            tracing::debug!(duration_us = elapsed_us, "performance_span_complete");
        }
    }
}

/// Bandwidth in MiB/s; zero for a zero duration.
pub fn bandwidth_mibps(bytes: usize, duration_us: u64) -> f64 {
    if duration_us == 0 {
        return 0.0;
    }
    (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
}

/// Record a completed transfer with its bandwidth.
pub fn record_transfer(bytes: usize, direction: Direction, duration_us: u64) {
    tracing::debug!(
        event = "transfer",
        bytes = bytes,
        direction = direction.as_str(),
        duration_us = duration_us,
        bandwidth_mibps = bandwidth_mibps(bytes, duration_us),
        "data_transfer"
    );
}

/// Record an allocation: requested bytes, native bytes, alignment, kind.
pub fn record_allocation(requested: usize, native: usize, alignment: usize, kind: &str, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        requested = requested,
        native = native,
        alignment = alignment,
        kind = kind,
        duration_us = duration_us,
        "memory_allocation"
    );
}
