//! Instrumentation macros.

/// Start a [`crate::performance::PerformanceSpan`] that logs its duration on drop.
///
/// ```rust
/// use accel_tracing::perf_span;
///
/// {
///     let _span = perf_span!("dev_mem_alloc", bytes = 4096);
///     // ... allocate ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Emit a debug-level event tagged with `event = $name`.
///
/// ```rust
/// use accel_tracing::perf_event;
///
/// perf_event!("hint_retry", bytes = 1024, uid = 0x4905);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}

/// Evaluate a block and return `(result, elapsed_us)`.
///
/// ```rust
/// use accel_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<u32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        tracing::trace!(operation = $name, duration_us = duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}
