//! Many host threads against one context

use accel_backends::{SimBackend, SimConfig};
use accel_core::registry::find_overlap;
use accel_core::{AccConfig, Context, Error};
use std::sync::Barrier;
use std::thread::{self, ScopedJoinHandle};
use std::time::Duration;

const THREADS: usize = 8;
const ROUNDS: usize = 40;

/// Join every worker, surfacing the first error
fn join_all(handles: Vec<ScopedJoinHandle<'_, accel_core::Result<()>>>) -> accel_core::Result<()> {
    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().expect("worker panicked"))
        .collect();
    results.into_iter().collect()
}

/// Alloc/free loop run by every worker of the stress tests
fn churn(context: &Context, start: &Barrier, t: usize) -> accel_core::Result<()> {
    start.wait();
    for round in 0..ROUNDS {
        let sizes = [1 + t * 13 + round, 256, 4096 + t];
        let ptrs = sizes
            .iter()
            .map(|n| context.dev_mem_alloc(*n))
            .collect::<accel_core::Result<Vec<_>>>()?;

        let live = context.live_allocations();
        assert!(find_overlap(&live).is_none(), "overlap among {live:?}");

        for ptr in ptrs {
            context.dev_mem_free(ptr)?;
        }
    }
    context.release_default_queue()
}

#[test]
fn concurrent_alloc_free_never_overlaps() -> accel_core::Result<()> {
    let sim = SimBackend::new();
    let config = AccConfig {
        handle_capacity: THREADS * 4,
        ..AccConfig::for_testing()
    };
    let context = Context::with_device(config, sim.clone())?;
    let start = Barrier::new(THREADS);

    thread::scope(|scope| {
        let handles = (0..THREADS)
            .map(|t| {
                let (context, start) = (&context, &start);
                scope.spawn(move || churn(context, start, t))
            })
            .collect();
        join_all(handles)
    })?;

    assert!(context.live_allocations().is_empty());
    assert_eq!(sim.live_buffers(), 0);
    Ok(())
}

#[test]
fn worker_errors_reach_the_caller() {
    let sim = SimBackend::new();
    let config = AccConfig {
        handle_capacity: 1,
        ..AccConfig::for_testing()
    };
    let context = Context::with_device(config, sim).unwrap();
    let start = Barrier::new(2);

    let outcome = thread::scope(|scope| {
        let handles = (0..2)
            .map(|t| {
                let (context, start) = (&context, &start);
                scope.spawn(move || churn(context, start, t))
            })
            .collect();
        join_all(handles)
    });
    assert!(matches!(outcome, Err(Error::PoolExhausted { capacity: 1, .. })), "{outcome:?}");
}

#[test]
fn threads_transfer_independently() -> accel_core::Result<()> {
    let context = Context::with_device(AccConfig::for_testing(), SimBackend::new())?;

    thread::scope(|scope| {
        let handles = (0..THREADS)
            .map(|t| {
                let context = &context;
                scope.spawn(move || -> accel_core::Result<()> {
                    let ptr = context.dev_mem_alloc(1024)?;
                    let data = vec![t as u8; 1024];
                    for _ in 0..10 {
                        context.copy_to_device(&data, ptr)?;
                        let mut back = vec![0u8; 1024];
                        context.copy_from_device(ptr, &mut back)?;
                        assert_eq!(back, data, "thread {t}");
                    }
                    context.dev_mem_free(ptr)
                })
            })
            .collect();
        join_all(handles)
    })
}

#[test]
fn per_thread_streams_with_events() -> accel_core::Result<()> {
    let sim = SimBackend::with_config(SimConfig {
        command_latency: Some(Duration::from_micros(200)),
        ..SimConfig::default()
    });
    let context = Context::with_device(AccConfig::for_testing(), sim)?;

    thread::scope(|scope| {
        let handles = (0..4u8)
            .map(|t| {
                let context = &context;
                scope.spawn(move || -> accel_core::Result<()> {
                    let stream = context.stream_create(i32::from(t % 2))?;
                    let event = context.event_create()?;
                    let ptr = context.dev_mem_alloc(512)?;

                    context.memset(ptr, t, 0, 512, Some(stream))?;
                    context.event_record(event, Some(stream))?;
                    context.event_synchronize(event)?;
                    assert!(context.event_query(event)?);

                    let mut back = [0u8; 512];
                    context.copy_from_device(ptr, &mut back)?;
                    assert!(back.iter().all(|&b| b == t));

                    context.event_destroy(event)?;
                    context.stream_destroy(stream)?;
                    context.dev_mem_free(ptr)
                })
            })
            .collect();
        join_all(handles)
    })?;

    context.device_synchronize()
}
