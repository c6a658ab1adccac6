//! The context object and device lifecycle
//!
//! A [`Context`] owns every resource the layer hands out: the active device,
//! the pointer registry, streams, events, per-thread default queues and the
//! micro-kernels. Each category sits behind its own [`NamedLock`]:
//!
//! ```text
//!   main ─► stream ─► event ─► memory ─► memset ─► memcpy
//!   │        │         │        │          │          │
//!   device   streams   events   registry   fill       copy
//!            defaults           memptr     kernel     kernel
//! ```
//!
//! Operations take one lock at a time and never call into another category
//! while holding one. Switching or closing the device holds `main` and visits
//! the others in the order above.

use crate::config::AccConfig;
use crate::device::DeviceConfig;
use crate::error::{Error, Result};
use crate::event::EventPool;
use crate::kernels::{KernelSlot, MicroKernel};
use crate::lock::{LockKind, NamedLock};
use crate::memory::MemoryState;
use crate::stream::{StreamId, StreamState};
use accel_backends::{Backend, DeviceInfo, QueueHandle, QueuePriority};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Queue an operation runs on
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueueTarget {
    pub(crate) queue: QueueHandle,
    /// The calling thread's default queue; the operation completes before
    /// returning
    pub(crate) default: bool,
}

pub struct Context {
    pub(crate) config: AccConfig,
    devices: Vec<Arc<dyn Backend>>,
    /// Cleared for good once a non-blocking read has been refused
    pub(crate) async_d2h: AtomicBool,
    pub(crate) main: NamedLock<Option<Arc<DeviceConfig>>>,
    pub(crate) streams: NamedLock<StreamState>,
    pub(crate) events: NamedLock<EventPool>,
    pub(crate) memory: NamedLock<MemoryState>,
    pub(crate) memset: NamedLock<KernelSlot>,
    pub(crate) memcpy: NamedLock<KernelSlot>,
}

impl Context {
    /// Create a context over `devices` and activate `config.device`. With no
    /// devices the context starts without an active device.
    pub fn new(config: AccConfig, devices: Vec<Arc<dyn Backend>>) -> Result<Self> {
        let capacity = config.handle_capacity;
        let context = Self {
            async_d2h: AtomicBool::new(config.async_d2h()),
            main: NamedLock::new(LockKind::Main, None),
            streams: NamedLock::new(LockKind::Stream, StreamState::new(capacity)),
            events: NamedLock::new(LockKind::Event, EventPool::new(capacity)),
            memory: NamedLock::new(LockKind::Memory, MemoryState::new(capacity)),
            memset: NamedLock::new(LockKind::Memset, KernelSlot::new(MicroKernel::MemSet)),
            memcpy: NamedLock::new(LockKind::Memcpy, KernelSlot::new(MicroKernel::MemCpy)),
            devices,
            config,
        };
        if !context.devices.is_empty() {
            context.set_active_device(context.config.device)?;
        }
        tracing::info!(
            devices = context.devices.len(),
            handle_capacity = capacity,
            "accelerator context created"
        );
        Ok(context)
    }

    /// Context over a single device
    pub fn with_device(config: AccConfig, backend: impl Backend + 'static) -> Result<Self> {
        let backend: Arc<dyn Backend> = Arc::new(backend);
        Self::new(AccConfig { device: 0, ..config }, vec![backend])
    }

    pub fn config(&self) -> &AccConfig {
        &self.config
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Index of the active device
    pub fn active_device(&self) -> Option<usize> {
        self.main.lock().as_ref().map(|device| device.id())
    }

    pub fn device_info(&self) -> Result<DeviceInfo> {
        Ok(self.device()?.info().clone())
    }

    /// Whether device-to-host reads on explicit streams are still
    /// non-blocking
    pub fn async_readback(&self) -> bool {
        self.async_d2h.load(Ordering::Relaxed)
    }

    /// Make `id` the active device.
    ///
    /// Refused with [`Error::DeviceBusy`] while device allocations, streams or
    /// events exist. Default queues and micro-kernels of the previous device
    /// are released.
    pub fn set_active_device(&self, id: usize) -> Result<()> {
        let backend = self.devices.get(id).cloned().ok_or(Error::InvalidDevice(id))?;
        let mut main = self.main.lock();
        if let Some(current) = main.as_ref() {
            if current.id() == id {
                return Ok(());
            }
            self.check_idle()?;
            self.release_device_state(current);
        }
        let device = DeviceConfig::new(id, backend, &self.config);
        tracing::info!(
            device = id,
            name = %device.info().name,
            vendor = ?device.info().vendor,
            placement_hint = device.placement_hint(),
            memset_kernel = device.memset_kernel(),
            memcpy_kernel = device.memcpy_kernel(),
            "device activated"
        );
        *main = Some(Arc::new(device));
        Ok(())
    }

    /// Block until every stream and default queue has drained
    pub fn device_synchronize(&self) -> Result<()> {
        let device = self.device()?;
        let queues = self.streams.lock().all_queues();
        let _timer = accel_tracing::perf_span!("device_synchronize");
        for queue in queues {
            device.backend().finish(queue)?;
        }
        Ok(())
    }

    /// Release everything still held and deactivate the device. Called on
    /// drop; later operations fail with [`Error::NoActiveDevice`].
    pub fn shutdown(&self) {
        let mut main = self.main.lock();
        if let Some(device) = main.take() {
            self.release_device_state(&device);
            tracing::info!(device = device.id(), "accelerator context shut down");
        }
    }

    pub(crate) fn device(&self) -> Result<Arc<DeviceConfig>> {
        self.main.lock().clone().ok_or(Error::NoActiveDevice)
    }

    /// Resolve `stream` to a queue; `None` is the calling thread's default
    /// queue, created on first use.
    pub(crate) fn queue_for(&self, device: &DeviceConfig, stream: Option<StreamId>) -> Result<QueueTarget> {
        let mut streams = self.streams.lock();
        match stream {
            Some(id) => {
                let stream = streams.get(id)?;
                debug_assert_eq!(
                    stream.owner,
                    thread::current().id(),
                    "stream used off its owning thread; hand it over with stream_adopt"
                );
                Ok(QueueTarget {
                    queue: stream.queue,
                    default: false,
                })
            }
            None => {
                let thread = thread::current().id();
                let queue = match streams.defaults.get(&thread).copied() {
                    Some(queue) => queue,
                    None => {
                        let queue = device.backend().create_queue(QueuePriority::Normal)?;
                        tracing::debug!(?thread, %queue, "created default queue");
                        streams.defaults.insert(thread, queue);
                        queue
                    }
                };
                Ok(QueueTarget { queue, default: true })
            }
        }
    }

    /// Complete the operation when it ran on a default queue
    pub(crate) fn finish_default(&self, device: &DeviceConfig, target: QueueTarget) -> Result<()> {
        if target.default {
            device.backend().finish(target.queue)?;
        }
        Ok(())
    }

    fn check_idle(&self) -> Result<()> {
        let streams = self.streams.lock().len();
        if streams > 0 {
            return Err(Error::DeviceBusy(format!("{streams} streams live")));
        }
        let events = self.events.lock().len();
        if events > 0 {
            return Err(Error::DeviceBusy(format!("{events} events live")));
        }
        let allocations = self.memory.lock().registry.len();
        if allocations > 0 {
            return Err(Error::DeviceBusy(format!("{allocations} device allocations live")));
        }
        Ok(())
    }

    /// Release every device-owned resource, category by category
    fn release_device_state(&self, device: &DeviceConfig) {
        let backend = device.backend();

        for queue in self.streams.lock().drain() {
            if let Err(err) = backend.release_queue(queue) {
                tracing::warn!(%queue, error = %err, "failed to release queue");
            }
        }

        for event in self.events.lock().drain() {
            if let Err(err) = backend.release_event(event) {
                tracing::warn!(%event, error = %err, "failed to release event");
            }
        }

        {
            let mut memory = self.memory.lock();
            for info in memory.registry.drain() {
                tracing::warn!(
                    ptr = %info.address,
                    buffer = %info.buffer,
                    bytes = info.size,
                    "releasing leaked device allocation"
                );
                if let Err(err) = crate::memory::release_device_buffer(device, info.buffer) {
                    tracing::warn!(buffer = %info.buffer, error = %err, "failed to release buffer");
                }
            }
            memory.resolver.release(backend);
        }

        self.memset.lock().release(backend);
        self.memcpy.lock().release(backend);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("devices", &self.devices.len())
            .field("active_device", &self.active_device())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accel_backends::SimBackend;

    fn sims(n: usize) -> (Vec<SimBackend>, Vec<Arc<dyn Backend>>) {
        let sims: Vec<_> = (0..n).map(|_| SimBackend::new()).collect();
        let devices = sims
            .iter()
            .map(|sim| Arc::new(sim.clone()) as Arc<dyn Backend>)
            .collect();
        (sims, devices)
    }

    #[test]
    fn activates_configured_device() {
        let (_, devices) = sims(2);
        let config = AccConfig {
            device: 1,
            ..AccConfig::for_testing()
        };
        let context = Context::new(config, devices).unwrap();
        assert_eq!(context.device_count(), 2);
        assert_eq!(context.active_device(), Some(1));
    }

    #[test]
    fn no_devices_means_no_active_device() {
        let context = Context::new(AccConfig::for_testing(), Vec::new()).unwrap();
        assert!(matches!(context.device_info(), Err(Error::NoActiveDevice)));
        assert!(matches!(context.dev_mem_alloc(8), Err(Error::NoActiveDevice)));
    }

    #[test]
    fn unknown_device_is_rejected() {
        let (_, devices) = sims(1);
        let context = Context::new(AccConfig::for_testing(), devices).unwrap();
        assert!(matches!(context.set_active_device(3), Err(Error::InvalidDevice(3))));
        assert_eq!(context.active_device(), Some(0));
    }

    #[test]
    fn switch_refused_while_allocations_live() {
        let (sims, devices) = sims(2);
        let context = Context::new(AccConfig::for_testing(), devices).unwrap();
        let ptr = context.dev_mem_alloc(64).unwrap();

        assert!(matches!(context.set_active_device(1), Err(Error::DeviceBusy(_))));
        context.dev_mem_free(ptr).unwrap();

        context.set_active_device(1).unwrap();
        assert_eq!(context.active_device(), Some(1));
        assert_eq!(sims[0].live_queues(), 0);
        assert_eq!(sims[0].live_kernels(), 0);
    }

    #[test]
    fn shutdown_releases_everything() {
        let (sims, devices) = sims(1);
        let context = Context::new(AccConfig::for_testing(), devices).unwrap();
        let _leaked = context.dev_mem_alloc(128).unwrap();
        let _stream = context.stream_create(0).unwrap();
        let event = context.event_create().unwrap();
        context.event_record(event, None).unwrap();

        context.shutdown();
        let sim = &sims[0];
        assert_eq!(sim.live_buffers(), 0);
        assert_eq!(sim.live_queues(), 0);
        assert_eq!(sim.live_events(), 0);
        assert_eq!(sim.live_kernels(), 0);
        assert!(matches!(context.dev_mem_alloc(8), Err(Error::NoActiveDevice)));

        // Idempotent, and drop after shutdown is fine.
        context.shutdown();
    }

    #[test]
    fn drop_shuts_down() {
        let sim = SimBackend::new();
        {
            let context = Context::with_device(AccConfig::for_testing(), sim.clone()).unwrap();
            context.dev_mem_alloc(32).unwrap();
        }
        assert_eq!(sim.live_buffers(), 0);
        assert_eq!(sim.live_queues(), 0);
    }

    #[test]
    fn synchronize_drains_all_queues() {
        let sim = SimBackend::new();
        let context = Context::with_device(AccConfig::for_testing(), sim).unwrap();
        let stream = context.stream_create(1).unwrap();
        let ptr = context.dev_mem_alloc(256).unwrap();
        context.memset(ptr, 0xab, 0, 256, Some(stream)).unwrap();
        context.device_synchronize().unwrap();

        let mut out = [0u8; 256];
        context.copy_from_device(ptr, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 0xab));
    }
}
