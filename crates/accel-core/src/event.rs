//! Events: completion markers on streams
//!
//! An event slot is Unset until recorded. Recording replaces whatever marker
//! the slot held before. Queries never fail on a broken or unset event: both
//! count as complete.

use crate::context::Context;
use crate::error::Result;
use crate::lock::LockKind;
use crate::pool::{HandlePool, SlotId};
use crate::stream::StreamId;
use accel_backends::{EventHandle, EventStatus};
use std::fmt;

/// Handle to an event created by [`Context::event_create`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) SlotId);

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event{}", self.0.index())
    }
}

/// Event slots behind the event lock
#[derive(Debug)]
pub(crate) struct EventPool {
    pool: HandlePool<Option<EventHandle>>,
}

impl EventPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            pool: HandlePool::new(LockKind::Event, capacity),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pool.len()
    }

    fn marker(&self, id: EventId) -> Result<Option<EventHandle>> {
        Ok(*self.pool.get(id.0)?)
    }

    /// Release every slot, returning the recorded markers
    pub(crate) fn drain(&mut self) -> Vec<EventHandle> {
        let markers = self.pool.live().filter_map(|(_, marker)| *marker).collect();
        for slot in self.pool.live_ids() {
            let _ = self.pool.release(slot);
        }
        markers
    }
}

impl Context {
    /// New, unrecorded event
    pub fn event_create(&self) -> Result<EventId> {
        Ok(EventId(self.events.lock().pool.acquire()?))
    }

    pub fn event_destroy(&self, event: EventId) -> Result<()> {
        let marker = {
            let mut events = self.events.lock();
            let marker = events.marker(event)?;
            events.pool.release(event.0)?;
            marker
        };
        if let Some(marker) = marker {
            self.device()?.backend().release_event(marker)?;
        }
        Ok(())
    }

    /// Mark the current end of `stream`
    pub fn event_record(&self, event: EventId, stream: Option<StreamId>) -> Result<()> {
        let device = self.device()?;
        let backend = device.backend();
        let target = self.queue_for(&device, stream)?;

        let previous = self.events.lock().pool.get_mut(event.0)?.take();
        if let Some(previous) = previous {
            if let Err(err) = backend.release_event(previous) {
                tracing::debug!(%event, marker = %previous, error = %err, "releasing previous marker failed");
            }
        }

        let marker = backend.enqueue_marker(target.queue)?;
        if self.config.event_flush {
            if let Err(err) = backend.flush(target.queue) {
                if let Err(release) = backend.release_event(marker) {
                    tracing::debug!(%event, %marker, error = %release, "releasing unflushed marker failed");
                }
                return Err(err.into());
            }
        }

        let stored = {
            let mut events = self.events.lock();
            events.pool.get_mut(event.0).map(|slot| *slot = Some(marker))
        };
        if let Err(err) = stored {
            // Destroyed concurrently.
            let _ = backend.release_event(marker);
            return Err(err);
        }
        tracing::trace!(%event, %marker, queue = %target.queue, "event recorded");
        Ok(())
    }

    /// Whether everything before the recorded marker has completed
    pub fn event_query(&self, event: EventId) -> Result<bool> {
        let Some(marker) = self.events.lock().marker(event)? else {
            return Ok(true);
        };
        let device = self.device()?;
        match device.backend().event_status(marker) {
            Ok(EventStatus::Queued | EventStatus::Running) => Ok(false),
            Ok(EventStatus::Complete) => Ok(true),
            Ok(EventStatus::Error(code)) => {
                tracing::debug!(%event, code, "event completed with an error");
                Ok(true)
            }
            Err(err) => {
                tracing::debug!(%event, error = %err, "event status unavailable, treating as complete");
                Ok(true)
            }
        }
    }

    /// Block until the recorded marker has completed
    pub fn event_synchronize(&self, event: EventId) -> Result<()> {
        let Some(marker) = self.events.lock().marker(event)? else {
            if self.config.verbosity >= 3 {
                tracing::warn!(%event, "synchronizing an event that was never recorded");
            }
            return Ok(());
        };
        self.device()?.backend().wait_for_events(&[marker])?;
        Ok(())
    }

    /// Make later work on `stream` wait for `event`
    pub fn stream_wait_event(&self, stream: Option<StreamId>, event: EventId) -> Result<()> {
        let Some(marker) = self.events.lock().marker(event)? else {
            return Ok(());
        };
        let device = self.device()?;
        let target = self.queue_for(&device, stream)?;
        device.backend().enqueue_barrier(target.queue, &[marker])?;
        Ok(())
    }

    /// Recorded markers still pending, for diagnostics
    pub fn pending_events(&self) -> Result<usize> {
        let markers: Vec<_> = self.events.lock().pool.live().filter_map(|(_, m)| *m).collect();
        let device = self.device()?;
        Ok(markers
            .into_iter()
            .filter(|marker| {
                device
                    .backend()
                    .event_status(*marker)
                    .is_ok_and(|status| matches!(status, EventStatus::Queued | EventStatus::Running))
            })
            .count())
    }
}
