//! Streams: user-visible in-order queues
//!
//! A stream belongs to the thread that created it. Work on a stream is
//! asynchronous; [`Context::stream_sync`] or an event waits for it. Passing
//! `None` wherever a stream is accepted selects the calling thread's default
//! queue, on which every operation completes before returning.

use crate::context::Context;
use crate::error::{Error, Result};
use crate::lock::LockKind;
use crate::pool::{HandlePool, SlotId};
use accel_backends::{QueueHandle, QueuePriority};
use std::collections::HashMap;
use std::fmt;
use std::thread::{self, ThreadId};

/// Handle to a stream created by [`Context::stream_create`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub(crate) SlotId);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0.index())
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Stream {
    pub(crate) queue: QueueHandle,
    pub(crate) owner: ThreadId,
    pub(crate) priority: i32,
}

/// Everything behind the stream lock
#[derive(Debug)]
pub(crate) struct StreamState {
    pool: HandlePool<Option<Stream>>,
    /// Lazily created per-thread default queues
    pub(crate) defaults: HashMap<ThreadId, QueueHandle>,
}

impl StreamState {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            pool: HandlePool::new(LockKind::Stream, capacity),
            defaults: HashMap::new(),
        }
    }

    /// Live streams, not counting default queues
    pub(crate) fn len(&self) -> usize {
        self.pool.len()
    }

    pub(crate) fn get(&self, id: StreamId) -> Result<&Stream> {
        (*self.pool.get(id.0)?)
            .as_ref()
            .ok_or(Error::InvalidHandle {
                pool: LockKind::Stream,
                slot: id.0.index() as u32,
            })
    }

    fn get_mut(&mut self, id: StreamId) -> Result<&mut Stream> {
        self.pool
            .get_mut(id.0)?
            .as_mut()
            .ok_or(Error::InvalidHandle {
                pool: LockKind::Stream,
                slot: id.0.index() as u32,
            })
    }

    /// Every queue that may hold work
    pub(crate) fn all_queues(&self) -> Vec<QueueHandle> {
        self.pool
            .live()
            .filter_map(|(_, stream)| stream.as_ref().map(|stream| stream.queue))
            .chain(self.defaults.values().copied())
            .collect()
    }

    /// Forget every stream and default queue, returning their queues
    pub(crate) fn drain(&mut self) -> Vec<QueueHandle> {
        let queues = self.all_queues();
        for slot in self.pool.live_ids() {
            let _ = self.pool.release(slot);
        }
        self.defaults.clear();
        queues
    }
}

impl Context {
    /// Create a stream owned by the calling thread. Negative priorities are
    /// low, positive high.
    pub fn stream_create(&self, priority: i32) -> Result<StreamId> {
        let device = self.device()?;
        let backend = device.backend();
        let queue = backend.create_queue(QueuePriority::from_level(priority))?;

        let acquired = {
            let mut streams = self.streams.lock();
            streams.pool.acquire().and_then(|slot| {
                *streams.pool.get_mut(slot)? = Some(Stream {
                    queue,
                    owner: thread::current().id(),
                    priority,
                });
                Ok(StreamId(slot))
            })
        };
        match acquired {
            Ok(id) => {
                tracing::debug!(stream = %id, %queue, priority, "stream created");
                Ok(id)
            }
            Err(err) => {
                if let Err(release) = backend.release_queue(queue) {
                    tracing::warn!(%queue, error = %release, "failed to release queue");
                }
                Err(err)
            }
        }
    }

    /// Wait for pending work, then release the stream
    pub fn stream_destroy(&self, id: StreamId) -> Result<()> {
        let device = self.device()?;
        let stream = {
            let mut streams = self.streams.lock();
            let stream = *streams.get(id)?;
            streams.pool.release(id.0)?;
            stream
        };
        let backend = device.backend();
        backend.finish(stream.queue)?;
        backend.release_queue(stream.queue)?;
        tracing::debug!(stream = %id, priority = stream.priority, "stream destroyed");
        Ok(())
    }

    /// Block until all work on the stream has completed
    pub fn stream_sync(&self, id: StreamId) -> Result<()> {
        let device = self.device()?;
        let target = self.queue_for(&device, Some(id))?;
        device.backend().finish(target.queue)?;
        Ok(())
    }

    /// Hand a stream over to the calling thread
    pub fn stream_adopt(&self, id: StreamId) -> Result<()> {
        let mut streams = self.streams.lock();
        let stream = streams.get_mut(id)?;
        stream.owner = thread::current().id();
        Ok(())
    }

    /// Release the calling thread's default queue, if it has one. Threads
    /// that end without calling this keep theirs until shutdown.
    pub fn release_default_queue(&self) -> Result<()> {
        let device = self.device()?;
        let queue = self.streams.lock().defaults.remove(&thread::current().id());
        if let Some(queue) = queue {
            device.backend().release_queue(queue)?;
        }
        Ok(())
    }
}
