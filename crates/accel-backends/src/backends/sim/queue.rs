//! In-order command queues backed by one worker thread each

use super::kernels::KernelLaunch;
use super::memory::SimBuffer;
use crate::backend::{EventStatus, QueuePriority};
use crate::error::{codes, BackendError, Result};
use parking_lot::{Condvar, Mutex};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Completion state shared between the queue worker and waiters
pub(crate) struct SimEvent {
    status: Mutex<EventStatus>,
    completed: Condvar,
}

impl SimEvent {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            status: Mutex::new(EventStatus::Queued),
            completed: Condvar::new(),
        })
    }

    pub(crate) fn status(&self) -> EventStatus {
        *self.status.lock()
    }

    fn set(&self, status: EventStatus) {
        let mut guard = self.status.lock();
        *guard = status;
        if matches!(status, EventStatus::Complete | EventStatus::Error(_)) {
            self.completed.notify_all();
        }
    }

    /// Block until the event has completed or failed
    pub(crate) fn wait(&self) {
        let mut guard = self.status.lock();
        while !matches!(*guard, EventStatus::Complete | EventStatus::Error(_)) {
            self.completed.wait(&mut guard);
        }
    }
}

/// Host pointer carried into the worker thread.
pub(crate) struct HostPtr(pub(crate) *const u8);
pub(crate) struct HostPtrMut(pub(crate) *mut u8);

// SAFETY: the enqueueing caller guarantees validity until completion
// (see `Backend::enqueue_write` / `enqueue_read`).
unsafe impl Send for HostPtr {}
unsafe impl Send for HostPtrMut {}

pub(crate) enum Command {
    Write {
        buffer: Arc<SimBuffer>,
        offset: usize,
        src: HostPtr,
        len: usize,
    },
    Read {
        buffer: Arc<SimBuffer>,
        offset: usize,
        dst: HostPtrMut,
        len: usize,
    },
    Copy {
        src: Arc<SimBuffer>,
        dst: Arc<SimBuffer>,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
    },
    Fill {
        buffer: Arc<SimBuffer>,
        pattern: Vec<u8>,
        offset: usize,
        len: usize,
    },
    Kernel(KernelLaunch),
    Marker(Arc<SimEvent>),
    Barrier(Vec<Arc<SimEvent>>),
}

impl Command {
    fn execute(self) {
        match self {
            Command::Write { buffer, offset, src, len } => {
                // SAFETY: range checked at enqueue, pointer validity per contract.
                unsafe { buffer.storage.write_from(offset, src.0, len) }
            }
            Command::Read { buffer, offset, dst, len } => {
                // SAFETY: as above.
                unsafe { buffer.storage.read_into(offset, dst.0, len) }
            }
            Command::Copy {
                src,
                dst,
                src_offset,
                dst_offset,
                len,
            } => src.storage.copy_to(src_offset, &dst.storage, dst_offset, len),
            Command::Fill {
                buffer,
                pattern,
                offset,
                len,
            } => buffer.storage.fill(offset, len, &pattern),
            Command::Kernel(launch) => launch.run(),
            Command::Marker(event) => event.set(EventStatus::Complete),
            Command::Barrier(events) => events.iter().for_each(|event| event.wait()),
        }
    }
}

/// Queue with a dedicated worker draining commands in submission order
pub(crate) struct SimQueue {
    pub(crate) priority: QueuePriority,
    sender: mpsc::Sender<Command>,
    worker: JoinHandle<()>,
}

impl SimQueue {
    pub(crate) fn spawn(id: u64, priority: QueuePriority, latency: Option<Duration>) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Command>();
        let worker = thread::Builder::new()
            .name(format!("sim-queue-{id}"))
            .spawn(move || {
                for command in receiver {
                    if let Some(latency) = latency {
                        thread::sleep(latency);
                    }
                    command.execute();
                }
            })
            .map_err(|err| {
                tracing::error!(queue = id, error = %err, "failed to spawn queue worker");
                BackendError::Native {
                    call: "create_queue",
                    code: codes::OUT_OF_RESOURCES,
                }
            })?;
        Ok(Self {
            priority,
            sender,
            worker,
        })
    }

    pub(crate) fn submit(&self, command: Command) -> Result<()> {
        self.sender.send(command).map_err(|_| BackendError::Native {
            call: "enqueue",
            code: codes::INVALID_COMMAND_QUEUE,
        })
    }

    /// Enqueue a marker and return it without waiting
    pub(crate) fn marker(&self) -> Result<Arc<SimEvent>> {
        let event = SimEvent::new();
        self.submit(Command::Marker(Arc::clone(&event)))?;
        Ok(event)
    }

    /// Drain and join the worker
    pub(crate) fn shutdown(self) {
        drop(self.sender);
        if self.worker.join().is_err() {
            tracing::error!("sim queue worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn markers_complete_in_order() {
        let queue = SimQueue::spawn(1, QueuePriority::Normal, Some(Duration::from_millis(2))).unwrap();
        let first = queue.marker().unwrap();
        let second = queue.marker().unwrap();
        second.wait();
        assert!(first.status().is_complete());
        queue.shutdown();
    }

    #[test]
    fn barrier_waits_for_other_queue() {
        let slow = SimQueue::spawn(1, QueuePriority::Normal, Some(Duration::from_millis(20))).unwrap();
        let fast = SimQueue::spawn(2, QueuePriority::High, None).unwrap();
        let gate = slow.marker().unwrap();
        fast.submit(Command::Barrier(vec![Arc::clone(&gate)])).unwrap();
        let after = fast.marker().unwrap();
        after.wait();
        assert!(gate.status().is_complete());
        slow.shutdown();
        fast.shutdown();
    }
}
