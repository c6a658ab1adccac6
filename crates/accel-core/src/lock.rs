//! The six named locks
//!
//! Every mutable resource category of a [`crate::Context`] sits behind exactly
//! one of these. Declaration order of [`LockKind`] is the global acquisition
//! order; debug builds assert that a thread only ever takes a lock that comes
//! after every lock it already holds.

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Resource categories, in acquisition order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockKind {
    /// Active-device selection
    Main,
    /// Stream pool and per-thread default queues
    Stream,
    /// Event pool
    Event,
    /// Pointer registry and the address-resolution kernel
    Memory,
    /// Fill micro-kernel
    Memset,
    /// Copy micro-kernel
    Memcpy,
}

impl LockKind {
    pub const ALL: [LockKind; 6] = [
        LockKind::Main,
        LockKind::Stream,
        LockKind::Event,
        LockKind::Memory,
        LockKind::Memset,
        LockKind::Memcpy,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            LockKind::Main => "main",
            LockKind::Stream => "stream",
            LockKind::Event => "event",
            LockKind::Memory => "memory",
            LockKind::Memset => "memset",
            LockKind::Memcpy => "memcpy",
        }
    }

    #[cfg(debug_assertions)]
    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: std::cell::Cell<u8> = const { std::cell::Cell::new(0) };
}

/// Mutex tagged with its resource category
pub struct NamedLock<T> {
    kind: LockKind,
    inner: Mutex<T>,
}

impl<T> NamedLock<T> {
    pub const fn new(kind: LockKind, value: T) -> Self {
        Self {
            kind,
            inner: Mutex::new(value),
        }
    }

    pub fn kind(&self) -> LockKind {
        self.kind
    }

    /// Acquire; blocks the calling thread only
    pub fn lock(&self) -> NamedGuard<'_, T> {
        #[cfg(debug_assertions)]
        HELD.with(|held| {
            let mask = held.get();
            debug_assert!(
                mask < self.kind.bit(),
                "`{}` lock taken out of order (held mask {mask:#08b})",
                self.kind
            );
            held.set(mask | self.kind.bit());
        });
        NamedGuard {
            kind: self.kind,
            guard: self.inner.lock(),
        }
    }

    /// Exclusive access without locking
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T: fmt::Debug> fmt::Debug for NamedLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamedLock").field("kind", &self.kind).finish_non_exhaustive()
    }
}

/// Guard returned by [`NamedLock::lock`]
pub struct NamedGuard<'a, T> {
    kind: LockKind,
    guard: MutexGuard<'a, T>,
}

impl<T> NamedGuard<'_, T> {
    pub fn kind(&self) -> LockKind {
        self.kind
    }
}

impl<T> Deref for NamedGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for NamedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for NamedGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        HELD.with(|held| held.set(held.get() & !self.kind.bit()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_nesting_is_allowed() {
        let main = NamedLock::new(LockKind::Main, 1);
        let memory = NamedLock::new(LockKind::Memory, 2);
        let main_guard = main.lock();
        let memory_guard = memory.lock();
        assert_eq!(*main_guard + *memory_guard, 3);
    }

    #[test]
    fn sequential_use_in_any_order() {
        let memcpy = NamedLock::new(LockKind::Memcpy, ());
        let stream = NamedLock::new(LockKind::Stream, ());
        drop(memcpy.lock());
        drop(stream.lock());
        drop(memcpy.lock());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "taken out of order")]
    fn reverse_nesting_panics_in_debug() {
        let event = NamedLock::new(LockKind::Event, ());
        let stream = NamedLock::new(LockKind::Stream, ());
        let _event = event.lock();
        let _stream = stream.lock();
    }

    #[test]
    fn names_follow_order() {
        let names: Vec<_> = LockKind::ALL.iter().map(|kind| kind.name()).collect();
        assert_eq!(names, ["main", "stream", "event", "memory", "memset", "memcpy"]);
        assert!(LockKind::ALL.windows(2).all(|pair| pair[0] < pair[1]));
    }
}
