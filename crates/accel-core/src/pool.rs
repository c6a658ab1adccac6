//! Fixed-capacity handle pool
//!
//! Slots are addressed by [`SlotId`]. An index permutation tracks which slots
//! are free without any allocation after construction:
//!
//! ```text
//!   order:  [ f f f f | l l l l l l ]
//!            0     free          capacity
//!            ^ free slots         ^ live slots
//! ```
//!
//! `acquire` takes the slot just below the boundary and moves the boundary
//! down; `release` swaps the released slot with the one at the boundary and
//! moves it back up. Both are O(1). The live slots are always exactly
//! `order[free..]`, which is what [`HandlePool::live`] walks.
//!
//! A pool is not synchronized by itself; every pool in a [`crate::Context`]
//! sits behind one of the named locks.

use crate::error::{Error, Result};
use crate::lock::LockKind;

/// Index of a slot in a [`HandlePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u32);

impl SlotId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Bounded set of reusable slots
#[derive(Debug)]
pub struct HandlePool<T> {
    kind: LockKind,
    slots: Vec<T>,
    order: Vec<u32>,
    /// `position[slot] == i` iff `order[i] == slot`
    position: Vec<u32>,
    free: usize,
}

impl<T: Default> HandlePool<T> {
    /// Pool with `capacity` default-initialized slots, all free
    pub fn new(kind: LockKind, capacity: usize) -> Self {
        assert!(capacity <= u32::MAX as usize, "pool capacity {capacity} too large");
        let order: Vec<u32> = (0..capacity as u32).collect();
        Self {
            kind,
            slots: (0..capacity).map(|_| T::default()).collect(),
            position: order.clone(),
            order,
            free: capacity,
        }
    }

    /// Take a free slot. Its content is `T::default()`.
    pub fn acquire(&mut self) -> Result<SlotId> {
        if self.free == 0 {
            return Err(Error::PoolExhausted {
                pool: self.kind,
                capacity: self.capacity(),
            });
        }
        self.free -= 1;
        Ok(SlotId(self.order[self.free]))
    }

    /// Return a live slot to the pool and reset its content
    pub fn release(&mut self, id: SlotId) -> Result<()> {
        self.check_live(id)?;
        self.slots[id.index()] = T::default();
        let boundary = self.order[self.free];
        self.swap_order(id.0, boundary);
        self.free += 1;
        Ok(())
    }

    /// Release `id` by moving the most recently acquired live slot's content
    /// into it and returning that slot instead. Returns the id whose content
    /// moved into `id`, if any.
    pub fn swap_remove(&mut self, id: SlotId) -> Result<Option<SlotId>> {
        self.check_live(id)?;
        let tail = SlotId(self.order[self.free]);
        if tail == id {
            self.release(id)?;
            return Ok(None);
        }
        let moved = std::mem::take(&mut self.slots[tail.index()]);
        self.slots[id.index()] = moved;
        self.release(tail)?;
        Ok(Some(tail))
    }
}

impl<T> HandlePool<T> {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.capacity() - self.free
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_live(&self, id: SlotId) -> bool {
        self.position
            .get(id.index())
            .is_some_and(|&pos| pos as usize >= self.free)
    }

    pub fn get(&self, id: SlotId) -> Result<&T> {
        self.check_live(id)?;
        Ok(&self.slots[id.index()])
    }

    pub fn get_mut(&mut self, id: SlotId) -> Result<&mut T> {
        self.check_live(id)?;
        Ok(&mut self.slots[id.index()])
    }

    /// Live slots, most recently acquired first
    pub fn live(&self) -> impl Iterator<Item = (SlotId, &T)> + '_ {
        self.order[self.free..]
            .iter()
            .map(move |&slot| (SlotId(slot), &self.slots[slot as usize]))
    }

    /// Live slot ids, most recently acquired first
    pub fn live_ids(&self) -> Vec<SlotId> {
        self.order[self.free..].iter().map(|&slot| SlotId(slot)).collect()
    }

    fn check_live(&self, id: SlotId) -> Result<()> {
        if self.is_live(id) {
            Ok(())
        } else {
            Err(Error::InvalidHandle {
                pool: self.kind,
                slot: id.0,
            })
        }
    }

    fn swap_order(&mut self, a: u32, b: u32) {
        let (pa, pb) = (self.position[a as usize], self.position[b as usize]);
        self.order.swap(pa as usize, pb as usize);
        self.position[a as usize] = pb;
        self.position[b as usize] = pa;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn acquire_until_exhausted() {
        let mut pool: HandlePool<u32> = HandlePool::new(LockKind::Event, 3);
        let ids: HashSet<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
        assert_eq!(ids.len(), 3);
        assert!(matches!(
            pool.acquire(),
            Err(Error::PoolExhausted { capacity: 3, .. })
        ));
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn release_resets_and_recycles() {
        let mut pool: HandlePool<u32> = HandlePool::new(LockKind::Stream, 2);
        let a = pool.acquire().unwrap();
        *pool.get_mut(a).unwrap() = 9;
        pool.release(a).unwrap();
        assert!(!pool.is_live(a));
        assert!(pool.get(a).is_err());

        let b = pool.acquire().unwrap();
        assert_eq!(*pool.get(b).unwrap(), 0);
    }

    #[test]
    fn double_release_is_rejected() {
        let mut pool: HandlePool<u32> = HandlePool::new(LockKind::Event, 2);
        let a = pool.acquire().unwrap();
        pool.release(a).unwrap();
        assert!(matches!(pool.release(a), Err(Error::InvalidHandle { .. })));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn release_out_of_order_keeps_live_set() {
        let mut pool: HandlePool<u32> = HandlePool::new(LockKind::Memory, 4);
        let ids: Vec<_> = (0..4).map(|_| pool.acquire().unwrap()).collect();
        pool.release(ids[1]).unwrap();
        pool.release(ids[3]).unwrap();
        let live: HashSet<_> = pool.live_ids().into_iter().collect();
        assert_eq!(live, HashSet::from([ids[0], ids[2]]));
    }

    #[test]
    fn swap_remove_moves_tail_content() {
        let mut pool: HandlePool<u32> = HandlePool::new(LockKind::Memory, 4);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        for (id, value) in [(a, 1), (b, 2), (c, 3)] {
            *pool.get_mut(id).unwrap() = value;
        }

        assert_eq!(pool.swap_remove(a).unwrap(), Some(c));
        assert_eq!(*pool.get(a).unwrap(), 3);
        assert!(!pool.is_live(c));

        let mut values: Vec<_> = pool.live().map(|(_, v)| *v).collect();
        values.sort_unstable();
        assert_eq!(values, [2, 3]);
    }

    #[test]
    fn swap_remove_of_tail_is_plain_release() {
        let mut pool: HandlePool<u32> = HandlePool::new(LockKind::Memory, 2);
        let _a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.swap_remove(b).unwrap(), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn empty_pool_is_always_exhausted() {
        let mut pool: HandlePool<()> = HandlePool::new(LockKind::Stream, 0);
        assert!(pool.acquire().is_err());
        assert!(pool.is_empty());
    }
}
