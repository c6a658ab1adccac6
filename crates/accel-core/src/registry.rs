//! Pointer registry: device address → owning buffer
//!
//! Every live device allocation has one entry recording its native buffer, its
//! device base address and its native size. Kernels pass flat addresses around;
//! host-side operations need the buffer behind an address, which is what
//! [`Registry::lookup`] recovers.
//!
//! ```text
//!   address ────────────┐
//!                       ▼
//!   ┌──────────┐   ┌───────────────┐      ┌────────┐
//!   │ buf3     │   │ buf7          │ ...  │ buf1   │
//!   └──────────┘   └───────────────┘      └────────┘
//!   base3          base7  ◄─delta─►
//! ```
//!
//! Lookup rules, in order:
//!
//! 1. an entry whose base equals the address wins immediately (offset 0);
//! 2. otherwise an entry below the address qualifies when the distance is a
//!    multiple of the element size and does not exceed the entry's size;
//! 3. the qualifying entry with the smallest distance wins.
//!
//! An address one past the end of buffer A therefore resolves to buffer B if B
//! starts there, and to A at `offset == size` only if nothing does.

use crate::error::{Error, Result};
use crate::lock::LockKind;
use crate::pool::{HandlePool, SlotId};
use crate::ptr::DevicePtr;
use accel_backends::BufferHandle;

/// One live device allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub buffer: BufferHandle,
    /// Device base address; host base address for host buffers
    pub address: DevicePtr,
    /// Native size in bytes
    pub size: usize,
}

impl MemoryInfo {
    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.address.addr().saturating_add(self.size as u64)
    }

    fn overlaps(&self, other: &MemoryInfo) -> bool {
        self.address.addr() < other.end() && other.address.addr() < self.end()
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub info: MemoryInfo,
    /// Distance from the buffer base, in elements of the requested size
    pub offset: usize,
}

/// Fixed-capacity address table
#[derive(Debug)]
pub struct Registry {
    pool: HandlePool<Option<MemoryInfo>>,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: HandlePool::new(LockKind::Memory, capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Record a new allocation
    pub fn insert(&mut self, info: MemoryInfo) -> Result<()> {
        debug_assert!(
            self.entries().iter().all(|entry| !entry.overlaps(&info)),
            "allocation {} ({} bytes) overlaps a live entry",
            info.address,
            info.size
        );
        let slot = self.pool.acquire()?;
        *self.pool.get_mut(slot)? = Some(info);
        Ok(())
    }

    /// Find the allocation containing `ptr`.
    ///
    /// `elsize` is the element size the offset is expressed in; `amount` is
    /// the number of elements the caller is about to touch, checked against
    /// the entry size in debug builds only.
    pub fn lookup(&self, ptr: DevicePtr, elsize: usize, amount: Option<usize>) -> Option<Resolved> {
        self.find(ptr, elsize, amount).map(|(_, resolved)| resolved)
    }

    fn find(&self, ptr: DevicePtr, elsize: usize, amount: Option<usize>) -> Option<(SlotId, Resolved)> {
        let elsize = elsize.max(1) as u64;
        let mut best: Option<(SlotId, MemoryInfo, u64)> = None;

        for (slot, entry) in self.pool.live() {
            let Some(info) = entry else { continue };
            let Some(delta) = ptr.offset_from(info.address) else {
                continue;
            };
            if delta == 0 {
                return Some((slot, Resolved { info: *info, offset: 0 }));
            }
            if best.is_some_and(|(_, _, closest)| closest <= delta) {
                continue;
            }
            if delta % elsize != 0 || delta > info.size as u64 {
                continue;
            }
            if cfg!(debug_assertions) {
                let touched = amount.map_or(0, |n| (n as u64).saturating_mul(elsize));
                if delta.saturating_add(touched) > info.size as u64 {
                    continue;
                }
            }
            best = Some((slot, *info, delta));
        }

        best.map(|(slot, info, delta)| {
            (
                slot,
                Resolved {
                    info,
                    offset: (delta / elsize) as usize,
                },
            )
        })
    }

    /// Remove the entry whose base is exactly `base`
    pub fn remove(&mut self, base: DevicePtr) -> Result<MemoryInfo> {
        let slot = self
            .pool
            .live()
            .find(|(_, entry)| matches!(entry, Some(info) if info.address == base))
            .map(|(slot, _)| slot);
        let Some(slot) = slot else {
            if let Some(inner) = self.lookup(base, 1, None) {
                tracing::debug!(
                    ptr = %base,
                    buffer = %inner.info.buffer,
                    offset = inner.offset,
                    "free of an interior pointer"
                );
            }
            return Err(Error::InvalidPointer { ptr: base });
        };
        let info = (*self.pool.get(slot)?).ok_or(Error::InvalidPointer { ptr: base })?;
        self.pool.swap_remove(slot)?;
        Ok(info)
    }

    /// Snapshot of every live entry
    pub fn entries(&self) -> Vec<MemoryInfo> {
        self.pool.live().filter_map(|(_, entry)| *entry).collect()
    }

    /// Remove every entry, returning them
    pub fn drain(&mut self) -> Vec<MemoryInfo> {
        let entries = self.entries();
        for slot in self.pool.live_ids() {
            let _ = self.pool.release(slot);
        }
        entries
    }
}

/// First pair of overlapping entries, if any
pub fn find_overlap(entries: &[MemoryInfo]) -> Option<(MemoryInfo, MemoryInfo)> {
    let mut sorted = entries.to_vec();
    sorted.sort_by_key(|info| info.address);
    sorted
        .windows(2)
        .find(|pair| pair[0].overlaps(&pair[1]))
        .map(|pair| (pair[0], pair[1]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn info(buffer: u64, address: u64, size: usize) -> MemoryInfo {
        MemoryInfo {
            buffer: BufferHandle::new(buffer),
            address: DevicePtr::new(address),
            size,
        }
    }

    fn registry(entries: &[MemoryInfo]) -> Registry {
        let mut registry = Registry::new(16);
        for entry in entries {
            registry.insert(*entry).unwrap();
        }
        registry
    }

    #[test]
    fn exact_and_interior_lookup() {
        let registry = registry(&[info(1, 0x1000, 256), info(2, 0x2000, 64)]);

        let hit = registry.lookup(DevicePtr::new(0x2000), 1, None).unwrap();
        assert_eq!(hit.info.buffer, BufferHandle::new(2));
        assert_eq!(hit.offset, 0);

        let hit = registry.lookup(DevicePtr::new(0x1010), 1, Some(16)).unwrap();
        assert_eq!(hit.info.buffer, BufferHandle::new(1));
        assert_eq!(hit.offset, 0x10);
    }

    #[test]
    fn element_size_scales_offset() {
        let registry = registry(&[info(1, 0x1000, 256)]);
        let hit = registry.lookup(DevicePtr::new(0x1020), 8, Some(2)).unwrap();
        assert_eq!(hit.offset, 4);
        assert!(registry.lookup(DevicePtr::new(0x1021), 8, None).is_none());
    }

    #[test]
    fn misses_outside_any_entry() {
        let registry = registry(&[info(1, 0x1000, 256)]);
        assert!(registry.lookup(DevicePtr::new(0xfff), 1, None).is_none());
        assert!(registry.lookup(DevicePtr::new(0x1101), 1, None).is_none());
    }

    #[test]
    fn one_past_end_prefers_the_next_buffer() {
        let registry = registry(&[info(1, 0x1000, 0x100), info(2, 0x1100, 0x100)]);
        let hit = registry.lookup(DevicePtr::new(0x1100), 1, None).unwrap();
        assert_eq!(hit.info.buffer, BufferHandle::new(2));
        assert_eq!(hit.offset, 0);
    }

    #[test]
    fn one_past_end_without_neighbour_is_a_zero_length_view() {
        let registry = registry(&[info(1, 0x1000, 0x100)]);
        let hit = registry.lookup(DevicePtr::new(0x1100), 1, Some(0)).unwrap();
        assert_eq!(hit.info.buffer, BufferHandle::new(1));
        assert_eq!(hit.offset, 0x100);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn amount_is_bounded_in_debug_builds() {
        let registry = registry(&[info(1, 0x1000, 0x100)]);
        assert!(registry.lookup(DevicePtr::new(0x10f0), 1, Some(0x10)).is_some());
        assert!(registry.lookup(DevicePtr::new(0x10f0), 1, Some(0x11)).is_none());
    }

    #[test]
    fn remove_requires_exact_base() {
        let mut registry = registry(&[info(1, 0x1000, 0x100), info(2, 0x2000, 0x100)]);
        assert!(matches!(
            registry.remove(DevicePtr::new(0x1008)),
            Err(Error::InvalidPointer { .. })
        ));
        let removed = registry.remove(DevicePtr::new(0x1000)).unwrap();
        assert_eq!(removed.buffer, BufferHandle::new(1));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(DevicePtr::new(0x1000), 1, None).is_none());
        assert!(registry.lookup(DevicePtr::new(0x2000), 1, None).is_some());
    }

    #[test]
    fn capacity_is_fixed() {
        let mut registry = Registry::new(2);
        registry.insert(info(1, 0x1000, 8)).unwrap();
        registry.insert(info(2, 0x2000, 8)).unwrap();
        assert!(matches!(
            registry.insert(info(3, 0x3000, 8)),
            Err(Error::PoolExhausted { .. })
        ));
        assert_eq!(registry.entries().len(), 2);
    }

    #[test]
    fn drain_empties_the_table() {
        let mut registry = registry(&[info(1, 0x1000, 8), info(2, 0x2000, 8)]);
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }

    #[test]
    fn overlap_detection() {
        assert!(find_overlap(&[info(1, 0x1000, 0x100), info(2, 0x1100, 8)]).is_none());
        assert!(find_overlap(&[info(1, 0x1000, 0x101), info(2, 0x1100, 8)]).is_some());
    }

    proptest! {
        #[test]
        fn every_interior_byte_resolves_to_its_buffer(
            sizes in prop::collection::vec(1usize..512, 1..12),
            pick in any::<prop::sample::Index>(),
            fraction in 0.0f64..1.0,
        ) {
            let mut registry = Registry::new(16);
            let mut entries = Vec::new();
            let mut address = 0x10_0000u64;
            for (i, size) in sizes.iter().enumerate() {
                let entry = info(i as u64, address, *size);
                registry.insert(entry).unwrap();
                entries.push(entry);
                address += (*size as u64).next_multiple_of(256);
            }

            let target = entries[pick.index(entries.len())];
            let offset = ((target.size as f64) * fraction) as usize;
            let hit = registry.lookup(target.address.byte_add(offset), 1, Some(1));
            prop_assert_eq!(hit.map(|h| (h.info, h.offset)), Some((target, offset)));
        }

        #[test]
        fn removal_leaves_others_resolvable(count in 2usize..10, victim in 0usize..10) {
            let victim = victim % count;
            let entries: Vec<_> = (0..count).map(|i| info(i as u64, 0x1000 * (i as u64 + 1), 0x80)).collect();
            let mut registry = registry(&entries);
            registry.remove(entries[victim].address).unwrap();

            for (i, entry) in entries.iter().enumerate() {
                let hit = registry.lookup(entry.address, 1, None);
                if i == victim {
                    prop_assert!(hit.is_none());
                } else {
                    prop_assert_eq!(hit.map(|h| h.info), Some(*entry));
                }
            }
        }
    }
}
