// Buffer cache.
//
// A bounded pool of sector-sized slots between the inode layer and the
// block device. All device traffic goes through here.
//
// Interface:
// * To get the current contents of a sector, call get; the returned guard
//   is pinned and exclusively locked.
// * Drop the guard promptly; a pinned slot cannot be evicted.
// * flush writes every dirty slot back, and with halt also empties the pool.
// * prefetch warms a sector without leaving it pinned.
//
// Slot bookkeeping (which sector, pin count, dirty and second-chance bits)
// lives under one state lock. The bytes of each slot live under that slot's
// own buffer lock, so a miss claims a slot under the state lock but runs the
// device transfer holding only the buffer lock. Concurrent gets of other
// sectors proceed during the I/O; gets of the same sector pin the claimed
// slot and queue on its buffer lock until the fill completes.
//
// Lock order: the state lock may acquire a slot's buffer lock only when that
// slot has no pins (claim paths, where it cannot block); a holder of a
// buffer lock may take the state lock only while it also holds a pin on that
// slot (guard drop, flush). Eviction and flush therefore cannot deadlock.

use core::ops::{Deref, DerefMut};

use array_macro::array;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard};

use crate::block::{BlockDevice, SectorBuf};
use crate::param::CACHE_SLOTS;

bitflags! {
    #[derive(Default)]
    struct SlotFlags: u8 {
        /// Contents differ from the on-device sector.
        const DIRTY = 1 << 0;
        /// Referenced since the clock hand last passed; grants a second
        /// chance at eviction time.
        const ACCESSED = 1 << 1;
    }
}

#[derive(Clone, Copy, Default)]
struct SlotMeta {
    sector: u32,
    pins: u32,
    flags: SlotFlags,
}

impl SlotMeta {
    /// Metadata for a slot just claimed for `sector`: one pin for the
    /// claimant, second chance armed, dirty iff the claimant says so.
    fn claimed(sector: u32, mark_dirty: bool) -> Self {
        let mut flags = SlotFlags::ACCESSED;
        if mark_dirty {
            flags |= SlotFlags::DIRTY;
        }
        Self {
            sector,
            pins: 1,
            flags,
        }
    }
}

struct CacheState {
    meta: [SlotMeta; CACHE_SLOTS],
    /// Slots [0, occupied) hold a sector; the pool only ever grows until it
    /// is full and slots are reused in place.
    occupied: usize,
    /// Clock position for the next eviction sweep.
    hand: usize,
}

impl CacheState {
    fn find(&self, sector: u32) -> Option<usize> {
        self.meta[..self.occupied]
            .iter()
            .position(|m| m.sector == sector)
    }

    /// One clock sweep: visit each occupied slot at most twice, stripping
    /// second-chance bits on the first visit. `None` when every slot is
    /// pinned.
    fn sweep(&mut self) -> Option<usize> {
        for _ in 0..2 * self.occupied {
            let i = self.hand;
            self.hand = (self.hand + 1) % self.occupied;
            let meta = &mut self.meta[i];
            if meta.pins > 0 {
                continue;
            }
            if meta.flags.contains(SlotFlags::ACCESSED) {
                meta.flags.remove(SlotFlags::ACCESSED);
                continue;
            }
            return Some(i);
        }
        None
    }
}

pub struct BlockCache {
    state: Mutex<CacheState>,
    slots: [Mutex<SectorBuf>; CACHE_SLOTS],
}

/// Pinned, locked handle to one cached sector. Derefs to the sector bytes.
/// Dropping it releases the buffer lock and the pin.
pub struct SlotGuard<'a> {
    cache: &'a BlockCache,
    index: usize,
    buf: Option<MutexGuard<'a, SectorBuf>>,
}

impl Deref for SlotGuard<'_> {
    type Target = [u8; crate::param::SECTOR_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.buf.as_ref().unwrap().0
    }
}

impl DerefMut for SlotGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf.as_mut().unwrap().0
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // Release the buffer lock before touching the state lock.
        self.buf.take();
        let mut state = self.cache.state.lock();
        let meta = &mut state.meta[self.index];
        debug_assert!(meta.pins > 0, "unpin of an unpinned slot");
        meta.pins -= 1;
    }
}

impl BlockCache {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CacheState {
                meta: [SlotMeta::default(); CACHE_SLOTS],
                occupied: 0,
                hand: 0,
            }),
            slots: array![_ => Mutex::new(SectorBuf::zeroed()); CACHE_SLOTS],
        }
    }

    /// Return a pinned guard whose bytes are current for `sector`. With
    /// `mark_dirty` the slot is marked dirty atomically with the pinning.
    pub fn get<'a, D: BlockDevice>(
        &'a self,
        device: &D,
        sector: u32,
        mark_dirty: bool,
    ) -> SlotGuard<'a> {
        let mut state = self.state.lock();
        loop {
            // Hit: pin under the state lock, then take the slot's buffer.
            // The pin keeps the slot bound to `sector` while we wait.
            if let Some(i) = state.find(sector) {
                let meta = &mut state.meta[i];
                meta.pins += 1;
                meta.flags.insert(SlotFlags::ACCESSED);
                if mark_dirty {
                    meta.flags.insert(SlotFlags::DIRTY);
                }
                drop(state);
                let buf = self.slots[i].lock();
                return SlotGuard {
                    cache: self,
                    index: i,
                    buf: Some(buf),
                };
            }

            // Miss with room: bring the next slot into use.
            if state.occupied < CACHE_SLOTS {
                let i = state.occupied;
                state.occupied += 1;
                state.meta[i] = SlotMeta::claimed(sector, mark_dirty);
                let mut buf = self.slots[i].try_lock().expect("fresh slot buffer held");
                drop(state);
                device.read(sector, &mut buf.0);
                return SlotGuard {
                    cache: self,
                    index: i,
                    buf: Some(buf),
                };
            }

            // Miss with the pool full: run the clock. The victim's
            // write-back and the fill both happen outside the state lock.
            if let Some(i) = state.sweep() {
                let old = state.meta[i];
                state.meta[i] = SlotMeta::claimed(sector, mark_dirty);
                let mut buf = self.slots[i].try_lock().expect("unpinned slot buffer held");
                drop(state);
                if old.flags.contains(SlotFlags::DIRTY) {
                    device.write(old.sector, &buf.0);
                }
                device.read(sector, &mut buf.0);
                return SlotGuard {
                    cache: self,
                    index: i,
                    buf: Some(buf),
                };
            }

            // Every slot is pinned. Wait for an unpin without holding the
            // state lock, then rescan: the sector may have arrived (or a
            // slot freed up) in the meantime.
            drop(state);
            core::hint::spin_loop();
            state = self.state.lock();
        }
    }

    /// Write every dirty slot to the device. With `halt`, additionally
    /// evacuate the pool; this is the shutdown path and expects no
    /// outstanding pins.
    pub fn flush<D: BlockDevice>(&self, device: &D, halt: bool) {
        for i in 0..CACHE_SLOTS {
            let mut state = self.state.lock();
            if i >= state.occupied {
                break;
            }
            if !state.meta[i].flags.contains(SlotFlags::DIRTY) {
                continue;
            }
            // Pin the slot so it keeps its sector, and clear dirty before
            // the write: a writer arriving mid-write re-marks it under the
            // state lock and queues on the buffer lock, so its bytes land
            // in a later flush rather than getting lost.
            let sector = state.meta[i].sector;
            state.meta[i].pins += 1;
            state.meta[i].flags.remove(SlotFlags::DIRTY);
            drop(state);

            let buf = self.slots[i].lock();
            device.write(sector, &buf.0);
            drop(buf);

            self.state.lock().meta[i].pins -= 1;
        }
        if halt {
            let mut state = self.state.lock();
            debug_assert!(
                state.meta[..state.occupied].iter().all(|m| m.pins == 0),
                "halting flush with pinned slots"
            );
            state.occupied = 0;
            state.hand = 0;
        }
    }

    /// Warm `sector`: run the miss path if it is absent and drop the guard
    /// immediately, leaving the slot unpinned with its second chance armed.
    pub fn prefetch<D: BlockDevice>(&self, device: &D, sector: u32) {
        if !self.resident(sector) {
            drop(self.get(device, sector, false));
        }
    }

    /// Slots currently holding a sector.
    pub fn occupied(&self) -> usize {
        self.state.lock().occupied
    }

    pub(crate) fn resident(&self, sector: u32) -> bool {
        self.state.lock().find(sector).is_some()
    }

    #[cfg(test)]
    pub(crate) fn resident_sectors(&self) -> alloc::vec::Vec<u32> {
        let state = self.state.lock();
        state.meta[..state.occupied].iter().map(|m| m.sector).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDisk;
    use crate::param::SECTOR_SIZE;

    fn disk_with_tags(capacity: u32) -> MemDisk {
        // Tag every sector with its own index so fills are checkable.
        let disk = MemDisk::new(capacity);
        let mut buf = [0u8; SECTOR_SIZE];
        for s in 0..capacity {
            buf[0] = s as u8;
            disk.write(s, &buf);
        }
        disk
    }

    #[test]
    fn miss_fills_from_device_and_hit_reuses_the_slot() {
        let disk = disk_with_tags(8);
        let cache = BlockCache::new();
        {
            let b = cache.get(&disk, 3, false);
            assert_eq!(b[0], 3);
        }
        assert_eq!(cache.occupied(), 1);
        {
            let b = cache.get(&disk, 3, false);
            assert_eq!(b[0], 3);
        }
        assert_eq!(cache.occupied(), 1);
    }

    #[test]
    fn no_sector_is_cached_twice() {
        let disk = disk_with_tags(8);
        let cache = BlockCache::new();
        let a = cache.get(&disk, 5, false);
        drop(a);
        let b = cache.get(&disk, 5, true);
        drop(b);
        let sectors = cache.resident_sectors();
        let mut dedup = sectors.clone();
        dedup.sort_unstable();
        dedup.dedup();
        assert_eq!(sectors.len(), dedup.len());
    }

    #[test]
    fn clock_gives_recently_used_slots_a_second_chance() {
        let disk = disk_with_tags(2 * CACHE_SLOTS as u32);
        let cache = BlockCache::new();
        for s in 0..CACHE_SLOTS as u32 {
            drop(cache.get(&disk, s, false));
        }
        // Pool is full; every slot still has its second chance, so the
        // first eviction strips them all and takes slot 0.
        drop(cache.get(&disk, 64, false));
        assert!(!cache.resident(0));
        assert!(cache.resident(64));
        // Re-reference sector 1; the next eviction must pass it over and
        // take sector 2 instead.
        drop(cache.get(&disk, 1, false));
        drop(cache.get(&disk, 65, false));
        assert!(cache.resident(1));
        assert!(!cache.resident(2));
    }

    #[test]
    fn pinned_slots_survive_any_amount_of_pressure() {
        let disk = disk_with_tags(3 * CACHE_SLOTS as u32);
        let cache = BlockCache::new();
        let pinned = cache.get(&disk, 7, false);
        for s in 64..64 + 2 * CACHE_SLOTS as u32 {
            drop(cache.get(&disk, s, false));
        }
        assert_eq!(pinned[0], 7);
        assert!(cache.resident(7));
    }

    #[test]
    fn eviction_writes_dirty_contents_back() {
        let disk = disk_with_tags(2 * CACHE_SLOTS as u32);
        let cache = BlockCache::new();
        {
            let mut b = cache.get(&disk, 0, true);
            b[0] = 0xee;
        }
        // Push sector 0 out.
        for s in 1..=CACHE_SLOTS as u32 {
            drop(cache.get(&disk, s, false));
        }
        assert!(!cache.resident(0));
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read(0, &mut buf);
        assert_eq!(buf[0], 0xee);
    }

    #[test]
    fn flush_halt_evacuates_after_writing_back() {
        let disk = disk_with_tags(8);
        let cache = BlockCache::new();
        {
            let mut b = cache.get(&disk, 2, true);
            b[0] = 0x55;
        }
        cache.flush(&disk, true);
        assert_eq!(cache.occupied(), 0);
        let mut buf = [0u8; SECTOR_SIZE];
        disk.read(2, &mut buf);
        assert_eq!(buf[0], 0x55);
    }

    #[test]
    fn prefetch_leaves_the_sector_resident_and_unpinned() {
        let disk = disk_with_tags(2 * CACHE_SLOTS as u32);
        let cache = BlockCache::new();
        cache.prefetch(&disk, 4);
        assert!(cache.resident(4));
        assert_eq!(cache.occupied(), 1);
        // Prefetching again is a no-op, and the slot is evictable: enough
        // fresh sectors push it out because it holds no pin.
        cache.prefetch(&disk, 4);
        assert_eq!(cache.occupied(), 1);
        for s in 8..8 + CACHE_SLOTS as u32 {
            drop(cache.get(&disk, s, false));
        }
        assert!(!cache.resident(4));
    }
}
