// Filesystem context.
//
// Owns the device, the free-sector allocator, the buffer cache and the
// table of open inodes; every operation threads through a shared reference
// to this struct instead of process-wide globals, so a mount is just a
// value and unmount is flush-with-halt.
//
// Layering, bottom to top:
//   - the cache (cache.rs) is the only code that touches the device;
//   - the index walk maps byte offsets to sectors and grows the tree
//     behind its three cursors;
//   - the open-inode table hands every opener of a sector the same Arc,
//     which is what makes deny_write counts meaningful across openers.
//
// Locking: an operation takes at most one inode's body lock, and may take
// cache locks below it. The table lock is held for table membership and
// open/deny counts only, never across device I/O except the inode load on
// first open. Opens and closes of the same sector are serialized by the
// caller, as the syscall layer's file-system lock does.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;
use zerocopy::{AsBytes, LayoutVerified};

use crate::block::BlockDevice;
use crate::cache::{BlockCache, SlotGuard};
use crate::freemap::SectorAllocator;
use crate::inode::{
    data_sectors, double_blocks, indirect_blocks, DiskInode, IndirectBlock, Inode, InodeBody,
};
use crate::param::{
    DOUBLE_SLOT, MAX_BYTES, NDIRECT, NSINDIRECT, PTRS_PER_BLOCK, ROOT_SECTOR, SECTOR_SIZE,
};

pub struct Filesystem<D: BlockDevice, A: SectorAllocator> {
    device: D,
    allocator: A,
    cache: BlockCache,
    /// Open-inode table. Keyed by sector: at most one in-memory inode per
    /// sector exists at any time.
    open_inodes: Mutex<Vec<Arc<Inode>>>,
}

impl<D: BlockDevice, A: SectorAllocator> Filesystem<D, A> {
    pub fn new(device: D, allocator: A) -> Self {
        Self {
            device,
            allocator,
            cache: BlockCache::new(),
            open_inodes: Mutex::new(Vec::new()),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Pinned guard for one sector; see BlockCache::get.
    pub fn cache_get(&self, sector: u32, mark_dirty: bool) -> SlotGuard<'_> {
        self.cache.get(&self.device, sector, mark_dirty)
    }

    /// Write all dirty cache slots back; with `halt`, also empty the cache.
    pub fn flush(&self, halt: bool) {
        self.cache.flush(&self.device, halt);
    }

    /// Synchronously warm `sector` in the cache. Out-of-range sectors are
    /// ignored so speculative callers never fault.
    pub fn prefetch(&self, sector: u32) {
        if sector < self.device.capacity() {
            self.cache.prefetch(&self.device, sector);
        }
    }

    // Inode lifecycle.

    /// Write a fresh inode at `sector` with `length` bytes of zeroed
    /// content. Returns false when the device fills up first; the inode is
    /// still written, with however much length was covered.
    pub fn create(&self, sector: u32, length: u32, is_dir: bool) -> bool {
        let mut body = InodeBody::empty(ROOT_SECTOR);
        body.length = self.expand(&mut body, length.min(MAX_BYTES));
        let disk = DiskInode::from_body(&body, is_dir);
        let mut bp = self.cache_get(sector, true);
        bp.copy_from_slice(disk.as_bytes());
        drop(bp);
        body.length == length
    }

    /// Open the inode stored at `sector`, or hand back the one every other
    /// opener already shares.
    pub fn open(&self, sector: u32) -> Arc<Inode> {
        let mut table = self.open_inodes.lock();
        if let Some(ip) = table.iter().find(|ip| ip.sector() == sector) {
            ip.meta.lock().open_count += 1;
            return Arc::clone(ip);
        }
        let ip = {
            let bp = self.cache_get(sector, false);
            let disk = LayoutVerified::<_, DiskInode>::new(&bp[..])
                .expect("inode sector misaligned");
            Arc::new(Inode::from_disk(sector, &disk))
        };
        table.push(Arc::clone(&ip));
        ip
    }

    /// Add an opener to an already-open inode.
    pub fn reopen(&self, ip: &Arc<Inode>) {
        ip.meta.lock().open_count += 1;
    }

    /// Drop one opener. The last close leaves the table and either writes
    /// the inode back to its sector or, if it was removed, returns the
    /// inode sector and every sector of content and index to the allocator.
    pub fn close(&self, ip: Arc<Inode>) {
        let removed = {
            let mut table = self.open_inodes.lock();
            let mut meta = ip.meta.lock();
            meta.open_count -= 1;
            if meta.open_count > 0 {
                return;
            }
            table.retain(|other| !Arc::ptr_eq(other, &ip));
            meta.removed
        };
        let body = ip.body.lock();
        if removed {
            self.allocator.release(ip.sector(), 1);
            self.dealloc(&body);
        } else {
            let disk = DiskInode::from_body(&body, ip.is_dir());
            let mut bp = self.cache_get(ip.sector(), true);
            bp.copy_from_slice(disk.as_bytes());
        }
    }

    // File content.

    /// Read up to `buf.len()` bytes at `offset`, returning the count read;
    /// short at end of file. The bound is the inode's published read
    /// length, so a reader racing a growing write sees the file as it was
    /// before the write or after it, never a half-written tail.
    pub fn read_at(&self, ip: &Inode, buf: &mut [u8], offset: u32) -> usize {
        let bound = ip.read_length();
        let mut done = 0;
        let mut off = offset;
        while done < buf.len() && off < bound {
            let sector = match self.sector_for(ip, bound, off) {
                Some(s) => s,
                None => break,
            };
            let within = off as usize % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min(SECTOR_SIZE - within)
                .min((bound - off) as usize);
            let bp = self.cache_get(sector, false);
            buf[done..done + chunk].copy_from_slice(&bp[within..within + chunk]);
            drop(bp);
            done += chunk;
            off += chunk as u32;
        }
        done
    }

    /// Write `buf` at `offset`, growing the file first when it ends beyond
    /// the current length. Returns the count written: zero while writes are
    /// denied, short when the allocator or the index tree runs out. The new
    /// length becomes visible to readers only once every byte is in place.
    pub fn write_at(&self, ip: &Inode, buf: &[u8], offset: u32) -> usize {
        if ip.meta.lock().deny_write_count > 0 {
            return 0;
        }
        let want = (offset as u64 + buf.len() as u64).min(MAX_BYTES as u64) as u32;
        let length = {
            let mut body = ip.body.lock();
            if want > body.length {
                body.length = self.expand(&mut body, want);
            }
            body.length
        };
        let mut done = 0;
        let mut off = offset;
        while done < buf.len() && off < length {
            let sector = match self.sector_for(ip, length, off) {
                Some(s) => s,
                None => break,
            };
            let within = off as usize % SECTOR_SIZE;
            let chunk = (buf.len() - done)
                .min(SECTOR_SIZE - within)
                .min((length - off) as usize);
            let mut bp = self.cache_get(sector, true);
            bp[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
            drop(bp);
            done += chunk;
            off += chunk as u32;
        }
        ip.publish_read_length(length);
        done
    }

    // Index walk.

    /// Map a byte offset to its data sector. `bound` is the caller's view
    /// of the file length: readers pass the published read length, writers
    /// the grown length. Pointers are copied out under a short body lock;
    /// the indirect blocks themselves come from the cache.
    pub(crate) fn sector_for(&self, ip: &Inode, bound: u32, pos: u32) -> Option<u32> {
        if pos >= bound {
            return None;
        }
        let s = pos as usize / SECTOR_SIZE;
        if s < NDIRECT {
            return Some(ip.body.lock().pointers[s]);
        }
        let s = s - NDIRECT;
        if s < NSINDIRECT * PTRS_PER_BLOCK {
            let slot = NDIRECT + s / PTRS_PER_BLOCK;
            let indirect = ip.body.lock().pointers[slot];
            return Some(self.indirect_entry(indirect, s % PTRS_PER_BLOCK));
        }
        let s = s - NSINDIRECT * PTRS_PER_BLOCK;
        let outer = ip.body.lock().pointers[DOUBLE_SLOT];
        let inner = self.indirect_entry(outer, s / PTRS_PER_BLOCK);
        Some(self.indirect_entry(inner, s % PTRS_PER_BLOCK))
    }

    fn indirect_entry(&self, block: u32, idx: usize) -> u32 {
        let bp = self.cache_get(block, false);
        let view = LayoutVerified::<_, IndirectBlock>::new(&bp[..])
            .expect("indirect block misaligned");
        view.ptrs[idx]
    }

    // Growth. One sector at a time, zero-filled through the cache,
    // advancing the cursors; they never move backwards. On allocator
    // exhaustion the partial tree stays and the achieved length reflects
    // exactly the sectors that landed.

    /// Grow the index tree to cover `target` bytes. Returns the byte length
    /// actually covered, which is `target` unless the allocator or the tree
    /// runs out.
    pub(crate) fn expand(&self, body: &mut InodeBody, target: u32) -> u32 {
        let mut need = data_sectors(target).saturating_sub(data_sectors(body.length));
        if need == 0 {
            return target;
        }

        while body.direct_index < NDIRECT as u32 {
            let s = match self.allocator.allocate(1) {
                Some(s) => s,
                None => return achieved(body.length, target, need),
            };
            self.zero_sector(s);
            body.pointers[body.direct_index as usize] = s;
            body.direct_index += 1;
            need -= 1;
            if need == 0 {
                return target;
            }
        }
        while body.direct_index < DOUBLE_SLOT as u32 {
            let (left, ok) = self.expand_single(body, need);
            need = left;
            if need == 0 {
                return target;
            }
            if !ok {
                return achieved(body.length, target, need);
            }
        }
        let (left, _) = self.expand_double(body, need);
        if left == 0 {
            target
        } else {
            achieved(body.length, target, left)
        }
    }

    /// Fill the single-indirect region at the direct cursor. Allocates the
    /// indirect block lazily on first use; when its 128 entries are full
    /// the direct cursor advances and the indirect cursor resets.
    fn expand_single(&self, body: &mut InodeBody, mut need: u32) -> (u32, bool) {
        let slot = body.direct_index as usize;
        let fresh = body.indirect_index == 0;
        if fresh {
            match self.allocator.allocate(1) {
                Some(s) => body.pointers[slot] = s,
                None => return (need, false),
            }
        }
        let mut bp = self.cache_get(body.pointers[slot], true);
        if fresh {
            bp.fill(0);
        }
        let mut block = LayoutVerified::<_, IndirectBlock>::new(&mut bp[..])
            .expect("indirect block misaligned");
        let mut ok = true;
        while body.indirect_index < PTRS_PER_BLOCK as u32 {
            let s = match self.allocator.allocate(1) {
                Some(s) => s,
                None => {
                    ok = false;
                    break;
                }
            };
            self.zero_sector(s);
            block.ptrs[body.indirect_index as usize] = s;
            body.indirect_index += 1;
            need -= 1;
            if need == 0 {
                break;
            }
        }
        drop(bp);
        if !ok && fresh && body.indirect_index == 0 {
            // The fresh block received nothing; give it back so teardown
            // (which counts from the length) stays exact.
            self.allocator.release(body.pointers[slot], 1);
            body.pointers[slot] = 0;
            return (need, false);
        }
        if body.indirect_index == PTRS_PER_BLOCK as u32 {
            body.indirect_index = 0;
            body.direct_index += 1;
        }
        (need, ok)
    }

    /// Fill the double-indirect region: an outer block of indirect blocks,
    /// each filled by expand_double_inner behind the inner cursor pair.
    fn expand_double(&self, body: &mut InodeBody, mut need: u32) -> (u32, bool) {
        let fresh = body.indirect_index == 0 && body.double_indirect_index == 0;
        if fresh {
            match self.allocator.allocate(1) {
                Some(s) => body.pointers[DOUBLE_SLOT] = s,
                None => return (need, false),
            }
        }
        let mut bp = self.cache_get(body.pointers[DOUBLE_SLOT], true);
        if fresh {
            bp.fill(0);
        }
        let mut outer = LayoutVerified::<_, IndirectBlock>::new(&mut bp[..])
            .expect("indirect block misaligned");
        let mut ok = true;
        while body.indirect_index < PTRS_PER_BLOCK as u32 {
            let (left, inner_ok) = self.expand_double_inner(body, need, &mut outer);
            need = left;
            if !inner_ok {
                ok = false;
                break;
            }
            if need == 0 {
                break;
            }
        }
        drop(bp);
        if !ok && fresh && body.indirect_index == 0 && body.double_indirect_index == 0 {
            self.allocator.release(body.pointers[DOUBLE_SLOT], 1);
            body.pointers[DOUBLE_SLOT] = 0;
            return (need, false);
        }
        (need, ok)
    }

    fn expand_double_inner(
        &self,
        body: &mut InodeBody,
        mut need: u32,
        outer: &mut IndirectBlock,
    ) -> (u32, bool) {
        let slot = body.indirect_index as usize;
        let fresh = body.double_indirect_index == 0;
        if fresh {
            match self.allocator.allocate(1) {
                Some(s) => outer.ptrs[slot] = s,
                None => return (need, false),
            }
        }
        let mut bp = self.cache_get(outer.ptrs[slot], true);
        if fresh {
            bp.fill(0);
        }
        let mut inner = LayoutVerified::<_, IndirectBlock>::new(&mut bp[..])
            .expect("indirect block misaligned");
        let mut ok = true;
        while body.double_indirect_index < PTRS_PER_BLOCK as u32 {
            let s = match self.allocator.allocate(1) {
                Some(s) => s,
                None => {
                    ok = false;
                    break;
                }
            };
            self.zero_sector(s);
            inner.ptrs[body.double_indirect_index as usize] = s;
            body.double_indirect_index += 1;
            need -= 1;
            if need == 0 {
                break;
            }
        }
        drop(bp);
        if !ok && fresh && body.double_indirect_index == 0 {
            self.allocator.release(outer.ptrs[slot], 1);
            outer.ptrs[slot] = 0;
            return (need, false);
        }
        if body.double_indirect_index == PTRS_PER_BLOCK as u32 {
            body.double_indirect_index = 0;
            body.indirect_index += 1;
        }
        (need, ok)
    }

    /// A sector fresh from the allocator may carry stale bytes on the
    /// device and in the cache; zero it through the cache so both agree.
    fn zero_sector(&self, sector: u32) {
        let mut bp = self.cache_get(sector, true);
        bp.fill(0);
    }

    // Teardown. Counts recomputed from the byte length rather than the
    // cursors: a partial growth may have stopped before its final cursor
    // state, but the length always says exactly which sectors exist.

    fn dealloc(&self, body: &InodeBody) {
        let mut data = data_sectors(body.length);
        let mut indirect = indirect_blocks(body.length);
        let doubles = double_blocks(body.length);

        let mut slot = 0;
        while data > 0 && slot < NDIRECT {
            self.allocator.release(body.pointers[slot], 1);
            data -= 1;
            slot += 1;
        }
        while indirect > 0 && slot < DOUBLE_SLOT {
            let entries = data.min(PTRS_PER_BLOCK as u32);
            self.release_indirect(body.pointers[slot], entries);
            data -= entries;
            indirect -= 1;
            slot += 1;
        }
        if doubles > 0 {
            self.release_double(body.pointers[DOUBLE_SLOT], indirect, data);
        }
    }

    fn release_indirect(&self, block: u32, entries: u32) {
        let ptrs = self.read_indirect(block);
        for &s in &ptrs[..entries as usize] {
            self.allocator.release(s, 1);
        }
        self.allocator.release(block, 1);
    }

    fn release_double(&self, block: u32, inner_blocks: u32, mut data: u32) {
        let ptrs = self.read_indirect(block);
        for &inner in &ptrs[..inner_blocks as usize] {
            let entries = data.min(PTRS_PER_BLOCK as u32);
            self.release_indirect(inner, entries);
            data -= entries;
        }
        self.allocator.release(block, 1);
    }

    fn read_indirect(&self, block: u32) -> [u32; PTRS_PER_BLOCK] {
        let bp = self.cache_get(block, false);
        let view = LayoutVerified::<_, IndirectBlock>::new(&bp[..])
            .expect("indirect block misaligned");
        view.ptrs
    }

    #[cfg(test)]
    pub(crate) fn open_count(&self) -> usize {
        self.open_inodes.lock().len()
    }
}

/// Achieved length after a growth that fell `remaining` sectors short of
/// covering `target` bytes. Floored at the old length: if nothing at all
/// landed, the file simply did not grow.
fn achieved(old_length: u32, target: u32, remaining: u32) -> u32 {
    target
        .saturating_sub(remaining * SECTOR_SIZE as u32)
        .max(old_length)
}
