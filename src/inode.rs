// Inode layer data model.
//
// An inode describes a single unnamed file or directory and occupies
// exactly one sector. Content sectors are reached through a three-level
// index: pointer slots 0..4 address data sectors directly, slots 4..13 each
// address an indirect block of 128 sector indices, and slot 13 addresses a
// block of indirect blocks. Growth fills the tree in that order behind
// three cursors that only ever advance; teardown recomputes every count
// from the byte length, so a partially grown tree (whose cursors stopped
// mid-stride) is released exactly.
//
// The in-memory inode is shared by every opener through the open-inode
// table in fs.rs. Bookkeeping that never reaches the disk (open count,
// deny-write count, the removal mark) lives beside the mirrored fields, and
// read_length is the file size readers trust: it trails length while a
// growing write is in flight and catches up when the write completes.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::param::{INODE_MAGIC, INODE_PTRS, NDIRECT, PTRS_PER_BLOCK, SECTOR_SIZE};

/// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    /// File size in bytes. Signed on disk; never negative in a valid inode.
    pub length: i32,
    /// Must be INODE_MAGIC.
    pub magic: u32,
    /// Growth cursors: how far each level of the index tree is populated.
    pub direct_index: u32,
    pub indirect_index: u32,
    pub double_indirect_index: u32,
    /// Nonzero for directories. A u32 so the record has no padding.
    pub is_directory: u32,
    /// Sector of the parent directory's inode.
    pub parent: u32,
    reserved: [u32; 107],
    /// Slots 0..4 direct, 4..13 single-indirect, 13 double-indirect.
    pub pointers: [u32; INODE_PTRS],
}

const_assert_eq!(size_of::<DiskInode>(), SECTOR_SIZE);

/// A sector interpreted as a run of sector indices. No header; unused
/// entries are zero.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct IndirectBlock {
    pub ptrs: [u32; PTRS_PER_BLOCK],
}

const_assert_eq!(size_of::<IndirectBlock>(), SECTOR_SIZE);

impl DiskInode {
    pub(crate) fn from_body(body: &InodeBody, is_dir: bool) -> Self {
        Self {
            length: body.length as i32,
            magic: INODE_MAGIC,
            direct_index: body.direct_index,
            indirect_index: body.indirect_index,
            double_indirect_index: body.double_indirect_index,
            is_directory: is_dir as u32,
            parent: body.parent,
            reserved: [0; 107],
            pointers: body.pointers,
        }
    }
}

/// Fields mirrored from the on-disk inode. The lock that guards them
/// doubles as the growth lock: growth holds it for the whole expansion,
/// readers take it only long enough to copy a pointer out.
pub(crate) struct InodeBody {
    pub length: u32,
    pub direct_index: u32,
    pub indirect_index: u32,
    pub double_indirect_index: u32,
    pub parent: u32,
    pub pointers: [u32; INODE_PTRS],
}

impl InodeBody {
    pub(crate) fn empty(parent: u32) -> Self {
        Self {
            length: 0,
            direct_index: 0,
            indirect_index: 0,
            double_indirect_index: 0,
            parent,
            pointers: [0; INODE_PTRS],
        }
    }
}

/// Reference counts and the removal mark, guarded together so the
/// deny-write invariant (deny_write_count <= open_count) can be asserted.
pub(crate) struct InodeMeta {
    pub open_count: u32,
    pub deny_write_count: u32,
    pub removed: bool,
}

/// In-memory inode. One exists per open sector; all openers share it.
pub struct Inode {
    sector: u32,
    is_dir: bool,
    /// End of file as readers see it. Published (with fetch_max, so a slow
    /// writer cannot roll it back) only after a write has copied all of its
    /// bytes in.
    read_length: AtomicU32,
    pub(crate) meta: Mutex<InodeMeta>,
    pub(crate) body: Mutex<InodeBody>,
}

impl Inode {
    /// Build the in-memory mirror of an on-disk inode. Asserts the magic:
    /// opening a sector that holds no inode is a caller bug.
    pub(crate) fn from_disk(sector: u32, disk: &DiskInode) -> Self {
        assert_eq!(disk.magic, INODE_MAGIC, "sector {}: not an inode", sector);
        assert!(disk.length >= 0, "sector {}: negative length", sector);
        Self {
            sector,
            is_dir: disk.is_directory != 0,
            read_length: AtomicU32::new(disk.length as u32),
            meta: Mutex::new(InodeMeta {
                open_count: 1,
                deny_write_count: 0,
                removed: false,
            }),
            body: Mutex::new(InodeBody {
                length: disk.length as u32,
                direct_index: disk.direct_index,
                indirect_index: disk.indirect_index,
                double_indirect_index: disk.double_indirect_index,
                parent: disk.parent,
                pointers: disk.pointers,
            }),
        }
    }

    /// Sector this inode lives in; its identity across the system.
    pub fn sector(&self) -> u32 {
        self.sector
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn parent(&self) -> u32 {
        self.body.lock().parent
    }

    /// Current byte length. During a growing write this runs ahead of what
    /// readers are allowed to see.
    pub fn length(&self) -> u32 {
        self.body.lock().length
    }

    /// Mark for deletion; the sectors are released when the last opener
    /// closes.
    pub fn remove(&self) {
        self.meta.lock().removed = true;
    }

    /// Disable writes. At most once per opener.
    pub fn deny_write(&self) {
        let mut meta = self.meta.lock();
        meta.deny_write_count += 1;
        assert!(meta.deny_write_count <= meta.open_count);
    }

    /// Re-enable writes. Once per earlier deny_write, before closing.
    pub fn allow_write(&self) {
        let mut meta = self.meta.lock();
        assert!(meta.deny_write_count > 0);
        assert!(meta.deny_write_count <= meta.open_count);
        meta.deny_write_count -= 1;
    }

    pub(crate) fn read_length(&self) -> u32 {
        self.read_length.load(Ordering::Acquire)
    }

    pub(crate) fn publish_read_length(&self, length: u32) {
        self.read_length.fetch_max(length, Ordering::AcqRel);
    }
}

// Sector-count arithmetic, all derived from a byte length. Deallocation
// uses these rather than the cursors.

/// Data sectors backing `len` bytes.
pub(crate) fn data_sectors(len: u32) -> u32 {
    len.div_ceil(SECTOR_SIZE as u32)
}

const DIRECT_BYTES: u32 = (NDIRECT * SECTOR_SIZE) as u32;
const BYTES_PER_INDIRECT: u32 = (PTRS_PER_BLOCK * SECTOR_SIZE) as u32;
const DOUBLE_START: u32 =
    ((NDIRECT + crate::param::NSINDIRECT * PTRS_PER_BLOCK) * SECTOR_SIZE) as u32;

/// Indirect blocks backing `len` bytes, wherever they hang (the single
/// region and under the double-indirect block alike).
pub(crate) fn indirect_blocks(len: u32) -> u32 {
    if len <= DIRECT_BYTES {
        return 0;
    }
    (len - DIRECT_BYTES).div_ceil(BYTES_PER_INDIRECT)
}

/// 1 when `len` reaches into the double-indirect region.
pub(crate) fn double_blocks(len: u32) -> u32 {
    (len > DOUBLE_START) as u32
}
