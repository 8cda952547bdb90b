// Sizing constants. Changing SECTOR_SIZE requires recomputing the index-tree
// fanout and the on-disk inode padding so the inode stays exactly one sector.

/// Bytes per device sector.
pub const SECTOR_SIZE: usize = 512;

/// Upper bound on occupied buffer-cache slots.
pub const CACHE_SLOTS: usize = 64;

/// Sector indices held by one indirect block.
pub const PTRS_PER_BLOCK: usize = SECTOR_SIZE / core::mem::size_of::<u32>();

/// Direct pointer slots in an inode.
pub const NDIRECT: usize = 4;
/// Single-indirect pointer slots in an inode.
pub const NSINDIRECT: usize = 9;
/// Index of the double-indirect pointer slot.
pub const DOUBLE_SLOT: usize = NDIRECT + NSINDIRECT;
/// Total pointer slots in an inode.
pub const INODE_PTRS: usize = DOUBLE_SLOT + 1;

/// Largest file the index tree can address, in sectors:
/// 4 direct + 9 * 128 single-indirect + 128 * 128 double-indirect.
pub const MAX_SECTORS: usize =
    NDIRECT + NSINDIRECT * PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK;
/// Largest file in bytes.
pub const MAX_BYTES: u32 = (MAX_SECTORS * SECTOR_SIZE) as u32;

/// Sentinel stamped into every on-disk inode ("INOD").
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Sector holding the root directory inode. Sector 0 belongs to the
/// free-sector map.
pub const ROOT_SECTOR: u32 = 1;

/// Cadence of the background flush task, in milliseconds.
pub const FLUSH_INTERVAL_MS: u64 = 5_000;
