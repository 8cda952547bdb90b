// Block device interface.
//
// A device moves exactly one sector per call and blocks until the transfer
// is complete. Ordering across concurrent callers is not guaranteed; the
// buffer cache is the only caller in this crate and serializes per sector.
// A failed transfer has no recovery path and panics.

use core::ops::{Deref, DerefMut};

use static_assertions::const_assert_eq;

use crate::param::SECTOR_SIZE;

/// One sector of bytes, aligned so the cache can hand out typed views
/// (`DiskInode`, `IndirectBlock`) of the raw buffer.
#[repr(C, align(8))]
pub struct SectorBuf(pub [u8; SECTOR_SIZE]);

const_assert_eq!(core::mem::size_of::<SectorBuf>(), SECTOR_SIZE);

impl SectorBuf {
    pub const fn zeroed() -> Self {
        SectorBuf([0; SECTOR_SIZE])
    }
}

impl Deref for SectorBuf {
    type Target = [u8; SECTOR_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SectorBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Synchronous sector-granular storage.
pub trait BlockDevice: Send + Sync {
    /// Read `sector` into `buf`. Panics if the transfer fails.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Write `buf` to `sector`. Panics if the transfer fails.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);

    /// Device size in sectors.
    fn capacity(&self) -> u32;
}

impl<T: BlockDevice + ?Sized> BlockDevice for alloc::sync::Arc<T> {
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        (**self).read(sector, buf)
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        (**self).write(sector, buf)
    }

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }
}

/// Memory-backed device. Reference implementation of the device contract
/// and the backing store for the test suite.
pub struct MemDisk {
    sectors: spin::Mutex<alloc::vec::Vec<[u8; SECTOR_SIZE]>>,
}

impl MemDisk {
    pub fn new(capacity: u32) -> Self {
        Self {
            sectors: spin::Mutex::new(alloc::vec![[0; SECTOR_SIZE]; capacity as usize]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock();
        let src = sectors
            .get(sector as usize)
            .unwrap_or_else(|| panic!("read past device end: sector {}", sector));
        buf.copy_from_slice(src);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock();
        let len = sectors.len();
        let dst = sectors
            .get_mut(sector as usize)
            .unwrap_or_else(|| panic!("write past device end: sector {} of {}", sector, len));
        dst.copy_from_slice(buf);
    }

    fn capacity(&self) -> u32 {
        self.sectors.lock().len() as u32
    }
}
