//! Sector-granular filesystem core.
//!
//! Three layers, bottom to top:
//!   - Blocks: a synchronous one-sector-at-a-time device and a free-sector
//!     map, both behind traits so the surrounding kernel supplies them.
//!   - Cache: a bounded pool of sector buffers with clock eviction,
//!     write-back and prefetch. Every sector of device traffic goes
//!     through it.
//!   - Inodes: arbitrarily sized files and directories over a direct /
//!     indirect / double-indirect index, an open-inode table that gives
//!     all openers of a sector one shared object, and byte-granular
//!     read/write with implicit growth.
//!
//! Nothing is a process-wide singleton: all state hangs off a
//! [`Filesystem`] built at mount time, and the background flush task is a
//! handle its owner stops. Directory entry encoding, path walking and file
//! descriptors belong to the layers above this crate.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod block;
pub mod cache;
#[cfg(feature = "std")]
pub mod daemon;
pub mod freemap;
pub mod fs;
pub mod inode;
pub mod param;


pub use block::{BlockDevice, MemDisk};
#[cfg(feature = "std")]
pub use daemon::{FlushDaemon, Mount};
pub use freemap::{FreeMap, SectorAllocator};
pub use fs::Filesystem;
pub use inode::Inode;
