//! A memory-mapped view over a fixed-size disk-image file.
//!
//! Owns the image's mapping for the lifetime of the mount, translates block
//! numbers to byte regions, and manages the free-block bitmap stored in
//! block 0.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::MmapMut;
use thiserror::Error;

use crate::bitmap;
use crate::errno::{Errno, ENOSPC};

/// Size in bytes of a single block.
pub const BLOCK_SIZE: usize = 4096;
/// Total number of blocks in an image.
pub const BLOCK_COUNT: usize = 256;
/// Total size in bytes of an image file.
pub const NUFS_SIZE: u64 = (BLOCK_COUNT * BLOCK_SIZE) as u64;
/// The lowest block number the allocator will hand out; blocks below this are
/// reserved for the free-block bitmap and the inode table.
pub const FIRST_DATA_BLOCK: u32 = 28;
/// Block holding the free-block bitmap.
const BITMAP_BLOCK: u32 = 0;

/// Fatal conditions: these abort the mount, since there is no way to serve
/// upcalls without a working mapping.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("failed to open image file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to size image file to {size} bytes: {source}")]
    Resize {
        size: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to map image file: {0}")]
    Map(#[source] std::io::Error),
    #[error("failed to flush image file: {0}")]
    Flush(#[source] std::io::Error),
    #[error("block {0} is out of range")]
    BlockOutOfRange(u32),
}

/// Owns the mapped image region and the free-block bitmap housed in its
/// first block.
pub struct BlockDevice {
    mmap: MmapMut,
}

impl BlockDevice {
    /// Opens (creating if absent) the image file at `path`, ensuring it is
    /// exactly [`NUFS_SIZE`] bytes, and maps it read-write, shared.
    ///
    /// On a freshly-created image (previous size was 0), block 0 is marked
    /// allocated. An image that already had the right size is trusted as-is.
    pub fn open(path: &Path) -> Result<Self, FsError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|source| FsError::Open {
                path: path.display().to_string(),
                source,
            })?;
        let metadata = file.metadata().map_err(|source| FsError::Open {
            path: path.display().to_string(),
            source,
        })?;
        let previous_size = metadata.len();
        if previous_size != NUFS_SIZE {
            file.set_len(NUFS_SIZE).map_err(|source| FsError::Resize {
                size: NUFS_SIZE,
                source,
            })?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(FsError::Map)?;
        let mut dev = BlockDevice { mmap };
        if previous_size == 0 {
            bitmap::set(dev.bitmap_region_mut(), BITMAP_BLOCK as usize, true);
        }
        Ok(dev)
    }

    /// Number of whole blocks needed to hold `bytes` bytes, rounded up.
    pub fn bytes_to_blocks(bytes: u64) -> u32 {
        bytes.div_ceil(BLOCK_SIZE as u64) as u32
    }

    fn bitmap_region_mut(&mut self) -> &mut [u8] {
        &mut self.mmap[..BLOCK_COUNT / 8]
    }

    fn bitmap_region(&self) -> &[u8] {
        &self.mmap[..BLOCK_COUNT / 8]
    }

    /// Returns the byte region backing block `n`, or `None` if `n` is out of
    /// range. Callers treat `None` as an I/O failure (`-EIO`).
    pub fn get_block(&self, n: u32) -> Option<&[u8]> {
        if (n as usize) >= BLOCK_COUNT {
            log::error!("get_block: block {n} out of range");
            return None;
        }
        let start = n as usize * BLOCK_SIZE;
        Some(&self.mmap[start..start + BLOCK_SIZE])
    }

    /// Mutable counterpart of [`BlockDevice::get_block`].
    pub fn get_block_mut(&mut self, n: u32) -> Option<&mut [u8]> {
        if (n as usize) >= BLOCK_COUNT {
            log::error!("get_block_mut: block {n} out of range");
            return None;
        }
        let start = n as usize * BLOCK_SIZE;
        Some(&mut self.mmap[start..start + BLOCK_SIZE])
    }

    /// Linear scan of the free-block bitmap from [`FIRST_DATA_BLOCK`]
    /// upward. Sets the bit, zero-fills the block, and returns its number on
    /// the first free slot found. Allocation order is deterministic (lowest
    /// free block first).
    pub fn alloc_block(&mut self) -> Result<u32, Errno> {
        let free = (FIRST_DATA_BLOCK..BLOCK_COUNT as u32)
            .find(|&n| !bitmap::get(self.bitmap_region(), n as usize));
        let Some(n) = free else {
            return Err(ENOSPC);
        };
        bitmap::set(self.bitmap_region_mut(), n as usize, true);
        self.get_block_mut(n).expect("n is in range").fill(0);
        Ok(n)
    }

    /// Frees block `n`, zero-filling its contents. Freeing an already-free
    /// block logs a warning and is a no-op, not an error. `n` outside the
    /// allocator's range is a fatal usage error.
    pub fn free_block(&mut self, n: u32) -> Result<(), FsError> {
        if n < FIRST_DATA_BLOCK || (n as usize) >= BLOCK_COUNT {
            return Err(FsError::BlockOutOfRange(n));
        }
        if !bitmap::get(self.bitmap_region(), n as usize) {
            log::warn!("free_block: block {n} is already free");
            return Ok(());
        }
        bitmap::set(self.bitmap_region_mut(), n as usize, false);
        self.get_block_mut(n).expect("n is in range").fill(0);
        Ok(())
    }

    /// Number of data blocks currently free, for `statfs`.
    pub fn free_block_count(&self) -> usize {
        let total_data_blocks = BLOCK_COUNT - FIRST_DATA_BLOCK as usize;
        let allocated = (FIRST_DATA_BLOCK..BLOCK_COUNT as u32)
            .filter(|&n| bitmap::get(self.bitmap_region(), n as usize))
            .count();
        total_data_blocks - allocated
    }

    /// Requests the OS synchronize the mapped region to disk.
    pub fn flush(&self) -> Result<(), FsError> {
        self.mmap.flush().map_err(FsError::Flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn open_fresh() -> (NamedTempFile, BlockDevice) {
        let file = NamedTempFile::new().unwrap();
        // A brand-new temp file is empty, so BlockDevice::open treats it as freshly created.
        let dev = BlockDevice::open(file.path()).unwrap();
        (file, dev)
    }

    #[test]
    fn fresh_image_has_block_zero_allocated() {
        let (_file, dev) = open_fresh();
        assert!(bitmap::get(dev.bitmap_region(), 0));
        assert_eq!(dev.free_block_count(), BLOCK_COUNT - FIRST_DATA_BLOCK as usize);
    }

    #[test]
    fn alloc_is_deterministic_and_zeroes() {
        let (_file, mut dev) = open_fresh();
        let a = dev.alloc_block().unwrap();
        assert_eq!(a, FIRST_DATA_BLOCK);
        let b = dev.alloc_block().unwrap();
        assert_eq!(b, FIRST_DATA_BLOCK + 1);
        assert!(dev.get_block(a).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn free_then_realloc_returns_lowest_free() {
        let (_file, mut dev) = open_fresh();
        let a = dev.alloc_block().unwrap();
        let _b = dev.alloc_block().unwrap();
        dev.free_block(a).unwrap();
        let c = dev.alloc_block().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn double_free_is_a_noop() {
        let (_file, mut dev) = open_fresh();
        let a = dev.alloc_block().unwrap();
        dev.free_block(a).unwrap();
        dev.free_block(a).unwrap();
    }

    #[test]
    fn exhaustion_returns_enospc() {
        let (_file, mut dev) = open_fresh();
        let total = BLOCK_COUNT - FIRST_DATA_BLOCK as usize;
        for _ in 0..total {
            dev.alloc_block().unwrap();
        }
        assert_eq!(dev.alloc_block(), Err(ENOSPC));
    }

    #[test]
    fn free_block_out_of_range_is_fatal_usage_error() {
        let (_file, mut dev) = open_fresh();
        assert!(dev.free_block(1).is_err());
        assert!(dev.free_block(BLOCK_COUNT as u32).is_err());
    }

    #[test]
    fn bytes_to_blocks_rounds_up() {
        assert_eq!(BlockDevice::bytes_to_blocks(0), 0);
        assert_eq!(BlockDevice::bytes_to_blocks(1), 1);
        assert_eq!(BlockDevice::bytes_to_blocks(BLOCK_SIZE as u64), 1);
        assert_eq!(BlockDevice::bytes_to_blocks(BLOCK_SIZE as u64 + 1), 2);
    }
}
