//! The fixed-size inode record and its explicit little-endian on-disk
//! encoding.
//!
//! Unlike a verbatim struct copy, every field here is written and read at a
//! fixed byte offset in a known width and byte order, so the image is
//! portable across host architectures (see `SPEC_FULL.md` §9).

use crate::block_device::BLOCK_SIZE;

/// Maximum number of path bytes a record can hold, including the
/// terminating NUL. Paths longer than `PATH_CAPACITY - 1` are rejected by
/// the path index before an inode is ever constructed.
pub const PATH_CAPACITY: usize = 256;
/// Maximum number of inhabited inode slots.
pub const MAX_FILES: usize = 128;
/// Maximum number of data blocks referenced by a single file.
pub const MAX_BLOCKS_PER_FILE: usize = 128;

const SIZE_OFFSET: usize = PATH_CAPACITY;
const BLOCK_COUNT_OFFSET: usize = SIZE_OFFSET + 8;
const BLOCKS_OFFSET: usize = BLOCK_COUNT_OFFSET + 4;
const MODE_OFFSET: usize = BLOCKS_OFFSET + MAX_BLOCKS_PER_FILE * 4;
const ATIME_OFFSET: usize = MODE_OFFSET + 4;
const MTIME_OFFSET: usize = ATIME_OFFSET + 8;
const CTIME_OFFSET: usize = MTIME_OFFSET + 8;
/// Size in bytes of one serialized inode record.
pub const INODE_RECORD_SIZE: usize = CTIME_OFFSET + 8;
/// How many inode records fit in one block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_RECORD_SIZE;

/// Mode bit marking a directory (matches `libc::S_IFDIR`).
pub const S_IFDIR: u32 = libc::S_IFDIR as u32;
/// Mode bit marking a regular file (matches `libc::S_IFREG`).
pub const S_IFREG: u32 = libc::S_IFREG as u32;
/// Mask isolating the file-type bits of a mode word.
pub const S_IFMT: u32 = libc::S_IFMT as u32;

/// A file or directory's metadata, including its inline block map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inode {
    pub path: String,
    pub size: u64,
    pub block_count: u32,
    pub blocks: [i32; MAX_BLOCKS_PER_FILE],
    pub mode: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl Default for Inode {
    fn default() -> Self {
        Inode {
            path: String::new(),
            size: 0,
            block_count: 0,
            blocks: [0; MAX_BLOCKS_PER_FILE],
            mode: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }
}

impl Inode {
    /// An inhabited slot always has a non-empty path; this is how the load
    /// path distinguishes an inode record from a zeroed, unused one.
    pub fn is_occupied(&self) -> bool {
        !self.path.is_empty()
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// Active block numbers, i.e. `blocks[0..block_count]`.
    pub fn active_blocks(&self) -> &[i32] {
        &self.blocks[..self.block_count as usize]
    }

    /// Serializes this record into a fixed-width little-endian byte buffer.
    pub fn to_le_bytes(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut buf = [0u8; INODE_RECORD_SIZE];
        let path_bytes = self.path.as_bytes();
        let n = path_bytes.len().min(PATH_CAPACITY - 1);
        buf[..n].copy_from_slice(&path_bytes[..n]);
        // buf[n] and onward in the path region stay zero, acting as the NUL terminator.
        buf[SIZE_OFFSET..SIZE_OFFSET + 8].copy_from_slice(&self.size.to_le_bytes());
        buf[BLOCK_COUNT_OFFSET..BLOCK_COUNT_OFFSET + 4]
            .copy_from_slice(&self.block_count.to_le_bytes());
        for (i, &b) in self.blocks.iter().enumerate() {
            let off = BLOCKS_OFFSET + i * 4;
            buf[off..off + 4].copy_from_slice(&b.to_le_bytes());
        }
        buf[MODE_OFFSET..MODE_OFFSET + 4].copy_from_slice(&self.mode.to_le_bytes());
        buf[ATIME_OFFSET..ATIME_OFFSET + 8].copy_from_slice(&self.atime.to_le_bytes());
        buf[MTIME_OFFSET..MTIME_OFFSET + 8].copy_from_slice(&self.mtime.to_le_bytes());
        buf[CTIME_OFFSET..CTIME_OFFSET + 8].copy_from_slice(&self.ctime.to_le_bytes());
        buf
    }

    /// Deserializes a record previously written by [`Inode::to_le_bytes`].
    /// A record's bytes may be all zero (an unused slot); this yields the
    /// default, unoccupied inode.
    pub fn from_le_bytes(buf: &[u8; INODE_RECORD_SIZE]) -> Self {
        let nul = buf[..PATH_CAPACITY]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PATH_CAPACITY);
        let path = String::from_utf8_lossy(&buf[..nul]).into_owned();
        let size = u64::from_le_bytes(buf[SIZE_OFFSET..SIZE_OFFSET + 8].try_into().unwrap());
        let block_count = u32::from_le_bytes(
            buf[BLOCK_COUNT_OFFSET..BLOCK_COUNT_OFFSET + 4]
                .try_into()
                .unwrap(),
        );
        let mut blocks = [0i32; MAX_BLOCKS_PER_FILE];
        for (i, slot) in blocks.iter_mut().enumerate() {
            let off = BLOCKS_OFFSET + i * 4;
            *slot = i32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        }
        let mode = u32::from_le_bytes(buf[MODE_OFFSET..MODE_OFFSET + 4].try_into().unwrap());
        let atime = i64::from_le_bytes(buf[ATIME_OFFSET..ATIME_OFFSET + 8].try_into().unwrap());
        let mtime = i64::from_le_bytes(buf[MTIME_OFFSET..MTIME_OFFSET + 8].try_into().unwrap());
        let ctime = i64::from_le_bytes(buf[CTIME_OFFSET..CTIME_OFFSET + 8].try_into().unwrap());
        Inode {
            path,
            size,
            block_count,
            blocks,
            mode,
            atime,
            mtime,
            ctime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_le_bytes() {
        let mut inode = Inode {
            path: "/a/b".to_string(),
            size: 4097,
            block_count: 2,
            mode: S_IFREG | 0o644,
            atime: 10,
            mtime: 20,
            ctime: 30,
            ..Default::default()
        };
        inode.blocks[0] = 28;
        inode.blocks[1] = 29;
        let bytes = inode.to_le_bytes();
        let back = Inode::from_le_bytes(&bytes);
        assert_eq!(inode, back);
    }

    #[test]
    fn zeroed_record_is_unoccupied() {
        let buf = [0u8; INODE_RECORD_SIZE];
        let inode = Inode::from_le_bytes(&buf);
        assert!(!inode.is_occupied());
    }

    #[test]
    fn fits_required_capacity() {
        assert!(INODES_PER_BLOCK * 26 >= MAX_FILES);
    }
}
