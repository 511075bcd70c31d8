//! The path-addressed filesystem core: inode table, flat path index, and the
//! upcall surface the bridge adapter forwards to.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::block_device::{BlockDevice, FsError, BLOCK_SIZE};
use crate::errno::{
    Errno, EEXIST, EILSEQ, EINVAL, EISDIR, ENAMETOOLONG, ENOENT, ENOSPC, ENOTDIR, ENOTEMPTY,
};
use crate::inode::{
    Inode, INODES_PER_BLOCK, INODE_RECORD_SIZE, MAX_BLOCKS_PER_FILE, MAX_FILES, S_IFDIR, S_IFMT,
    S_IFREG,
};

/// Block holding `inode_count`.
const INODE_HEADER_BLOCK: u32 = 1;
/// First block of the packed inode record array.
const INODE_TABLE_START_BLOCK: u32 = 2;

/// A `getattr`-style summary of an inode, independent of any bridge crate.
#[derive(Clone, Copy, Debug)]
pub struct Attr {
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub blocks: u64,
    pub blksize: u32,
}

/// A `statfs`-style summary of the whole mount.
#[derive(Clone, Copy, Debug)]
pub struct FsStat {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
}

/// One directory entry as seen by `readdir`: a name and whether it names a
/// directory.
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Owns the mapped image region (via [`BlockDevice`]) and the in-memory
/// inode array. A `Filesystem` value is the sole owner of both for the
/// lifetime of the mount; nothing in this crate lets a block handle outlive
/// it.
pub struct Filesystem {
    dev: BlockDevice,
    inodes: Vec<Inode>,
    inode_count: usize,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Trims trailing `/` characters except when the whole path is `/`. Does not
/// enforce the length cap; callers pick the error a too-long path should
/// surface as via [`canonicalize_for_lookup`] or [`canonicalize_for_create`].
fn trim_path(path: &str) -> &str {
    if path == "/" {
        path
    } else {
        path.trim_end_matches('/')
    }
}

/// Canonicalizes `path` for an operation that names a path which must
/// already exist. A path too long to fit an inode record can never have
/// been stored, so it is reported as `-ENOENT` rather than `-ENAMETOOLONG`
/// (SPEC_FULL.md §7 reserves `-ENAMETOOLONG` for `create`/`rename`).
fn canonicalize_for_lookup(path: &str) -> Result<String, Errno> {
    let trimmed = trim_path(path);
    if trimmed.len() >= crate::inode::PATH_CAPACITY {
        return Err(ENOENT);
    }
    Ok(trimmed.to_string())
}

/// Canonicalizes `path` for an operation that creates or targets a new
/// name (`mknod`, `mkdir`, rename's destination), rejecting paths too long
/// to fit an inode record with `-ENAMETOOLONG`.
fn canonicalize_for_create(path: &str) -> Result<String, Errno> {
    let trimmed = trim_path(path);
    if trimmed.len() >= crate::inode::PATH_CAPACITY {
        return Err(ENAMETOOLONG);
    }
    Ok(trimmed.to_string())
}

impl Filesystem {
    /// Opens the image at `path` (creating it if absent), loads or
    /// bootstraps the inode table, and returns a ready-to-serve filesystem.
    pub fn open(path: &Path) -> Result<Self, FsError> {
        let dev = BlockDevice::open(path)?;
        let mut fs = Filesystem {
            dev,
            inodes: vec![Inode::default(); MAX_FILES],
            inode_count: 0,
        };
        fs.load()?;
        if fs.lookup("/").is_none() {
            // Bootstrap: the load above found no root; this happens once, on a
            // freshly created image.
            let t = now();
            fs.inodes[0] = Inode {
                path: "/".to_string(),
                mode: S_IFDIR | 0o755,
                atime: t,
                mtime: t,
                ctime: t,
                ..Default::default()
            };
            fs.inode_count = 1;
            fs.save()?;
        }
        Ok(fs)
    }

    /// Reads `inode_count` from block 1 and the inode records from the 26
    /// blocks starting at block 2 into the in-memory array. The stored count
    /// is trusted.
    fn load(&mut self) -> Result<(), FsError> {
        let header = self.dev.get_block(INODE_HEADER_BLOCK).ok_or(FsError::BlockOutOfRange(INODE_HEADER_BLOCK))?;
        let count = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        self.inode_count = count.min(MAX_FILES);
        for i in 0..self.inode_count {
            let block = INODE_TABLE_START_BLOCK + (i / INODES_PER_BLOCK) as u32;
            let offset = (i % INODES_PER_BLOCK) * INODE_RECORD_SIZE;
            let data = self
                .dev
                .get_block(block)
                .ok_or(FsError::BlockOutOfRange(block))?;
            let mut record = [0u8; INODE_RECORD_SIZE];
            record.copy_from_slice(&data[offset..offset + INODE_RECORD_SIZE]);
            self.inodes[i] = Inode::from_le_bytes(&record);
        }
        Ok(())
    }

    /// Writes `inode_count` to block 1 and the first `inode_count` records
    /// into the 26 blocks starting at block 2, then requests a synchronous
    /// flush. Called after every mutation.
    fn save(&mut self) -> Result<(), FsError> {
        {
            let header = self
                .dev
                .get_block_mut(INODE_HEADER_BLOCK)
                .ok_or(FsError::BlockOutOfRange(INODE_HEADER_BLOCK))?;
            header[0..4].copy_from_slice(&(self.inode_count as u32).to_le_bytes());
        }
        for i in 0..self.inode_count {
            let record = self.inodes[i].to_le_bytes();
            let block = INODE_TABLE_START_BLOCK + (i / INODES_PER_BLOCK) as u32;
            let offset = (i % INODES_PER_BLOCK) * INODE_RECORD_SIZE;
            let data = self
                .dev
                .get_block_mut(block)
                .ok_or(FsError::BlockOutOfRange(block))?;
            data[offset..offset + INODE_RECORD_SIZE].copy_from_slice(&record);
        }
        self.dev.flush()
    }

    /// Linear scan over inhabited slots for an exact canonicalized-path
    /// match.
    fn find(&self, path: &str) -> Option<usize> {
        self.inodes[..self.inode_count]
            .iter()
            .position(|i| i.path == path)
    }

    /// Looks up an inode by path.
    pub fn lookup(&self, path: &str) -> Option<(usize, &Inode)> {
        let idx = self.find(path)?;
        Some((idx, &self.inodes[idx]))
    }

    /// Basenames of `dir`'s direct children, per the flat-path containment
    /// rule: paths beginning with `dir`'s path, strictly longer, that —
    /// after stripping `dir`'s path plus one `/` — contain no further `/`.
    fn children_of(&self, dir: &str) -> Vec<DirEntry> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        self.inodes[..self.inode_count]
            .iter()
            .filter_map(|inode| {
                let rest = inode.path.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    return None;
                }
                Some(DirEntry {
                    name: rest.to_string(),
                    is_dir: inode.is_dir(),
                })
            })
            .collect()
    }

    /// Appends a new inode with the given mode, flushing metadata. Fails if
    /// the table is full or the path is too long.
    fn create_inode(&mut self, path: &str, mode: u32) -> Result<usize, Errno> {
        if self.inode_count == MAX_FILES {
            return Err(ENOSPC);
        }
        let t = now();
        let idx = self.inode_count;
        self.inodes[idx] = Inode {
            path: path.to_string(),
            mode,
            atime: t,
            mtime: t,
            ctime: t,
            ..Default::default()
        };
        self.inode_count += 1;
        self.save().map_err(|_| crate::errno::EIO)?;
        Ok(idx)
    }

    /// Allocates a new data block for the inode at `idx`, appends it to the
    /// block map, and flushes. Fails if the per-file block cap or the
    /// underlying allocator is exhausted.
    fn add_block(&mut self, idx: usize) -> Result<u32, Errno> {
        let block_count = self.inodes[idx].block_count as usize;
        if block_count == MAX_BLOCKS_PER_FILE {
            return Err(ENOSPC);
        }
        let block = self.dev.alloc_block()?;
        self.inodes[idx].blocks[block_count] = block as i32;
        self.inodes[idx].block_count += 1;
        self.save().map_err(|_| crate::errno::EIO)?;
        Ok(block)
    }

    /// Frees every block referenced by the inode at `idx`, then compacts the
    /// array by shifting higher-indexed entries down by one and zeroing the
    /// vacated trailing slot.
    fn remove_inode(&mut self, idx: usize) -> Result<(), Errno> {
        let blocks: Vec<i32> = self.inodes[idx].active_blocks().to_vec();
        for b in blocks {
            self.dev
                .free_block(b as u32)
                .map_err(|_| crate::errno::EIO)?;
        }
        for i in idx..self.inode_count - 1 {
            self.inodes[i] = self.inodes[i + 1].clone();
        }
        self.inodes[self.inode_count - 1] = Inode::default();
        self.inode_count -= 1;
        self.save().map_err(|_| crate::errno::EIO)?;
        Ok(())
    }

    fn attr_of(&self, inode: &Inode) -> Attr {
        Attr {
            mode: inode.mode,
            size: inode.size,
            nlink: if inode.is_dir() { 2 } else { 1 },
            atime: inode.atime,
            mtime: inode.mtime,
            ctime: inode.ctime,
            blocks: inode.size.div_ceil(512),
            blksize: BLOCK_SIZE as u32,
        }
    }

    // ---- upcall surface ----

    pub fn access(&self, path: &str) -> Result<(), Errno> {
        let path = canonicalize_for_lookup(path)?;
        if self.find(&path).is_some() {
            Ok(())
        } else {
            Err(ENOENT)
        }
    }

    pub fn getattr(&self, path: &str) -> Result<Attr, Errno> {
        let path = canonicalize_for_lookup(path)?;
        let (_, inode) = self.lookup(&path).ok_or(ENOENT)?;
        Ok(self.attr_of(inode))
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, Errno> {
        let path = canonicalize_for_lookup(path)?;
        let (_, inode) = self.lookup(&path).ok_or(ENOENT)?;
        if !inode.is_dir() {
            return Err(ENOTDIR);
        }
        let mut entries = vec![
            DirEntry {
                name: ".".to_string(),
                is_dir: true,
            },
            DirEntry {
                name: "..".to_string(),
                is_dir: true,
            },
        ];
        entries.extend(self.children_of(&path));
        Ok(entries)
    }

    pub fn mknod(&mut self, path: &str, mode: u32) -> Result<(), Errno> {
        let path = canonicalize_for_create(path)?;
        if self.find(&path).is_some() {
            return Err(EEXIST);
        }
        let mode = if mode & S_IFMT == 0 {
            S_IFREG | (mode & 0o7777)
        } else {
            mode
        };
        self.create_inode(&path, mode)?;
        Ok(())
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<(), Errno> {
        let path = canonicalize_for_create(path)?;
        if self.find(&path).is_some() {
            return Err(EEXIST);
        }
        self.create_inode(&path, S_IFDIR | (mode & 0o7777))?;
        Ok(())
    }

    pub fn unlink(&mut self, path: &str) -> Result<(), Errno> {
        let path = canonicalize_for_lookup(path)?;
        let idx = self.find(&path).ok_or(ENOENT)?;
        if self.inodes[idx].is_dir() {
            return Err(EISDIR);
        }
        self.remove_inode(idx)
    }

    pub fn rmdir(&mut self, path: &str) -> Result<(), Errno> {
        let path = canonicalize_for_lookup(path)?;
        let idx = self.find(&path).ok_or(ENOENT)?;
        if !self.inodes[idx].is_dir() {
            return Err(ENOTDIR);
        }
        if !self.children_of(&path).is_empty() {
            return Err(ENOTEMPTY);
        }
        self.remove_inode(idx)
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), Errno> {
        let from = canonicalize_for_lookup(from)?;
        let to = trim_path(to);
        let idx = self.find(&from).ok_or(ENOENT)?;
        if self.find(to).is_some() {
            return Err(EEXIST);
        }
        if to.len() >= crate::inode::PATH_CAPACITY {
            return Err(ENAMETOOLONG);
        }
        let to = to.to_string();
        let t = now();
        self.inodes[idx].path = to;
        self.inodes[idx].mtime = t;
        self.inodes[idx].ctime = t;
        self.save().map_err(|_| crate::errno::EIO)
    }

    pub fn statfs(&self) -> FsStat {
        let bfree = self.dev.free_block_count() as u64;
        FsStat {
            blocks: crate::block_device::BLOCK_COUNT as u64,
            bfree,
            bavail: bfree,
            files: MAX_FILES as u64,
            ffree: (MAX_FILES - self.inode_count) as u64,
            bsize: BLOCK_SIZE as u32,
            namelen: (crate::inode::PATH_CAPACITY - 1) as u32,
        }
    }

    /// Reads up to `buf.len()` bytes from `path` at `offset`, one block at a
    /// time. Returns the number of bytes actually read, which is short if
    /// the block map ends mid-file.
    pub fn read(&mut self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
        let path = canonicalize_for_lookup(path)?;
        let idx = self.find(&path).ok_or(ENOENT)?;
        if self.inodes[idx].is_dir() {
            return Err(EISDIR);
        }
        if offset >= self.inodes[idx].size {
            return Ok(0);
        }
        let size = (buf.len() as u64).min(self.inodes[idx].size - offset) as usize;
        let mut done = 0usize;
        while done < size {
            let block_index = (offset as usize + done) / BLOCK_SIZE;
            let block_offset = (offset as usize + done) % BLOCK_SIZE;
            let chunk = size - done;
            let chunk = chunk.min(BLOCK_SIZE - block_offset);
            if block_index >= self.inodes[idx].block_count as usize {
                break;
            }
            let block_num = self.inodes[idx].blocks[block_index] as u32;
            let data = self.dev.get_block(block_num).ok_or(crate::errno::EIO)?;
            buf[done..done + chunk].copy_from_slice(&data[block_offset..block_offset + chunk]);
            done += chunk;
        }
        self.inodes[idx].atime = now();
        self.save().map_err(|_| crate::errno::EIO)?;
        Ok(done)
    }

    /// Writes `data` to `path` at `offset`, allocating blocks lazily as the
    /// block map grows contiguously from index 0. Returns the number of
    /// bytes actually written, which is short only on allocator exhaustion
    /// after at least one byte was written.
    pub fn write(&mut self, path: &str, data: &[u8], offset: u64) -> Result<usize, Errno> {
        let path = canonicalize_for_lookup(path)?;
        let idx = self.find(&path).ok_or(ENOENT)?;
        if self.inodes[idx].is_dir() {
            return Err(EISDIR);
        }
        let mut done = 0usize;
        'outer: while done < data.len() {
            let block_index = (offset as usize + done) / BLOCK_SIZE;
            let block_offset = (offset as usize + done) % BLOCK_SIZE;
            let chunk = (data.len() - done).min(BLOCK_SIZE - block_offset);
            // A large-offset write may need to allocate several intermediate
            // blocks (not just the one at block_index) before this run's
            // block exists, since the block map only grows one entry at a time.
            while block_index >= self.inodes[idx].block_count as usize {
                match self.add_block(idx) {
                    Ok(_) => {}
                    Err(ENOSPC) => {
                        if done > 0 {
                            break 'outer;
                        }
                        return Err(ENOSPC);
                    }
                    Err(e) => return Err(e),
                }
            }
            let block_num = self.inodes[idx].blocks[block_index] as u32;
            let region = self.dev.get_block_mut(block_num).ok_or(crate::errno::EIO)?;
            region[block_offset..block_offset + chunk]
                .copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        let end = offset + done as u64;
        if end > self.inodes[idx].size {
            self.inodes[idx].size = end;
        }
        let t = now();
        self.inodes[idx].mtime = t;
        self.inodes[idx].ctime = t;
        self.save().map_err(|_| crate::errno::EIO)?;
        Ok(done)
    }

    /// Resolves a `(parent_path, name)` pair into a full canonical child
    /// path, rejecting non-UTF-8 names at the boundary. Used by the bridge
    /// adapter, which addresses children by parent + name rather than a
    /// full path.
    pub fn join(parent: &str, name: &std::ffi::OsStr) -> Result<String, Errno> {
        let name = name.to_str().ok_or(EILSEQ)?;
        if name.is_empty() || name.contains('/') {
            return Err(EINVAL);
        }
        if parent == "/" {
            Ok(format!("/{name}"))
        } else {
            Ok(format!("{parent}/{name}"))
        }
    }

    /// Path of the inode at 0-based slot `idx`, for the bridge adapter's
    /// `ino = idx + 1` convention.
    pub fn path_at(&self, idx: usize) -> Option<&str> {
        if idx < self.inode_count {
            Some(&self.inodes[idx].path)
        } else {
            None
        }
    }

    pub fn inode_count(&self) -> usize {
        self.inode_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn fresh() -> (NamedTempFile, Filesystem) {
        let file = NamedTempFile::new().unwrap();
        let fs = Filesystem::open(file.path()).unwrap();
        (file, fs)
    }

    #[test]
    fn root_exists_after_mount() {
        let (_f, fs) = fresh();
        let (_, root) = fs.lookup("/").unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn end_to_end_create_write_read() {
        let (_f, mut fs) = fresh();
        fs.mkdir("/d", 0o755).unwrap();
        fs.mknod("/d/f", S_IFREG | 0o644).unwrap();
        let n = fs.write("/d/f", b"hello", 0).unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 5];
        let n = fs.read("/d/f", &mut buf, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(fs.getattr("/d/f").unwrap().size, 5);
    }

    #[test]
    fn write_spanning_two_blocks() {
        let (_f, mut fs) = fresh();
        fs.mknod("/f", S_IFREG | 0o644).unwrap();
        let data = vec![b'A'; 4097];
        let n = fs.write("/f", &data, 0).unwrap();
        assert_eq!(n, 4097);
        let attr = fs.getattr("/f").unwrap();
        assert_eq!(attr.size, 4097);
        let mut buf = vec![0u8; 4097];
        fs.read("/f", &mut buf, 0).unwrap();
        assert_eq!(buf[4095], b'A');
        assert_eq!(buf[4096], b'A');
    }

    #[test]
    fn write_exhausts_block_device() {
        let (_f, mut fs) = fresh();
        fs.mknod("/f", S_IFREG | 0o644).unwrap();
        let data = vec![b'A'; MAX_BLOCKS_PER_FILE * BLOCK_SIZE];
        let n = fs.write("/f", &data, 0).unwrap();
        assert_eq!(n, data.len());
        let more = fs.write("/f", b"x", data.len() as u64);
        assert!(more == Err(ENOSPC) || more == Ok(0));
    }

    #[test]
    fn inode_table_full_returns_enospc() {
        let (_f, mut fs) = fresh();
        // Root already occupies one slot.
        for i in 0..MAX_FILES - 1 {
            fs.mknod(&format!("/f{i}"), S_IFREG | 0o644).unwrap();
        }
        assert_eq!(fs.mknod("/one-too-many", S_IFREG | 0o644), Err(ENOSPC));
    }

    #[test]
    fn unlink_missing_is_enoent_unlink_dir_is_eisdir() {
        let (_f, mut fs) = fresh();
        assert_eq!(fs.unlink("/nope"), Err(ENOENT));
        fs.mkdir("/d", 0o755).unwrap();
        assert_eq!(fs.unlink("/d"), Err(EISDIR));
    }

    #[test]
    fn remount_preserves_contents() {
        let file = NamedTempFile::new().unwrap();
        {
            let mut fs = Filesystem::open(file.path()).unwrap();
            fs.mknod("/a", S_IFREG | 0o644).unwrap();
            fs.write("/a", b"xyz", 0).unwrap();
        }
        let mut fs = Filesystem::open(file.path()).unwrap();
        let mut buf = [0u8; 3];
        let n = fs.read("/a", &mut buf, 0).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn rename_roundtrip_is_identity() {
        let (_f, mut fs) = fresh();
        fs.mknod("/a", S_IFREG | 0o644).unwrap();
        fs.write("/a", b"xyz", 0).unwrap();
        fs.rename("/a", "/b").unwrap();
        fs.rename("/b", "/a").unwrap();
        let mut buf = [0u8; 3];
        fs.read("/a", &mut buf, 0).unwrap();
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn rmdir_nonempty_is_enotempty() {
        let (_f, mut fs) = fresh();
        fs.mkdir("/d", 0o755).unwrap();
        fs.mknod("/d/f", S_IFREG | 0o644).unwrap();
        assert_eq!(fs.rmdir("/d"), Err(ENOTEMPTY));
    }

    #[test]
    fn write_at_large_offset_allocates_every_intermediate_block() {
        let (_f, mut fs) = fresh();
        fs.mknod("/f", S_IFREG | 0o644).unwrap();
        fs.write("/f", b"end", 8192).unwrap();
        let attr = fs.getattr("/f").unwrap();
        assert_eq!(attr.size, 8195);
        let mut buf = vec![0xffu8; 8192];
        let n = fs.read("/f", &mut buf, 0).unwrap();
        assert_eq!(n, 8192);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn overlong_path_is_enoent_except_on_create_and_rename_destination() {
        let (_f, mut fs) = fresh();
        let long = format!("/{}", "a".repeat(300));
        assert_eq!(fs.access(&long), Err(ENOENT));
        assert_eq!(fs.getattr(&long), Err(ENOENT));
        assert_eq!(fs.readdir(&long), Err(ENOENT));
        assert_eq!(fs.unlink(&long), Err(ENOENT));
        assert_eq!(fs.rmdir(&long), Err(ENOENT));
        assert_eq!(fs.mknod(&long, S_IFREG | 0o644), Err(ENAMETOOLONG));
        fs.mknod("/short", S_IFREG | 0o644).unwrap();
        assert_eq!(fs.rename("/short", &long), Err(ENAMETOOLONG));
    }

    #[test]
    fn statfs_on_fresh_image() {
        let (_f, fs) = fresh();
        let stat = fs.statfs();
        assert_eq!(stat.ffree as usize, MAX_FILES - 1);
        assert_eq!(
            stat.bfree,
            (crate::block_device::BLOCK_COUNT - crate::block_device::FIRST_DATA_BLOCK as usize)
                as u64
        );
    }
}
