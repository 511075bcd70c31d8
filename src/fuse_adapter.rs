//! Translates the host bridge's inode-number-addressed trait onto the
//! path-addressed core of [`crate::fs::Filesystem`].
//!
//! The bridge (`fuser`) resolves names to inodes via an explicit `lookup`
//! call and addresses every subsequent operation by a 64-bit `ino`, root
//! fixed at 1. This crate's core has no concept of an inode number at all —
//! every operation takes a path. The adapter bridges the two by treating an
//! inhabited inode-table slot's index, plus one, as its `ino`. Because
//! `remove` compacts the table, no `ino -> path` mapping is cached across
//! calls; every callback re-resolves the path fresh from the live table.

use std::ffi::OsStr;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem as FuseFilesystem, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use libc::ENOENT;

use crate::errno::{self, Errno};
use crate::fs::{Attr, Filesystem};
use crate::inode::S_IFDIR;

/// How long the kernel may cache entry/attribute replies before re-asking.
/// Short, since nothing else can mutate the image out from under this
/// single-writer mount, but a long TTL would make external edits to the
/// image file (there are none expected, but nothing rules it out) invisible.
const TTL: Duration = Duration::from_secs(1);

/// Bridges `fuser`'s ino-addressed `Filesystem` trait to the path-addressed
/// core.
pub struct Adapter {
    fs: Filesystem,
}

impl Adapter {
    pub fn new(fs: Filesystem) -> Self {
        Adapter { fs }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        let idx = (ino as usize).checked_sub(1)?;
        self.fs.path_at(idx).map(str::to_string)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, Errno> {
        let parent_path = self.path_of(parent).ok_or(errno::ENOENT)?;
        Filesystem::join(&parent_path, name)
    }

    fn file_attr(&self, ino: u64, attr: Attr) -> FileAttr {
        let kind = if attr.mode & crate::inode::S_IFMT == S_IFDIR {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let epoch = |secs: i64| UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64);
        FileAttr {
            ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: epoch(attr.atime),
            mtime: epoch(attr.mtime),
            ctime: epoch(attr.ctime),
            crtime: SystemTime::UNIX_EPOCH,
            kind,
            perm: (attr.mode & 0o7777) as u16,
            nlink: attr.nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            blksize: attr.blksize,
            flags: 0,
        }
    }

    /// ino for the path at table index `idx`, used when an operation creates
    /// or resolves a new child.
    fn ino_for_path(&self, path: &str) -> Option<u64> {
        let (idx, _) = self.fs.lookup(path)?;
        Some(idx as u64 + 1)
    }
}

fn log_failure(op: &str, path: Option<&str>, errno: Errno) {
    match path {
        Some(p) => log::trace!("{op}({p}) -> {errno}"),
        None => log::trace!("{op} -> {errno}"),
    }
}

impl FuseFilesystem for Adapter {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(_) => return reply.error(ENOENT),
        };
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.ino_for_path(&path).unwrap_or(0);
                reply.entry(&TTL, &self.file_attr(ino, attr), 0)
            }
            Err(e) => {
                log_failure("lookup", Some(&path), e);
                reply.error(errno::to_positive(e))
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        match self.fs.getattr(&path) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, attr)),
            Err(e) => {
                log_failure("getattr", Some(&path), e);
                reply.error(errno::to_positive(e))
            }
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, _mask: i32, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        match self.fs.access(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno::to_positive(e)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        let entries = match self.fs.readdir(&path) {
            Ok(e) => e,
            Err(e) => {
                log_failure("readdir", Some(&path), e);
                return reply.error(errno::to_positive(e));
            }
        };
        for (i, entry) in entries.into_iter().enumerate().skip(offset as usize) {
            let kind = if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            // Resolve . and .. to this directory's own ino / a stand-in, since
            // neither is a distinct inode-table slot.
            let entry_ino = match entry.name.as_str() {
                "." | ".." => ino,
                name => {
                    let child = Filesystem::join(&path, OsStr::new(name)).ok();
                    child
                        .as_deref()
                        .and_then(|p| self.ino_for_path(p))
                        .unwrap_or(ino)
                }
            };
            if reply.add(entry_ino, (i + 1) as i64, kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, flags: i32, reply: ReplyOpen) {
        reply.opened(0, flags as u32);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: fuser::ReplyCreate,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(errno::to_positive(e)),
        };
        if let Err(e) = self.fs.mknod(&path, mode) {
            log_failure("create", Some(&path), e);
            return reply.error(errno::to_positive(e));
        }
        let attr = self.fs.getattr(&path).expect("just created");
        let ino = self.ino_for_path(&path).unwrap_or(0);
        reply.created(&TTL, &self.file_attr(ino, attr), 0, 0, flags as u32);
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(errno::to_positive(e)),
        };
        if let Err(e) = self.fs.mknod(&path, mode) {
            return reply.error(errno::to_positive(e));
        }
        let attr = self.fs.getattr(&path).expect("just created");
        let ino = self.ino_for_path(&path).unwrap_or(0);
        reply.entry(&TTL, &self.file_attr(ino, attr), 0);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(errno::to_positive(e)),
        };
        if let Err(e) = self.fs.mkdir(&path, mode) {
            return reply.error(errno::to_positive(e));
        }
        let attr = self.fs.getattr(&path).expect("just created");
        let ino = self.ino_for_path(&path).unwrap_or(0);
        reply.entry(&TTL, &self.file_attr(ino, attr), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(errno::to_positive(e)),
        };
        match self.fs.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(e) => {
                log_failure("unlink", Some(&path), e);
                reply.error(errno::to_positive(e))
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(errno::to_positive(e)),
        };
        match self.fs.rmdir(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno::to_positive(e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let from = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => return reply.error(errno::to_positive(e)),
        };
        let to = match self.child_path(newparent, newname) {
            Ok(p) => p,
            Err(e) => return reply.error(errno::to_positive(e)),
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(errno::to_positive(e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        let mut buf = vec![0u8; size as usize];
        match self.fs.read(&path, &mut buf, offset as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => {
                log_failure("read", Some(&path), e);
                reply.error(errno::to_positive(e))
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            return reply.error(ENOENT);
        };
        match self.fs.write(&path, data, offset as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => {
                log_failure("write", Some(&path), e);
                reply.error(errno::to_positive(e))
            }
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let stat = self.fs.statfs();
        reply.statfs(
            stat.blocks,
            stat.bfree,
            stat.bavail,
            stat.files,
            stat.ffree,
            stat.bsize,
            stat.namelen,
            0,
        );
    }
}

pub fn mount(fs: Filesystem, mountpoint: &Path, options: &[fuser::MountOption]) -> std::io::Result<()> {
    fuser::mount2(Adapter::new(fs), mountpoint, options)
}
