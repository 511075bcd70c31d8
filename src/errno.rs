//! POSIX error codes used across the filesystem core and the bridge adapter.

/// An error signaled as a negative POSIX error number, exactly as every core
/// filesystem operation returns it.
pub type Errno = i32;

/// Permission denied.
pub const EACCES: Errno = -libc::EACCES;
/// File exists.
pub const EEXIST: Errno = -libc::EEXIST;
/// Is a directory.
pub const EISDIR: Errno = -libc::EISDIR;
/// Not a directory.
pub const ENOTDIR: Errno = -libc::ENOTDIR;
/// No such file or directory.
pub const ENOENT: Errno = -libc::ENOENT;
/// Directory not empty.
pub const ENOTEMPTY: Errno = -libc::ENOTEMPTY;
/// Filename too long.
pub const ENAMETOOLONG: Errno = -libc::ENAMETOOLONG;
/// No space left on device.
pub const ENOSPC: Errno = -libc::ENOSPC;
/// I/O error.
pub const EIO: Errno = -libc::EIO;
/// Invalid argument.
pub const EINVAL: Errno = -libc::EINVAL;
/// Illegal byte sequence.
pub const EILSEQ: Errno = -libc::EILSEQ;

/// Converts a negative `Errno` (the convention used throughout the core) into
/// the positive code `fuser`'s `reply.error()` expects.
pub fn to_positive(errno: Errno) -> i32 {
    errno.unsigned_abs() as i32
}
