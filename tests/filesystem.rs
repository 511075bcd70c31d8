//! End-to-end scenarios against the path-addressed filesystem core, driven
//! directly (no actual FUSE mount, since CI has no kernel FUSE support) the
//! same way the bridge adapter itself would.

use duskfs::fs::Filesystem;
use duskfs::inode::{MAX_FILES, S_IFDIR, S_IFREG};
use tempfile::NamedTempFile;

fn open_fresh() -> (NamedTempFile, Filesystem) {
    let file = NamedTempFile::new().expect("tempfile");
    let fs = Filesystem::open(file.path()).expect("open fresh image");
    (file, fs)
}

#[test]
fn nested_directories_and_readdir_listing() {
    let (_f, mut fs) = open_fresh();
    fs.mkdir("/a", 0o755).unwrap();
    fs.mkdir("/a/b", 0o755).unwrap();
    fs.mknod("/a/b/f1", S_IFREG | 0o644).unwrap();
    fs.mknod("/a/b/f2", S_IFREG | 0o644).unwrap();
    // A sibling at the same depth must not show up under /a/b.
    fs.mknod("/a/f3", S_IFREG | 0o644).unwrap();

    let entries = fs.readdir("/a/b").unwrap();
    let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&"."));
    assert!(names.contains(&".."));
    assert!(names.contains(&"f1"));
    assert!(names.contains(&"f2"));
    assert!(!names.contains(&"f3"));

    let top = fs.readdir("/a").unwrap();
    let top_names: Vec<_> = top.iter().map(|e| e.name.as_str()).collect();
    assert!(top_names.contains(&"b"));
    assert!(top_names.contains(&"f3"));
    assert!(!top_names.contains(&"f1"));
}

#[test]
fn mknod_default_mode_when_no_type_bits_given() {
    let (_f, mut fs) = open_fresh();
    // mode with only permission bits, no S_IFMT bits set.
    fs.mknod("/f", 0o600).unwrap();
    let attr = fs.getattr("/f").unwrap();
    assert_eq!(attr.mode & S_IFREG, S_IFREG);
    assert_eq!(attr.mode & 0o7777, 0o644);
}

#[test]
fn create_unlink_cycle_restores_capacity() {
    let (_f, mut fs) = open_fresh();
    for i in 0..MAX_FILES - 1 {
        fs.mknod(&format!("/f{i}"), S_IFREG | 0o644).unwrap();
    }
    assert_eq!(fs.statfs().ffree, 0);
    fs.unlink("/f0").unwrap();
    assert_eq!(fs.statfs().ffree, 1);
    fs.mknod("/f0-again", S_IFREG | 0o644).unwrap();
    assert_eq!(fs.statfs().ffree, 0);
}

#[test]
fn partial_write_offset_zero_fills_gap() {
    let (_f, mut fs) = open_fresh();
    fs.mknod("/f", S_IFREG | 0o644).unwrap();
    fs.write("/f", b"end", 8192).unwrap();
    let mut buf = vec![0xffu8; 8192];
    let n = fs.read("/f", &mut buf, 0).unwrap();
    assert_eq!(n, 8192);
    assert!(buf.iter().all(|&b| b == 0));
    let attr = fs.getattr("/f").unwrap();
    assert_eq!(attr.size, 8195);
}

#[test]
fn short_read_past_block_map_end() {
    let (_f, mut fs) = open_fresh();
    fs.mknod("/f", S_IFREG | 0o644).unwrap();
    fs.write("/f", b"hi", 0).unwrap();
    let mut buf = vec![0u8; 100];
    let n = fs.read("/f", &mut buf, 0).unwrap();
    assert_eq!(n, 2);
    assert_eq!(&buf[..2], b"hi");
}

#[test]
fn rmdir_requires_directory_and_emptiness() {
    let (_f, mut fs) = open_fresh();
    fs.mknod("/f", S_IFREG | 0o644).unwrap();
    assert!(fs.rmdir("/f").is_err());
    fs.mkdir("/d", 0o755).unwrap();
    assert!(fs.rmdir("/d").is_ok());
    assert!(fs.lookup("/d").is_none());
}

#[test]
fn remount_preserves_nested_tree() {
    let file = NamedTempFile::new().unwrap();
    {
        let mut fs = Filesystem::open(file.path()).unwrap();
        fs.mkdir("/a", 0o755).unwrap();
        fs.mknod("/a/f", S_IFREG | 0o644).unwrap();
        fs.write("/a/f", b"persisted", 0).unwrap();
    }
    let mut fs = Filesystem::open(file.path()).unwrap();
    let attr = fs.getattr("/a/f").unwrap();
    assert_eq!(attr.size, 9);
    let mut buf = vec![0u8; 9];
    fs.read("/a/f", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"persisted");
    assert!(fs.getattr("/a").unwrap().mode & S_IFDIR == S_IFDIR);
}
