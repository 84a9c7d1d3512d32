#![allow(clippy::unnecessary_cast)] // libc::S_IFDIR is u32 on Linux and u16 on MacOS

use fuse_backend_rs::abi::fuse_abi::Attr;

use crate::inodes::InodeKind;

pub const ROOT_FILE_ATTR: Attr = Attr {
    ino: fuse_backend_rs::api::filesystem::ROOT_ID,
    size: 0,
    blksize: 1024,
    blocks: 0,
    mode: libc::S_IFDIR as u32 | 0o755,
    atime: 0,
    mtime: 0,
    ctime: 0,
    atimensec: 0,
    mtimensec: 0,
    ctimensec: 0,
    nlink: 2,
    uid: 0,
    gid: 0,
    rdev: 0,
    flags: 0,
    #[cfg(target_os = "macos")]
    crtime: 0,
    #[cfg(target_os = "macos")]
    crtimensec: 0,
    #[cfg(target_os = "macos")]
    padding: 0,
};

/// Builds an [Attr] for a non-root inode from what the inode model knows
/// about it: its kind (tree/file, a regular file always being rw for the
/// owner, a directory always being searchable) and its materialized size,
/// if any (unmaterialized entries don't carry a size here — callers that
/// need one fetch [crate::tree::BlobMetadata] separately).
pub fn gen_file_attr(ino: u64, kind: InodeKind, size: u64, executable: bool) -> Attr {
    let mode = match kind {
        InodeKind::Tree => libc::S_IFDIR as u32 | 0o755,
        InodeKind::File if executable => libc::S_IFREG as u32 | 0o755,
        InodeKind::File => libc::S_IFREG as u32 | 0o644,
    };
    Attr {
        ino,
        size,
        blksize: 4096,
        blocks: size.div_ceil(512),
        mode,
        atime: 0,
        mtime: 0,
        ctime: 0,
        atimensec: 0,
        mtimensec: 0,
        ctimensec: 0,
        nlink: if matches!(kind, InodeKind::Tree) { 2 } else { 1 },
        uid: 0,
        gid: 0,
        rdev: 0,
        flags: 0,
        #[cfg(target_os = "macos")]
        crtime: 0,
        #[cfg(target_os = "macos")]
        crtimensec: 0,
        #[cfg(target_os = "macos")]
        padding: 0,
    }
}
