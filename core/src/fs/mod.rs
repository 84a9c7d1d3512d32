//! The FUSE-facing [fuse_backend_rs::api::filesystem::FileSystem]
//! implementation: bridges kernel requests to the [crate::inodes::InodeMap],
//! [crate::inodes::Overlay] and [crate::objectstore::ObjectStore] that make
//! up a [crate::mount::MountPoint]. Same inode-tracker-guarded-by-`RwLock`
//! shape throughout: a `tokio_handle.block_on`/`spawn` bridge from FUSE's
//! synchronous callbacks into this crate's async object resolution, and a
//! file-handle table keyed by an atomic counter, generalized from a
//! read-only view of one fixed tree to a writable one that can
//! materialize, create and rename entries against the [Overlay].

pub mod file_attr;
#[cfg(unix)]
pub mod fuse;

use std::ffi::CStr;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fuse_backend_rs::api::filesystem::{
    Context, CreateIn, Entry, FileSystem, FsOptions, OpenOptions, SetattrValid, ZeroCopyReader, ZeroCopyWriter,
};
use parking_lot::RwLock;
use tracing::instrument;

use self::file_attr::{gen_file_attr, ROOT_FILE_ATTR};
use crate::inodes::overlay::{ChildRef, OverlayDirEntry};
use crate::inodes::tracker::TrackedKind;
use crate::inodes::{InodeKind, InodeNumber, InodeTracker, LoadedInode, Materialization, ROOT_INODE};
use crate::mount::MountPoint;
use crate::objectstore::ObjectFetchContext;
use crate::tree::EntryKind;
use crate::ObjectId;

fn entry_kind_byte(kind: EntryKind) -> u8 {
    match kind {
        EntryKind::RegularFile => 0,
        EntryKind::ExecutableFile => 1,
        EntryKind::Symlink => 2,
        EntryKind::Directory => 3,
    }
}

fn inode_kind_of(kind: EntryKind) -> InodeKind {
    if kind.is_directory() {
        InodeKind::Tree
    } else {
        InodeKind::File
    }
}

fn as_io_error(err: crate::Error) -> io::Error {
    use crate::Error::*;
    let errno = match &err {
        NotFound(_) => libc::ENOENT,
        Argument(_) => libc::EINVAL,
        Conflict(_) => libc::EEXIST,
        Unsupported => libc::ENOSYS,
        AlreadyInProgress | AlreadyMounted | TakeoverInProgress => libc::EBUSY,
        BackendUnavailable(_) | BackendTimeout => libc::EIO,
        StoreCorrupt(_) | StoreIOError(_) | MalformedObject(_) | MissingProxyHash(_) => libc::EIO,
        Cancelled => libc::EINTR,
        _ => libc::EIO,
    };
    io::Error::from_raw_os_error(errno)
}

/// Binds a mounted working copy to the FUSE `FileSystem` trait.
pub struct VfsdFs {
    mount: Arc<MountPoint>,
    tracker: RwLock<InodeTracker>,
    file_handles: RwLock<std::collections::HashMap<u64, ()>>,
    next_file_handle: AtomicU64,
    tokio_handle: tokio::runtime::Handle,
}

impl VfsdFs {
    pub fn new(mount: Arc<MountPoint>, tokio_handle: tokio::runtime::Handle) -> Self {
        Self {
            mount,
            tracker: RwLock::new(InodeTracker::default()),
            file_handles: RwLock::new(std::collections::HashMap::new()),
            next_file_handle: AtomicU64::new(1),
            tokio_handle,
        }
    }

    fn overlay(&self) -> &crate::inodes::Overlay {
        self.mount.overlay.as_ref()
    }

    /// Populates the root inode's overlay directory table from the
    /// mount's current root tree, if it hasn't been already. Idempotent:
    /// calling it again is a harmless no-op once entries exist.
    pub async fn populate_root(&self) -> crate::Result<()> {
        let existing = self.overlay().read_dir(ROOT_INODE).await?;
        if !existing.is_empty() {
            return Ok(());
        }
        let root = self.mount.current_root();
        let ctx = ObjectFetchContext::mgmt();
        let tree = self.mount.object_store.get_root_tree(&root, &ctx).await?;
        self.populate_directory(ROOT_INODE, &tree).await
    }

    async fn populate_directory(&self, inode: InodeNumber, tree: &crate::tree::Tree) -> crate::Result<()> {
        for entry in tree.entries() {
            let tracked_kind = if entry.kind().is_directory() {
                crate::inodes::tracker::TrackedKind::Tree
            } else {
                crate::inodes::tracker::TrackedKind::File
            };
            let child_inode = self.dedup_inode(tracked_kind, entry.id());
            self.mount.inode_map.ensure_slot(child_inode);
            let overlay_entry = OverlayDirEntry {
                name: entry.name().to_vec(),
                child_inode,
                kind: entry_kind_byte(entry.kind()),
                reference: ChildRef::Reference(entry.id().as_bytes().to_vec()),
            };
            // Best-effort: a concurrent populate of the same directory
            // racing to add the same name is harmless (both sides agree
            // on content), so a Conflict here is not an error.
            let _ = self.overlay().add_child(inode, overlay_entry).await;
        }
        Ok(())
    }

    fn dedup_inode(&self, kind: crate::inodes::tracker::TrackedKind, id: &ObjectId) -> InodeNumber {
        let inode_map = &self.mount.inode_map;
        self.tracker
            .write()
            .get_or_insert_with(kind, id.clone(), || inode_map.allocate())
    }

    /// Ensures a child's `InodeMap` slot reflects the given kind/reference,
    /// loading it for the first time if necessary. Cheap to call
    /// repeatedly once loaded.
    fn ensure_child_loaded(
        &self,
        child_inode: InodeNumber,
        kind: InodeKind,
        reference: Option<ObjectId>,
        parent: (InodeNumber, Vec<u8>),
    ) {
        self.mount.inode_map.ensure_slot(child_inode);
        if self.mount.inode_map.begin_load(child_inode) {
            let materialization = match reference {
                Some(id) => Materialization::Unmaterialized(id),
                None => Materialization::Materialized,
            };
            self.mount.inode_map.finish_load(
                child_inode,
                LoadedInode {
                    kind,
                    materialization,
                    parent: Some(parent),
                    kernel_refs: 0,
                    last_access: std::time::Instant::now(),
                    pending_overlay_writes: 0,
                },
            );
        }
    }

    /// Returns the directory entries of `inode`, populating them from the
    /// committed tree on first access if the directory is still
    /// unmaterialized (a materialized or freshly-created directory's
    /// entries live solely in the overlay and are never repopulated from
    /// a tree).
    async fn list_children(&self, inode: InodeNumber) -> crate::Result<Vec<OverlayDirEntry>> {
        let existing = self.overlay().read_dir(inode).await?;
        if !existing.is_empty() || inode == ROOT_INODE {
            return Ok(existing);
        }
        let source = self
            .mount
            .inode_map
            .with_loaded(inode, |loaded| match &loaded.materialization {
                Materialization::Unmaterialized(id) => Some(id.clone()),
                Materialization::Materialized => None,
            })
            .flatten();
        let Some(tree_id) = source else {
            return Ok(existing);
        };
        let ctx = ObjectFetchContext::mgmt();
        let tree = self.mount.object_store.get_tree(&tree_id, &ctx).await?;
        self.populate_directory(inode, &tree).await?;
        self.overlay().read_dir(inode).await
    }

    async fn attr_for(&self, inode: InodeNumber) -> crate::Result<fuse_backend_rs::abi::fuse_abi::Attr> {
        if inode == ROOT_INODE {
            return Ok(ROOT_FILE_ATTR);
        }
        let kind = self
            .mount
            .inode_map
            .with_loaded(inode, |loaded| loaded.kind)
            .ok_or_else(|| crate::Error::NotFound(inode.to_string()))?;
        let size = match kind {
            InodeKind::Tree => 0,
            InodeKind::File => match self.overlay().stat_file(inode).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            },
        };
        Ok(gen_file_attr(inode, kind, size, false))
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.tokio_handle.block_on(fut)
    }

    fn new_file_handle(&self) -> u64 {
        let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        self.file_handles.write().insert(fh, ());
        fh
    }
}

fn cstr_to_vec(name: &CStr) -> Vec<u8> {
    name.to_bytes().to_vec()
}

impl FileSystem for VfsdFs {
    type Handle = u64;
    type Inode = u64;

    fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
        self.block_on(self.populate_root()).map_err(as_io_error)?;
        Ok(FsOptions::empty())
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn getattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Option<Self::Handle>,
    ) -> io::Result<(fuse_backend_rs::abi::fuse_abi::stat64, Duration)> {
        let attr = self.block_on(self.attr_for(inode)).map_err(as_io_error)?;
        Ok((attr.into(), Duration::from_secs(1)))
    }

    #[instrument(skip_all, fields(rq.parent_inode = parent))]
    fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
        let name_bytes = cstr_to_vec(name);
        let children = self.block_on(self.list_children(parent)).map_err(as_io_error)?;
        let Some(child) = children.iter().find(|e| e.name == name_bytes) else {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        };
        let kind = child.entry_kind().map_err(as_io_error)?;
        let reference = child.reference_id().map_err(as_io_error)?;
        self.ensure_child_loaded(
            child.child_inode,
            inode_kind_of(kind),
            reference,
            (parent, name_bytes),
        );
        let attr = self.block_on(self.attr_for(child.child_inode)).map_err(as_io_error)?;
        Ok(Entry {
            inode: child.child_inode,
            attr: attr.into(),
            attr_timeout: Duration::from_secs(1),
            entry_timeout: Duration::from_secs(1),
            ..Default::default()
        })
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
    fn readdir(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        _size: u32,
        offset: u64,
        add_entry: &mut dyn FnMut(fuse_backend_rs::api::filesystem::DirEntry) -> io::Result<usize>,
    ) -> io::Result<()> {
        let children = self.block_on(self.list_children(inode)).map_err(as_io_error)?;
        for (i, child) in children.iter().enumerate().skip(offset as usize) {
            let kind = child.entry_kind().map_err(as_io_error)?;
            let dir_entry = fuse_backend_rs::api::filesystem::DirEntry {
                ino: child.child_inode,
                offset: (i + 1) as u64,
                type_: match kind {
                    EntryKind::Directory => libc::DT_DIR as u32,
                    EntryKind::Symlink => libc::DT_LNK as u32,
                    _ => libc::DT_REG as u32,
                },
                name: &child.name,
            };
            if add_entry(dir_entry)? == 0 {
                break;
            }
        }
        Ok(())
    }

    fn opendir(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        Ok((None, OpenOptions::empty()))
    }

    fn releasedir(&self, _ctx: &Context, _inode: Self::Inode, _flags: u32, _handle: Self::Handle) -> io::Result<()> {
        Ok(())
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn open(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
        if inode == ROOT_INODE {
            return Err(io::Error::from_raw_os_error(libc::EISDIR));
        }
        Ok((Some(self.new_file_handle()), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.inode = inode, fh = handle))]
    fn release(
        &self,
        _ctx: &Context,
        _inode: Self::Inode,
        _flags: u32,
        handle: Self::Handle,
        _flush: bool,
        _flock_release: bool,
        _lock_owner: Option<u64>,
    ) -> io::Result<()> {
        self.file_handles.write().remove(&handle);
        Ok(())
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn read(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        w: &mut dyn ZeroCopyWriter,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _flags: u32,
    ) -> io::Result<usize> {
        let bytes = self.block_on(self.read_file_contents(inode)).map_err(as_io_error)?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + size as usize).min(bytes.len());
        w.write(&bytes[start..end])
    }

    #[instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
    fn write(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        _handle: Self::Handle,
        r: &mut dyn ZeroCopyReader,
        size: u32,
        offset: u64,
        _lock_owner: Option<u64>,
        _delayed_write: bool,
        _flags: u32,
        _fuse_flags: u32,
    ) -> io::Result<usize> {
        let mut buf = vec![0u8; size as usize];
        let n = r.read(&mut buf)?;
        buf.truncate(n);
        self.block_on(self.write_file_contents(inode, offset, &buf)).map_err(as_io_error)?;
        Ok(n)
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn readlink(&self, _ctx: &Context, inode: Self::Inode) -> io::Result<Vec<u8>> {
        self.block_on(self.read_file_contents(inode)).map_err(as_io_error)
    }

    #[instrument(skip_all, fields(rq.parent = parent))]
    fn create(
        &self,
        _ctx: &Context,
        parent: Self::Inode,
        name: &CStr,
        args: CreateIn,
    ) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions)> {
        let executable = args.mode & 0o111 != 0;
        let kind = if executable { EntryKind::ExecutableFile } else { EntryKind::RegularFile };
        let entry = self.block_on(self.create_child(parent, cstr_to_vec(name), kind)).map_err(as_io_error)?;
        Ok((entry, Some(self.new_file_handle()), OpenOptions::empty()))
    }

    #[instrument(skip_all, fields(rq.parent = parent))]
    fn mkdir(&self, _ctx: &Context, parent: Self::Inode, name: &CStr, _mode: u32, _umask: u32) -> io::Result<Entry> {
        self.block_on(self.create_child(parent, cstr_to_vec(name), EntryKind::Directory))
            .map_err(as_io_error)
    }

    #[instrument(skip_all, fields(rq.parent = parent))]
    fn unlink(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        self.block_on(self.remove_child(parent, cstr_to_vec(name))).map_err(as_io_error)
    }

    #[instrument(skip_all, fields(rq.parent = parent))]
    fn rmdir(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<()> {
        self.block_on(self.remove_child(parent, cstr_to_vec(name))).map_err(as_io_error)
    }

    #[instrument(skip_all)]
    fn rename(
        &self,
        _ctx: &Context,
        olddir: Self::Inode,
        oldname: &CStr,
        newdir: Self::Inode,
        newname: &CStr,
        _flags: u32,
    ) -> io::Result<()> {
        self.block_on(self.rename_child(olddir, cstr_to_vec(oldname), newdir, cstr_to_vec(newname)))
            .map_err(as_io_error)
    }

    #[instrument(skip_all, fields(rq.inode = inode))]
    fn setattr(
        &self,
        _ctx: &Context,
        inode: Self::Inode,
        attr: fuse_backend_rs::abi::fuse_abi::stat64,
        _handle: Option<Self::Handle>,
        valid: SetattrValid,
    ) -> io::Result<(fuse_backend_rs::abi::fuse_abi::stat64, Duration)> {
        if valid.contains(SetattrValid::SIZE) {
            self.block_on(self.truncate_file(inode, attr.st_size as u64)).map_err(as_io_error)?;
        }
        let resolved = self.block_on(self.attr_for(inode)).map_err(as_io_error)?;
        Ok((resolved.into(), Duration::from_secs(1)))
    }
}

impl VfsdFs {
    async fn read_file_contents(&self, inode: InodeNumber) -> crate::Result<Vec<u8>> {
        let materialized = self
            .mount
            .inode_map
            .with_loaded(inode, |loaded| matches!(loaded.materialization, Materialization::Materialized))
            .unwrap_or(false);
        if materialized {
            return self.overlay().read_file(inode).await;
        }
        let id = self
            .mount
            .inode_map
            .with_loaded(inode, |loaded| match &loaded.materialization {
                Materialization::Unmaterialized(id) => Some(id.clone()),
                Materialization::Materialized => None,
            })
            .flatten()
            .ok_or_else(|| crate::Error::NotFound(inode.to_string()))?;
        let ctx = ObjectFetchContext::fs(std::process::id());
        let bytes = self.mount.object_store.get_blob(&id, &ctx).await?;
        Ok(bytes.to_vec())
    }

    async fn write_file_contents(&self, inode: InodeNumber, offset: u64, data: &[u8]) -> crate::Result<()> {
        self.materialize_file(inode).await?;
        let _guard = self.mount.inode_map.guard_overlay_write(inode);
        self.overlay().write_file(inode, offset, data).await?;
        self.mount.inode_map.materialize_chain(inode);
        self.mount.journal.add_delta(
            None,
            vec![(format!("inode:{inode:x}").into_bytes(), crate::journal::PathEventKind::Changed)],
        );
        Ok(())
    }

    async fn truncate_file(&self, inode: InodeNumber, len: u64) -> crate::Result<()> {
        self.materialize_file(inode).await?;
        let _guard = self.mount.inode_map.guard_overlay_write(inode);
        self.overlay().truncate(inode, len).await?;
        self.mount.inode_map.materialize_chain(inode);
        Ok(())
    }

    /// Copies an unmaterialized file's current content into the overlay
    /// the first time it's written to, so the write lands on top of what
    /// the committed tree actually had rather than on an empty file.
    async fn materialize_file(&self, inode: InodeNumber) -> crate::Result<()> {
        let needs_copy = self
            .mount
            .inode_map
            .with_loaded(inode, |loaded| match &loaded.materialization {
                Materialization::Unmaterialized(id) => Some(id.clone()),
                Materialization::Materialized => None,
            })
            .flatten();
        if let Some(id) = needs_copy {
            let ctx = ObjectFetchContext::fs(std::process::id());
            let bytes = self.mount.object_store.get_blob(&id, &ctx).await?;
            let _guard = self.mount.inode_map.guard_overlay_write(inode);
            self.overlay().write_file(inode, 0, &bytes).await?;
        }
        Ok(())
    }

    async fn create_child(&self, parent: InodeNumber, name: Vec<u8>, kind: EntryKind) -> crate::Result<Entry> {
        let child_inode = self.mount.inode_map.allocate();
        self.mount.inode_map.ensure_slot(child_inode);
        if self.mount.inode_map.begin_load(child_inode) {
            self.mount.inode_map.finish_load(
                child_inode,
                LoadedInode {
                    kind: inode_kind_of(kind),
                    materialization: Materialization::Materialized,
                    parent: Some((parent, name.clone())),
                    kernel_refs: 0,
                    last_access: std::time::Instant::now(),
                    pending_overlay_writes: 0,
                },
            );
        }
        {
            let _guard = self.mount.inode_map.guard_overlay_write(parent);
            self.overlay()
                .add_child(
                    parent,
                    OverlayDirEntry {
                        name: name.clone(),
                        child_inode,
                        kind: entry_kind_byte(kind),
                        reference: ChildRef::Materialized,
                    },
                )
                .await?;
        }
        self.mount.inode_map.materialize_chain(parent);
        self.mount.journal.add_delta(
            None,
            vec![(name, crate::journal::PathEventKind::Created)],
        );
        let attr = self.attr_for(child_inode).await?;
        Ok(Entry {
            inode: child_inode,
            attr: attr.into(),
            attr_timeout: Duration::from_secs(1),
            entry_timeout: Duration::from_secs(1),
            ..Default::default()
        })
    }

    async fn remove_child(&self, parent: InodeNumber, name: Vec<u8>) -> crate::Result<()> {
        let _guard = self.mount.inode_map.guard_overlay_write(parent);
        self.overlay().remove_child(parent, &name).await?;
        self.mount.inode_map.materialize_chain(parent);
        self.mount.journal.add_delta(None, vec![(name, crate::journal::PathEventKind::Changed)]);
        Ok(())
    }

    async fn rename_child(
        &self,
        old_parent: InodeNumber,
        old_name: Vec<u8>,
        new_parent: InodeNumber,
        new_name: Vec<u8>,
    ) -> crate::Result<()> {
        let _old_guard = self.mount.inode_map.guard_overlay_write(old_parent);
        let _new_guard = self.mount.inode_map.guard_overlay_write(new_parent);
        self.overlay().rename_child(old_parent, &old_name, new_parent, &new_name).await?;
        self.mount.inode_map.materialize_chain(old_parent);
        self.mount.inode_map.materialize_chain(new_parent);
        self.mount.journal.add_delta(
            None,
            vec![
                (old_name, crate::journal::PathEventKind::Changed),
                (new_name, crate::journal::PathEventKind::Changed),
            ],
        );
        Ok(())
    }
}
