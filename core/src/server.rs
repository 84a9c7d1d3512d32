//! Top-level supervisor: owns the shared [ObjectStore] and the registry of
//! currently-mounted [MountPoint]s, and runs the background inode-unload
//! sweep. Grounded on the daemon-loop shape of a long-running store
//! server binary: build the services once, hand them to whatever's
//! serving requests, then wait on a signal/shutdown future and tear down
//! cleanly. Here that shape is lifted one layer up, since a single process
//! can serve several mounts against one store.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, instrument, warn};

use crate::inodes::{InodeMap, Overlay};
use crate::journal::Journal;
use crate::mount::MountPoint;
use crate::objectstore::ObjectStore;
use crate::rootid::RootId;
use crate::{Error, Result};

/// How often the background sweep looks for inodes to unload. There's no
/// precedent elsewhere in this crate to reuse (everything else either has
/// no notion of aging out, or ages out on a different policy); this value
/// is new and deliberately conservative.
pub const DEFAULT_UNLOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Default journal memory budget per mount, used when a mount's config
/// doesn't override it.
pub const DEFAULT_JOURNAL_MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

struct MountEntry {
    mount: Arc<MountPoint>,
    mount_point_path: PathBuf,
}

/// Owns every mount in this process and the object store they share.
/// `lock_held` records whether this instance currently holds the
/// filesystem-level advisory lock that guards a state directory (the real
/// lock file itself lives in `daemon::statedir`; this flag is what the
/// takeover protocol flips during handoff, see [crate::takeover]).
pub struct Server {
    object_store: Arc<ObjectStore>,
    mounts: RwLock<HashMap<PathBuf, MountEntry>>,
    next_mount_generation: AtomicU64,
    unload_interval: Duration,
    lock_held: std::sync::atomic::AtomicBool,
}

impl Server {
    pub fn new(object_store: Arc<ObjectStore>) -> Self {
        Self::with_unload_interval(object_store, DEFAULT_UNLOAD_INTERVAL)
    }

    pub fn with_unload_interval(object_store: Arc<ObjectStore>, unload_interval: Duration) -> Self {
        Self {
            object_store,
            mounts: RwLock::new(HashMap::new()),
            next_mount_generation: AtomicU64::new(1),
            unload_interval,
            lock_held: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn object_store(&self) -> &Arc<ObjectStore> {
        &self.object_store
    }

    /// Registers and returns a freshly-allocated mount at `mount_point_path`,
    /// or `Err(Error::AlreadyMounted)` if something is already registered
    /// there.
    #[instrument(skip(self))]
    pub fn mount(&self, mount_point_path: PathBuf, overlay_root: PathBuf, initial_root: RootId) -> Result<Arc<MountPoint>> {
        let mut mounts = self.mounts.write();
        if mounts.contains_key(&mount_point_path) {
            return Err(Error::AlreadyMounted);
        }
        let generation = self.next_mount_generation.fetch_add(1, Ordering::SeqCst);
        let mount = Arc::new(MountPoint::new(
            self.object_store.clone(),
            Arc::new(InodeMap::new()),
            Arc::new(Journal::new(DEFAULT_JOURNAL_MEMORY_LIMIT)),
            Arc::new(Overlay::new(overlay_root)),
            initial_root,
            generation,
        ));
        mounts.insert(
            mount_point_path.clone(),
            MountEntry { mount: mount.clone(), mount_point_path },
        );
        info!(generation, "mount registered");
        Ok(mount)
    }

    /// Re-registers a mount carried over from a predecessor process during
    /// takeover, preserving its `mount_generation` rather than allocating a
    /// fresh one (the whole point of a takeover is that journal positions
    /// issued by the predecessor stay valid).
    #[instrument(skip(self, mount))]
    pub fn adopt_mount(&self, mount_point_path: PathBuf, mount: Arc<MountPoint>) {
        let mut mounts = self.mounts.write();
        mounts.insert(mount_point_path.clone(), MountEntry { mount, mount_point_path });
    }

    pub fn unmount(&self, mount_point_path: &PathBuf) -> Result<()> {
        self.mounts
            .write()
            .remove(mount_point_path)
            .map(|_| ())
            .ok_or(Error::NotMounted)
    }

    pub fn get_mount(&self, mount_point_path: &PathBuf) -> Option<Arc<MountPoint>> {
        self.mounts.read().get(mount_point_path).map(|e| e.mount.clone())
    }

    pub fn list_mounts(&self) -> Vec<PathBuf> {
        self.mounts.read().keys().cloned().collect()
    }

    pub fn lock_is_held(&self) -> bool {
        self.lock_held.load(Ordering::SeqCst)
    }

    pub fn set_lock_held(&self, held: bool) {
        self.lock_held.store(held, Ordering::SeqCst);
    }

    /// Runs the background inode-unload sweep until `shutdown` resolves.
    /// Intended to be spawned as its own task alongside whatever is
    /// actually serving filesystem requests: a dedicated task waiting on
    /// `ctrl_c()` next to the FUSE daemon rather than folding shutdown
    /// logic into the request path.
    pub async fn run_unload_sweep(&self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(self.unload_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once();
                }
                _ = &mut shutdown => {
                    info!("unload sweep received shutdown signal");
                    break;
                }
            }
        }
    }

    fn sweep_once(&self) {
        let cutoff = std::time::Instant::now() - self.unload_interval;
        for entry in self.mounts.read().values() {
            let unloaded = entry.mount.inode_map.unload_older_than(cutoff);
            if unloaded > 0 {
                info!(path = ?entry.mount_point_path, unloaded, "swept idle inodes");
            }
        }
    }

    /// Drops every mount registration. Called on graceful shutdown once the
    /// filesystem channels themselves have been torn down (or handed off
    /// via takeover); does not attempt to unmount anything at the OS level,
    /// since that's a property of the FUSE/privileged-helper layer, not of
    /// this registry.
    pub fn shutdown(&self) {
        let count = self.mounts.write().drain().count();
        if count > 0 {
            warn!(count, "server shut down with mounts still registered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::{CacheConfig, InMemoryObjectCache};
    use crate::importqueue::{BatchSizes, ImportRequestQueue};
    use crate::localstore::MemoryLocalStore;
    use crate::rootid::parse_root_id;

    fn store() -> Arc<ObjectStore> {
        Arc::new(ObjectStore::new(
            Arc::new(MemoryLocalStore::new()),
            Arc::new(InMemoryObjectCache::new(CacheConfig::default())),
            ImportRequestQueue::new(BatchSizes::default()),
            Arc::new(MemoryBackend::new()),
        ))
    }

    #[test]
    fn mounting_twice_at_same_path_conflicts() {
        let server = Server::new(store());
        let root = parse_root_id(b"aaaa");
        let path = PathBuf::from("/mnt/repo");
        let overlay_dir = tempfile::tempdir().unwrap();
        server.mount(path.clone(), overlay_dir.path().to_path_buf(), root.clone()).unwrap();
        let err = server.mount(path, overlay_dir.path().to_path_buf(), root).unwrap_err();
        assert!(matches!(err, Error::AlreadyMounted));
    }

    #[test]
    fn unmounting_unknown_path_errors() {
        let server = Server::new(store());
        let err = server.unmount(&PathBuf::from("/mnt/nope")).unwrap_err();
        assert!(matches!(err, Error::NotMounted));
    }

    #[test]
    fn mount_generations_are_distinct() {
        let server = Server::new(store());
        let root = parse_root_id(b"aaaa");
        let overlay_dir = tempfile::tempdir().unwrap();
        let a = server
            .mount(PathBuf::from("/mnt/a"), overlay_dir.path().join("a"), root.clone())
            .unwrap();
        let b = server
            .mount(PathBuf::from("/mnt/b"), overlay_dir.path().join("b"), root)
            .unwrap();
        assert_ne!(a.mount_generation(), b.mount_generation());
    }

    #[tokio::test]
    async fn unload_sweep_stops_on_shutdown() {
        let server = Arc::new(Server::with_unload_interval(store(), Duration::from_millis(5)));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let server_clone = server.clone();
        let handle = tokio::spawn(async move {
            server_clone
                .run_unload_sweep(async {
                    let _ = rx.await;
                })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep task should stop promptly after shutdown")
            .unwrap();
    }
}
