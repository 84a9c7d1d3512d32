//! Resolves the fixed layout of a daemon's state directory: one lock file,
//! one management socket, one takeover rendezvous socket, a per-backend
//! storage subdirectory, a per-client directory (holding each mount's
//! overlay), and a config file. Nothing here parses or watches the config
//! file — just names the path — since loading/reload is out of scope.

use std::path::{Path, PathBuf};

/// Root of a daemon instance's on-disk state, handed in by the (external)
/// CLI/config layer rather than discovered here.
#[derive(Clone, Debug)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("lock")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join("socket")
    }

    pub fn takeover_socket_path(&self) -> PathBuf {
        self.root.join("takeover")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn storage_dir(&self, engine: &str) -> PathBuf {
        self.root.join("storage").join(engine)
    }

    pub fn client_dir(&self, client_name: &str) -> PathBuf {
        self.root.join("clients").join(client_name)
    }

    /// Where a given client's overlay (materialized inode) storage lives,
    /// per the `<client dir>/local` convention (see
    /// `vfsd_core::inodes::overlay::Overlay`).
    pub fn overlay_dir(&self, client_name: &str) -> PathBuf {
        self.client_dir(client_name).join("local")
    }

    /// Creates every directory this instance will need (but not the lock
    /// or socket files themselves, which are created by whatever binds
    /// them).
    pub async fn ensure_dirs(&self, engine: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.root.join("clients")).await?;
        tokio::fs::create_dir_all(self.storage_dir(engine)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_nest_under_root() {
        let dir = StateDir::new("/var/run/vfsd");
        assert_eq!(dir.lock_path(), PathBuf::from("/var/run/vfsd/lock"));
        assert_eq!(dir.socket_path(), PathBuf::from("/var/run/vfsd/socket"));
        assert_eq!(dir.takeover_socket_path(), PathBuf::from("/var/run/vfsd/takeover"));
        assert_eq!(dir.config_path(), PathBuf::from("/var/run/vfsd/config.json"));
        assert_eq!(dir.storage_dir("sled"), PathBuf::from("/var/run/vfsd/storage/sled"));
        assert_eq!(dir.client_dir("repo1"), PathBuf::from("/var/run/vfsd/clients/repo1"));
        assert_eq!(dir.overlay_dir("repo1"), PathBuf::from("/var/run/vfsd/clients/repo1/local"));
    }

    #[tokio::test]
    async fn ensure_dirs_creates_clients_and_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::new(tmp.path());
        dir.ensure_dirs("sled").await.unwrap();
        assert!(tmp.path().join("clients").is_dir());
        assert!(tmp.path().join("storage").join("sled").is_dir());
    }
}
