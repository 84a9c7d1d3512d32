//! Bidirectional binding between an internal [ObjectId] and the
//! `(path, revHash)` pair a path-addressed [crate::backend::RemoteBackend]
//! needs to resolve it. `prepare_to_store` is pure so callers can compute
//! the id before touching storage; `store`/`load` are the LocalStore side.

use std::num::NonZeroU32;

use governor::{Quota, RateLimiter};
use lazy_static::lazy_static;
use tracing::error;

use crate::localstore::{ColumnFamily, LocalStore};
use crate::{Error, ObjectId, Result};

lazy_static! {
    /// Caps how often a missing-proxy-hash hit is logged at `error` level.
    /// A backend serving a corrupted or half-imported tree can turn every
    /// lookup against it into a miss; without a cap that floods the log at
    /// the same rate as the request traffic causing it.
    static ref MISSING_PROXY_HASH_LOG_LIMITER: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    > = RateLimiter::direct(Quota::per_minute(NonZeroU32::new(10).unwrap()));
}

/// The `(path, revHash)` pair a proxy hash binds to an [ObjectId].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyHash {
    pub path: Vec<u8>,
    pub rev_hash: Vec<u8>,
}

impl ProxyHash {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.path.len() + self.rev_hash.len());
        buf.extend_from_slice(&(self.path.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.path);
        buf.extend_from_slice(&(self.rev_hash.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.rev_hash);
        buf
    }

    fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::MalformedObject("truncated proxy hash record".into()));
        }
        let path_len = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let rest = &bytes[4..];
        if rest.len() < path_len + 4 {
            return Err(Error::MalformedObject("truncated proxy hash record".into()));
        }
        let path = rest[..path_len].to_vec();
        let rest = &rest[path_len..];
        let rev_len = u32::from_be_bytes(rest[0..4].try_into().unwrap()) as usize;
        let rest = &rest[4..];
        if rest.len() != rev_len {
            return Err(Error::MalformedObject("truncated proxy hash record".into()));
        }
        Ok(Self {
            path,
            rev_hash: rest.to_vec(),
        })
    }
}

/// Deterministically derives the [ObjectId] a `(path, revHash)` pair binds
/// to, and the bytes that should be persisted for it. Pure: calling this
/// twice with the same inputs yields the same id.
pub fn prepare_to_store(path: &[u8], rev_hash: &[u8]) -> (ObjectId, Vec<u8>) {
    use sha1::{Digest, Sha1};
    let mut hasher = Sha1::new();
    hasher.update(b"proxyhash:");
    hasher.update(path);
    hasher.update(b"\0");
    hasher.update(rev_hash);
    let digest = hasher.finalize();
    let id = ObjectId::try_from(digest.as_slice())
        .expect("sha1 digest is always OBJECT_ID_LEN bytes");
    let serialized = ProxyHash {
        path: path.to_vec(),
        rev_hash: rev_hash.to_vec(),
    }
    .serialize();
    (id, serialized)
}

/// Writes a previously-`prepare_to_store`d record. Not atomic with any
/// other write the caller may be doing as part of the same logical
/// operation; callers that need atomicity should fold this into their own
/// [crate::localstore::BatchEntry] list instead.
pub async fn store(store: &dyn LocalStore, id: &ObjectId, serialized: Vec<u8>) -> Result<()> {
    store
        .put(ColumnFamily::ProxyHashes, id.as_bytes(), serialized)
        .await
}

/// Reads back the `(path, revHash)` pair for an [ObjectId]. A miss here is
/// a fatal invariant violation for the calling operation: every
/// path-addressed object that ever entered the system must have had its
/// proxy hash stored first.
pub async fn load(store: &dyn LocalStore, id: &ObjectId) -> Result<ProxyHash> {
    match store.get(ColumnFamily::ProxyHashes, id.as_bytes()).await? {
        Some(bytes) => ProxyHash::deserialize(&bytes),
        None => {
            if MISSING_PROXY_HASH_LOG_LIMITER.check().is_ok() {
                error!(object_id = %id, "missing proxy hash");
            }
            Err(Error::MissingProxyHash(id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localstore::MemoryLocalStore;

    #[test]
    fn prepare_to_store_is_deterministic() {
        let (id1, ser1) = prepare_to_store(b"src/lib.rs", b"deadbeef");
        let (id2, ser2) = prepare_to_store(b"src/lib.rs", b"deadbeef");
        assert_eq!(id1, id2);
        assert_eq!(ser1, ser2);
    }

    #[test]
    fn different_inputs_yield_different_ids() {
        let (id1, _) = prepare_to_store(b"a.txt", b"deadbeef");
        let (id2, _) = prepare_to_store(b"b.txt", b"deadbeef");
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn round_trips_through_store() {
        let backing = MemoryLocalStore::new();
        let (id, serialized) = prepare_to_store(b"a/b/c.txt", b"cafef00d");
        store(&backing, &id, serialized).await.unwrap();
        let loaded = load(&backing, &id).await.unwrap();
        assert_eq!(loaded.path, b"a/b/c.txt");
        assert_eq!(loaded.rev_hash, b"cafef00d");
    }

    #[tokio::test]
    async fn missing_load_is_an_error() {
        let backing = MemoryLocalStore::new();
        let id = ObjectId::try_from(vec![0u8; 20]).unwrap();
        assert!(load(&backing, &id).await.is_err());
    }

    #[tokio::test]
    async fn repeated_misses_still_all_return_missing_proxy_hash() {
        // The log-rate limiter gates the `error!` call only; every miss
        // must still surface the same error regardless of whether it got
        // logged.
        let backing = MemoryLocalStore::new();
        let id = ObjectId::try_from(vec![1u8; 20]).unwrap();
        for _ in 0..20 {
            let err = load(&backing, &id).await.unwrap_err();
            assert!(matches!(err, Error::MissingProxyHash(_)));
        }
    }
}
