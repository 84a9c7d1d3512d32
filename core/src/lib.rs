//! The object-resolution and fetch pipeline sitting between filesystem
//! dispatchers and a remote source-control backend: the inode model, the
//! tiered object store, the priority-scheduled import queue, and the mount
//! lifecycle that ties them together.

mod digests;
mod errors;

pub mod backend;
pub mod cache;
pub mod importqueue;
pub mod inodes;
pub mod journal;
pub mod localstore;
pub mod mount;
pub mod objectstore;
pub mod pathresolve;
pub mod proxyhash;
pub mod rootid;
pub mod server;
pub mod takeover;
pub mod tree;

pub mod grpc_channel;

#[cfg(feature = "fuse")]
pub mod fs;

pub mod proto {
    #![allow(clippy::derive_partial_eq_without_eq)]
    tonic::include_proto!("vfsd.core.v1");
}

#[cfg(test)]
pub mod fixtures;

pub use digests::{ObjectId, OBJECT_ID_LEN};
pub use errors::Error;

pub type Result<T> = std::result::Result<T, Error>;
