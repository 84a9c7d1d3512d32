//! The daemon binary's library half: the privileged-helper client, the
//! on-disk state-directory layout, and the `tonic` management surface that
//! exposes `vfsd_core::Server`/`vfsd_core::MountPoint` to callers. Split out
//! of `main.rs` so the RPC service implementations stay reachable from both
//! the binary and integration tests.

pub mod helper;
pub mod listener;
pub mod management;
pub mod statedir;

pub mod proto {
    #![allow(clippy::derive_partial_eq_without_eq)]
    tonic::include_proto!("vfsd.daemon.v1");
}
