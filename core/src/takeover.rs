//! Graceful handoff of a running mount from one process to its successor:
//! the predecessor serializes each mount's inode
//! high-water-mark, current root and journal position, then passes the
//! live FUSE channel, lock file and management-socket listener file
//! descriptors across a `UnixStream` using `SCM_RIGHTS` so the kernel
//! mount survives the exec. Nothing else in this crate hands off a live
//! kernel resource across a process boundary, so the wire format here is
//! new, built directly against `nix`'s socket-control-message API the same
//! way the rest of this crate leans on whatever crate covers a given
//! concern (see DESIGN.md).

use serde::{Deserialize, Serialize};

use crate::inodes::InodeNumber;
use crate::journal::SequenceNumber;
use crate::rootid::RootId;
use crate::{Error, Result};

/// Everything about one mount that must be reconstructed, not just handed
/// across as an open fd.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountState {
    pub mount_point_path: std::path::PathBuf,
    pub mount_generation: u64,
    pub current_root: RootId,
    pub inode_high_water_mark: InodeNumber,
    pub journal_sequence: SequenceNumber,
}

/// The full snapshot sent across on takeover: one [MountState] per
/// currently-registered mount, serialized as the message body of the
/// `SCM_RIGHTS` datagram.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct TakeoverPayload {
    pub mounts: Vec<MountState>,
}

impl TakeoverPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Generic(format!("encoding takeover payload: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Generic(format!("decoding takeover payload: {e}")))
    }
}

/// One named file descriptor carried alongside a [TakeoverPayload]. Order
/// matters: the successor must read them back in the same order they were
/// sent, since `SCM_RIGHTS` preserves the array's ordering but not any
/// label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TakeoverFdKind {
    FsChannel,
    LockFile,
    ManagementListener,
}

pub const TAKEOVER_FD_ORDER: [TakeoverFdKind; 3] = [
    TakeoverFdKind::FsChannel,
    TakeoverFdKind::LockFile,
    TakeoverFdKind::ManagementListener,
];

#[cfg(unix)]
mod unix_impl {
    use std::io::{IoSlice, IoSliceMut};
    use std::os::fd::{AsFd, OwnedFd};
    use std::os::unix::net::UnixStream;

    use nix::cmsg_space;
    use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

    use super::*;

    /// Sends `payload` plus its file descriptors, in [TAKEOVER_FD_ORDER],
    /// over `socket`. `fds` must supply exactly one fd per mount times the
    /// three kinds in [TAKEOVER_FD_ORDER], concatenated in that order
    /// (mount 0's three fds, then mount 1's three fds, ...).
    pub fn send_takeover(socket: &UnixStream, payload: &TakeoverPayload, fds: &[OwnedFd]) -> Result<()> {
        if fds.len() != payload.mounts.len() * TAKEOVER_FD_ORDER.len() {
            return Err(Error::Argument("fd count does not match mount count".into()));
        }
        let body = payload.to_bytes()?;
        let raw_fds: Vec<i32> = fds.iter().map(|fd| fd.as_fd().as_raw_fd_compat()).collect();
        let cmsg = [ControlMessage::ScmRights(&raw_fds)];
        let iov = [IoSlice::new(&body)];
        sendmsg::<()>(socket.as_fd().as_raw_fd_compat(), &iov, &cmsg, MsgFlags::empty(), None)
            .map_err(|e| Error::Generic(format!("sendmsg failed during takeover: {e}")))?;
        Ok(())
    }

    /// Receives a [TakeoverPayload] and its accompanying fds from `socket`.
    /// The returned fds are in the same flattened order `send_takeover` was
    /// given them.
    pub fn receive_takeover(socket: &UnixStream, max_body_len: usize) -> Result<(TakeoverPayload, Vec<OwnedFd>)> {
        let mut body_buf = vec![0u8; max_body_len];
        let mut iov = [IoSliceMut::new(&mut body_buf)];
        // Generous headroom: a handful of mounts times three fds each.
        let mut cmsg_buffer = cmsg_space!([std::os::fd::RawFd; 64]);
        let msg = recvmsg::<()>(
            socket.as_fd().as_raw_fd_compat(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::empty(),
        )
        .map_err(|e| Error::Generic(format!("recvmsg failed during takeover: {e}")))?;

        let mut fds = Vec::new();
        let cmsgs = msg.cmsgs().map_err(|e| Error::Generic(format!("malformed cmsg during takeover: {e}")))?;
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                for raw in received {
                    // Safety: the kernel just handed us ownership of these
                    // descriptors via SCM_RIGHTS; nothing else in this
                    // process has a handle on them yet.
                    fds.push(unsafe { OwnedFd::from_raw_fd_compat(raw) });
                }
            }
        }

        let body_len = msg.bytes;
        let payload = TakeoverPayload::from_bytes(&body_buf[..body_len])?;
        if fds.len() != payload.mounts.len() * TAKEOVER_FD_ORDER.len() {
            return Err(Error::Generic("fd count mismatch in received takeover message".into()));
        }
        Ok((payload, fds))
    }

    // nix 0.27's sendmsg/recvmsg want a bare RawFd; std's AsFd gives us a
    // BorrowedFd. Small shims keep the call sites above readable.
    trait AsRawFdCompat {
        fn as_raw_fd_compat(&self) -> std::os::fd::RawFd;
    }
    impl AsRawFdCompat for std::os::fd::BorrowedFd<'_> {
        fn as_raw_fd_compat(&self) -> std::os::fd::RawFd {
            use std::os::fd::AsRawFd;
            self.as_raw_fd()
        }
    }

    trait FromRawFdCompat {
        unsafe fn from_raw_fd_compat(raw: std::os::fd::RawFd) -> Self;
    }
    impl FromRawFdCompat for OwnedFd {
        unsafe fn from_raw_fd_compat(raw: std::os::fd::RawFd) -> Self {
            use std::os::fd::FromRawFd;
            OwnedFd::from_raw_fd(raw)
        }
    }
}

#[cfg(unix)]
pub use unix_impl::{receive_takeover, send_takeover};

#[cfg(not(unix))]
pub fn send_takeover(_socket: &std::net::TcpStream, _payload: &TakeoverPayload, _fds: &[()]) -> Result<()> {
    Err(Error::Unsupported)
}

#[cfg(not(unix))]
pub fn receive_takeover(_socket: &std::net::TcpStream, _max_body_len: usize) -> Result<(TakeoverPayload, Vec<()>)> {
    Err(Error::Unsupported)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;

    fn sample_fd() -> OwnedFd {
        use std::os::fd::FromRawFd;
        // /dev/null is always present and harmless to pass as a stand-in
        // fd in tests; production callers pass the real channel/lock/
        // listener descriptors.
        let file = std::fs::File::open("/dev/null").unwrap();
        let raw = {
            use std::os::fd::IntoRawFd;
            file.into_raw_fd()
        };
        unsafe { OwnedFd::from_raw_fd(raw) }
    }

    #[test]
    fn round_trips_payload_and_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let payload = TakeoverPayload {
            mounts: vec![MountState {
                mount_point_path: "/mnt/repo".into(),
                mount_generation: 7,
                current_root: crate::rootid::parse_root_id(b"aaaa"),
                inode_high_water_mark: 42,
                journal_sequence: 99,
            }],
        };
        let fds = vec![sample_fd(), sample_fd(), sample_fd()];

        let send_thread = std::thread::spawn(move || {
            send_takeover(&sender, &payload, &fds).unwrap();
        });

        let (received_payload, received_fds) = receive_takeover(&receiver, 1 << 16).unwrap();
        send_thread.join().unwrap();

        assert_eq!(received_payload.mounts.len(), 1);
        assert_eq!(received_payload.mounts[0].mount_generation, 7);
        assert_eq!(received_fds.len(), 3);
    }

    #[test]
    fn mismatched_fd_count_is_rejected() {
        let (sender, _receiver) = UnixStream::pair().unwrap();
        let payload = TakeoverPayload {
            mounts: vec![MountState {
                mount_point_path: "/mnt/repo".into(),
                mount_generation: 1,
                current_root: crate::rootid::parse_root_id(b"aaaa"),
                inode_high_water_mark: 1,
                journal_sequence: 0,
            }],
        };
        let err = send_takeover(&sender, &payload, &[sample_fd()]).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }
}
