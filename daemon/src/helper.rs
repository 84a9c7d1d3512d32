//! Client for the privileged mount helper: a small, separately-privileged
//! process that actually calls `mount(2)`/`umount(2)` and holds onto the
//! live FUSE channel/lock/listener descriptors across a takeover. Only the
//! client side of that protocol is in scope here (the helper process's
//! own implementation is a separate, privileged binary); this type covers
//! every request the protocol defines, framed as length-prefixed JSON over a
//! `UnixStream`, with `SCM_RIGHTS` used for responses that hand back a file
//! descriptor — the same wire shape `vfsd_core::takeover` already uses for
//! the larger mount-handoff payload.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error talking to mount helper: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed helper response: {0}")]
    Protocol(String),
    #[error("mount helper reported an error: {0}")]
    Remote(String),
    #[error("helper task panicked")]
    Join,
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Serialize, Deserialize)]
enum Request {
    Mount { path: PathBuf, read_only: bool },
    Unmount { path: PathBuf },
    TakeoverShutdown { path: PathBuf },
    TakeoverStart { path: PathBuf, bind_mounts: Vec<PathBuf> },
    SetLogFile,
    SetDaemonTimeout { millis: u64 },
    Stop,
}

#[derive(Debug, Serialize, Deserialize)]
enum Response {
    Ok,
    OkWithFd,
    StopComplete { exit_code: i32 },
    Error(String),
}

fn write_frame(stream: &mut UnixStream, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| Error::Protocol("request too large".into()))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    Ok(body)
}

fn send_fd_request(stream: &mut UnixStream, request: &Request) -> Result<(Response, Option<OwnedFd>)> {
    let body = serde_json::to_vec(request).map_err(|e| Error::Protocol(e.to_string()))?;
    write_frame(stream, &body)?;

    let response_body = read_frame(stream)?;
    let response: Response = serde_json::from_slice(&response_body).map_err(|e| Error::Protocol(e.to_string()))?;
    let fd = if matches!(response, Response::OkWithFd) {
        Some(recv_fd(stream)?)
    } else {
        None
    };
    Ok((response, fd))
}

#[cfg(unix)]
fn recv_fd(stream: &UnixStream) -> Result<OwnedFd> {
    use std::io::IoSliceMut;
    use std::os::fd::{AsFd, FromRawFd};

    use nix::cmsg_space;
    use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};

    let mut dummy = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut dummy)];
    let mut cmsg_buffer = cmsg_space!([std::os::fd::RawFd; 1]);
    let msg = recvmsg::<()>(stream.as_fd().as_fd_raw(), &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty())
        .map_err(|e| Error::Protocol(format!("recvmsg failed: {e}")))?;

    for cmsg in msg.cmsgs().map_err(|e| Error::Protocol(e.to_string()))? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&raw) = fds.first() {
                // Safety: the kernel just handed us ownership of this
                // descriptor via SCM_RIGHTS.
                return Ok(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
    }
    Err(Error::Protocol("expected an fd, got none".into()))
}

trait AsFdRaw {
    fn as_fd_raw(&self) -> std::os::fd::RawFd;
}
impl AsFdRaw for std::os::fd::BorrowedFd<'_> {
    fn as_fd_raw(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.as_raw_fd()
    }
}

/// A connected client for one helper socket. Every call dispatches its
/// blocking socket I/O onto `spawn_blocking`, matching the pattern the
/// FUSE channel uses to bridge a synchronous transport into async code
/// (see [vfsd_core::fs::VfsdFs]).
pub struct HelperClient {
    stream: std::sync::Mutex<UnixStream>,
}

impl HelperClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)?;
        Ok(Self { stream: std::sync::Mutex::new(stream) })
    }

    fn call(&self, request: Request) -> Result<(Response, Option<OwnedFd>)> {
        let mut stream = self.stream.lock().expect("helper connection mutex poisoned");
        send_fd_request(&mut stream, &request)
    }

    /// Asks the helper to `mount(2)` the filesystem and hand back the
    /// kernel-side FUSE channel descriptor.
    pub async fn mount(self: std::sync::Arc<Self>, path: PathBuf, read_only: bool) -> Result<OwnedFd> {
        tokio::task::spawn_blocking(move || {
            let (response, fd) = self.call(Request::Mount { path, read_only })?;
            match (response, fd) {
                (Response::OkWithFd, Some(fd)) => Ok(fd),
                (Response::Error(msg), _) => Err(Error::Remote(msg)),
                _ => Err(Error::Protocol("mount did not return a file descriptor".into())),
            }
        })
        .await
        .map_err(|_| Error::Join)?
    }

    pub async fn unmount(self: std::sync::Arc<Self>, path: PathBuf) -> Result<()> {
        tokio::task::spawn_blocking(move || match self.call(Request::Unmount { path })?.0 {
            Response::Ok => Ok(()),
            Response::Error(msg) => Err(Error::Remote(msg)),
            _ => Err(Error::Protocol("unexpected response to unmount".into())),
        })
        .await
        .map_err(|_| Error::Join)?
    }

    pub async fn takeover_shutdown(self: std::sync::Arc<Self>, path: PathBuf) -> Result<()> {
        tokio::task::spawn_blocking(move || match self.call(Request::TakeoverShutdown { path })?.0 {
            Response::Ok => Ok(()),
            Response::Error(msg) => Err(Error::Remote(msg)),
            _ => Err(Error::Protocol("unexpected response to takeoverShutdown".into())),
        })
        .await
        .map_err(|_| Error::Join)?
    }

    pub async fn takeover_start(self: std::sync::Arc<Self>, path: PathBuf, bind_mounts: Vec<PathBuf>) -> Result<OwnedFd> {
        tokio::task::spawn_blocking(move || {
            let (response, fd) = self.call(Request::TakeoverStart { path, bind_mounts })?;
            match (response, fd) {
                (Response::OkWithFd, Some(fd)) => Ok(fd),
                (Response::Error(msg), _) => Err(Error::Remote(msg)),
                _ => Err(Error::Protocol("takeoverStart did not return a file descriptor".into())),
            }
        })
        .await
        .map_err(|_| Error::Join)?
    }

    pub async fn set_log_file(self: std::sync::Arc<Self>) -> Result<()> {
        tokio::task::spawn_blocking(move || match self.call(Request::SetLogFile)?.0 {
            Response::Ok => Ok(()),
            Response::Error(msg) => Err(Error::Remote(msg)),
            _ => Err(Error::Protocol("unexpected response to setLogFile".into())),
        })
        .await
        .map_err(|_| Error::Join)?
    }

    pub async fn set_daemon_timeout(self: std::sync::Arc<Self>, millis: u64) -> Result<()> {
        tokio::task::spawn_blocking(move || match self.call(Request::SetDaemonTimeout { millis })?.0 {
            Response::Ok => Ok(()),
            Response::Error(msg) => Err(Error::Remote(msg)),
            _ => Err(Error::Protocol("unexpected response to setDaemonTimeout".into())),
        })
        .await
        .map_err(|_| Error::Join)?
    }

    pub async fn stop(self: std::sync::Arc<Self>) -> Result<i32> {
        tokio::task::spawn_blocking(move || match self.call(Request::Stop)?.0 {
            Response::StopComplete { exit_code } => Ok(exit_code),
            Response::Error(msg) => Err(Error::Remote(msg)),
            _ => Err(Error::Protocol("unexpected response to stop".into())),
        })
        .await
        .map_err(|_| Error::Join)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fake helper that speaks just enough of the protocol to exercise
    /// the client: answers `Unmount` with `Ok`, and `Mount` with `OkWithFd`
    /// carrying a `/dev/null` descriptor.
    fn spawn_fake_helper(listener: UnixStream) {
        std::thread::spawn(move || {
            let mut stream = listener;
            let body = read_frame(&mut stream).unwrap();
            let request: Request = serde_json::from_slice(&body).unwrap();
            match request {
                Request::Unmount { .. } => {
                    let resp = serde_json::to_vec(&Response::Ok).unwrap();
                    write_frame(&mut stream, &resp).unwrap();
                }
                Request::Mount { .. } => {
                    let resp = serde_json::to_vec(&Response::OkWithFd).unwrap();
                    write_frame(&mut stream, &resp).unwrap();
                    send_fd(&stream);
                }
                _ => {
                    let resp = serde_json::to_vec(&Response::Error("unsupported in test".into())).unwrap();
                    write_frame(&mut stream, &resp).unwrap();
                }
            }
        });
    }

    fn send_fd(stream: &UnixStream) {
        use std::io::IoSlice;
        use std::os::fd::AsFd;

        use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};

        let file = std::fs::File::open("/dev/null").unwrap();
        let raw = file.as_fd().as_fd_raw();
        let iov = [IoSlice::new(b"x")];
        let cmsg = [ControlMessage::ScmRights(&[raw])];
        sendmsg::<()>(stream.as_fd().as_fd_raw(), &iov, &cmsg, MsgFlags::empty(), None).unwrap();
    }

    #[tokio::test]
    async fn unmount_round_trips_ok() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        spawn_fake_helper(server_sock);
        let client = std::sync::Arc::new(HelperClient { stream: std::sync::Mutex::new(client_sock) });
        client.unmount(PathBuf::from("/mnt/repo")).await.unwrap();
    }

    #[tokio::test]
    async fn mount_returns_an_owned_fd() {
        let (client_sock, server_sock) = UnixStream::pair().unwrap();
        spawn_fake_helper(server_sock);
        let client = std::sync::Arc::new(HelperClient { stream: std::sync::Mutex::new(client_sock) });
        let fd = client.mount(PathBuf::from("/mnt/repo"), false).await.unwrap();
        assert!(std::os::fd::AsRawFd::as_raw_fd(&fd) >= 0);
    }
}
