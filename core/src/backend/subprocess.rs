//! [RemoteBackend] implementation that talks to a long-lived helper
//! subprocess over a framed binary protocol on its stdio pipes. Each
//! frame: big-endian `(request_id, command, flags, data_length)` followed
//! by `data_length` bytes of payload. Errors are signalled by setting the
//! `ERROR` flag and replacing the payload with
//! `(error_type_len, error_type, message_len, message)`.
//!
//! A single subprocess handles one request at a time (sync request/reply);
//! the importer pool confines one `SubprocessBackend` to one worker thread
//! so this never needs cross-task coordination beyond the internal mutex.

use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command as TokioCommand};
use tokio::sync::Mutex;
use tonic::async_trait;

use super::{BatchItem, ObjectKey, RemoteBackend};
use crate::proxyhash::ProxyHash;
use crate::rootid::RootId;
use crate::tree::{BlobMetadata, Tree};
use crate::{Error, ObjectId, Result};

const FLAG_ERROR: u32 = 0x1;
const PROTOCOL_VERSION: u32 = 1;

#[repr(u32)]
#[derive(Clone, Copy)]
enum FrameCommand {
    Handshake = 0,
    GetTrees = 1,
    GetBlobs = 2,
    GetBlobMetadata = 3,
    Prefetch = 4,
    ResolveRoot = 5,
    ImportManifest = 6,
}

#[derive(Serialize, Deserialize)]
struct HandshakeRequest {
    protocol_version: u32,
    capability_flags: u32,
}

#[derive(Serialize, Deserialize)]
struct HandshakeResponse {
    protocol_version: u32,
    capability_flags: u32,
}

#[derive(Serialize, Deserialize)]
struct WireKey {
    id: Vec<u8>,
    path: Option<Vec<u8>>,
    rev_hash: Option<Vec<u8>>,
}

impl From<&ObjectKey> for WireKey {
    fn from(key: &ObjectKey) -> Self {
        Self {
            id: key.id.as_bytes().to_vec(),
            path: key.proxy_hash.as_ref().map(|p| p.path.clone()),
            rev_hash: key.proxy_hash.as_ref().map(|p| p.rev_hash.clone()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct WireTreeReply {
    id: Vec<u8>,
    entries: Option<Vec<(Vec<u8>, Vec<u8>, u8)>>,
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireBlobReply {
    id: Vec<u8>,
    data: Option<Vec<u8>>,
    error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct WireMetadataReply {
    id: Vec<u8>,
    sha1: Option<Vec<u8>>,
    size: Option<u64>,
    error: Option<String>,
}

struct Connection {
    child: Child,
    next_request_id: u32,
}

/// Helper-subprocess [RemoteBackend]. Spawns (or respawns, on protocol
/// error) a child process and speaks the framed protocol described above
/// over its stdin/stdout.
pub struct SubprocessBackend {
    command: std::ffi::OsString,
    args: Vec<std::ffi::OsString>,
    conn: Mutex<Option<Connection>>,
}

impl SubprocessBackend {
    pub fn new(command: impl Into<std::ffi::OsString>, args: Vec<std::ffi::OsString>) -> Self {
        Self {
            command: command.into(),
            args,
            conn: Mutex::new(None),
        }
    }

    async fn ensure_connected<'a>(
        &self,
        guard: &'a mut Option<Connection>,
    ) -> Result<&'a mut Connection> {
        if guard.is_none() {
            let mut child = TokioCommand::new(&self.command)
                .args(&self.args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            let mut conn = Connection {
                next_request_id: 0,
                child,
            };
            Self::handshake(&mut conn).await?;
            *guard = Some(conn);
        }
        Ok(guard.as_mut().unwrap())
    }

    async fn handshake(conn: &mut Connection) -> Result<()> {
        let request = HandshakeRequest {
            protocol_version: PROTOCOL_VERSION,
            capability_flags: 0,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| Error::BackendProtocol(e.to_string()))?;
        write_frame(conn, FrameCommand::Handshake as u32, &payload).await?;
        let (flags, data) = read_frame(conn).await?;
        if flags & FLAG_ERROR != 0 {
            return Err(Error::BackendProtocol(String::from_utf8_lossy(&data).into_owned()));
        }
        let response: HandshakeResponse =
            serde_json::from_slice(&data).map_err(|e| Error::BackendProtocol(e.to_string()))?;
        if response.protocol_version != PROTOCOL_VERSION {
            return Err(Error::BackendProtocol(format!(
                "helper speaks protocol version {}, expected {}",
                response.protocol_version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }

    /// Drops the current connection so the next call respawns the helper.
    /// Called on protocol errors per the "drop and respawn" design note.
    async fn reset(&self) {
        *self.conn.lock().await = None;
    }

    async fn roundtrip(&self, command: FrameCommand, payload: &[u8]) -> Result<Vec<u8>> {
        let mut guard = self.conn.lock().await;
        let conn = self.ensure_connected(&mut guard).await?;
        write_frame(conn, command as u32, payload).await?;
        let (flags, data) = read_frame(conn).await?;
        if flags & FLAG_ERROR != 0 {
            drop(guard);
            self.reset().await;
            return Err(Error::BackendProtocol(String::from_utf8_lossy(&data).into_owned()));
        }
        Ok(data)
    }
}

async fn write_frame(conn: &mut Connection, command: u32, payload: &[u8]) -> Result<()> {
    let request_id = conn.next_request_id;
    conn.next_request_id = conn.next_request_id.wrapping_add(1);
    let mut header = Vec::with_capacity(16);
    header.extend_from_slice(&request_id.to_be_bytes());
    header.extend_from_slice(&command.to_be_bytes());
    header.extend_from_slice(&0u32.to_be_bytes());
    header.extend_from_slice(&(payload.len() as u32).to_be_bytes());

    let stdin = conn
        .child
        .stdin
        .as_mut()
        .ok_or_else(|| Error::BackendProtocol("helper stdin closed".into()))?;
    stdin.write_all(&header).await?;
    stdin.write_all(payload).await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_frame(conn: &mut Connection) -> Result<(u32, Vec<u8>)> {
    let stdout = conn.child.stdout.as_mut().ok_or_else(|| Error::BackendProtocol("helper stdout closed".into()))?;
    let mut header = [0u8; 16];
    stdout.read_exact(&mut header).await?;
    let flags = u32::from_be_bytes(header[8..12].try_into().unwrap());
    let data_length = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;
    let mut data = vec![0u8; data_length];
    stdout.read_exact(&mut data).await?;
    Ok((flags, data))
}

#[async_trait]
impl RemoteBackend for SubprocessBackend {
    async fn get_tree_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<Tree>> {
        let wire: Vec<WireKey> = keys.iter().map(WireKey::from).collect();
        let payload = match serde_json::to_vec(&wire) {
            Ok(p) => p,
            Err(e) => {
                return keys.iter().map(|k| (k.id.clone(), Err(Error::BackendProtocol(e.to_string())))).collect()
            }
        };
        let data = match self.roundtrip(FrameCommand::GetTrees, &payload).await {
            Ok(d) => d,
            Err(e) => return keys.iter().map(|k| (k.id.clone(), Err(Error::BackendProtocol(e.to_string())))).collect(),
        };
        let replies: Vec<WireTreeReply> = serde_json::from_slice(&data).unwrap_or_default();
        replies
            .into_iter()
            .filter_map(|reply| {
                let id = ObjectId::try_from(reply.id).ok()?;
                let result = if let Some(err) = reply.error {
                    Err(Error::BackendProtocol(err))
                } else {
                    let entries = reply.entries.unwrap_or_default();
                    decode_tree(entries)
                };
                Some((id, result))
            })
            .collect()
    }

    async fn get_blob_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<bytes::Bytes>> {
        let wire: Vec<WireKey> = keys.iter().map(WireKey::from).collect();
        let payload = match serde_json::to_vec(&wire) {
            Ok(p) => p,
            Err(e) => {
                return keys.iter().map(|k| (k.id.clone(), Err(Error::BackendProtocol(e.to_string())))).collect()
            }
        };
        let data = match self.roundtrip(FrameCommand::GetBlobs, &payload).await {
            Ok(d) => d,
            Err(e) => return keys.iter().map(|k| (k.id.clone(), Err(Error::BackendProtocol(e.to_string())))).collect(),
        };
        let replies: Vec<WireBlobReply> = serde_json::from_slice(&data).unwrap_or_default();
        replies
            .into_iter()
            .filter_map(|reply| {
                let id = ObjectId::try_from(reply.id).ok()?;
                let result = match (reply.data, reply.error) {
                    (_, Some(err)) => Err(Error::BackendProtocol(err)),
                    (Some(data), None) => Ok(bytes::Bytes::from(data)),
                    (None, None) => Err(Error::BackendProtocol("empty blob reply".into())),
                };
                Some((id, result))
            })
            .collect()
    }

    async fn get_blob_metadata_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<BlobMetadata>> {
        let wire: Vec<WireKey> = keys.iter().map(WireKey::from).collect();
        let payload = match serde_json::to_vec(&wire) {
            Ok(p) => p,
            Err(e) => {
                return keys.iter().map(|k| (k.id.clone(), Err(Error::BackendProtocol(e.to_string())))).collect()
            }
        };
        let data = match self.roundtrip(FrameCommand::GetBlobMetadata, &payload).await {
            Ok(d) => d,
            Err(e) => return keys.iter().map(|k| (k.id.clone(), Err(Error::BackendProtocol(e.to_string())))).collect(),
        };
        let replies: Vec<WireMetadataReply> = serde_json::from_slice(&data).unwrap_or_default();
        replies
            .into_iter()
            .filter_map(|reply| {
                let id = ObjectId::try_from(reply.id).ok()?;
                let result = match (reply.sha1, reply.size, reply.error) {
                    (_, _, Some(err)) => Err(Error::BackendProtocol(err)),
                    (Some(sha1), Some(size), None) => {
                        let sha1: Result<[u8; 20]> = sha1
                            .as_slice()
                            .try_into()
                            .map_err(|_| Error::BackendProtocol("sha1 must be 20 bytes".into()));
                        sha1.map(|sha1| BlobMetadata { sha1, size })
                    }
                    _ => Err(Error::BackendProtocol("incomplete metadata reply".into())),
                };
                Some((id, result))
            })
            .collect()
    }

    async fn prefetch_blobs(&self, proxy_hashes: &[ProxyHash]) -> Result<()> {
        let wire: Vec<(Vec<u8>, Vec<u8>)> = proxy_hashes
            .iter()
            .map(|p| (p.path.clone(), p.rev_hash.clone()))
            .collect();
        let payload = serde_json::to_vec(&wire).map_err(|e| Error::BackendProtocol(e.to_string()))?;
        self.roundtrip(FrameCommand::Prefetch, &payload).await?;
        Ok(())
    }

    async fn resolve_root(&self, root_id: &RootId) -> Result<ObjectId> {
        let payload = crate::rootid::render_root_id(root_id);
        let data = self.roundtrip(FrameCommand::ResolveRoot, &payload).await?;
        ObjectId::try_from(data).map_err(Error::from)
    }

    async fn import_manifest_for_root(&self, root_id: &RootId, manifest_id: &ObjectId) -> Result<()> {
        let mut payload = crate::rootid::render_root_id(root_id);
        payload.extend_from_slice(manifest_id.as_bytes());
        self.roundtrip(FrameCommand::ImportManifest, &payload).await?;
        Ok(())
    }
}

fn decode_tree(entries: Vec<(Vec<u8>, Vec<u8>, u8)>) -> Result<Tree> {
    use crate::tree::{Entry, EntryKind};
    let entries = entries
        .into_iter()
        .map(|(name, id, kind)| {
            let kind = match kind {
                0 => EntryKind::RegularFile,
                1 => EntryKind::ExecutableFile,
                2 => EntryKind::Symlink,
                3 => EntryKind::Directory,
                _ => return Err(Error::BackendProtocol("invalid entry kind".into())),
            };
            Entry::new(name, ObjectId::try_from(id)?, kind)
        })
        .collect::<Result<Vec<_>>>()?;
    Tree::from_entries(entries)
}
