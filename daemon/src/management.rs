//! The `tonic` service implementing the abstract management surface:
//! every RPC here is a thin translation onto a `vfsd_core::Server` /
//! `vfsd_core::MountPoint` call, replacing the cross-language thrift
//! plumbing placed out of scope with an in-scope, typed equivalent.
//!
//! Checkout/diff/status all operate at the mount's root directory only,
//! matching [vfsd_core::mount::MountPoint::checkout]'s own current scope
//! (see that module's doc comment) — a full recursive walk is future work,
//! not something this surface adds on top of what the core actually does.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{instrument, warn};

use vfsd_core::mount::{CheckoutMode, Conflict, ConflictKind, DiffClass, DiffResult, LocalState};
use vfsd_core::objectstore::ObjectFetchContext;
use vfsd_core::pathresolve::{self, Resolved};
use vfsd_core::proxyhash::ProxyHash;
use vfsd_core::rootid::{parse_root_id, render_root_id};
use vfsd_core::server::Server;
use vfsd_core::tree::Tree;
use vfsd_core::Error as CoreError;

use crate::proto;

pub struct ManagementService {
    server: Arc<Server>,
}

impl ManagementService {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    fn mount_or_status(&self, path: &str) -> Result<Arc<vfsd_core::mount::MountPoint>, Status> {
        self.server
            .get_mount(&PathBuf::from(path))
            .ok_or_else(|| Status::not_found(format!("{path} is not mounted")))
    }
}

fn core_err_to_status(err: CoreError) -> Status {
    match err {
        CoreError::NotFound(m) => Status::not_found(m),
        CoreError::Argument(m) => Status::invalid_argument(m),
        CoreError::Conflict(m) => Status::aborted(m),
        CoreError::AlreadyMounted => Status::already_exists("path is already mounted"),
        CoreError::NotMounted => Status::not_found("path is not mounted"),
        CoreError::MountGenerationChanged => Status::failed_precondition("mount generation changed"),
        CoreError::JournalTruncated => Status::out_of_range("journal range truncated"),
        CoreError::Unsupported => Status::unimplemented("operation not supported on this platform"),
        other => Status::internal(other.to_string()),
    }
}

/// Computes each top-level name's [LocalState] by resolving it against the
/// live mount and comparing to the committed entry, if any. A name present
/// in `committed` but no longer resolvable at all is treated as
/// [LocalState::ExternallyRemoved] — the kernel deleted what the working
/// copy used to have.
async fn top_level_local_states(
    mount: &vfsd_core::mount::MountPoint,
    committed: &Tree,
) -> Result<HashMap<Vec<u8>, LocalState>, Status> {
    let mut states = HashMap::new();
    for entry in committed.entries() {
        let name = entry.name().to_vec();
        let state = match pathresolve::resolve(mount, &name).await {
            Ok(Resolved::Unmaterialized { .. }) => LocalState::Unmaterialized,
            Ok(Resolved::Materialized { inode, kind }) => {
                if kind.is_directory() {
                    LocalState::Materialized { matches_committed: true }
                } else {
                    let matches = pathresolve::materialized_file_matches(mount, inode, entry.id())
                        .await
                        .map_err(core_err_to_status)?;
                    LocalState::Materialized { matches_committed: matches }
                }
            }
            Err(CoreError::NotFound(_)) => LocalState::ExternallyRemoved,
            Err(e) => return Err(core_err_to_status(e)),
        };
        states.insert(name, state);
    }
    Ok(states)
}

/// The set of names visible in the working copy's root right now: every
/// committed name still resolvable, plus anything the overlay has added
/// that isn't in the committed tree.
async fn working_names(mount: &vfsd_core::mount::MountPoint, committed: &Tree) -> Result<Vec<Vec<u8>>, Status> {
    let mut names: HashSet<Vec<u8>> = HashSet::new();
    for entry in committed.entries() {
        if pathresolve::resolve(mount, entry.name()).await.is_ok() {
            names.insert(entry.name().to_vec());
        }
    }
    for overlay_entry in mount.overlay.read_dir(vfsd_core::inodes::ROOT_INODE).await.map_err(core_err_to_status)? {
        names.insert(overlay_entry.name.clone());
    }
    Ok(names.into_iter().collect())
}

fn conflict_kind_proto(kind: ConflictKind) -> i32 {
    match kind {
        ConflictKind::Modified => proto::ConflictKindProto::Modified as i32,
        ConflictKind::ExternallyRemoved => proto::ConflictKindProto::ExternallyRemoved as i32,
    }
}

fn conflict_proto(conflict: &Conflict) -> proto::ConflictProto {
    proto::ConflictProto {
        path: conflict.path.clone().into(),
        kind: conflict_kind_proto(conflict.kind),
    }
}

fn checkout_mode_from_proto(mode: i32) -> CheckoutMode {
    match proto::CheckoutModeProto::try_from(mode).unwrap_or(proto::CheckoutModeProto::Normal) {
        proto::CheckoutModeProto::DryRun => CheckoutMode::DryRun,
        proto::CheckoutModeProto::Force => CheckoutMode::Force,
        _ => CheckoutMode::Normal,
    }
}

fn diff_status_entries(diff: &DiffResult) -> Vec<proto::ScmStatusEntryProto> {
    let mut entries = Vec::new();
    let classes: [(DiffClass, &[Vec<u8>]); 5] = [
        (DiffClass::Modified, &diff.modified),
        (DiffClass::Added, &diff.added),
        (DiffClass::Removed, &diff.removed),
        (DiffClass::Ignored, &diff.ignored),
        (DiffClass::Unknown, &diff.unknown),
    ];
    for (class, paths) in classes {
        for path in paths {
            entries.push(proto::ScmStatusEntryProto {
                path: path.clone().into(),
                class: proto::ConflictKindProto::Unspecified as i32,
                status_class: class as u32,
            });
        }
    }
    entries
}

#[tonic::async_trait]
impl proto::management_service_server::ManagementService for ManagementService {
    #[instrument(skip(self, request), err)]
    async fn mount(&self, request: Request<proto::MountRequest>) -> Result<Response<proto::MountResponse>, Status> {
        let req = request.into_inner();
        let initial_root = parse_root_id(&req.initial_root_id);
        self.server
            .mount(PathBuf::from(req.mount_path), PathBuf::from(req.client_path), initial_root)
            .map_err(core_err_to_status)?;
        Ok(Response::new(proto::MountResponse {}))
    }

    #[instrument(skip(self, request), err)]
    async fn unmount(&self, request: Request<proto::UnmountRequest>) -> Result<Response<proto::UnmountResponse>, Status> {
        let req = request.into_inner();
        self.server.unmount(&PathBuf::from(req.mount_path)).map_err(core_err_to_status)?;
        Ok(Response::new(proto::UnmountResponse {}))
    }

    async fn list_mounts(&self, _request: Request<proto::ListMountsRequest>) -> Result<Response<proto::ListMountsResponse>, Status> {
        let mut mounts = Vec::new();
        for path in self.server.list_mounts() {
            if let Some(mount) = self.server.get_mount(&path) {
                mounts.push(proto::MountInfo {
                    mount_path: path.to_string_lossy().into_owned(),
                    mount_generation: mount.mount_generation(),
                    current_root_id: render_root_id(&mount.current_root()).into(),
                });
            }
        }
        Ok(Response::new(proto::ListMountsResponse { mounts }))
    }

    #[instrument(skip(self, request), err)]
    async fn get_current_journal_position(
        &self,
        request: Request<proto::GetCurrentJournalPositionRequest>,
    ) -> Result<Response<proto::JournalPositionProto>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        mount.journal.flush();
        Ok(Response::new(proto::JournalPositionProto {
            mount_generation: mount.mount_generation(),
            sequence: mount.journal.current_sequence(),
            snapshot_hash: render_root_id(&mount.current_root()).into(),
        }))
    }

    #[instrument(skip(self, request), err)]
    async fn get_files_changed_since(
        &self,
        request: Request<proto::GetFilesChangedSinceRequest>,
    ) -> Result<Response<proto::FileDeltaOrTruncated>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let from = req.from.ok_or_else(|| Status::invalid_argument("missing journal position"))?;
        vfsd_core::mount::check_mount_generation(&mount, from.mount_generation).map_err(core_err_to_status)?;

        match mount.journal.accumulate_range(from.sequence) {
            vfsd_core::journal::RangeResult::Truncated => Ok(Response::new(proto::FileDeltaOrTruncated {
                result: Some(proto::file_delta_or_truncated::Result::Truncated(true)),
            })),
            vfsd_core::journal::RangeResult::Summary(summary) => {
                let transitions = summary
                    .snapshot_transitions
                    .iter()
                    .map(|t| proto::SnapshotTransitionProto {
                        has_from_root: t.from_root.is_some(),
                        from_root: t.from_root.as_ref().map(render_root_id).unwrap_or_default().into(),
                        to_root: render_root_id(&t.to_root).into(),
                    })
                    .collect();
                Ok(Response::new(proto::FileDeltaOrTruncated {
                    result: Some(proto::file_delta_or_truncated::Result::Delta(proto::FileDelta {
                        created: summary.created.into_iter().map(Into::into).collect(),
                        changed: summary.changed.into_iter().map(Into::into).collect(),
                        unclean: summary.unclean.into_iter().map(Into::into).collect(),
                        transitions,
                        from_sequence: summary.from,
                        to_sequence: summary.to,
                    })),
                }))
            }
        }
    }

    #[instrument(skip(self, request), err)]
    async fn get_sha1(&self, request: Request<proto::GetSha1Request>) -> Result<Response<proto::GetSha1Response>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let ctx = ObjectFetchContext::mgmt();
        let mut results = Vec::with_capacity(req.paths.len());
        for path in &req.paths {
            let result = async {
                match pathresolve::resolve(&mount, path).await? {
                    Resolved::Unmaterialized { id, .. } => {
                        Ok(mount.object_store.get_blob_metadata(&id, &ctx).await?.sha1)
                    }
                    Resolved::Materialized { inode, .. } => {
                        use sha1::{Digest, Sha1};
                        let bytes = mount.overlay.read_file(inode).await?;
                        let digest = Sha1::digest(&bytes);
                        let sha1: [u8; 20] = digest.into();
                        Ok(sha1)
                    }
                }
            }
            .await;
            results.push(match result {
                Ok(sha1) => proto::Sha1Result {
                    result: Some(proto::sha1_result::Result::Sha1(sha1.to_vec().into())),
                },
                Err(e) => proto::Sha1Result {
                    result: Some(proto::sha1_result::Result::Error(format!("{e}"))),
                },
            });
        }
        Ok(Response::new(proto::GetSha1Response { results }))
    }

    #[instrument(skip(self, request), err)]
    async fn get_file_information(
        &self,
        request: Request<proto::GetFileInformationRequest>,
    ) -> Result<Response<proto::GetFileInformationResponse>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let ctx = ObjectFetchContext::mgmt();
        let mut results = Vec::with_capacity(req.paths.len());
        for path in &req.paths {
            let result: Result<proto::FileInfo, CoreError> = async {
                match pathresolve::resolve(&mount, path).await? {
                    Resolved::Unmaterialized { id, kind } => Ok(proto::FileInfo {
                        size: mount.object_store.get_blob_size(&id, &ctx).await.unwrap_or(0),
                        is_directory: kind.is_directory(),
                        materialized: false,
                    }),
                    Resolved::Materialized { inode, kind } => {
                        let size = if kind.is_directory() {
                            0
                        } else {
                            mount.overlay.stat_file(inode).await?.len()
                        };
                        Ok(proto::FileInfo { size, is_directory: kind.is_directory(), materialized: true })
                    }
                }
            }
            .await;
            results.push(match result {
                Ok(info) => proto::FileInformationResult {
                    result: Some(proto::file_information_result::Result::Info(info)),
                },
                Err(e) => proto::FileInformationResult {
                    result: Some(proto::file_information_result::Result::Error(format!("{e}"))),
                },
            });
        }
        Ok(Response::new(proto::GetFileInformationResponse { results }))
    }

    #[instrument(skip(self, request), err)]
    async fn check_out_revision(
        &self,
        request: Request<proto::CheckOutRevisionRequest>,
    ) -> Result<Response<proto::CheckOutRevisionResponse>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let target_root = parse_root_id(&req.root_id);
        let mode = checkout_mode_from_proto(req.mode);

        let committed = mount
            .object_store
            .get_root_tree(&mount.current_root(), &ObjectFetchContext::mgmt())
            .await
            .map_err(core_err_to_status)?;
        let states = top_level_local_states(&mount, &committed).await?;

        let conflicts = mount
            .checkout(&target_root, mode, |name| states.get(name).cloned().unwrap_or(LocalState::Absent))
            .await
            .map_err(core_err_to_status)?;

        Ok(Response::new(proto::CheckOutRevisionResponse {
            conflicts: conflicts.iter().map(conflict_proto).collect(),
        }))
    }

    #[instrument(skip(self, request), err)]
    async fn reset_parent_commits(
        &self,
        request: Request<proto::ResetParentCommitsRequest>,
    ) -> Result<Response<proto::ResetParentCommitsResponse>, Status> {
        // Resets what the mount considers "current" without touching the
        // working copy at all — a force dry-run checkout against the first
        // parent, discarding any conflicts it would have reported.
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let Some(first_parent) = req.parents.first() else {
            return Err(Status::invalid_argument("resetParentCommits requires at least one parent"));
        };
        let target_root = parse_root_id(first_parent);
        mount
            .checkout(&target_root, CheckoutMode::Force, |_| LocalState::Unmaterialized)
            .await
            .map_err(core_err_to_status)?;
        Ok(Response::new(proto::ResetParentCommitsResponse {}))
    }

    #[instrument(skip(self, request), err)]
    async fn get_scm_status(
        &self,
        request: Request<proto::GetScmStatusRequest>,
    ) -> Result<Response<proto::GetScmStatusResponse>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let target_root = parse_root_id(&req.root_id);
        let committed = mount
            .object_store
            .get_root_tree(&mount.current_root(), &ObjectFetchContext::mgmt())
            .await
            .map_err(core_err_to_status)?;
        let states = top_level_local_states(&mount, &committed).await?;
        let names = working_names(&mount, &committed).await?;

        let diff = mount
            .diff(&target_root, &names, |name| states.get(name).cloned().unwrap_or(LocalState::Absent), |_| false)
            .await
            .map_err(core_err_to_status)?;

        let entries = if req.list_ignored {
            diff_status_entries(&diff)
        } else {
            diff_status_entries(&diff).into_iter().filter(|e| e.status_class != DiffClass::Ignored as u32).collect()
        };
        Ok(Response::new(proto::GetScmStatusResponse { entries }))
    }

    #[instrument(skip(self, request), err)]
    async fn glob_files(&self, request: Request<proto::GlobFilesRequest>) -> Result<Response<proto::GlobFilesResponse>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let committed = mount
            .object_store
            .get_root_tree(&mount.current_root(), &ObjectFetchContext::mgmt())
            .await
            .map_err(core_err_to_status)?;
        let names = working_names(&mount, &committed).await?;

        let mut matching = Vec::new();
        let mut dropped = Vec::new();
        for pattern in &req.patterns {
            if pattern.contains('/') {
                // Only the mount's root directory is matched against today;
                // recursive globbing would need the same multi-level walk
                // checkout/diff don't yet do either.
                dropped.push(pattern.clone());
                warn!(pattern, "glob pattern spans directories, which this surface cannot match yet");
                continue;
            }
            for name in &names {
                if !req.include_dotfiles && name.starts_with(b".") {
                    continue;
                }
                if glob_matches_single_component(pattern.as_bytes(), name) {
                    matching.push(name.clone());
                }
            }
        }
        matching.sort();
        matching.dedup();
        Ok(Response::new(proto::GlobFilesResponse {
            matching_paths: matching.into_iter().map(Into::into).collect(),
            dropped_patterns: dropped,
        }))
    }

    type SubscribeJournalStream = ReceiverStream<Result<proto::JournalPositionProto, Status>>;

    #[instrument(skip(self, request), err)]
    async fn subscribe_journal(
        &self,
        request: Request<proto::SubscribeJournalRequest>,
    ) -> Result<Response<Self::SubscribeJournalStream>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let mount_generation = mount.mount_generation();

        let subscriber_tx = tx.clone();
        let subscriber_id = mount.journal.register_subscriber(Box::new(move |entry| {
            let position = proto::JournalPositionProto {
                mount_generation,
                sequence: entry.sequence,
                snapshot_hash: entry
                    .snapshot_transition
                    .as_ref()
                    .map(|t| render_root_id(&t.to_root))
                    .unwrap_or_default()
                    .into(),
            };
            let _ = subscriber_tx.try_send(Ok(position));
        }));

        tokio::spawn({
            let journal = mount.journal.clone();
            async move {
                tx.closed().await;
                journal.cancel_subscriber(subscriber_id);
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    #[instrument(skip(self, request), err)]
    async fn prefetch(&self, request: Request<proto::PrefetchRequest>) -> Result<Response<proto::PrefetchResponse>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        let proxy_hashes: Vec<ProxyHash> = req
            .proxy_hashes
            .into_iter()
            .map(|p| ProxyHash { path: p.path.to_vec(), rev_hash: p.rev_hash.to_vec() })
            .collect();
        mount.object_store.prefetch_blobs(&proxy_hashes, &ObjectFetchContext::prefetch()).await;
        Ok(Response::new(proto::PrefetchResponse {}))
    }

    #[instrument(skip(self, request), err)]
    async fn unload_inodes(
        &self,
        request: Request<proto::UnloadInodesRequest>,
    ) -> Result<Response<proto::UnloadInodesResponse>, Status> {
        let req = request.into_inner();
        let mount = self.mount_or_status(&req.mount_path)?;
        if !req.subtree.is_empty() {
            warn!("unloadInodes subtree scoping is not implemented; unloading the whole mount instead");
        }
        let cutoff = std::time::Instant::now()
            .checked_sub(std::time::Duration::from_secs(req.older_than_secs))
            .unwrap_or_else(std::time::Instant::now);
        let count = mount.inode_map.unload_older_than(cutoff);
        Ok(Response::new(proto::UnloadInodesResponse { count: count as u64 }))
    }
}

/// Matches a single path component against a pattern containing at most
/// `*` wildcards (no `?`, no character classes) — the common case for the
/// patterns a build tool passes in.
fn glob_matches_single_component(pattern: &[u8], name: &[u8]) -> bool {
    fn matches(pattern: &[u8], name: &[u8]) -> bool {
        match pattern.first() {
            None => name.is_empty(),
            Some(b'*') => {
                if matches(&pattern[1..], name) {
                    return true;
                }
                !name.is_empty() && matches(pattern, &name[1..])
            }
            Some(&c) => !name.is_empty() && name[0] == c && matches(&pattern[1..], &name[1..]),
        }
    }
    matches(pattern, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_star_matches_prefix_suffix() {
        assert!(glob_matches_single_component(b"*.rs", b"lib.rs"));
        assert!(!glob_matches_single_component(b"*.rs", b"lib.toml"));
        assert!(glob_matches_single_component(b"*", b"anything"));
        assert!(glob_matches_single_component(b"exact", b"exact"));
        assert!(!glob_matches_single_component(b"exact", b"exactish"));
    }
}
