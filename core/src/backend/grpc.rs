use tokio_stream::StreamExt;
use tonic::async_trait;
use tonic::transport::Channel;

use super::{BatchItem, ObjectKey, RemoteBackend};
use crate::proto::import_service_client::ImportServiceClient;
use crate::proto::{self, ObjectKeyProto};
use crate::proxyhash::ProxyHash;
use crate::rootid::{self, RootId};
use crate::tree::{BlobMetadata, Tree};
use crate::{Error, ObjectId, Result};

/// [RemoteBackend] speaking the `ImportService` gRPC contract
/// (`core/proto/import_service.proto`) over a `tonic` channel. A thin
/// wrapper around a generated client, translating to/from the internal types at
/// the call boundary only.
#[derive(Clone)]
pub struct GrpcBackend {
    client: ImportServiceClient<Channel>,
}

impl GrpcBackend {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: ImportServiceClient::new(channel),
        }
    }

    fn proto_key(key: &ObjectKey) -> ObjectKeyProto {
        ObjectKeyProto {
            id: Some(proto::ObjectIdProto {
                value: key.id.as_bytes().to_vec().into(),
            }),
            proxy_hash: key.proxy_hash.as_ref().map(|p| proto::ProxyHashProto {
                path: p.path.clone().into(),
                rev_hash: p.rev_hash.clone().into(),
            }),
        }
    }
}

#[async_trait]
impl RemoteBackend for GrpcBackend {
    async fn get_tree_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<Tree>> {
        let mut client = self.client.clone();
        let req = proto::GetObjectsRequest {
            keys: keys.iter().map(Self::proto_key).collect(),
        };
        let mut out = Vec::with_capacity(keys.len());
        let stream = match client.get_trees(req).await {
            Ok(resp) => resp.into_inner(),
            Err(status) => {
                let err = Error::Grpc(status);
                return keys
                    .iter()
                    .map(|k| (k.id.clone(), Err(Error::BackendProtocol(err.to_string()))))
                    .collect();
            }
        };
        tokio::pin!(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(reply) => {
                    let Some(id_proto) = reply.id else { continue };
                    let Ok(id) = ObjectId::try_from(id_proto.value.to_vec()) else { continue };
                    let result = match reply.result {
                        Some(proto::tree_reply::Result::Tree(t)) => {
                            Tree::try_from(t).map_err(Error::from)
                        }
                        Some(proto::tree_reply::Result::Error(e)) => Err(Error::BackendProtocol(e)),
                        None => Err(Error::BackendProtocol("empty tree reply".into())),
                    };
                    out.push((id, result));
                }
                Err(status) => {
                    out.push((
                        ObjectId::try_from(vec![0u8; crate::OBJECT_ID_LEN]).unwrap(),
                        Err(Error::Grpc(status)),
                    ));
                }
            }
        }
        out
    }

    async fn get_blob_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<bytes::Bytes>> {
        let mut client = self.client.clone();
        let req = proto::GetObjectsRequest {
            keys: keys.iter().map(Self::proto_key).collect(),
        };
        use std::collections::HashMap;
        let mut buffers: HashMap<ObjectId, bytes::BytesMut> = HashMap::new();
        let mut errors: HashMap<ObjectId, Error> = HashMap::new();
        let mut finished: Vec<ObjectId> = Vec::new();

        let stream = match client.get_blobs(req).await {
            Ok(resp) => resp.into_inner(),
            Err(status) => {
                let err = Error::Grpc(status);
                return keys
                    .iter()
                    .map(|k| (k.id.clone(), Err(Error::BackendProtocol(err.to_string()))))
                    .collect();
            }
        };
        tokio::pin!(stream);
        while let Some(item) = stream.next().await {
            let Ok(chunk) = item else { continue };
            let Some(id_proto) = chunk.id else { continue };
            let Ok(id) = ObjectId::try_from(id_proto.value.to_vec()) else { continue };
            match chunk.result {
                Some(proto::blob_chunk::Result::Data(data)) => {
                    buffers.entry(id.clone()).or_default().extend_from_slice(&data);
                }
                Some(proto::blob_chunk::Result::Error(e)) => {
                    errors.insert(id.clone(), Error::BackendProtocol(e));
                }
                None => {}
            }
            if chunk.eof {
                finished.push(id);
            }
        }
        keys.iter()
            .map(|key| {
                let result = if let Some(err) = errors.remove(&key.id) {
                    Err(err)
                } else if let Some(buf) = buffers.remove(&key.id) {
                    Ok(buf.freeze())
                } else {
                    Err(Error::NotFound(key.id.to_string()))
                };
                (key.id.clone(), result)
            })
            .collect()
    }

    async fn get_blob_metadata_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<BlobMetadata>> {
        let mut client = self.client.clone();
        let req = proto::GetObjectsRequest {
            keys: keys.iter().map(Self::proto_key).collect(),
        };
        let mut out = Vec::with_capacity(keys.len());
        let stream = match client.get_blob_metadata(req).await {
            Ok(resp) => resp.into_inner(),
            Err(status) => {
                let err = Error::Grpc(status);
                return keys
                    .iter()
                    .map(|k| (k.id.clone(), Err(Error::BackendProtocol(err.to_string()))))
                    .collect();
            }
        };
        tokio::pin!(stream);
        while let Some(item) = stream.next().await {
            let Ok(reply) = item else { continue };
            let Some(id_proto) = reply.id else { continue };
            let Ok(id) = ObjectId::try_from(id_proto.value.to_vec()) else { continue };
            let result = match reply.result {
                Some(proto::blob_metadata_reply::Result::Metadata(m)) => {
                    BlobMetadata::try_from(m).map_err(Error::from)
                }
                Some(proto::blob_metadata_reply::Result::Error(e)) => Err(Error::BackendProtocol(e)),
                None => Err(Error::BackendProtocol("empty metadata reply".into())),
            };
            out.push((id, result));
        }
        out
    }

    async fn prefetch_blobs(&self, proxy_hashes: &[ProxyHash]) -> Result<()> {
        let mut client = self.client.clone();
        let req = proto::PrefetchRequest {
            proxy_hashes: proxy_hashes
                .iter()
                .map(|p| proto::ProxyHashProto {
                    path: p.path.clone().into(),
                    rev_hash: p.rev_hash.clone().into(),
                })
                .collect(),
        };
        client.prefetch(req).await?;
        Ok(())
    }

    async fn resolve_root(&self, root_id: &RootId) -> Result<ObjectId> {
        let mut client = self.client.clone();
        let req = proto::ResolveRootRequest {
            root_id: rootid::render_root_id(root_id).into(),
        };
        let resp = client.resolve_root(req).await?.into_inner();
        let tree_id = resp
            .tree_id
            .ok_or_else(|| Error::BackendProtocol("missing tree_id".into()))?;
        Ok(ObjectId::try_from(tree_id.value.to_vec())?)
    }

    async fn import_manifest_for_root(&self, root_id: &RootId, manifest_id: &ObjectId) -> Result<()> {
        let mut client = self.client.clone();
        let req = proto::ImportManifestRequest {
            root_id: rootid::render_root_id(root_id).into(),
            manifest_id: manifest_id.as_bytes().to_vec().into(),
        };
        client.import_manifest_for_root(req).await?;
        Ok(())
    }
}
