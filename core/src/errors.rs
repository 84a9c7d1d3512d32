use thiserror::Error;

/// Errors surfaced across the object store, import queue, inode model and
/// mount lifecycle. Filesystem-facing callers (core::fs) are responsible
/// for mapping these onto the errno the kernel expects; nothing in this
/// enum assumes a POSIX caller.
#[derive(Error, Debug)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object id: {0}")]
    InvalidObjectId(#[from] crate::digests::Error),

    #[error("malformed argument: {0}")]
    Argument(String),

    #[error("local store is corrupt: {0}")]
    StoreCorrupt(String),

    #[error("local store i/o error: {0}")]
    StoreIOError(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend timed out")]
    BackendTimeout,

    #[error("backend protocol error: {0}")]
    BackendProtocol(String),

    #[error("backend returned malformed data for {0}")]
    MalformedObject(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("missing proxy hash for object {0}")]
    MissingProxyHash(String),

    #[error("operation not supported on this platform")]
    Unsupported,

    #[error("already in progress")]
    AlreadyInProgress,

    #[error("mount generation changed, caller must rebaseline")]
    MountGenerationChanged,

    #[error("requested journal range has been truncated")]
    JournalTruncated,

    #[error("path is already mounted")]
    AlreadyMounted,

    #[error("path is not mounted")]
    NotMounted,

    #[error("a takeover is already in progress")]
    TakeoverInProgress,

    #[error("{0}")]
    Generic(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("rpc error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("rpc transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),
}

impl Error {
    /// True if retrying the same request against the same backend might
    /// succeed (transient network/transport failure), as opposed to a
    /// structural error (malformed data, not found) that will recur.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_) | Error::GrpcTransport(_) | Error::Io(_) | Error::BackendTimeout
        )
    }
}
