use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("repository not found: '{0}'")]
    RepoNotFound(String),

    #[error("repository has unsupported layout version: '{0}'")]
    RepoBadVersion(String),

    #[error("manifest not found: '{0}'")]
    ManifestNotFound(String),

    #[error("bad manifest: {0}")]
    BadManifest(String),

    #[error("blob not found: '{0}'")]
    BlobNotFound(String),

    #[error("bad blob digest: '{0}'")]
    BadBlobDigest(String),

    #[error("upload not found: '{0}'")]
    UploadNotFound(String),

    #[error("chunk offset {offset} does not match upload size {size}")]
    BadUploadRange { offset: u64, size: u64 },

    /// Dedupe index lookup returned not-present. Internal to the placement
    /// path; never surfaced to clients.
    #[error("dedupe cache miss")]
    CacheMiss,

    #[error("dedupe cache error: {0}")]
    Cache(#[source] Box<redb::Error>),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redb::Error> for StoreError {
    fn from(value: redb::Error) -> Self {
        StoreError::Cache(Box::new(value))
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(value: redb::DatabaseError) -> Self {
        redb::Error::from(value).into()
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(value: redb::TransactionError) -> Self {
        redb::Error::from(value).into()
    }
}

impl From<redb::TableError> for StoreError {
    fn from(value: redb::TableError) -> Self {
        redb::Error::from(value).into()
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(value: redb::StorageError) -> Self {
        redb::Error::from(value).into()
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(value: redb::CommitError) -> Self {
        redb::Error::from(value).into()
    }
}
