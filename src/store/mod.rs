//! Object-store seam. The mirror only ever talks to the cache through
//! these traits; concrete backends (S3 and friends) live behind them.

use std::io;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub mod local;

/// Streaming object body.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: Option<SystemTime>,
    pub etag: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("operation canceled")]
    Canceled,
    #[error("presigned urls not supported by this store")]
    SignUnsupported,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Streaming writer for one object. Bytes become visible only after
/// `commit`; `cancel` discards everything written so far. Dropping a
/// writer without committing must behave like `cancel`.
#[async_trait]
pub trait StoreWriter: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn cancel(&mut self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError>;

    /// Opens the object for reading, returning its metadata alongside the
    /// body stream.
    async fn reader(&self, key: &str) -> Result<(ByteStream, ObjectMeta), StoreError>;

    async fn writer(&self, key: &str) -> Result<Box<dyn StoreWriter>, StoreError>;

    /// Presigned URL granting direct GET access to the object.
    fn sign_get(&self, key: &str, expires: Duration) -> Result<String, StoreError>;

    /// Presigned URL granting direct HEAD access to the object.
    fn sign_head(&self, key: &str, expires: Duration) -> Result<String, StoreError>;
}
