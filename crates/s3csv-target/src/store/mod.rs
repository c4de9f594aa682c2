//! Chunked object storage
//!
//! [`ObjectStore`] is the multipart-upload capability the uploaders drive.
//! Implementations:
//!
//! - [`S3Store`]: AWS S3 and S3-compatible services
//! - [`MemoryStore`]: in-process store for tests, with fault injection
//! - [`RetryingStore`](crate::retry::RetryingStore): wraps another store with
//!   exponential back-off on transient errors

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// An open multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub key: String,
    pub upload_id: String,
}

/// One uploaded chunk: its 1-based number and the integrity tag the store returned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub number: u32,
    pub tag: String,
}

/// Multipart upload operations against a single bucket
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket (or namespace) objects are written to
    fn bucket(&self) -> &str;

    async fn begin_chunked_upload(&self, key: &str) -> StoreResult<UploadSession>;

    /// Upload one part and return its integrity tag
    async fn upload_chunk(&self, session: &UploadSession, part_number: u32, data: &[u8]) -> StoreResult<String>;

    /// Commit the parts, in order, as one object
    async fn complete(&self, session: &UploadSession, parts: &[Part]) -> StoreResult<()>;

    async fn abort(&self, session: &UploadSession) -> StoreResult<()>;

    /// Multipart uploads started under `prefix` and never completed or aborted
    async fn list_open_uploads(&self, prefix: &str) -> StoreResult<Vec<UploadSession>>;
}
