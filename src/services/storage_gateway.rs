//! src/services/storage_gateway.rs
//!
//! The contract the ingestion core consumes from an object-storage backend:
//! upload/download grants, the backend side of chunked uploads, and the
//! delete/exists probes used by cleanup paths. The backend engine itself is
//! out of scope; `LocalStorageGateway` is the in-tree implementation.

use crate::models::{
    object::{ExpectedContent, ObjectLocation},
    part::PartETag,
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("supplied parts disagree with the backend: {0}")]
    PartMismatch(String),
    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),
    #[error("object `{0}` not found")]
    NotFound(String),
    #[error("grant rejected: {0}")]
    InvalidGrant(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// What the backend reports once a chunked upload has been assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedObject {
    pub etag: String,
    pub size_bytes: i64,
}

/// What the backend holds at a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub size_bytes: i64,
    /// Lower-case hex SHA-256, when the backend tracks one.
    pub sha256: Option<String>,
}

/// Backing object store as seen by the upload session manager.
///
/// Every method may suspend on network I/O. Implementations must be cheap to
/// share (`Arc<dyn StorageGateway>`).
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Single-part upload grant valid for `ttl`. The grant only admits a body
    /// of exactly `expected.size_bytes`, hashing to `expected.sha256` when set.
    async fn issue_upload_grant(
        &self,
        location: &ObjectLocation,
        expected: &ExpectedContent,
        ttl: Duration,
    ) -> StorageResult<String>;

    /// Open a backend-side multipart session and return its token.
    async fn begin_chunked_upload(&self, location: &ObjectLocation) -> StorageResult<String>;

    /// Grant for one chunk of an open multipart session.
    async fn issue_part_grant(
        &self,
        location: &ObjectLocation,
        token: &str,
        part_number: i32,
        ttl: Duration,
    ) -> StorageResult<String>;

    /// Grants for `part_numbers`, returned in the same order.
    ///
    /// Issuance fans out with up to `grant_fanout()` calls in flight so the
    /// latency of N grants stays close to the latency of one.
    async fn issue_chunk_grants(
        &self,
        location: &ObjectLocation,
        token: &str,
        part_numbers: &[i32],
        ttl: Duration,
    ) -> StorageResult<Vec<String>> {
        futures::stream::iter(part_numbers.iter().copied())
            .map(|part_number| self.issue_part_grant(location, token, part_number, ttl))
            .buffered(self.grant_fanout().max(1))
            .try_collect()
            .await
    }

    /// Upper bound on concurrent grant issuances.
    fn grant_fanout(&self) -> usize {
        16
    }

    /// Assemble the uploaded chunks into the final object.
    ///
    /// Fails with `PartMismatch` when `parts` disagree with what the backend
    /// received and `IntegrityFailure` when the assembled bytes are not
    /// `expected.size_bytes` long or do not hash to `expected.sha256`.
    async fn finish_chunked_upload(
        &self,
        location: &ObjectLocation,
        token: &str,
        parts: &[PartETag],
        expected: &ExpectedContent,
    ) -> StorageResult<FinishedObject>;

    /// Drop a multipart session and whatever chunks it holds.
    async fn cancel_chunked_upload(&self, location: &ObjectLocation, token: &str)
    -> StorageResult<()>;

    /// Delete a stored object. Deleting a missing object succeeds.
    async fn delete_object(&self, location: &ObjectLocation) -> StorageResult<()>;

    async fn object_exists(&self, location: &ObjectLocation) -> StorageResult<bool>;

    /// Size and digest of a stored object, `None` when nothing is stored.
    async fn stat_object(&self, location: &ObjectLocation) -> StorageResult<Option<StoredObject>>;

    /// Time-limited read grant for private objects.
    async fn issue_download_grant(
        &self,
        location: &ObjectLocation,
        ttl: Duration,
    ) -> StorageResult<String>;

    /// Permanent unsigned URL for public objects.
    fn public_url(&self, location: &ObjectLocation) -> String;
}
