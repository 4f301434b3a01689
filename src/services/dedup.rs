//! src/services/dedup.rs
//!
//! Content-addressed reuse of already stored objects.

use crate::{models::object::ObjectRecord, services::records::RecordStore};

#[derive(Clone)]
pub struct DeduplicationIndex {
    records: RecordStore,
}

impl DeduplicationIndex {
    pub fn new(records: RecordStore) -> Self {
        Self { records }
    }

    /// Find a completed, non-deleted object of `tenant_id` with the same
    /// content hash and size. Hashes are compared lower-case.
    ///
    /// Lookups never cross tenants, and an in-flight or failed upload of the
    /// same content does not count as a hit.
    pub async fn lookup(
        &self,
        tenant_id: &str,
        content_hash: &str,
        size_bytes: i64,
    ) -> Result<Option<ObjectRecord>, sqlx::Error> {
        let hash = content_hash.to_ascii_lowercase();
        let hit = self
            .records
            .find_completed_by_hash(tenant_id, &hash, size_bytes)
            .await?;
        if let Some(object) = &hit {
            tracing::debug!(
                tenant_id,
                object_id = %object.id,
                "dedup hit on {}",
                object.storage_key
            );
        }
        Ok(hit)
    }
}
