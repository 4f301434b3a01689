//! src/services/records.rs
//!
//! `RecordStore` provides SQLite persistence for upload sessions, object records and
//! part lists. Status changes are only ever written as conditional updates
//! that name the expected prior status; a caller learns whether it won the
//! race from the returned flag and never from re-reading the row.

use crate::models::{
    object::{ObjectRecord, ObjectStatus},
    part::{PartETag, PartRecord},
    session::{UploadSession, UploadStatus},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::sync::Arc;
use uuid::Uuid;

const SESSION_COLUMNS: &str = "id, tenant_id, object_id, multipart, part_size, total_parts, \
     completed_parts, backend_token, status, expires_at, created_at, updated_at";

const OBJECT_COLUMNS: &str = "id, tenant_id, filename, size_bytes, mime_type, content_hash, \
     bucket, storage_key, access_policy, status, etag, deleted_at, created_at, updated_at";

#[derive(Clone)]
pub struct RecordStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
}

impl RecordStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.db.begin().await
    }

    pub async fn insert_object(
        conn: &mut SqliteConnection,
        object: &ObjectRecord,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO objects (
                id, tenant_id, filename, size_bytes, mime_type, content_hash, bucket,
                storage_key, access_policy, status, etag, deleted_at, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(object.id)
        .bind(&object.tenant_id)
        .bind(&object.filename)
        .bind(object.size_bytes)
        .bind(&object.mime_type)
        .bind(&object.content_hash)
        .bind(&object.bucket)
        .bind(&object.storage_key)
        .bind(object.access_policy)
        .bind(object.status)
        .bind(&object.etag)
        .bind(object.deleted_at)
        .bind(object.created_at)
        .bind(object.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn insert_session(
        conn: &mut SqliteConnection,
        session: &UploadSession,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO upload_sessions (
                id, tenant_id, object_id, multipart, part_size, total_parts, completed_parts,
                backend_token, status, expires_at, created_at, updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(session.id)
        .bind(&session.tenant_id)
        .bind(session.object_id)
        .bind(session.multipart)
        .bind(session.part_size)
        .bind(session.total_parts)
        .bind(session.completed_parts)
        .bind(&session.backend_token)
        .bind(session.status)
        .bind(session.expires_at)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Persist the backend multipart token. Written once, right after the
    /// backend session is opened.
    pub async fn set_backend_token(&self, session_id: Uuid, token: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE upload_sessions SET backend_token = ?
             WHERE id = ? AND backend_token IS NULL",
        )
        .bind(token)
        .bind(session_id)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    pub async fn get_object(&self, id: Uuid) -> Result<Option<ObjectRecord>, sqlx::Error> {
        sqlx::query_as::<_, ObjectRecord>(&format!(
            "SELECT {} FROM objects WHERE id = ?",
            OBJECT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&*self.db)
        .await
    }

    /// Most recent completed, non-deleted object matching tenant, hash and size.
    pub async fn find_completed_by_hash(
        &self,
        tenant_id: &str,
        content_hash: &str,
        size_bytes: i64,
    ) -> Result<Option<ObjectRecord>, sqlx::Error> {
        sqlx::query_as::<_, ObjectRecord>(&format!(
            "SELECT {} FROM objects
             WHERE tenant_id = ? AND content_hash = ? AND size_bytes = ?
               AND status = ? AND deleted_at IS NULL
             ORDER BY created_at DESC LIMIT 1",
            OBJECT_COLUMNS
        ))
        .bind(tenant_id)
        .bind(content_hash)
        .bind(size_bytes)
        .bind(ObjectStatus::Completed)
        .fetch_optional(&*self.db)
        .await
    }

    /// Move a session from one of `from` to `to`. When `live_at` is given the
    /// session must also be unexpired at that instant. Returns whether this
    /// write won.
    pub async fn transition_session(
        conn: &mut SqliteConnection,
        id: Uuid,
        from: &[UploadStatus],
        to: UploadStatus,
        now: DateTime<Utc>,
        live_at: Option<DateTime<Utc>>,
    ) -> Result<bool, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE upload_sessions SET status = ");
        builder.push_bind(to);
        builder.push(", updated_at = ");
        builder.push_bind(now);
        if to == UploadStatus::Completed {
            builder.push(", completed_parts = total_parts");
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND status IN (");
        let mut statuses = builder.separated(", ");
        for status in from {
            statuses.push_bind(*status);
        }
        statuses.push_unseparated(")");
        if let Some(at) = live_at {
            builder.push(" AND expires_at > ");
            builder.push_bind(at);
        }

        let result = builder.build().execute(&mut *conn).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Move an object from one of `from` to `to`, optionally recording the
    /// backend etag and a content hash. Existing values are kept when `None`.
    pub async fn transition_object(
        conn: &mut SqliteConnection,
        id: Uuid,
        from: &[ObjectStatus],
        to: ObjectStatus,
        etag: Option<&str>,
        content_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE objects SET status = ");
        builder.push_bind(to);
        builder.push(", etag = COALESCE(");
        builder.push_bind(etag);
        builder.push(", etag), content_hash = COALESCE(");
        builder.push_bind(content_hash);
        builder.push(", content_hash), updated_at = ");
        builder.push_bind(now);
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND status IN (");
        let mut statuses = builder.separated(", ");
        for status in from {
            statuses.push_bind(*status);
        }
        statuses.push_unseparated(")");

        let result = builder.build().execute(&mut *conn).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Raise the received-part count for a live session identified by its
    /// backend token, moving `INIT` to `IN_PROGRESS`. Never lowers the count
    /// and never exceeds `total_parts`.
    pub async fn note_part_progress(
        &self,
        backend_token: &str,
        received: i32,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET completed_parts = MIN(MAX(completed_parts, ?), total_parts),
                 status = ?,
                 updated_at = ?
             WHERE backend_token = ? AND status IN (?, ?) AND expires_at > ?",
        )
        .bind(received)
        .bind(UploadStatus::InProgress)
        .bind(now)
        .bind(backend_token)
        .bind(UploadStatus::Init)
        .bind(UploadStatus::InProgress)
        .bind(now)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn insert_parts(
        conn: &mut SqliteConnection,
        session_id: Uuid,
        parts: &[PartETag],
        now: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        if parts.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT OR REPLACE INTO upload_parts (session_id, part_number, etag, uploaded_at) ",
        );
        builder.push_values(parts, |mut row, part| {
            row.push_bind(session_id)
                .push_bind(part.part_number)
                .push_bind(part.etag.clone())
                .push_bind(now);
        });
        builder.build().execute(&mut *conn).await?;
        Ok(())
    }

    pub async fn list_parts(&self, session_id: Uuid) -> Result<Vec<PartRecord>, sqlx::Error> {
        sqlx::query_as::<_, PartRecord>(
            "SELECT session_id, part_number, etag, uploaded_at
             FROM upload_parts WHERE session_id = ? ORDER BY part_number ASC",
        )
        .bind(session_id)
        .fetch_all(&*self.db)
        .await
    }

    /// Hard-delete a session with its parts, and the object row when it is
    /// in one of `object_statuses`. Returns the number of session rows removed.
    pub async fn delete_session(
        conn: &mut SqliteConnection,
        session_id: Uuid,
        object_id: Uuid,
        object_statuses: &[ObjectStatus],
    ) -> Result<u64, sqlx::Error> {
        sqlx::query("DELETE FROM upload_parts WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *conn)
            .await?;
        let removed = sqlx::query("DELETE FROM upload_sessions WHERE id = ?")
            .bind(session_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();

        if !object_statuses.is_empty() {
            let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM objects WHERE id = ");
            builder.push_bind(object_id);
            builder.push(" AND status IN (");
            let mut statuses = builder.separated(", ");
            for status in object_statuses {
                statuses.push_bind(*status);
            }
            statuses.push_unseparated(")");
            builder.build().execute(&mut *conn).await?;
        }
        Ok(removed)
    }

    /// Live sessions whose expiry has passed.
    pub async fn expired_live_sessions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions
             WHERE status IN (?, ?) AND expires_at <= ?
             ORDER BY expires_at ASC LIMIT ?",
            SESSION_COLUMNS
        ))
        .bind(UploadStatus::Init)
        .bind(UploadStatus::InProgress)
        .bind(now)
        .bind(limit)
        .fetch_all(&*self.db)
        .await
    }

    /// Terminal sessions whose last transition is older than `cutoff`.
    pub async fn terminal_sessions_before(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions
             WHERE status IN (?, ?, ?, ?) AND updated_at < ?
             ORDER BY updated_at ASC LIMIT ?",
            SESSION_COLUMNS
        ))
        .bind(UploadStatus::Completed)
        .bind(UploadStatus::Aborted)
        .bind(UploadStatus::Expired)
        .bind(UploadStatus::Failed)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&*self.db)
        .await
    }

    /// Session that admitted the object stored at `bucket`/`storage_key`.
    pub async fn session_for_location(
        &self,
        bucket: &str,
        storage_key: &str,
    ) -> Result<Option<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions
             WHERE object_id = (SELECT id FROM objects WHERE bucket = ? AND storage_key = ?)",
            SESSION_COLUMNS
        ))
        .bind(bucket)
        .bind(storage_key)
        .fetch_optional(&*self.db)
        .await
    }

    pub async fn sessions_in_status(
        &self,
        status: UploadStatus,
    ) -> Result<Vec<UploadSession>, sqlx::Error> {
        sqlx::query_as::<_, UploadSession>(&format!(
            "SELECT {} FROM upload_sessions WHERE status = ? ORDER BY updated_at ASC",
            SESSION_COLUMNS
        ))
        .bind(status)
        .fetch_all(&*self.db)
        .await
    }

    /// Set the soft-delete marker on a completed object. Returns whether
    /// this call set it.
    pub async fn soft_delete_object(
        conn: &mut SqliteConnection,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE objects SET deleted_at = ?, updated_at = ?
             WHERE id = ? AND status = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(ObjectStatus::Completed)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
