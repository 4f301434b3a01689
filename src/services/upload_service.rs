//! src/services/upload_service.rs
//!
//! `UploadSessionManager` owns the upload session state machine and
//! coordinates admission, grant issuance, completion, abort and status
//! projection on top of the record store, quota ledger, dedup index and
//! storage gateway.
//!
//! ```text
//! INIT ─┬─> IN_PROGRESS ─┬─> COMPLETED                 (single-part)
//!       │                └─> PROCESSING ─┬─> COMPLETED (multipart, finalizer)
//!       │                                └─> FAILED
//!       └─ any non-terminal ─> ABORTED | EXPIRED
//! ```
//!
//! Every transition is a conditional update naming the expected prior
//! status, and for client-driven transitions also requiring the session to
//! be unexpired at the time of the write.

use crate::{
    config::IngestConfig,
    models::{
        object::{AccessPolicy, ObjectLocation, ObjectRecord, ObjectStatus},
        part::PartETag,
        session::{UploadSession, UploadStatus, total_parts_for},
        upload::{
            CompleteUploadRequest, CompleteUploadResponse, DedupHit, InitUploadRequest,
            InitUploadResponse, PartGrant, RefreshUploadResponse, UploadStatusView, UploadTicket,
        },
    },
    services::{
        dedup::DeduplicationIndex,
        events::{AuditAction, AuditEntry, AuditSink, EventSink, UploadEvent},
        finalizer::{FinalizeTask, FinalizerHandle},
        quota_ledger::{QuotaError, QuotaLedger},
        records::RecordStore,
        storage_gateway::{StorageError, StorageGateway},
    },
};
use chrono::{DateTime, Utc};
use std::{path::Path, sync::Arc, time::Duration};
use thiserror::Error;
use uuid::Uuid;

/// Backend limit on the number of chunks in one multipart upload.
pub const MAX_PARTS: i64 = 10_000;

const LIVE: [UploadStatus; 2] = [UploadStatus::Init, UploadStatus::InProgress];

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("quota exceeded for tenant `{tenant_id}`: {reason}")]
    QuotaExceeded { tenant_id: String, reason: String },
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("object `{0}` not found")]
    ObjectNotFound(Uuid),
    #[error("upload session `{0}` has expired")]
    SessionExpired(Uuid),
    #[error("upload session `{id}` is {}", .status.as_str())]
    SessionTerminalConflict { id: Uuid, status: UploadStatus },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("integrity check failed: {0}")]
    IntegrityFailure(String),
    #[error("cleanup incomplete: {0}")]
    PartialCleanupFailure(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    /// Stable machine-readable kind used in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::SessionNotFound(_) => "SESSION_NOT_FOUND",
            Self::ObjectNotFound(_) => "OBJECT_NOT_FOUND",
            Self::SessionExpired(_) => "SESSION_EXPIRED",
            Self::SessionTerminalConflict { .. } => "SESSION_TERMINAL_CONFLICT",
            Self::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            Self::IntegrityFailure(_) => "INTEGRITY_FAILURE",
            Self::PartialCleanupFailure(_) => "PARTIAL_CLEANUP_FAILURE",
            Self::Database(_) => "INTERNAL",
        }
    }
}

impl From<StorageError> for UploadError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::IntegrityFailure(msg) => Self::IntegrityFailure(msg),
            StorageError::PartMismatch(msg) | StorageError::InvalidGrant(msg) => {
                Self::Validation(msg)
            }
            StorageError::NotFound(key) => Self::Validation(format!("object `{key}` not found")),
            StorageError::Unavailable(msg) => Self::StorageUnavailable(msg),
            StorageError::Io(err) => Self::StorageUnavailable(err.to_string()),
        }
    }
}

impl From<QuotaError> for UploadError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded { tenant_id, reason } => Self::QuotaExceeded { tenant_id, reason },
            QuotaError::InvalidLimits(msg) => Self::Validation(msg),
            QuotaError::Database(err) => Self::Database(err),
        }
    }
}

/// Shape of an admitted upload, derived from the request before any write.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Admission {
    content_hash: Option<String>,
    multipart: bool,
    part_size: i64,
    total_parts: i32,
}

pub struct UploadSessionManager {
    records: RecordStore,
    dedup: DeduplicationIndex,
    quota: QuotaLedger,
    gateway: Arc<dyn StorageGateway>,
    finalizer: FinalizerHandle,
    events: Arc<dyn EventSink>,
    audit: Arc<dyn AuditSink>,
    config: IngestConfig,
}

impl UploadSessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        records: RecordStore,
        dedup: DeduplicationIndex,
        quota: QuotaLedger,
        gateway: Arc<dyn StorageGateway>,
        finalizer: FinalizerHandle,
        events: Arc<dyn EventSink>,
        audit: Arc<dyn AuditSink>,
        config: IngestConfig,
    ) -> Self {
        Self {
            records,
            dedup,
            quota,
            gateway,
            finalizer,
            events,
            audit,
            config,
        }
    }

    pub fn quota(&self) -> &QuotaLedger {
        &self.quota
    }

    pub fn finalizer_running(&self) -> bool {
        self.finalizer.is_running()
    }

    /// Admit an upload: validate, try dedup, reserve quota, create the
    /// object and session rows, open the backend side and issue grants.
    ///
    /// A dedup hit returns the existing object without touching quota or
    /// issuing grants. Any backend failure after the rows were written rolls
    /// them back together with the reservation.
    pub async fn init_upload(&self, req: InitUploadRequest) -> UploadResult<InitUploadResponse> {
        let admission = self.validate(&req)?;

        if let Some(hash) = admission.content_hash.as_deref() {
            if let Some(existing) = self
                .dedup
                .lookup(&req.tenant_id, hash, req.declared_size)
                .await?
            {
                let (url, _) = self.access_url(&existing).await?;
                self.audit.record(AuditEntry {
                    action: AuditAction::DedupHit,
                    tenant_id: req.tenant_id.clone(),
                    session_id: None,
                    object_id: existing.id,
                    detail: None,
                });
                return Ok(InitUploadResponse::Deduplicated(DedupHit {
                    object_id: existing.id,
                    url,
                    no_upload_needed: true,
                }));
            }
        }

        let now = Utc::now();
        let policy = req.access_policy.unwrap_or_default();
        let object_id = Uuid::new_v4();
        let location = ObjectLocation::new(
            &self.config.bucket,
            storage_key(&req.tenant_id, policy, now, object_id, req.filename.as_deref()),
        );

        let object = ObjectRecord {
            id: object_id,
            tenant_id: req.tenant_id.clone(),
            filename: req.filename.clone(),
            size_bytes: req.declared_size,
            mime_type: req.mime_type.trim().to_string(),
            content_hash: admission.content_hash.clone(),
            bucket: location.bucket.clone(),
            storage_key: location.key.clone(),
            access_policy: policy,
            status: ObjectStatus::Init,
            etag: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        let mut session = UploadSession {
            id: Uuid::new_v4(),
            tenant_id: req.tenant_id.clone(),
            object_id,
            multipart: admission.multipart,
            part_size: admission.part_size,
            total_parts: admission.total_parts,
            completed_parts: 0,
            backend_token: None,
            status: UploadStatus::Init,
            expires_at: after(now, self.config.session_ttl),
            created_at: now,
            updated_at: now,
        };

        let mut tx = self.records.begin().await?;
        self.quota
            .reserve(&mut tx, &req.tenant_id, req.declared_size)
            .await?;
        RecordStore::insert_object(&mut tx, &object).await?;
        RecordStore::insert_session(&mut tx, &session).await?;
        tx.commit().await?;

        let parts = match self.open_backend(&mut session, &object).await {
            Ok(parts) => parts,
            Err(err) => {
                self.rollback_admission(&session, req.declared_size).await;
                return Err(err);
            }
        };

        tracing::info!(
            session_id = %session.id,
            object_id = %object_id,
            tenant_id = %req.tenant_id,
            multipart = session.multipart,
            total_parts = session.total_parts,
            "upload admitted"
        );
        self.audit.record(AuditEntry {
            action: AuditAction::InitUpload,
            tenant_id: req.tenant_id,
            session_id: Some(session.id),
            object_id,
            detail: Some(format!("{} bytes", req.declared_size)),
        });

        Ok(InitUploadResponse::Upload(UploadTicket {
            session_id: session.id,
            object_id,
            bucket: location.bucket,
            storage_key: location.key,
            multipart: session.multipart,
            part_size: session.part_size,
            total_parts: session.total_parts,
            parts,
            session_expires_at: session.expires_at,
        }))
    }

    /// Re-issue grants for a live session. An empty list means every part.
    pub async fn refresh_upload(
        &self,
        session_id: Uuid,
        part_numbers: &[i32],
    ) -> UploadResult<RefreshUploadResponse> {
        let session = self.load_session(session_id).await?;
        ensure_live(&session, Utc::now())?;

        let mut wanted: Vec<i32> = if part_numbers.is_empty() {
            (1..=session.total_parts).collect()
        } else {
            part_numbers.to_vec()
        };
        wanted.sort_unstable();
        wanted.dedup();
        if let Some(bad) = wanted
            .iter()
            .find(|n| **n < 1 || **n > session.total_parts)
        {
            return Err(UploadError::Validation(format!(
                "part {} is outside 1..={}",
                bad, session.total_parts
            )));
        }

        let object = self.load_object(session.object_id).await?;
        let parts = self.issue_grants(&session, &object, &wanted).await?;
        tracing::debug!(session_id = %session.id, parts = parts.len(), "grants refreshed");
        Ok(RefreshUploadResponse { parts })
    }

    /// Finish a live session.
    ///
    /// Single-part uploads become `COMPLETED` before this returns. Multipart
    /// uploads become `PROCESSING` and are merged by the finalizer; the
    /// outcome is observed through `get_status`.
    pub async fn complete_upload(
        &self,
        session_id: Uuid,
        req: CompleteUploadRequest,
    ) -> UploadResult<CompleteUploadResponse> {
        let session = self.load_session(session_id).await?;
        let now = Utc::now();
        ensure_live(&session, now)?;

        let supplied_hash = req
            .content_hash
            .as_deref()
            .map(normalize_hash)
            .transpose()?;
        let object = self.load_object(session.object_id).await?;
        if let (Some(declared), Some(supplied)) = (&object.content_hash, &supplied_hash) {
            if declared != supplied {
                return Err(UploadError::Validation(
                    "content hash differs from the one declared at admission".into(),
                ));
            }
        }

        if session.multipart {
            let parts = validate_parts(req.parts.unwrap_or_default(), session.total_parts)?;
            if supplied_hash.is_none() && object.content_hash.is_none() {
                return Err(UploadError::Validation(
                    "a content hash is required to complete a chunked upload".into(),
                ));
            }
            self.begin_processing(&session, &object, &parts, supplied_hash.as_deref())
                .await
        } else {
            if let Some(parts) = req.parts {
                validate_parts(parts, session.total_parts)?;
            }
            self.complete_single(&session, &object, supplied_hash.as_deref())
                .await
        }
    }

    /// Cancel a session. Backend cleanup is best-effort and never fails the
    /// call; the reservation is released when this abort wins.
    pub async fn abort_upload(&self, session_id: Uuid) -> UploadResult<()> {
        let session = self.load_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(UploadError::SessionTerminalConflict {
                id: session.id,
                status: session.status,
            });
        }
        let object = self.load_object(session.object_id).await?;
        let now = Utc::now();

        let mut tx = self.records.begin().await?;
        let won = RecordStore::transition_session(
            &mut tx,
            session.id,
            &[
                UploadStatus::Init,
                UploadStatus::InProgress,
                UploadStatus::Processing,
            ],
            UploadStatus::Aborted,
            now,
            None,
        )
        .await?;
        if !won {
            tx.rollback().await?;
            let current = self.load_session(session_id).await?;
            return Err(UploadError::SessionTerminalConflict {
                id: current.id,
                status: current.status,
            });
        }
        RecordStore::transition_object(
            &mut tx,
            object.id,
            &[ObjectStatus::Init, ObjectStatus::Processing],
            ObjectStatus::Failed,
            None,
            None,
            now,
        )
        .await?;
        self.quota
            .release(&mut tx, &object.tenant_id, object.size_bytes)
            .await?;
        tx.commit().await?;

        if let Err(err) = self.cleanup_backend(&session, &object).await {
            tracing::warn!(session_id = %session.id, "{}", err);
        }

        tracing::info!(session_id = %session.id, "upload aborted");
        self.audit.record(AuditEntry {
            action: AuditAction::AbortUpload,
            tenant_id: object.tenant_id,
            session_id: Some(session.id),
            object_id: object.id,
            detail: Some(format!("from {}", session.status.as_str())),
        });
        Ok(())
    }

    pub async fn get_status(&self, session_id: Uuid) -> UploadResult<UploadStatusView> {
        let session = self.load_session(session_id).await?;
        let object = self.load_object(session.object_id).await?;

        let (url, url_expires_at) =
            if object.status == ObjectStatus::Completed && object.deleted_at.is_none() {
                let (url, expires) = self.access_url(&object).await?;
                (Some(url), expires)
            } else {
                (None, None)
            };

        Ok(UploadStatusView {
            session_id: session.id,
            object_id: object.id,
            upload_status: session.status,
            object_status: object.status,
            finished: matches!(object.status, ObjectStatus::Completed | ObjectStatus::Failed),
            completed_parts: session.completed_parts,
            total_parts: session.total_parts,
            url,
            url_expires_at,
        })
    }

    /// Record that the backend now holds `received` chunks for the session
    /// with `backend_token`. Returns whether a live session was updated.
    pub async fn note_part_received(&self, backend_token: &str, received: i32) -> UploadResult<bool> {
        let updated = self
            .records
            .note_part_progress(backend_token, received, Utc::now())
            .await?;
        if !updated {
            tracing::debug!(backend_token, "part landed for a session that is no longer live");
        }
        Ok(updated)
    }

    /// Explicit delete of a stored object: soft-delete, reclaim quota, then
    /// remove the bytes best-effort.
    pub async fn delete_object(&self, object_id: Uuid) -> UploadResult<()> {
        let object = self.load_object(object_id).await?;
        if object.deleted_at.is_some() {
            return Err(UploadError::ObjectNotFound(object_id));
        }
        if object.status != ObjectStatus::Completed {
            return Err(UploadError::Validation(format!(
                "object `{}` is {} and cannot be deleted",
                object_id,
                object.status.as_str()
            )));
        }

        let mut tx = self.records.begin().await?;
        if !RecordStore::soft_delete_object(&mut tx, object_id, Utc::now()).await? {
            tx.rollback().await?;
            return Err(UploadError::ObjectNotFound(object_id));
        }
        self.quota
            .reclaim(&mut tx, &object.tenant_id, object.size_bytes)
            .await?;
        tx.commit().await?;

        if let Err(err) = self.gateway.delete_object(&object.location()).await {
            tracing::warn!(
                object_id = %object_id,
                error = %err,
                "partial cleanup failure deleting stored bytes"
            );
        }
        self.audit.record(AuditEntry {
            action: AuditAction::DeleteObject,
            tenant_id: object.tenant_id,
            session_id: None,
            object_id,
            detail: None,
        });
        Ok(())
    }

    /// Re-enqueue a finalize task for every session left in `PROCESSING`.
    /// Session whose grants may still write bytes to `location`.
    pub async fn writable_session(&self, location: &ObjectLocation) -> UploadResult<UploadSession> {
        let session = self
            .records
            .session_for_location(&location.bucket, &location.key)
            .await?
            .ok_or_else(|| {
                UploadError::Validation(format!("no upload session owns `{}`", location))
            })?;
        ensure_live(&session, Utc::now())?;
        Ok(session)
    }

    /// Drop bytes that landed after their session ended. A completed session
    /// keeps them; its grant only admits the declared content.
    pub async fn settle_blob_write(
        &self,
        session_id: Uuid,
        location: &ObjectLocation,
    ) -> UploadResult<()> {
        let session = self.load_session(session_id).await?;
        match session.status {
            UploadStatus::Aborted | UploadStatus::Expired | UploadStatus::Failed => {
                if let Err(err) = self.gateway.delete_object(location).await {
                    tracing::warn!(
                        session_id = %session.id,
                        error = %err,
                        "partial cleanup failure for late upload"
                    );
                }
                Err(UploadError::SessionTerminalConflict {
                    id: session.id,
                    status: session.status,
                })
            }
            _ => Ok(()),
        }
    }

    pub async fn resume_pending_finalizations(&self) -> UploadResult<usize> {
        let pending = self
            .records
            .sessions_in_status(UploadStatus::Processing)
            .await?;
        let mut queued = 0;
        for session in pending {
            let task = FinalizeTask {
                session_id: session.id,
                object_id: session.object_id,
            };
            if self.finalizer.enqueue(task).await.is_err() {
                tracing::error!("finalizer is not running, {} sessions left PROCESSING", queued);
                break;
            }
            queued += 1;
        }
        if queued > 0 {
            tracing::info!(queued, "resumed pending finalizations");
        }
        Ok(queued)
    }

    fn validate(&self, req: &InitUploadRequest) -> UploadResult<Admission> {
        validate_tenant(&req.tenant_id)?;

        if req.declared_size <= 0 {
            return Err(UploadError::Validation("declared size must be positive".into()));
        }
        if req.declared_size > self.config.max_object_size {
            return Err(UploadError::Validation(format!(
                "declared size {} exceeds the maximum of {} bytes",
                req.declared_size, self.config.max_object_size
            )));
        }

        let mime = req.mime_type.trim();
        if mime.is_empty() {
            return Err(UploadError::Validation("mime type is required".into()));
        }
        if !self.config.allowed_mime_types.is_empty()
            && !self
                .config
                .allowed_mime_types
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(mime))
        {
            return Err(UploadError::Validation(format!(
                "mime type `{mime}` is not accepted"
            )));
        }

        let content_hash = req
            .content_hash
            .as_deref()
            .map(normalize_hash)
            .transpose()?;

        let hint = req.multipart_hint.clone().unwrap_or_default();
        if let Some(part_size) = hint.part_size {
            if part_size < self.config.min_part_size || part_size > self.config.max_part_size {
                return Err(UploadError::Validation(format!(
                    "part size {} is outside {}..={}",
                    part_size, self.config.min_part_size, self.config.max_part_size
                )));
            }
        }
        let multipart = hint
            .enabled
            .unwrap_or(req.declared_size > self.config.multipart_threshold);

        let (part_size, total_parts) = if multipart {
            let part_size = hint.part_size.unwrap_or(self.config.default_part_size);
            (part_size, total_parts_for(req.declared_size, part_size))
        } else {
            (req.declared_size, 1)
        };
        if total_parts > MAX_PARTS {
            return Err(UploadError::Validation(format!(
                "{total_parts} parts exceed the limit of {MAX_PARTS}, use a larger part size"
            )));
        }

        Ok(Admission {
            content_hash,
            multipart,
            part_size,
            total_parts: total_parts as i32,
        })
    }

    /// Open the backend multipart session when needed and issue the initial
    /// grants. The backend token is persisted before any grant is handed out.
    async fn open_backend(
        &self,
        session: &mut UploadSession,
        object: &ObjectRecord,
    ) -> UploadResult<Vec<PartGrant>> {
        let location = &object.location();
        if session.multipart {
            let token = self
                .gateway
                .begin_chunked_upload(location)
                .await
                .map_err(|err| UploadError::StorageUnavailable(err.to_string()))?;
            session.backend_token = Some(token.clone());
            if let Err(err) = self.records.set_backend_token(session.id, &token).await {
                self.cancel_quietly(session, location, &token).await;
                return Err(err.into());
            }
        }

        let all: Vec<i32> = (1..=session.total_parts).collect();
        match self.issue_grants(session, object, &all).await {
            Ok(parts) => Ok(parts),
            Err(err) => {
                if let Some(token) = session.backend_token.as_deref() {
                    self.cancel_quietly(session, location, token).await;
                }
                Err(match err {
                    UploadError::Database(err) => UploadError::Database(err),
                    other => UploadError::StorageUnavailable(other.to_string()),
                })
            }
        }
    }

    async fn issue_grants(
        &self,
        session: &UploadSession,
        object: &ObjectRecord,
        part_numbers: &[i32],
    ) -> UploadResult<Vec<PartGrant>> {
        let location = &object.location();
        let ttl = self.config.grant_ttl;
        let expires_at = after(Utc::now(), ttl);

        let urls = match session.backend_token.as_deref() {
            Some(token) => {
                self.gateway
                    .issue_chunk_grants(location, token, part_numbers, ttl)
                    .await?
            }
            None if session.multipart => {
                return Err(UploadError::StorageUnavailable(
                    "chunked session has no backend token".into(),
                ));
            }
            None => vec![
                self.gateway
                    .issue_upload_grant(location, &object.expected_content(), ttl)
                    .await?,
            ],
        };

        Ok(part_numbers
            .iter()
            .zip(urls)
            .map(|(part_number, url)| PartGrant {
                part_number: *part_number,
                url,
                expires_at,
            })
            .collect())
    }

    /// Undo an admission whose backend side could not be opened.
    async fn rollback_admission(&self, session: &UploadSession, reserved_bytes: i64) {
        let result: UploadResult<()> = async {
            let mut tx = self.records.begin().await?;
            let removed = RecordStore::delete_session(
                &mut tx,
                session.id,
                session.object_id,
                &[ObjectStatus::Init],
            )
            .await?;
            if removed == 1 {
                self.quota
                    .release(&mut tx, &session.tenant_id, reserved_bytes)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => tracing::info!(session_id = %session.id, "admission rolled back"),
            Err(err) => tracing::error!(
                session_id = %session.id,
                error = %err,
                "failed to roll back admission, reaper will expire it"
            ),
        }
    }

    async fn begin_processing(
        &self,
        session: &UploadSession,
        object: &ObjectRecord,
        parts: &[PartETag],
        supplied_hash: Option<&str>,
    ) -> UploadResult<CompleteUploadResponse> {
        let now = Utc::now();
        let mut tx = self.records.begin().await?;
        let won = RecordStore::transition_session(
            &mut tx,
            session.id,
            &LIVE,
            UploadStatus::Processing,
            now,
            Some(now),
        )
        .await?;
        if !won {
            tx.rollback().await?;
            return Err(self.lost_race(session.id, now).await);
        }
        RecordStore::transition_object(
            &mut tx,
            object.id,
            &[ObjectStatus::Init],
            ObjectStatus::Processing,
            None,
            supplied_hash,
            now,
        )
        .await?;
        RecordStore::insert_parts(&mut tx, session.id, parts, now).await?;
        tx.commit().await?;

        let task = FinalizeTask {
            session_id: session.id,
            object_id: object.id,
        };
        if self.finalizer.enqueue(task).await.is_err() {
            tracing::error!(
                session_id = %session.id,
                "finalizer is not running, session stays PROCESSING until restart"
            );
        }
        tracing::info!(session_id = %session.id, parts = parts.len(), "chunked upload queued for merge");

        Ok(CompleteUploadResponse {
            object_id: object.id,
            status: UploadStatus::Processing,
        })
    }

    async fn complete_single(
        &self,
        session: &UploadSession,
        object: &ObjectRecord,
        supplied_hash: Option<&str>,
    ) -> UploadResult<CompleteUploadResponse> {
        let Some(stored) = self.gateway.stat_object(&object.location()).await? else {
            return Err(UploadError::Validation(
                "no bytes have been received for this upload".into(),
            ));
        };
        if stored.size_bytes != object.size_bytes {
            return Err(UploadError::Validation(format!(
                "received {} bytes, declared {}",
                stored.size_bytes, object.size_bytes
            )));
        }
        let declared = supplied_hash.or(object.content_hash.as_deref());
        if let (Some(declared), Some(actual)) = (declared, stored.sha256.as_deref()) {
            if !declared.eq_ignore_ascii_case(actual) {
                return Err(UploadError::IntegrityFailure(format!(
                    "declared sha256 {}, stored {}",
                    declared, actual
                )));
            }
        }

        let now = Utc::now();
        let mut tx = self.records.begin().await?;
        let won = RecordStore::transition_session(
            &mut tx,
            session.id,
            &LIVE,
            UploadStatus::Completed,
            now,
            Some(now),
        )
        .await?;
        if !won {
            tx.rollback().await?;
            return Err(self.lost_race(session.id, now).await);
        }
        RecordStore::transition_object(
            &mut tx,
            object.id,
            &[ObjectStatus::Init],
            ObjectStatus::Completed,
            None,
            supplied_hash,
            now,
        )
        .await?;
        self.quota
            .commit(&mut tx, &object.tenant_id, object.size_bytes)
            .await?;
        tx.commit().await?;

        tracing::info!(session_id = %session.id, object_id = %object.id, "upload completed");
        self.events.publish(UploadEvent::Completed {
            session_id: session.id,
            object_id: object.id,
            tenant_id: object.tenant_id.clone(),
            size_bytes: object.size_bytes,
        });
        self.audit.record(AuditEntry {
            action: AuditAction::CompleteUpload,
            tenant_id: object.tenant_id.clone(),
            session_id: Some(session.id),
            object_id: object.id,
            detail: None,
        });

        Ok(CompleteUploadResponse {
            object_id: object.id,
            status: UploadStatus::Completed,
        })
    }

    /// Error for a conditional write that found the session moved on.
    async fn lost_race(&self, session_id: Uuid, now: DateTime<Utc>) -> UploadError {
        match self.load_session(session_id).await {
            Ok(current) => match ensure_live(&current, now) {
                Err(err) => err,
                Ok(()) => UploadError::SessionTerminalConflict {
                    id: current.id,
                    status: current.status,
                },
            },
            Err(err) => err,
        }
    }

    /// Drop whatever partial state the backend holds for an ended session.
    async fn cleanup_backend(
        &self,
        session: &UploadSession,
        object: &ObjectRecord,
    ) -> UploadResult<()> {
        let location = object.location();
        let result = match session.backend_token.as_deref() {
            Some(token) => self.gateway.cancel_chunked_upload(&location, token).await,
            None => self.gateway.delete_object(&location).await,
        };
        result.map_err(|err| {
            UploadError::PartialCleanupFailure(format!("{} ({})", location, err))
        })
    }

    async fn cancel_quietly(&self, session: &UploadSession, location: &ObjectLocation, token: &str) {
        if let Err(err) = self.gateway.cancel_chunked_upload(location, token).await {
            tracing::warn!(
                session_id = %session.id,
                error = %err,
                "partial cleanup failure cancelling backend session"
            );
        }
    }

    async fn access_url(
        &self,
        object: &ObjectRecord,
    ) -> UploadResult<(String, Option<DateTime<Utc>>)> {
        let location = object.location();
        if object.access_policy.is_public() {
            return Ok((self.gateway.public_url(&location), None));
        }
        let ttl = self.config.download_url_ttl;
        let url = self.gateway.issue_download_grant(&location, ttl).await?;
        Ok((url, Some(after(Utc::now(), ttl))))
    }

    async fn load_session(&self, id: Uuid) -> UploadResult<UploadSession> {
        self.records
            .get_session(id)
            .await?
            .ok_or(UploadError::SessionNotFound(id))
    }

    async fn load_object(&self, id: Uuid) -> UploadResult<ObjectRecord> {
        self.records
            .get_object(id)
            .await?
            .ok_or(UploadError::ObjectNotFound(id))
    }
}

/// Whether `session` still accepts grants, refreshes and completion at `now`.
fn ensure_live(session: &UploadSession, now: DateTime<Utc>) -> UploadResult<()> {
    match session.status {
        UploadStatus::Expired => Err(UploadError::SessionExpired(session.id)),
        status if status.is_live() => {
            if session.is_expired_at(now) {
                Err(UploadError::SessionExpired(session.id))
            } else {
                Ok(())
            }
        }
        status => Err(UploadError::SessionTerminalConflict {
            id: session.id,
            status,
        }),
    }
}

/// Supplied parts must be exactly `1..=total_parts` with non-empty etags.
fn validate_parts(mut parts: Vec<PartETag>, total_parts: i32) -> UploadResult<Vec<PartETag>> {
    if parts.len() != total_parts as usize {
        return Err(UploadError::Validation(format!(
            "expected {} parts, got {}",
            total_parts,
            parts.len()
        )));
    }
    parts.sort_by_key(|p| p.part_number);
    for (expected, part) in (1..=total_parts).zip(&parts) {
        if part.part_number != expected {
            return Err(UploadError::Validation(format!(
                "parts must be numbered 1..={total_parts} without gaps or duplicates"
            )));
        }
        if part.etag.trim().is_empty() {
            return Err(UploadError::Validation(format!(
                "part {expected} has an empty etag"
            )));
        }
    }
    Ok(parts)
}

fn validate_tenant(tenant_id: &str) -> UploadResult<()> {
    let ok = !tenant_id.is_empty()
        && tenant_id.len() <= 64
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        && !tenant_id.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(UploadError::Validation(format!(
            "invalid tenant id `{tenant_id}`"
        )))
    }
}

/// Lower-case a SHA-256 hex digest, rejecting anything else.
fn normalize_hash(hash: &str) -> UploadResult<String> {
    let hash = hash.trim();
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(UploadError::Validation(
            "content hash must be a 64-character hex SHA-256 digest".into(),
        ));
    }
    Ok(hash.to_ascii_lowercase())
}

/// `{tenant}/{public|private}/{YYYYMMDD}/{object_id}[.ext]`
fn storage_key(
    tenant_id: &str,
    policy: AccessPolicy,
    now: DateTime<Utc>,
    object_id: Uuid,
    filename: Option<&str>,
) -> String {
    let ext = filename
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 16 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default();
    format!(
        "{}/{}/{}/{}{}",
        tenant_id,
        policy.key_segment(),
        now.format("%Y%m%d"),
        object_id,
        ext
    )
}

fn after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::upload::MultipartHint,
        services::{
            events::testing::RecordingSink,
            finalizer::{AsyncFinalizer, FinalizeWorker},
            storage_gateway::{StoredObject, testing::MemoryGateway},
        },
    };
    use sqlx::SqlitePool;
    use std::sync::atomic::Ordering;
    use tokio::time::{Instant, sleep};

    const MIB: i64 = 1024 * 1024;
    const HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    struct Harness {
        manager: Arc<UploadSessionManager>,
        gateway: Arc<MemoryGateway>,
        sink: Arc<RecordingSink>,
        records: RecordStore,
        finalizer: Option<AsyncFinalizer>,
    }

    fn build(
        records: &RecordStore,
        gateway: &Arc<MemoryGateway>,
        sink: &Arc<RecordingSink>,
        config: IngestConfig,
    ) -> (UploadSessionManager, AsyncFinalizer) {
        let quota = QuotaLedger::new(
            records.db.clone(),
            config.default_max_bytes,
            config.default_max_objects,
        );
        let worker = FinalizeWorker {
            records: records.clone(),
            quota: quota.clone(),
            gateway: gateway.clone(),
            events: sink.clone(),
            audit: sink.clone(),
        };
        let (finalizer, handle) = AsyncFinalizer::start(worker, 2, 16);
        let manager = UploadSessionManager::new(
            records.clone(),
            DeduplicationIndex::new(records.clone()),
            quota,
            gateway.clone(),
            handle,
            sink.clone(),
            sink.clone(),
            config,
        );
        (manager, finalizer)
    }

    async fn harness_with(gateway: Arc<MemoryGateway>, config: IngestConfig) -> Harness {
        harness_on(db::memory_pool().await, gateway, config)
    }

    fn harness_on(pool: SqlitePool, gateway: Arc<MemoryGateway>, config: IngestConfig) -> Harness {
        let records = RecordStore::new(Arc::new(pool));
        let sink = Arc::new(RecordingSink::default());
        let (manager, finalizer) = build(&records, &gateway, &sink, config);
        Harness {
            manager: Arc::new(manager),
            gateway,
            sink,
            records,
            finalizer: Some(finalizer),
        }
    }

    async fn harness() -> Harness {
        harness_with(MemoryGateway::new(), IngestConfig::default()).await
    }

    fn request(size: i64) -> InitUploadRequest {
        InitUploadRequest {
            tenant_id: "acme".into(),
            declared_size: size,
            mime_type: "video/mp4".into(),
            content_hash: None,
            filename: None,
            access_policy: None,
            multipart_hint: None,
        }
    }

    fn hashed(size: i64) -> InitUploadRequest {
        InitUploadRequest {
            content_hash: Some(HASH.into()),
            ..request(size)
        }
    }

    fn ticket(response: InitUploadResponse) -> UploadTicket {
        match response {
            InitUploadResponse::Upload(ticket) => ticket,
            InitUploadResponse::Deduplicated(hit) => panic!("unexpected dedup hit {hit:?}"),
        }
    }

    fn all_parts(n: i32) -> Vec<PartETag> {
        (1..=n).map(|i| PartETag::new(i, format!("etag-{i}"))).collect()
    }

    fn with_parts(parts: Vec<PartETag>) -> CompleteUploadRequest {
        CompleteUploadRequest {
            parts: Some(parts),
            content_hash: None,
        }
    }

    async fn wait_for(h: &Harness, session_id: Uuid, status: UploadStatus) -> UploadStatusView {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let view = h.manager.get_status(session_id).await.unwrap();
            if view.upload_status == status {
                return view;
            }
            assert!(
                Instant::now() < deadline,
                "session stuck in {:?}",
                view.upload_status
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn rows(h: &Harness, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&*h.records.db)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn small_upload_gets_one_grant_and_completes_synchronously() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(request(5 * MIB)).await.unwrap());

        assert!(!t.multipart);
        assert_eq!(t.total_parts, 1);
        assert_eq!(t.parts.len(), 1);
        assert_eq!(h.gateway.grants_issued(), 1);
        assert!(t.storage_key.starts_with("acme/private/"));

        let done = h
            .manager
            .complete_upload(t.session_id, CompleteUploadRequest::default())
            .await
            .unwrap();
        assert_eq!(done.status, UploadStatus::Completed);

        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.upload_status, UploadStatus::Completed);
        assert_eq!(view.object_status, ObjectStatus::Completed);
        assert!(view.finished);
        assert_eq!(view.completed_parts, 1);
        assert!(view.url.is_some());
        assert!(view.url_expires_at.is_some());

        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_used, 5 * MIB);
        assert_eq!(usage.bytes_reserved, 0);
        assert_eq!(usage.objects_used, 1);
        let events = h.sink.events();
        assert!(matches!(events.as_slice(), [UploadEvent::Completed { .. }]));
    }

    #[tokio::test]
    async fn chunked_upload_validates_parts_then_finalizes_off_path() {
        let h = harness_with(MemoryGateway::gated(), IngestConfig::default()).await;
        let t = ticket(h.manager.init_upload(hashed(150 * MIB)).await.unwrap());

        assert!(t.multipart);
        assert_eq!(t.part_size, 10 * MIB);
        assert_eq!(t.total_parts, 15);
        assert_eq!(t.parts.len(), 15);
        assert_eq!(
            t.parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            (1..=15).collect::<Vec<_>>()
        );
        assert_eq!(MemoryGateway::count(&h.gateway.begun), 1);

        let err = h
            .manager
            .complete_upload(t.session_id, with_parts(all_parts(14)))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)), "{err:?}");
        assert!(h.gateway.finish_calls.lock().unwrap().is_empty());

        let done = h
            .manager
            .complete_upload(t.session_id, with_parts(all_parts(15)))
            .await
            .unwrap();
        assert_eq!(done.status, UploadStatus::Processing);

        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.upload_status, UploadStatus::Processing);
        assert_eq!(view.object_status, ObjectStatus::Processing);
        assert!(!view.finished);
        assert!(view.url.is_none());

        h.gateway.release_finish();
        let view = wait_for(&h, t.session_id, UploadStatus::Completed).await;
        assert_eq!(view.object_status, ObjectStatus::Completed);
        assert!(view.finished);

        let object = h.records.get_object(t.object_id).await.unwrap().unwrap();
        assert_eq!(object.etag.as_deref(), Some("etag-15"));
        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_used, 150 * MIB);
        assert_eq!(usage.bytes_reserved, 0);
    }

    #[tokio::test]
    async fn gaps_duplicates_and_empty_etags_are_rejected() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(hashed(150 * MIB)).await.unwrap());

        let mut gap = all_parts(15);
        gap[14].part_number = 16;
        let mut dup = all_parts(15);
        dup[14].part_number = 14;
        let mut blank = all_parts(15);
        blank[3].etag = " ".into();

        for parts in [gap, dup, blank] {
            let err = h
                .manager
                .complete_upload(t.session_id, with_parts(parts))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)), "{err:?}");
        }
        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.upload_status, UploadStatus::Init);
    }

    #[tokio::test]
    async fn parts_may_arrive_out_of_order() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(hashed(150 * MIB)).await.unwrap());

        let mut parts = all_parts(15);
        parts.reverse();
        h.manager
            .complete_upload(t.session_id, with_parts(parts))
            .await
            .unwrap();
        wait_for(&h, t.session_id, UploadStatus::Completed).await;

        let calls = h.gateway.finish_calls.lock().unwrap().clone();
        assert_eq!(calls[0].1, all_parts(15));
    }

    #[tokio::test]
    async fn repeated_content_is_deduplicated_without_grants_or_quota() {
        let h = harness().await;
        let first = ticket(h.manager.init_upload(hashed(5 * MIB)).await.unwrap());
        h.manager
            .complete_upload(first.session_id, CompleteUploadRequest::default())
            .await
            .unwrap();
        let grants_before = h.gateway.grants_issued();
        let usage_before = h.manager.quota().usage("acme").await.unwrap();

        let mut again = hashed(5 * MIB);
        again.content_hash = Some(HASH.to_uppercase());
        match h.manager.init_upload(again).await.unwrap() {
            InitUploadResponse::Deduplicated(hit) => {
                assert_eq!(hit.object_id, first.object_id);
                assert!(hit.no_upload_needed);
                assert!(!hit.url.is_empty());
            }
            InitUploadResponse::Upload(t) => panic!("expected dedup hit, got {t:?}"),
        }

        assert_eq!(h.gateway.grants_issued(), grants_before);
        assert_eq!(h.manager.quota().usage("acme").await.unwrap(), usage_before);
        assert!(h.sink.actions().contains(&AuditAction::DedupHit));

        let mut other_tenant = hashed(5 * MIB);
        other_tenant.tenant_id = "globex".into();
        assert!(matches!(
            h.manager.init_upload(other_tenant).await.unwrap(),
            InitUploadResponse::Upload(_)
        ));
    }

    #[tokio::test]
    async fn concurrent_admissions_never_overshoot_the_quota() {
        let h = harness().await;
        h.manager
            .quota()
            .set_limits("acme", 100 * MIB, 1_000)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.init_upload(request(30 * MIB)).await
            }));
        }
        let mut admitted = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(response) => admitted.push(ticket(response)),
                Err(err) => assert!(matches!(err, UploadError::QuotaExceeded { .. }), "{err:?}"),
            }
        }
        assert_eq!(admitted.len(), 3);

        for t in &admitted {
            h.manager
                .complete_upload(t.session_id, CompleteUploadRequest::default())
                .await
                .unwrap();
        }
        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_used, 90 * MIB);
        assert!(usage.bytes_used <= usage.bytes_limit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_hold_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::file_pool(dir.path()).await;
        let h = harness_on(pool, MemoryGateway::new(), IngestConfig::default());
        h.manager
            .quota()
            .set_limits("acme", 100 * MIB, 1_000)
            .await
            .unwrap();

        let start = Arc::new(tokio::sync::Barrier::new(20));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let manager = h.manager.clone();
            let start = start.clone();
            handles.push(tokio::spawn(async move {
                start.wait().await;
                manager.init_upload(request(30 * MIB)).await
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(response) => {
                    ticket(response);
                    admitted += 1;
                }
                Err(err) => assert!(matches!(err, UploadError::QuotaExceeded { .. }), "{err:?}"),
            }
        }
        assert_eq!(admitted, 3);

        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_reserved, 90 * MIB);
        assert!(usage.bytes_reserved + usage.bytes_used <= usage.bytes_limit);
        assert_eq!(rows(&h, "upload_sessions").await, 3);
    }

    #[tokio::test]
    async fn single_part_completion_checks_the_stored_bytes() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(hashed(5 * MIB)).await.unwrap());
        let location = ObjectLocation::new(&t.bucket, &t.storage_key);

        h.gateway.store(
            &location,
            StoredObject {
                size_bytes: 40 * MIB,
                sha256: Some(HASH.into()),
            },
        );
        let err = h
            .manager
            .complete_upload(t.session_id, CompleteUploadRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)), "{err:?}");

        h.gateway.store(
            &location,
            StoredObject {
                size_bytes: 5 * MIB,
                sha256: Some("00".repeat(32)),
            },
        );
        let err = h
            .manager
            .complete_upload(t.session_id, CompleteUploadRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::IntegrityFailure(_)), "{err:?}");

        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.upload_status, UploadStatus::Init);
        assert_eq!(h.manager.quota().usage("acme").await.unwrap().bytes_used, 0);

        h.gateway.store(
            &location,
            StoredObject {
                size_bytes: 5 * MIB,
                sha256: Some(HASH.into()),
            },
        );
        h.manager
            .complete_upload(t.session_id, CompleteUploadRequest::default())
            .await
            .unwrap();
        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_used, 5 * MIB);
    }

    #[tokio::test]
    async fn blob_writes_are_refused_once_the_session_ends() {
        let h = harness().await;
        let done = ticket(h.manager.init_upload(request(5 * MIB)).await.unwrap());
        let aborted = ticket(h.manager.init_upload(request(5 * MIB)).await.unwrap());
        let done_at = ObjectLocation::new(&done.bucket, &done.storage_key);
        let aborted_at = ObjectLocation::new(&aborted.bucket, &aborted.storage_key);

        let session = h.manager.writable_session(&done_at).await.unwrap();
        assert_eq!(session.id, done.session_id);

        h.manager
            .complete_upload(done.session_id, CompleteUploadRequest::default())
            .await
            .unwrap();
        h.manager.abort_upload(aborted.session_id).await.unwrap();

        for location in [&done_at, &aborted_at] {
            let err = h.manager.writable_session(location).await.unwrap_err();
            assert!(
                matches!(err, UploadError::SessionTerminalConflict { .. }),
                "{err:?}"
            );
        }
        let unknown = ObjectLocation::new("media", "acme/private/20250101/nobody.bin");
        assert!(matches!(
            h.manager.writable_session(&unknown).await,
            Err(UploadError::Validation(_))
        ));

        // A write that raced the abort is removed; one that raced completion stays.
        let deleted = MemoryGateway::count(&h.gateway.deleted);
        assert!(h
            .manager
            .settle_blob_write(aborted.session_id, &aborted_at)
            .await
            .is_err());
        assert_eq!(MemoryGateway::count(&h.gateway.deleted), deleted + 1);
        h.manager
            .settle_blob_write(done.session_id, &done_at)
            .await
            .unwrap();
        assert_eq!(MemoryGateway::count(&h.gateway.deleted), deleted + 1);
    }

    #[tokio::test]
    async fn aborting_a_completed_session_conflicts_and_changes_nothing() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(request(5 * MIB)).await.unwrap());
        h.manager
            .complete_upload(t.session_id, CompleteUploadRequest::default())
            .await
            .unwrap();
        let before = h.records.get_object(t.object_id).await.unwrap().unwrap();

        let err = h.manager.abort_upload(t.session_id).await.unwrap_err();
        assert!(matches!(
            err,
            UploadError::SessionTerminalConflict {
                status: UploadStatus::Completed,
                ..
            }
        ));

        let after = h.records.get_object(t.object_id).await.unwrap().unwrap();
        assert_eq!(after.status, ObjectStatus::Completed);
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(MemoryGateway::count(&h.gateway.deleted), 0);
    }

    #[tokio::test]
    async fn abort_releases_quota_and_swallows_cleanup_failures() {
        let gateway = MemoryGateway::new();
        gateway.fail_cancel.store(true, Ordering::SeqCst);
        let h = harness_with(gateway, IngestConfig::default()).await;
        let t = ticket(h.manager.init_upload(request(150 * MIB)).await.unwrap());

        h.manager.abort_upload(t.session_id).await.unwrap();

        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.upload_status, UploadStatus::Aborted);
        assert_eq!(view.object_status, ObjectStatus::Failed);
        assert!(view.finished);
        assert_eq!(MemoryGateway::count(&h.gateway.cancelled), 1);
        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_reserved, 0);
        assert_eq!(usage.objects_reserved, 0);

        let err = h.manager.abort_upload(t.session_id).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionTerminalConflict { .. }));
    }

    #[tokio::test]
    async fn abort_that_wins_against_the_finalizer_sticks() {
        let h = harness_with(MemoryGateway::gated(), IngestConfig::default()).await;
        let t = ticket(h.manager.init_upload(hashed(150 * MIB)).await.unwrap());
        h.manager
            .complete_upload(t.session_id, with_parts(all_parts(15)))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while MemoryGateway::count(&h.gateway.merging) == 0 {
            assert!(Instant::now() < deadline, "finalizer never started the merge");
            sleep(Duration::from_millis(5)).await;
        }
        h.manager.abort_upload(t.session_id).await.unwrap();
        h.gateway.release_finish();

        let deadline = Instant::now() + Duration::from_secs(5);
        while MemoryGateway::count(&h.gateway.deleted) == 0 {
            assert!(Instant::now() < deadline, "superseded merge was not cleaned up");
            sleep(Duration::from_millis(10)).await;
        }

        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.upload_status, UploadStatus::Aborted);
        assert_eq!(view.object_status, ObjectStatus::Failed);
        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_used, 0);
        assert_eq!(usage.bytes_reserved, 0);
        assert!(h.sink.events().is_empty());
    }

    #[tokio::test]
    async fn expired_sessions_refuse_refresh_and_issue_no_grants() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(request(150 * MIB)).await.unwrap());
        let grants = h.gateway.grants_issued();

        sqlx::query("UPDATE upload_sessions SET expires_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::minutes(1))
            .bind(t.session_id)
            .execute(&*h.records.db)
            .await
            .unwrap();
        let err = h.manager.refresh_upload(t.session_id, &[]).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionExpired(_)), "{err:?}");

        sqlx::query("UPDATE upload_sessions SET status = 'EXPIRED' WHERE id = ?")
            .bind(t.session_id)
            .execute(&*h.records.db)
            .await
            .unwrap();
        let err = h.manager.refresh_upload(t.session_id, &[1]).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionExpired(_)), "{err:?}");
        let err = h
            .manager
            .complete_upload(t.session_id, with_parts(all_parts(15)))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::SessionExpired(_)), "{err:?}");

        assert_eq!(h.gateway.grants_issued(), grants);
    }

    #[tokio::test]
    async fn refresh_reissues_requested_parts_only() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(request(150 * MIB)).await.unwrap());

        let refreshed = h.manager.refresh_upload(t.session_id, &[7, 3, 7]).await.unwrap();
        assert_eq!(
            refreshed.parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![3, 7]
        );
        let all = h.manager.refresh_upload(t.session_id, &[]).await.unwrap();
        assert_eq!(all.parts.len(), 15);

        let err = h.manager.refresh_upload(t.session_id, &[16]).await.unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        let err = h.manager.refresh_upload(Uuid::new_v4(), &[]).await.unwrap_err();
        assert!(matches!(err, UploadError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn backend_failure_during_admission_leaves_nothing_behind() {
        let gateway = MemoryGateway::new();
        gateway.fail_begin.store(true, Ordering::SeqCst);
        let h = harness_with(gateway, IngestConfig::default()).await;

        let err = h.manager.init_upload(request(150 * MIB)).await.unwrap_err();
        assert!(matches!(err, UploadError::StorageUnavailable(_)), "{err:?}");

        assert_eq!(rows(&h, "upload_sessions").await, 0);
        assert_eq!(rows(&h, "objects").await, 0);
        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_reserved, 0);
        assert_eq!(usage.objects_reserved, 0);
    }

    #[tokio::test]
    async fn grant_failure_cancels_the_backend_session_and_rolls_back() {
        let gateway = MemoryGateway::new();
        gateway.fail_grants.store(true, Ordering::SeqCst);
        let h = harness_with(gateway, IngestConfig::default()).await;

        let err = h.manager.init_upload(request(150 * MIB)).await.unwrap_err();
        assert!(matches!(err, UploadError::StorageUnavailable(_)));
        assert_eq!(MemoryGateway::count(&h.gateway.cancelled), 1);

        let err = h.manager.init_upload(request(5 * MIB)).await.unwrap_err();
        assert!(matches!(err, UploadError::StorageUnavailable(_)));

        assert_eq!(rows(&h, "upload_sessions").await, 0);
        assert_eq!(rows(&h, "objects").await, 0);
        assert_eq!(
            h.manager.quota().usage("acme").await.unwrap().bytes_reserved,
            0
        );
    }

    #[tokio::test]
    async fn invalid_admissions_are_rejected_without_side_effects() {
        let config = IngestConfig {
            allowed_mime_types: vec!["video/mp4".into(), "image/png".into()],
            max_object_size: 100 * 1024 * MIB,
            ..IngestConfig::default()
        };
        let h = harness_with(MemoryGateway::new(), config).await;

        let mut cases = vec![
            request(0),
            InitUploadRequest {
                mime_type: "application/x-msdownload".into(),
                ..request(10)
            },
            InitUploadRequest {
                mime_type: "  ".into(),
                ..request(10)
            },
            InitUploadRequest {
                content_hash: Some("abc".into()),
                ..request(10)
            },
            InitUploadRequest {
                tenant_id: "../etc".into(),
                ..request(10)
            },
            InitUploadRequest {
                multipart_hint: Some(MultipartHint {
                    enabled: Some(true),
                    part_size: Some(MIB),
                }),
                ..request(150 * MIB)
            },
            InitUploadRequest {
                multipart_hint: Some(MultipartHint {
                    enabled: Some(true),
                    part_size: Some(5 * MIB),
                }),
                ..request(60 * 1024 * MIB)
            },
        ];
        cases.push(request(101 * 1024 * MIB));

        for case in cases {
            let err = h.manager.init_upload(case.clone()).await.unwrap_err();
            assert!(matches!(err, UploadError::Validation(_)), "{case:?} gave {err:?}");
        }
        assert_eq!(h.gateway.grants_issued(), 0);
        assert_eq!(rows(&h, "upload_sessions").await, 0);
        assert_eq!(
            h.manager.quota().usage("acme").await.unwrap().bytes_reserved,
            0
        );
    }

    #[tokio::test]
    async fn multipart_hint_overrides_the_size_threshold() {
        let h = harness().await;

        let forced_on = InitUploadRequest {
            multipart_hint: Some(MultipartHint {
                enabled: Some(true),
                part_size: Some(5 * MIB),
            }),
            ..request(12 * MIB)
        };
        let t = ticket(h.manager.init_upload(forced_on).await.unwrap());
        assert!(t.multipart);
        assert_eq!(t.total_parts, 3);

        let forced_off = InitUploadRequest {
            multipart_hint: Some(MultipartHint {
                enabled: Some(false),
                part_size: None,
            }),
            ..request(150 * MIB)
        };
        let t = ticket(h.manager.init_upload(forced_off).await.unwrap());
        assert!(!t.multipart);
        assert_eq!(t.total_parts, 1);
        assert_eq!(t.part_size, 150 * MIB);
    }

    #[tokio::test]
    async fn single_part_completion_requires_received_bytes() {
        let gateway = MemoryGateway::new();
        gateway.missing_objects.store(true, Ordering::SeqCst);
        let h = harness_with(gateway, IngestConfig::default()).await;
        let t = ticket(h.manager.init_upload(request(5 * MIB)).await.unwrap());

        let err = h
            .manager
            .complete_upload(t.session_id, CompleteUploadRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.upload_status, UploadStatus::Init);
    }

    #[tokio::test]
    async fn chunked_completion_needs_a_content_hash_from_somewhere() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(request(150 * MIB)).await.unwrap());

        let err = h
            .manager
            .complete_upload(t.session_id, with_parts(all_parts(15)))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));

        let done = h
            .manager
            .complete_upload(
                t.session_id,
                CompleteUploadRequest {
                    parts: Some(all_parts(15)),
                    content_hash: Some(HASH.to_uppercase()),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, UploadStatus::Processing);
        wait_for(&h, t.session_id, UploadStatus::Completed).await;

        let object = h.records.get_object(t.object_id).await.unwrap().unwrap();
        assert_eq!(object.content_hash.as_deref(), Some(HASH));
    }

    #[tokio::test]
    async fn part_progress_moves_to_in_progress_and_never_regresses() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(request(150 * MIB)).await.unwrap());
        let token = h
            .records
            .get_session(t.session_id)
            .await
            .unwrap()
            .unwrap()
            .backend_token
            .expect("chunked session has a token");

        assert!(h.manager.note_part_received(&token, 3).await.unwrap());
        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.upload_status, UploadStatus::InProgress);
        assert_eq!(view.completed_parts, 3);

        h.manager.note_part_received(&token, 2).await.unwrap();
        assert_eq!(h.manager.get_status(t.session_id).await.unwrap().completed_parts, 3);

        h.manager.note_part_received(&token, 99).await.unwrap();
        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(view.completed_parts, 15);
        assert_eq!(view.total_parts, 15);

        assert!(h.manager.refresh_upload(t.session_id, &[1]).await.is_ok());
        assert!(!h.manager.note_part_received("mpu-unknown", 1).await.unwrap());
    }

    #[tokio::test]
    async fn deleting_an_object_reclaims_quota_and_stops_dedup() {
        let h = harness().await;
        let t = ticket(h.manager.init_upload(hashed(5 * MIB)).await.unwrap());
        h.manager
            .complete_upload(t.session_id, CompleteUploadRequest::default())
            .await
            .unwrap();

        h.manager.delete_object(t.object_id).await.unwrap();

        let usage = h.manager.quota().usage("acme").await.unwrap();
        assert_eq!(usage.bytes_used, 0);
        assert_eq!(usage.objects_used, 0);
        assert_eq!(MemoryGateway::count(&h.gateway.deleted), 1);
        assert!(h.manager.get_status(t.session_id).await.unwrap().url.is_none());

        let err = h.manager.delete_object(t.object_id).await.unwrap_err();
        assert!(matches!(err, UploadError::ObjectNotFound(_)));
        assert!(matches!(
            h.manager.init_upload(hashed(5 * MIB)).await.unwrap(),
            InitUploadResponse::Upload(_)
        ));
    }

    #[tokio::test]
    async fn public_objects_get_a_permanent_url() {
        let h = harness().await;
        let req = InitUploadRequest {
            filename: Some("Holiday.Clip.MP4".into()),
            access_policy: Some(AccessPolicy::Public),
            ..request(5 * MIB)
        };
        let t = ticket(h.manager.init_upload(req).await.unwrap());
        assert!(t.storage_key.starts_with("acme/public/"));
        assert!(t.storage_key.ends_with(&format!("{}.mp4", t.object_id)));

        h.manager
            .complete_upload(t.session_id, CompleteUploadRequest::default())
            .await
            .unwrap();
        let view = h.manager.get_status(t.session_id).await.unwrap();
        assert_eq!(
            view.url.as_deref(),
            Some(format!("mem://media/{}", t.storage_key).as_str())
        );
        assert!(view.url_expires_at.is_none());
    }

    #[tokio::test]
    async fn processing_sessions_are_resumed_after_restart() {
        let mut h = harness().await;
        if let Some(finalizer) = h.finalizer.take() {
            finalizer.shutdown().await;
        }

        let t = ticket(h.manager.init_upload(hashed(150 * MIB)).await.unwrap());
        h.manager
            .complete_upload(t.session_id, with_parts(all_parts(15)))
            .await
            .unwrap();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.manager.get_status(t.session_id).await.unwrap().upload_status,
            UploadStatus::Processing
        );

        let (manager, finalizer) = build(&h.records, &h.gateway, &h.sink, IngestConfig::default());
        h.manager = Arc::new(manager);
        h.finalizer = Some(finalizer);

        assert_eq!(h.manager.resume_pending_finalizations().await.unwrap(), 1);
        wait_for(&h, t.session_id, UploadStatus::Completed).await;
        assert_eq!(MemoryGateway::count(&h.gateway.finished), 1);
    }

    #[test]
    fn storage_keys_follow_the_tenant_policy_date_layout() {
        let now = DateTime::parse_from_rfc3339("2025-03-09T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let id = Uuid::nil();
        assert_eq!(
            storage_key("acme", AccessPolicy::Private, now, id, Some("a.JPG")),
            format!("acme/private/20250309/{id}.jpg")
        );
        assert_eq!(
            storage_key("acme", AccessPolicy::Public, now, id, Some("noext")),
            format!("acme/public/20250309/{id}")
        );
        assert_eq!(
            storage_key("acme", AccessPolicy::Public, now, id, Some("x.tar.g z")),
            format!("acme/public/20250309/{id}")
        );
    }
}
