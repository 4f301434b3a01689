//! src/services/finalizer.rs
//!
//! Off-path merge of chunked uploads. The manager enqueues a task only after
//! the transaction that set `PROCESSING` has committed; a fixed pool of
//! workers drains a bounded queue and drives each session to `COMPLETED` or
//! `FAILED`. The `PROCESSING -> terminal` write is conditional, so a task
//! whose session was aborted meanwhile becomes a no-op.

use crate::{
    models::{
        object::ObjectStatus,
        part::PartETag,
        session::UploadStatus,
    },
    services::{
        events::{AuditAction, AuditEntry, AuditSink, EventSink, UploadEvent},
        quota_ledger::QuotaLedger,
        records::RecordStore,
        storage_gateway::StorageGateway,
    },
};
use chrono::Utc;
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use uuid::Uuid;

/// One merge to perform. Carries identifiers only; everything else is read
/// back from the record store when the task runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizeTask {
    pub session_id: Uuid,
    pub object_id: Uuid,
}

/// How a single task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Completed,
    Failed,
    /// The session left `PROCESSING` before this task could finish it.
    Superseded,
}

/// Cloneable sender side handed to the session manager.
#[derive(Clone)]
pub struct FinalizerHandle {
    sender: mpsc::Sender<FinalizeTask>,
}

impl FinalizerHandle {
    /// Queue a merge. Waits while the queue is full. Fails only once the
    /// worker pool has shut down; the session then stays `PROCESSING` and is
    /// picked up again at the next startup.
    pub async fn enqueue(&self, task: FinalizeTask) -> Result<(), FinalizeTask> {
        self.sender.send(task).await.map_err(|err| err.0)
    }

    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

/// Everything a worker needs to finish a session.
#[derive(Clone)]
pub struct FinalizeWorker {
    pub records: RecordStore,
    pub quota: QuotaLedger,
    pub gateway: Arc<dyn StorageGateway>,
    pub events: Arc<dyn EventSink>,
    pub audit: Arc<dyn AuditSink>,
}

impl FinalizeWorker {
    pub async fn finalize(&self, task: FinalizeTask) -> Result<FinalizeOutcome, sqlx::Error> {
        let Some(session) = self.records.get_session(task.session_id).await? else {
            tracing::warn!(session_id = %task.session_id, "finalize task for unknown session");
            return Ok(FinalizeOutcome::Superseded);
        };
        if session.status != UploadStatus::Processing {
            tracing::debug!(
                session_id = %session.id,
                status = session.status.as_str(),
                "session already left PROCESSING, skipping merge"
            );
            return Ok(FinalizeOutcome::Superseded);
        }
        let Some(object) = self.records.get_object(task.object_id).await? else {
            tracing::error!(object_id = %task.object_id, "finalize task for unknown object");
            return Ok(FinalizeOutcome::Superseded);
        };

        let location = object.location();
        let parts: Vec<PartETag> = self
            .records
            .list_parts(session.id)
            .await?
            .into_iter()
            .map(PartETag::from)
            .collect();

        let merged = match session.backend_token.as_deref() {
            Some(token) => self
                .gateway
                .finish_chunked_upload(&location, token, &parts, &object.expected_content())
                .await
                .map_err(|err| err.to_string()),
            None => Err("session has no backend multipart token".to_string()),
        };
        let merged = match merged {
            Ok(finished) if finished.size_bytes != object.size_bytes => {
                if let Err(err) = self.gateway.delete_object(&location).await {
                    tracing::warn!(
                        session_id = %session.id,
                        error = %err,
                        "partial cleanup failure for oversized merge"
                    );
                }
                Err(format!(
                    "assembled {} bytes, declared {}",
                    finished.size_bytes, object.size_bytes
                ))
            }
            other => other,
        };

        let now = Utc::now();
        match merged {
            Ok(finished) => {
                let mut tx = self.records.begin().await?;
                let won = RecordStore::transition_session(
                    &mut tx,
                    session.id,
                    &[UploadStatus::Processing],
                    UploadStatus::Completed,
                    now,
                    None,
                )
                .await?;
                if !won {
                    tx.rollback().await?;
                    tracing::info!(
                        session_id = %session.id,
                        "session aborted during merge, removing merged object"
                    );
                    if let Err(err) = self.gateway.delete_object(&location).await {
                        tracing::warn!(
                            session_id = %session.id,
                            error = %err,
                            "partial cleanup failure after superseded merge"
                        );
                    }
                    return Ok(FinalizeOutcome::Superseded);
                }
                RecordStore::transition_object(
                    &mut tx,
                    object.id,
                    &[ObjectStatus::Processing],
                    ObjectStatus::Completed,
                    Some(finished.etag.as_str()),
                    None,
                    now,
                )
                .await?;
                self.quota
                    .commit(&mut tx, &object.tenant_id, object.size_bytes)
                    .await?;
                tx.commit().await?;

                tracing::info!(
                    session_id = %session.id,
                    object_id = %object.id,
                    etag = %finished.etag,
                    "chunked upload finalized"
                );
                self.events.publish(UploadEvent::Completed {
                    session_id: session.id,
                    object_id: object.id,
                    tenant_id: object.tenant_id.clone(),
                    size_bytes: object.size_bytes,
                });
                self.audit.record(AuditEntry {
                    action: AuditAction::CompleteUpload,
                    tenant_id: object.tenant_id,
                    session_id: Some(session.id),
                    object_id: object.id,
                    detail: Some(format!("{} parts", parts.len())),
                });
                Ok(FinalizeOutcome::Completed)
            }
            Err(reason) => {
                let mut tx = self.records.begin().await?;
                let won = RecordStore::transition_session(
                    &mut tx,
                    session.id,
                    &[UploadStatus::Processing],
                    UploadStatus::Failed,
                    now,
                    None,
                )
                .await?;
                if !won {
                    tx.rollback().await?;
                    return Ok(FinalizeOutcome::Superseded);
                }
                RecordStore::transition_object(
                    &mut tx,
                    object.id,
                    &[ObjectStatus::Processing],
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

                tracing::warn!(
                    session_id = %session.id,
                    object_id = %object.id,
                    "chunked upload failed to finalize: {}",
                    reason
                );
                if let Some(token) = session.backend_token.as_deref() {
                    if let Err(err) = self.gateway.cancel_chunked_upload(&location, token).await {
                        tracing::warn!(
                            session_id = %session.id,
                            error = %err,
                            "partial cleanup failure after failed merge"
                        );
                    }
                }
                self.events.publish(UploadEvent::Failed {
                    session_id: session.id,
                    object_id: object.id,
                    tenant_id: object.tenant_id,
                    reason,
                });
                Ok(FinalizeOutcome::Failed)
            }
        }
    }
}

/// Worker pool owning the receiving end of the finalize queue.
pub struct AsyncFinalizer {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncFinalizer {
    /// Spawn `workers` tasks sharing one bounded queue of `queue_depth`.
    pub fn start(
        worker: FinalizeWorker,
        workers: usize,
        queue_depth: usize,
    ) -> (Self, FinalizerHandle) {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown, _) = watch::channel(false);

        let handles = (0..workers.max(1))
            .map(|index| {
                let worker = worker.clone();
                let receiver = receiver.clone();
                let shutdown = shutdown.subscribe();
                tokio::spawn(run_worker(index, worker, receiver, shutdown))
            })
            .collect();

        tracing::info!(workers = workers.max(1), queue_depth, "finalizer pool started");
        (
            Self {
                shutdown,
                workers: handles,
            },
            FinalizerHandle { sender },
        )
    }

    /// Signal the workers and wait for them to finish the task in hand.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.workers {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "finalizer worker panicked");
            }
        }
        tracing::info!("finalizer pool stopped");
    }
}

async fn run_worker(
    index: usize,
    worker: FinalizeWorker,
    receiver: Arc<Mutex<mpsc::Receiver<FinalizeTask>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        let task = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.changed() => None,
                task = receiver.recv() => task,
            }
        };
        let Some(task) = task else { break };

        match worker.finalize(task).await {
            Ok(outcome) => tracing::debug!(
                worker = index,
                session_id = %task.session_id,
                ?outcome,
                "finalize task done"
            ),
            Err(err) => tracing::error!(
                worker = index,
                session_id = %task.session_id,
                error = %err,
                "finalize task hit a database error, session left PROCESSING"
            ),
        }
    }
    tracing::debug!(worker = index, "finalizer worker exiting");
}
