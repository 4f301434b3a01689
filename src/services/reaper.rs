//! src/services/reaper.rs
//!
//! Background cleanup of stale upload sessions.
//!
//! Two sweeps on independent schedules: a frequent one that expires live
//! sessions past their deadline, and an infrequent one that hard-deletes
//! sessions which have been terminal for longer than the retention window.
//! Both only act through conditional writes, so re-running a sweep over the
//! same rows changes nothing.

use crate::{
    models::{
        object::ObjectStatus,
        session::{UploadSession, UploadStatus},
    },
    services::{
        events::{AuditAction, AuditEntry, AuditSink},
        quota_ledger::QuotaLedger,
        records::RecordStore,
        storage_gateway::StorageGateway,
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time::MissedTickBehavior};

/// Rows handled per sweep; the next tick picks up the rest.
const SWEEP_BATCH: i64 = 500;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub examined: usize,
    pub expired: usize,
    pub purged: usize,
}

pub struct ExpiryReaper {
    records: RecordStore,
    quota: QuotaLedger,
    gateway: Arc<dyn StorageGateway>,
    audit: Arc<dyn AuditSink>,
    expiry_interval: Duration,
    purge_interval: Duration,
    retention: Duration,
}

impl ExpiryReaper {
    pub fn new(
        records: RecordStore,
        quota: QuotaLedger,
        gateway: Arc<dyn StorageGateway>,
        audit: Arc<dyn AuditSink>,
        expiry_interval: Duration,
        purge_interval: Duration,
        retention: Duration,
    ) -> Self {
        Self {
            records,
            quota,
            gateway,
            audit,
            expiry_interval,
            purge_interval,
            retention,
        }
    }

    /// Expire every `INIT`/`IN_PROGRESS` session whose deadline is at or
    /// before `now`, fail its object and release its reservation.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, sqlx::Error> {
        let candidates = self.records.expired_live_sessions(now, SWEEP_BATCH).await?;
        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for session in &candidates {
            match self.expire(session, now).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "failed to expire session, will retry next sweep"
                ),
            }
        }

        if report.expired > 0 {
            tracing::info!(
                examined = report.examined,
                expired = report.expired,
                "expiry sweep finished"
            );
        }
        Ok(report)
    }

    async fn expire(&self, session: &UploadSession, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        let object = self.records.get_object(session.object_id).await?;

        let mut tx = self.records.begin().await?;
        let won = RecordStore::transition_session(
            &mut tx,
            session.id,
            &[UploadStatus::Init, UploadStatus::InProgress],
            UploadStatus::Expired,
            now,
            None,
        )
        .await?;
        if !won {
            tx.rollback().await?;
            return Ok(false);
        }
        let Some(object) = object else {
            tx.commit().await?;
            tracing::warn!(session_id = %session.id, "expired session had no object record");
            return Ok(true);
        };
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

        let location = object.location();
        let cleanup = match session.backend_token.as_deref() {
            Some(token) => self.gateway.cancel_chunked_upload(&location, token).await,
            None => match self.gateway.object_exists(&location).await {
                Ok(true) => self.gateway.delete_object(&location).await,
                Ok(false) => Ok(()),
                Err(err) => Err(err),
            },
        };
        if let Err(err) = cleanup {
            tracing::warn!(
                session_id = %session.id,
                error = %err,
                "partial cleanup failure for expired session"
            );
        }

        self.audit.record(AuditEntry {
            action: AuditAction::ExpireUpload,
            tenant_id: object.tenant_id,
            session_id: Some(session.id),
            object_id: object.id,
            detail: Some(format!("from {}", session.status.as_str())),
        });
        Ok(true)
    }

    /// Hard-delete sessions terminal since before `now - retention`, along
    /// with their part records and any object that never completed.
    pub async fn purge_terminal(&self, now: DateTime<Utc>) -> Result<SweepReport, sqlx::Error> {
        let cutoff = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let sessions = self
            .records
            .terminal_sessions_before(cutoff, SWEEP_BATCH)
            .await?;
        let mut report = SweepReport {
            examined: sessions.len(),
            ..SweepReport::default()
        };

        for session in &sessions {
            let purged: Result<u64, sqlx::Error> = async {
                let mut tx = self.records.begin().await?;
                let removed = RecordStore::delete_session(
                    &mut tx,
                    session.id,
                    session.object_id,
                    &[ObjectStatus::Failed],
                )
                .await?;
                tx.commit().await?;
                Ok(removed)
            }
            .await;
            match purged {
                Ok(removed) => report.purged += removed as usize,
                Err(err) => tracing::warn!(
                    session_id = %session.id,
                    error = %err,
                    "failed to purge session"
                ),
            }
        }

        if report.purged > 0 {
            tracing::info!(purged = report.purged, %cutoff, "purge sweep finished");
        }
        Ok(report)
    }

    /// Run both sweeps on their schedules until `shutdown` flips.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut expiry = tokio::time::interval(self.expiry_interval.max(Duration::from_secs(1)));
        let mut purge = tokio::time::interval(self.purge_interval.max(Duration::from_secs(1)));
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            expiry_every = ?self.expiry_interval,
            purge_every = ?self.purge_interval,
            "expiry reaper started"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = expiry.tick() => {
                    if let Err(err) = self.sweep_expired(Utc::now()).await {
                        tracing::error!(error = %err, "expiry sweep failed");
                    }
                }
                _ = purge.tick() => {
                    if let Err(err) = self.purge_terminal(Utc::now()).await {
                        tracing::error!(error = %err, "purge sweep failed");
                    }
                }
            }
        }
        tracing::info!("expiry reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db,
        models::object::{AccessPolicy, ObjectRecord},
        services::{events::testing::RecordingSink, storage_gateway::testing::MemoryGateway},
    };
    use uuid::Uuid;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    struct Fixture {
        reaper: ExpiryReaper,
        records: RecordStore,
        quota: QuotaLedger,
        gateway: Arc<MemoryGateway>,
        sink: Arc<RecordingSink>,
    }

    async fn fixture() -> Fixture {
        let pool = Arc::new(db::memory_pool().await);
        let records = RecordStore::new(pool.clone());
        let quota = QuotaLedger::new(pool, 1_000_000, 100);
        let gateway = MemoryGateway::new();
        let sink = Arc::new(RecordingSink::default());
        let reaper = ExpiryReaper::new(
            records.clone(),
            quota.clone(),
            gateway.clone(),
            sink.clone(),
            Duration::from_secs(3600),
            DAY,
            7 * DAY,
        );
        Fixture {
            reaper,
            records,
            quota,
            gateway,
            sink,
        }
    }

    /// Insert a session and its object the way admission would.
    async fn admit(
        fx: &Fixture,
        status: UploadStatus,
        token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> UploadSession {
        let now = Utc::now();
        let object = ObjectRecord {
            id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            filename: None,
            size_bytes: 1_000,
            mime_type: "image/png".into(),
            content_hash: None,
            bucket: "media".into(),
            storage_key: format!("acme/private/20250101/{}.png", Uuid::new_v4()),
            access_policy: AccessPolicy::Private,
            status: ObjectStatus::Init,
            etag: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        let session = UploadSession {
            id: Uuid::new_v4(),
            tenant_id: "acme".into(),
            object_id: object.id,
            multipart: token.is_some(),
            part_size: 500,
            total_parts: 2,
            completed_parts: 0,
            backend_token: token.map(str::to_string),
            status,
            expires_at,
            created_at: now,
            updated_at: now,
        };
        let mut tx = fx.records.begin().await.unwrap();
        fx.quota.reserve(&mut tx, "acme", 1_000).await.unwrap();
        RecordStore::insert_object(&mut tx, &object).await.unwrap();
        RecordStore::insert_session(&mut tx, &session).await.unwrap();
        tx.commit().await.unwrap();
        session
    }

    async fn snapshot(fx: &Fixture, session: &UploadSession) -> (UploadStatus, ObjectStatus, i64) {
        let s = fx.records.get_session(session.id).await.unwrap().unwrap();
        let o = fx.records.get_object(session.object_id).await.unwrap().unwrap();
        let reserved = fx.quota.usage("acme").await.unwrap().bytes_reserved;
        (s.status, o.status, reserved)
    }

    #[tokio::test]
    async fn expires_stale_sessions_and_releases_reservations() {
        let fx = fixture().await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        let future = Utc::now() + chrono::Duration::hours(1);
        let stale_chunked = admit(&fx, UploadStatus::InProgress, Some("mpu-1"), past).await;
        let stale_single = admit(&fx, UploadStatus::Init, None, past).await;
        let fresh = admit(&fx, UploadStatus::Init, None, future).await;

        let report = fx.reaper.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(report.examined, 2);
        assert_eq!(report.expired, 2);

        for session in [&stale_chunked, &stale_single] {
            let (status, object, _) = snapshot(&fx, session).await;
            assert_eq!(status, UploadStatus::Expired);
            assert_eq!(object, ObjectStatus::Failed);
        }
        let (status, _, reserved) = snapshot(&fx, &fresh).await;
        assert_eq!(status, UploadStatus::Init);
        assert_eq!(reserved, 1_000);

        assert_eq!(MemoryGateway::count(&fx.gateway.cancelled), 1);
        assert_eq!(MemoryGateway::count(&fx.gateway.deleted), 1);
        assert_eq!(
            fx.sink.actions(),
            vec![AuditAction::ExpireUpload, AuditAction::ExpireUpload]
        );
    }

    #[tokio::test]
    async fn running_the_expiry_sweep_twice_is_idempotent() {
        let fx = fixture().await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        let session = admit(&fx, UploadStatus::Init, Some("mpu-1"), past).await;

        fx.reaper.sweep_expired(Utc::now()).await.unwrap();
        let first = snapshot(&fx, &session).await;
        let report = fx.reaper.sweep_expired(Utc::now()).await.unwrap();
        let second = snapshot(&fx, &session).await;

        assert_eq!(first, second);
        assert_eq!(first, (UploadStatus::Expired, ObjectStatus::Failed, 0));
        assert_eq!(report, SweepReport::default());
        assert_eq!(MemoryGateway::count(&fx.gateway.cancelled), 1);
    }

    #[tokio::test]
    async fn processing_and_terminal_sessions_are_not_expired() {
        let fx = fixture().await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        let processing = admit(&fx, UploadStatus::Processing, Some("mpu-1"), past).await;
        let aborted = admit(&fx, UploadStatus::Aborted, None, past).await;

        let report = fx.reaper.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(report.expired, 0);
        assert_eq!(snapshot(&fx, &processing).await.0, UploadStatus::Processing);
        assert_eq!(snapshot(&fx, &aborted).await.0, UploadStatus::Aborted);
    }

    #[tokio::test]
    async fn purge_removes_old_terminal_sessions_only() {
        let fx = fixture().await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        let expired = admit(&fx, UploadStatus::Init, None, past).await;
        fx.reaper.sweep_expired(Utc::now()).await.unwrap();
        let live = admit(&fx, UploadStatus::Init, None, Utc::now() + chrono::Duration::hours(1)).await;

        // Inside the retention window nothing goes.
        let report = fx.reaper.purge_terminal(Utc::now()).await.unwrap();
        assert_eq!(report.purged, 0);

        let later = Utc::now() + chrono::Duration::days(8);
        let report = fx.reaper.purge_terminal(later).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.purged, 1);
        assert!(fx.records.get_session(expired.id).await.unwrap().is_none());
        assert!(fx.records.get_object(expired.object_id).await.unwrap().is_none());
        assert!(fx.records.get_session(live.id).await.unwrap().is_some());

        let again = fx.reaper.purge_terminal(later).await.unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn purge_keeps_completed_objects() {
        let fx = fixture().await;
        let session = admit(&fx, UploadStatus::Completed, None, Utc::now()).await;
        let mut conn = fx.records.db.acquire().await.unwrap();
        RecordStore::transition_object(
            &mut conn,
            session.object_id,
            &[ObjectStatus::Init],
            ObjectStatus::Completed,
            Some("etag"),
            None,
            Utc::now(),
        )
        .await
        .unwrap();
        drop(conn);

        let report = fx
            .reaper
            .purge_terminal(Utc::now() + chrono::Duration::days(8))
            .await
            .unwrap();
        assert_eq!(report.purged, 1);
        assert!(fx.records.get_session(session.id).await.unwrap().is_none());
        let object = fx.records.get_object(session.object_id).await.unwrap().unwrap();
        assert_eq!(object.status, ObjectStatus::Completed);
    }

    #[tokio::test]
    async fn run_loop_sweeps_on_start_and_stops_on_signal() {
        let fx = fixture().await;
        let past = Utc::now() - chrono::Duration::minutes(5);
        let session = admit(&fx, UploadStatus::Init, None, past).await;

        let reaper = Arc::new(fx.reaper);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reaper.clone().run(rx));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let current = fx.records.get_session(session.id).await.unwrap().unwrap();
            if current.status == UploadStatus::Expired {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "first tick did not sweep");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("reaper did not stop")
            .unwrap();
    }
}
