use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

use crate::{
    handlers::AppState,
    services::{
        dedup::DeduplicationIndex,
        events::{LogAuditSink, LogEventSink},
        finalizer::{AsyncFinalizer, FinalizeWorker},
        local_gateway::LocalStorageGateway,
        quota_ledger::QuotaLedger,
        reaper::ExpiryReaper,
        records::RecordStore,
        storage_gateway::StorageGateway,
        upload_service::UploadSessionManager,
    },
};

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting object-ingest with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    // --- Handle migration mode ---
    if migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }
    db::run_migrations(&db).await?;

    // --- Initialize core services ---
    let ingest = cfg.ingest.clone();
    let records = RecordStore::new(db.clone());
    let quota = QuotaLedger::new(
        db.clone(),
        ingest.default_max_bytes,
        ingest.default_max_objects,
    );
    let blobs = Arc::new(LocalStorageGateway::new(
        cfg.storage_dir.clone(),
        ingest.public_endpoint.clone(),
        ingest.signing_secret.as_bytes(),
        ingest.grant_fanout,
    )?);
    let gateway: Arc<dyn StorageGateway> = blobs.clone();
    let events = Arc::new(LogEventSink);
    let audit = Arc::new(LogAuditSink);

    let (finalizer, finalizer_handle) = AsyncFinalizer::start(
        FinalizeWorker {
            records: records.clone(),
            quota: quota.clone(),
            gateway: gateway.clone(),
            events: events.clone(),
            audit: audit.clone(),
        },
        ingest.finalizer_workers,
        ingest.finalizer_queue_depth,
    );

    let reaper = Arc::new(ExpiryReaper::new(
        records.clone(),
        quota.clone(),
        gateway.clone(),
        audit.clone(),
        ingest.expiry_sweep_interval,
        ingest.purge_sweep_interval,
        ingest.terminal_retention,
    ));
    let (stop_reaper, reaper_signal) = watch::channel(false);
    let reaper_task = tokio::spawn(reaper.run(reaper_signal));

    let manager = Arc::new(UploadSessionManager::new(
        records.clone(),
        DeduplicationIndex::new(records),
        quota,
        gateway,
        finalizer_handle,
        events,
        audit,
        ingest,
    ));
    manager.resume_pending_finalizations().await?;

    // --- Build router ---
    let state = AppState {
        manager,
        blobs,
        db,
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Drain background work ---
    let _ = stop_reaper.send(true);
    if let Err(err) = reaper_task.await {
        tracing::error!(error = %err, "expiry reaper panicked");
    }
    finalizer.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
