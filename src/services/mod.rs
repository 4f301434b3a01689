//! Ingestion core: the storage contract and its local implementation, the
//! record store, quota and dedup, the session manager, and the background
//! finalizer and reaper.

pub mod dedup;
pub mod events;
pub mod finalizer;
pub mod local_gateway;
pub mod quota_ledger;
pub mod reaper;
pub mod records;
pub mod storage_gateway;
pub mod upload_service;
