//! Core data models for the object ingestion service.
//!
//! These entities describe upload sessions, the objects they produce, the
//! parts reported for chunked uploads, and per-tenant quota accounts. They
//! map cleanly to database tables via `sqlx::FromRow` and serialize
//! naturally as JSON via `serde`.

pub mod object;
pub mod part;
pub mod quota;
pub mod session;
pub mod upload;
