use anyhow::{Context, Result};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

const MIB: i64 = 1024 * 1024;
const GIB: i64 = 1024 * MIB;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub ingest: IngestConfig,
}

/// Tunables for admission, grants, finalization and reaping.
#[derive(Clone)]
pub struct IngestConfig {
    /// Bucket every admitted object is placed in.
    pub bucket: String,
    /// Base URL clients use to reach the blob endpoint.
    pub public_endpoint: String,
    /// Secret used to sign upload/download grants.
    pub signing_secret: String,
    /// Declared sizes above this go multipart unless the client says otherwise.
    pub multipart_threshold: i64,
    pub default_part_size: i64,
    pub min_part_size: i64,
    pub max_part_size: i64,
    pub max_object_size: i64,
    /// Accepted mime types. Empty accepts everything.
    pub allowed_mime_types: Vec<String>,
    pub session_ttl: Duration,
    pub grant_ttl: Duration,
    pub download_url_ttl: Duration,
    pub default_max_bytes: i64,
    pub default_max_objects: i64,
    pub finalizer_workers: usize,
    pub finalizer_queue_depth: usize,
    /// Concurrent grant issuances per request.
    pub grant_fanout: usize,
    pub expiry_sweep_interval: Duration,
    pub purge_sweep_interval: Duration,
    /// How long terminal sessions are kept before being hard-deleted.
    pub terminal_retention: Duration,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bucket: "media".into(),
            public_endpoint: "http://127.0.0.1:3000".into(),
            signing_secret: "change-me".into(),
            multipart_threshold: 100 * MIB,
            default_part_size: 10 * MIB,
            min_part_size: 5 * MIB,
            max_part_size: 512 * MIB,
            max_object_size: 5 * GIB,
            allowed_mime_types: Vec::new(),
            session_ttl: Duration::from_secs(24 * 3600),
            grant_ttl: Duration::from_secs(3600),
            download_url_ttl: Duration::from_secs(24 * 3600),
            default_max_bytes: 10 * GIB,
            default_max_objects: 10_000,
            finalizer_workers: 4,
            finalizer_queue_depth: 256,
            grant_fanout: 16,
            expiry_sweep_interval: Duration::from_secs(3600),
            purge_sweep_interval: Duration::from_secs(24 * 3600),
            terminal_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl std::fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestConfig")
            .field("bucket", &self.bucket)
            .field("public_endpoint", &self.public_endpoint)
            .field("signing_secret", &"<redacted>")
            .field("multipart_threshold", &self.multipart_threshold)
            .field("default_part_size", &self.default_part_size)
            .field("max_object_size", &self.max_object_size)
            .field("allowed_mime_types", &self.allowed_mime_types)
            .field("session_ttl", &self.session_ttl)
            .field("grant_ttl", &self.grant_ttl)
            .field("finalizer_workers", &self.finalizer_workers)
            .field("terminal_retention", &self.terminal_retention)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked object ingestion service")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_INGEST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_INGEST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where the local gateway keeps object bytes (overrides OBJECT_INGEST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_INGEST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket for admitted objects (overrides OBJECT_INGEST_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Externally reachable base URL for grants (overrides OBJECT_INGEST_PUBLIC_ENDPOINT)
    #[arg(long)]
    pub public_endpoint: Option<String>,

    /// Number of finalizer workers (overrides OBJECT_INGEST_FINALIZER_WORKERS)
    #[arg(long)]
    pub finalizer_workers: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("OBJECT_INGEST_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("OBJECT_INGEST_PORT", 3000u16)?;
        let env_storage =
            env::var("OBJECT_INGEST_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("OBJECT_INGEST_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/object_ingest.db".into());

        let mut ingest = IngestConfig::from_env()?;
        if let Some(bucket) = args.bucket {
            ingest.bucket = bucket;
        }
        if let Some(endpoint) = args.public_endpoint {
            ingest.public_endpoint = endpoint;
        }
        if let Some(workers) = args.finalizer_workers {
            ingest.finalizer_workers = workers;
        }

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            ingest,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl IngestConfig {
    /// Defaults overridden by any `OBJECT_INGEST_*` variables present.
    pub fn from_env() -> Result<Self> {
        let d = Self::default();
        let allowed_mime_types = match env::var("OBJECT_INGEST_ALLOWED_MIME_TYPES") {
            Ok(list) => list
                .split(',')
                .map(|m| m.trim().to_ascii_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
            Err(_) => d.allowed_mime_types,
        };

        Ok(Self {
            bucket: env::var("OBJECT_INGEST_BUCKET").unwrap_or(d.bucket),
            public_endpoint: env::var("OBJECT_INGEST_PUBLIC_ENDPOINT")
                .unwrap_or(d.public_endpoint),
            signing_secret: env::var("OBJECT_INGEST_SIGNING_SECRET").unwrap_or(d.signing_secret),
            multipart_threshold: env_parse(
                "OBJECT_INGEST_MULTIPART_THRESHOLD",
                d.multipart_threshold,
            )?,
            default_part_size: env_parse("OBJECT_INGEST_PART_SIZE", d.default_part_size)?,
            min_part_size: env_parse("OBJECT_INGEST_MIN_PART_SIZE", d.min_part_size)?,
            max_part_size: env_parse("OBJECT_INGEST_MAX_PART_SIZE", d.max_part_size)?,
            max_object_size: env_parse("OBJECT_INGEST_MAX_OBJECT_SIZE", d.max_object_size)?,
            allowed_mime_types,
            session_ttl: env_secs("OBJECT_INGEST_SESSION_TTL_SECS", d.session_ttl)?,
            grant_ttl: env_secs("OBJECT_INGEST_GRANT_TTL_SECS", d.grant_ttl)?,
            download_url_ttl: env_secs("OBJECT_INGEST_DOWNLOAD_TTL_SECS", d.download_url_ttl)?,
            default_max_bytes: env_parse("OBJECT_INGEST_QUOTA_MAX_BYTES", d.default_max_bytes)?,
            default_max_objects: env_parse(
                "OBJECT_INGEST_QUOTA_MAX_OBJECTS",
                d.default_max_objects,
            )?,
            finalizer_workers: env_parse("OBJECT_INGEST_FINALIZER_WORKERS", d.finalizer_workers)?,
            finalizer_queue_depth: env_parse(
                "OBJECT_INGEST_FINALIZER_QUEUE_DEPTH",
                d.finalizer_queue_depth,
            )?,
            grant_fanout: env_parse("OBJECT_INGEST_GRANT_FANOUT", d.grant_fanout)?,
            expiry_sweep_interval: env_secs(
                "OBJECT_INGEST_EXPIRY_SWEEP_SECS",
                d.expiry_sweep_interval,
            )?,
            purge_sweep_interval: env_secs(
                "OBJECT_INGEST_PURGE_SWEEP_SECS",
                d.purge_sweep_interval,
            )?,
            terminal_retention: env_secs(
                "OBJECT_INGEST_RETENTION_SECS",
                d.terminal_retention,
            )?,
        })
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}
