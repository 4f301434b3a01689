//! src/services/local_gateway.rs
//!
//! `LocalStorageGateway` is a disk-backed `StorageGateway`. Object payloads are
//! sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`; chunked uploads
//! stage their parts under `base_path/.multipart/{token}/` until they are
//! merged. Grants are URLs against the service's own `/blobs` endpoint,
//! authenticated with an HMAC-SHA256 signature over method, location, upload
//! token, part number, expected size and digest, and expiry. A single-part
//! grant only admits a body of exactly the declared size.

use crate::{
    models::{
        object::{ExpectedContent, ObjectLocation},
        part::PartETag,
    },
    services::storage_gateway::{
        FinishedObject, StorageError, StorageGateway, StorageResult, StoredObject,
    },
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const STAGING_DIR: &str = ".multipart";
const LOCATION_FILE: &str = "location";
const READ_BUF: usize = 64 * 1024;

/// Query parameters carried by every grant URL.
#[derive(Debug, Clone, Deserialize)]
pub struct GrantParams {
    pub expires: i64,
    pub signature: String,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<i32>,
    /// Exact body length a single-part grant admits.
    pub size: Option<i64>,
    pub sha256: Option<String>,
}

impl GrantParams {
    /// Content a single-part write must match, if the grant binds one.
    pub fn expected_content(&self) -> Option<ExpectedContent> {
        self.size.map(|size_bytes| ExpectedContent {
            size_bytes,
            sha256: self.sha256.clone(),
        })
    }
}

#[derive(Clone)]
pub struct LocalStorageGateway {
    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
    endpoint: String,
    /// Keyed signer, cloned for every signature.
    mac: HmacSha256,
    fanout: usize,
}

impl LocalStorageGateway {
    pub fn new(
        base_path: impl Into<PathBuf>,
        endpoint: impl Into<String>,
        secret: impl AsRef<[u8]>,
        fanout: usize,
    ) -> StorageResult<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|err| StorageError::Unavailable(format!("grant signing key: {}", err)))?;
        Ok(Self {
            base_path: base_path.into(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            mac,
            fanout,
        })
    }

    /// Rejects keys that could escape the bucket directory.
    fn ensure_key_safe(&self, location: &ObjectLocation) -> StorageResult<()> {
        let key = location.key.as_str();
        let bucket = location.bucket.as_str();
        let bad = |s: &str| {
            s.is_empty()
                || s.starts_with('/')
                || s.contains("..")
                || s.bytes().any(|b| b.is_ascii_control() || b == b'\\')
        };
        if bad(key) || bad(bucket) || bucket.contains('/') || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidGrant(format!(
                "unsafe location `{}`",
                location
            )));
        }
        Ok(())
    }

    fn bucket_root(&self, bucket: &str) -> PathBuf {
        self.base_path.join(bucket)
    }

    /// Two-level shard identifiers from MD5(bucket/key).
    fn object_shards(location: &ObjectLocation) -> (String, String) {
        let digest = md5::compute(location.to_string());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, location: &ObjectLocation) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(location);
        let mut path = self.bucket_root(&location.bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(&location.key);
        path
    }

    fn staging_dir(&self, token: &str) -> StorageResult<PathBuf> {
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(StorageError::InvalidGrant("malformed upload token".into()));
        }
        Ok(self.base_path.join(STAGING_DIR).join(token))
    }

    fn part_path(dir: &Path, part_number: i32) -> PathBuf {
        dir.join(format!("part-{:05}", part_number))
    }

    /// String covered by a grant signature. `params.signature` is not part
    /// of it.
    fn canonical(method: &str, location: &ObjectLocation, params: &GrantParams) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}",
            method,
            location,
            params.upload_id.as_deref().unwrap_or(""),
            params.part_number.map(|n| n.to_string()).unwrap_or_default(),
            params.size.map(|n| n.to_string()).unwrap_or_default(),
            params.sha256.as_deref().unwrap_or(""),
            params.expires
        )
    }

    fn sign(&self, canonical: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(canonical.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    fn grant_url(
        &self,
        method: &str,
        location: &ObjectLocation,
        mut params: GrantParams,
        ttl: Duration,
    ) -> String {
        params.expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        params.signature = self.sign(&Self::canonical(method, location, &params));

        let mut url = format!(
            "{}?expires={}&signature={}",
            self.public_url(location),
            params.expires,
            params.signature
        );
        if let (Some(token), Some(part)) = (&params.upload_id, params.part_number) {
            url.push_str(&format!("&uploadId={}&partNumber={}", token, part));
        }
        if let Some(size) = params.size {
            url.push_str(&format!("&size={}", size));
        }
        if let Some(sha256) = &params.sha256 {
            url.push_str(&format!("&sha256={}", sha256));
        }
        url
    }

    fn unsigned(
        token: Option<&str>,
        part_number: Option<i32>,
        expected: Option<&ExpectedContent>,
    ) -> GrantParams {
        GrantParams {
            expires: 0,
            signature: String::new(),
            upload_id: token.map(str::to_string),
            part_number,
            size: expected.map(|e| e.size_bytes),
            sha256: expected.and_then(|e| e.sha256.clone()),
        }
    }

    /// Check a grant presented to the blob endpoint.
    pub fn verify_grant(
        &self,
        method: &str,
        location: &ObjectLocation,
        params: &GrantParams,
    ) -> StorageResult<()> {
        self.ensure_key_safe(location)?;
        if Utc::now().timestamp() > params.expires {
            return Err(StorageError::InvalidGrant("grant expired".into()));
        }
        let signature = URL_SAFE_NO_PAD
            .decode(params.signature.as_bytes())
            .map_err(|_| StorageError::InvalidGrant("malformed signature".into()))?;
        let mut mac = self.mac.clone();
        mac.update(Self::canonical(method, location, params).as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| StorageError::InvalidGrant("signature mismatch".into()))
    }

    /// Stream a single-part object to disk: temp file, fsync, atomic rename.
    /// A body that is not exactly `expected.size_bytes` long, or does not hash
    /// to `expected.sha256`, is discarded before it replaces anything.
    /// Returns the MD5 etag.
    pub async fn write_object<S>(
        &self,
        location: &ObjectLocation,
        expected: &ExpectedContent,
        stream: S,
    ) -> StorageResult<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(location)?;
        let file_path = self.object_path(location);
        let written = write_atomically(&file_path, stream, Some(expected)).await?;
        Ok(format!("{:x}", written.md5))
    }

    /// Stream one chunk into its multipart staging directory. Returns the
    /// part's MD5 etag and the number of distinct parts staged so far.
    pub async fn write_part<S>(
        &self,
        location: &ObjectLocation,
        token: &str,
        part_number: i32,
        stream: S,
    ) -> StorageResult<(String, usize)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.ensure_key_safe(location)?;
        if part_number < 1 {
            return Err(StorageError::InvalidGrant("part numbers start at 1".into()));
        }
        let dir = self.staging_dir(token)?;
        self.ensure_staged_location(&dir, location).await?;

        let written = write_atomically(&Self::part_path(&dir, part_number), stream, None).await?;
        let staged = count_parts(&dir).await?;
        Ok((format!("{:x}", written.md5), staged))
    }

    /// Open a stored object for reading.
    pub async fn open_object(&self, location: &ObjectLocation) -> StorageResult<File> {
        self.ensure_key_safe(location)?;
        File::open(self.object_path(location))
            .await
            .map_err(|err| match err.kind() {
                ErrorKind::NotFound => StorageError::NotFound(location.to_string()),
                _ => StorageError::Io(err),
            })
    }

    /// Whether `location` is served without a signature.
    pub fn is_public_key(location: &ObjectLocation) -> bool {
        location.key.split('/').nth(1) == Some("public")
    }

    async fn ensure_staged_location(
        &self,
        dir: &Path,
        location: &ObjectLocation,
    ) -> StorageResult<()> {
        let recorded = match fs::read_to_string(dir.join(LOCATION_FILE)).await {
            Ok(recorded) => recorded,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(format!("multipart upload for {}", location)));
            }
            Err(err) => return Err(StorageError::Io(err)),
        };
        if recorded != location.to_string() {
            return Err(StorageError::PartMismatch(format!(
                "upload belongs to `{}`, not `{}`",
                recorded, location
            )));
        }
        Ok(())
    }

    /// Recursively remove empty directories up to `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageGateway for LocalStorageGateway {
    async fn issue_upload_grant(
        &self,
        location: &ObjectLocation,
        expected: &ExpectedContent,
        ttl: Duration,
    ) -> StorageResult<String> {
        self.ensure_key_safe(location)?;
        let params = Self::unsigned(None, None, Some(expected));
        Ok(self.grant_url("PUT", location, params, ttl))
    }

    async fn begin_chunked_upload(&self, location: &ObjectLocation) -> StorageResult<String> {
        self.ensure_key_safe(location)?;
        let token = Uuid::new_v4().simple().to_string();
        let dir = self.staging_dir(&token)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        fs::write(dir.join(LOCATION_FILE), location.to_string())
            .await
            .map_err(|err| StorageError::Unavailable(err.to_string()))?;
        debug!(%location, %token, "opened multipart staging area");
        Ok(token)
    }

    async fn issue_part_grant(
        &self,
        location: &ObjectLocation,
        token: &str,
        part_number: i32,
        ttl: Duration,
    ) -> StorageResult<String> {
        self.staging_dir(token)?;
        let params = Self::unsigned(Some(token), Some(part_number), None);
        Ok(self.grant_url("PUT", location, params, ttl))
    }

    fn grant_fanout(&self) -> usize {
        self.fanout
    }

    async fn finish_chunked_upload(
        &self,
        location: &ObjectLocation,
        token: &str,
        parts: &[PartETag],
        expected: &ExpectedContent,
    ) -> StorageResult<FinishedObject> {
        self.ensure_key_safe(location)?;
        let dir = self.staging_dir(token)?;
        self.ensure_staged_location(&dir, location)
            .await
            .map_err(|err| match err {
                StorageError::NotFound(what) => StorageError::PartMismatch(format!("no {}", what)),
                other => other,
            })?;

        let file_path = self.object_path(location);
        let parent = parent_of(&file_path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let merged = merge_parts(&dir, &tmp_path, parts).await;
        let (content_hash, part_digests, size_bytes) = match merged {
            Ok(result) => result,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = check_content(expected, size_bytes, &content_hash) {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        if let Err(err) = fs::remove_dir_all(&dir).await {
            debug!("failed to remove staging dir {}: {}", dir.display(), err);
        }

        // S3-style multipart etag: md5 over the part digests, suffixed with the count.
        let mut combined = md5::Context::new();
        for digest in &part_digests {
            combined.consume(digest.0);
        }
        Ok(FinishedObject {
            etag: format!("{:x}-{}", combined.compute(), part_digests.len()),
            size_bytes,
        })
    }

    async fn cancel_chunked_upload(
        &self,
        _location: &ObjectLocation,
        token: &str,
    ) -> StorageResult<()> {
        let dir = self.staging_dir(token)?;
        match fs::remove_dir_all(&dir).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn delete_object(&self, location: &ObjectLocation) -> StorageResult<()> {
        self.ensure_key_safe(location)?;
        let file_path = self.object_path(location);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&location.bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn object_exists(&self, location: &ObjectLocation) -> StorageResult<bool> {
        self.ensure_key_safe(location)?;
        Ok(fs::try_exists(self.object_path(location)).await?)
    }

    async fn stat_object(&self, location: &ObjectLocation) -> StorageResult<Option<StoredObject>> {
        let mut file = match self.open_object(location).await {
            Ok(file) => file,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let mut content = Sha256::new();
        let mut size_bytes: i64 = 0;
        let mut buf = vec![0u8; READ_BUF];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            content.update(&buf[..n]);
            size_bytes += n as i64;
        }
        Ok(Some(StoredObject {
            size_bytes,
            sha256: Some(format!("{:x}", content.finalize())),
        }))
    }

    async fn issue_download_grant(
        &self,
        location: &ObjectLocation,
        ttl: Duration,
    ) -> StorageResult<String> {
        self.ensure_key_safe(location)?;
        Ok(self.grant_url("GET", location, Self::unsigned(None, None, None), ttl))
    }

    fn public_url(&self, location: &ObjectLocation) -> String {
        format!("{}/blobs/{}/{}", self.endpoint, location.bucket, location.key)
    }
}

fn parent_of(path: &Path) -> StorageResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        StorageError::Io(io::Error::new(
            ErrorKind::Other,
            "object path missing parent directory",
        ))
    })
}

/// Digests and length of a body written by [`write_atomically`].
struct Written {
    md5: md5::Digest,
    size_bytes: i64,
}

/// Reject assembled or uploaded bytes that differ from what was declared.
fn check_content(expected: &ExpectedContent, size_bytes: i64, sha256: &str) -> StorageResult<()> {
    if size_bytes != expected.size_bytes {
        return Err(StorageError::IntegrityFailure(format!(
            "expected {} bytes, received {}",
            expected.size_bytes, size_bytes
        )));
    }
    if let Some(want) = expected.sha256.as_deref() {
        if !want.eq_ignore_ascii_case(sha256) {
            return Err(StorageError::IntegrityFailure(format!(
                "expected sha256 {}, received {}",
                want, sha256
            )));
        }
    }
    Ok(())
}

/// Write `stream` to `target` through a temp file in the same directory.
/// With `expected` set the body is cut off as soon as it outgrows the
/// declared size and is never renamed into place unless it matches.
async fn write_atomically<S>(
    target: &Path,
    stream: S,
    expected: Option<&ExpectedContent>,
) -> StorageResult<Written>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let parent = parent_of(target)?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let written: StorageResult<Written> = async {
        let mut file = File::create(&tmp_path).await?;
        let mut digest = md5::Context::new();
        let mut content = Sha256::new();
        let mut size_bytes: i64 = 0;

        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as i64;
            if let Some(expected) = expected {
                if size_bytes > expected.size_bytes {
                    return Err(StorageError::IntegrityFailure(format!(
                        "body exceeds the declared {} bytes",
                        expected.size_bytes
                    )));
                }
            }
            digest.consume(&chunk);
            content.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected {
            check_content(expected, size_bytes, &format!("{:x}", content.finalize()))?;
        }
        Ok::<_, StorageError>(Written {
            md5: digest.compute(),
            size_bytes,
        })
    }
    .await;

    let written = match written {
        Ok(written) => written,
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }
    };
    if let Err(err) = fs::rename(&tmp_path, target).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StorageError::Io(err));
    }
    debug!(path = %target.display(), size_bytes = written.size_bytes, "body written");
    Ok(written)
}

/// Concatenate staged parts (in the supplied order) into `out_path`, checking
/// each part's etag. Returns the SHA-256 of the result, the per-part digests
/// and the total size.
async fn merge_parts(
    dir: &Path,
    out_path: &Path,
    parts: &[PartETag],
) -> StorageResult<(String, Vec<md5::Digest>, i64)> {
    let mut out = File::create(out_path).await?;
    let mut content = Sha256::new();
    let mut digests = Vec::with_capacity(parts.len());
    let mut size_bytes: i64 = 0;
    let mut buf = vec![0u8; READ_BUF];

    for part in parts {
        let path = LocalStorageGateway::part_path(dir, part.part_number);
        let mut input = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(StorageError::PartMismatch(format!(
                    "part {} was never uploaded",
                    part.part_number
                )));
            }
            Err(err) => return Err(StorageError::Io(err)),
        };
        let mut part_digest = md5::Context::new();
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            part_digest.consume(&buf[..n]);
            content.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size_bytes += n as i64;
        }
        let digest = part_digest.compute();
        let claimed = part.etag.trim_matches('"');
        if !claimed.eq_ignore_ascii_case(&format!("{:x}", digest)) {
            return Err(StorageError::PartMismatch(format!(
                "etag for part {} does not match stored bytes",
                part.part_number
            )));
        }
        digests.push(digest);
    }

    out.flush().await?;
    out.sync_all().await?;
    Ok((format!("{:x}", content.finalize()), digests, size_bytes))
}

async fn count_parts(dir: &Path) -> StorageResult<usize> {
    let mut entries = fs::read_dir(dir).await?;
    let mut count = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name().to_string_lossy().starts_with("part-") {
            count += 1;
        }
    }
    Ok(count)
}
