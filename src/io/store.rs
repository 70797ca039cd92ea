//! Object store access and remote staging of volumes and outputs.
//!
//! Stores are built for S3 (credentials from the environment) or for a local
//! directory. [`RemoteStagingClient`] moves files between a store and the local
//! work directory. Both directions are idempotent and compare content, not
//! just size. A download is skipped when the local copy was fetched from the
//! same object version (its entity tag, recorded next to the file); downloads
//! land under a temporary name first. An upload is skipped when the SHA-256 of
//! the local file matches the digest recorded in the destination's digest
//! manifest and the object still exists.

use crate::config::{RemoteConfig, RetryConfig as StageRetry};
use crate::error::{PipelineError, Result};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{
    ClientOptions, ObjectMeta, ObjectStore, ObjectStoreExt, RetryConfig, WriteMultipart,
};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Files at or above this size are uploaded in parts.
const MULTIPART_THRESHOLD: u64 = 16 * 1024 * 1024;

/// Read buffer for uploads.
const UPLOAD_BLOCK: usize = 8 * 1024 * 1024;

/// Object under an upload prefix mapping relative paths to SHA-256 digests.
const DIGEST_MANIFEST: &str = "_volchunk_digests.json";

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri.strip_prefix("s3://").ok_or_else(|| {
        PipelineError::config(format!("invalid S3 URI: expected 's3://' prefix in '{}'", uri))
    })?;

    without_scheme
        .split_once('/')
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| {
            PipelineError::config(format!(
                "invalid S3 URI: expected 's3://bucket/key' format in '{}'",
                uri
            ))
        })
}

/// Client options for long transfers of large volumes.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(10))
        // Whole-object transfers of multi-GB volumes
        .with_timeout(Duration::from_secs(30 * 60))
        .with_pool_idle_timeout(Duration::from_secs(90))
        .with_pool_max_idle_per_host(32)
}

/// Per-request retry for 429/5xx responses; stage-level retries sit on top.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: object_store::BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(300),
    }
}

/// Create an authenticated S3 client.
///
/// Credentials and region are loaded from (in order):
/// - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_REGION)
/// - AWS config files (~/.aws/credentials, ~/.aws/config)
/// - EC2 instance profile (IMDS)
pub fn create_s3_store(bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    info!("Creating S3 client for bucket: {}", bucket);

    let builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    let store = builder
        .build()
        .map_err(|e| PipelineError::config(format!("S3 client for '{}': {}", bucket, e)))?;
    Ok(Arc::new(store))
}

/// Store and object path for an `s3://bucket/key` URI.
pub fn store_for_uri(uri: &str) -> Result<(Arc<dyn ObjectStore>, ObjectPath)> {
    let (bucket, key) = parse_s3_uri(uri)?;
    Ok((create_s3_store(bucket)?, ObjectPath::from(key)))
}

/// Create the store outputs are uploaded to.
/// Uses LocalFileSystem if local_path is set, otherwise S3.
pub fn create_output_store(remote: &RemoteConfig) -> Result<Arc<dyn ObjectStore>> {
    match (&remote.local_path, &remote.bucket) {
        (Some(local_path), _) => {
            let path = Path::new(local_path);
            if !path.exists() {
                std::fs::create_dir_all(path)?;
            }
            info!("Creating LocalFileSystem store at: {}", path.display());
            let store = LocalFileSystem::new_with_prefix(path)
                .map_err(|e| PipelineError::config(format!("local store {}: {}", path.display(), e)))?;
            Ok(Arc::new(store))
        }
        (_, Some(bucket)) => create_s3_store(bucket),
        _ => Err(PipelineError::config("remote: no output destination")),
    }
}

/// Key prefix outputs are uploaded under.
/// Empty for local destinations, where the path is the store prefix.
pub fn output_prefix(remote: &RemoteConfig) -> ObjectPath {
    if remote.is_local() {
        ObjectPath::default()
    } else {
        ObjectPath::from(remote.prefix.as_deref().unwrap_or(""))
    }
}

fn map_store_error(context: &str, err: object_store::Error) -> PipelineError {
    match err {
        object_store::Error::NotFound { path, .. } => PipelineError::NotFound(path),
        other => PipelineError::transient_from(context.to_string(), other),
    }
}

/// Result of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Downloaded { bytes: u64 },
    UpToDate,
}

/// Counts from an upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub bytes: u64,
}

/// Moves artifacts between the object store and local disk.
#[derive(Clone)]
pub struct RemoteStagingClient {
    store: Arc<dyn ObjectStore>,
    retry: StageRetry,
    cancel: CancellationToken,
}

impl RemoteStagingClient {
    pub fn new(store: Arc<dyn ObjectStore>, retry: StageRetry) -> Self {
        Self {
            store,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight transfers when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Retry transient failures with backoff; other errors return at once.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(PipelineError::Cancelled(what.to_string()));
                }
                outcome = op() => outcome,
            };
            match outcome {
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what,
                        attempt,
                        self.retry.max_retries + 1,
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Download `remote` to `local`. Skipped when `local` was fetched from
    /// the same version of the object.
    pub async fn fetch(&self, remote: &ObjectPath, local: &Path) -> Result<FetchOutcome> {
        let what = format!("fetch {}", remote);
        self.with_retry(&what, || self.fetch_once(remote, local)).await
    }

    async fn fetch_once(&self, remote: &ObjectPath, local: &Path) -> Result<FetchOutcome> {
        let meta = self
            .store
            .head(remote)
            .await
            .map_err(|e| map_store_error("head", e))?;

        let version = object_version(&meta);
        let marker = version_path(local);
        if let Ok(existing) = tokio::fs::metadata(local).await {
            let fetched = tokio::fs::read_to_string(&marker).await.ok();
            if existing.len() == meta.size && fetched.as_deref() == Some(version.as_str()) {
                debug!("{} is up to date", local.display());
                return Ok(FetchOutcome::UpToDate);
            }
        }

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = partial_path(local);
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = self
            .store
            .get(remote)
            .await
            .map_err(|e| map_store_error("get", e))?
            .into_stream();

        let mut bytes = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| map_store_error("read", e))?;
            file.write_all(&chunk).await?;
            bytes += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        if bytes != meta.size {
            return Err(PipelineError::transient(format!(
                "short read of {}: {} of {} bytes",
                remote, bytes, meta.size
            )));
        }
        tokio::fs::rename(&tmp, local).await?;
        tokio::fs::write(&marker, version.as_bytes()).await?;
        info!("Fetched {} -> {} ({} bytes)", remote, local.display(), bytes);
        Ok(FetchOutcome::Downloaded { bytes })
    }

    /// Upload a file, or every file under a directory whose relative path
    /// matches `include`, below `prefix`. Files whose content was already
    /// uploaded there are skipped.
    pub async fn upload(
        &self,
        local: &Path,
        prefix: &ObjectPath,
        include: &glob::Pattern,
    ) -> Result<UploadSummary> {
        let files = collect_files(local, include)?;
        let manifest_key = join_key(prefix, DIGEST_MANIFEST);
        let mut digests = self
            .with_retry("read digest manifest", || self.load_digests(&manifest_key))
            .await?;
        let mut summary = UploadSummary::default();

        for (path, relative) in files {
            let key = join_key(prefix, &relative);
            let digest = file_digest(&path).await?;
            let unchanged = digests.get(&relative) == Some(&digest);
            let what = format!("upload {}", key);
            match self
                .with_retry(&what, || self.upload_once(&path, &key, unchanged))
                .await?
            {
                Some(bytes) => {
                    summary.uploaded += 1;
                    summary.bytes += bytes;
                    digests.insert(relative, digest);
                }
                None => summary.skipped += 1,
            }
        }

        if summary.uploaded > 0 {
            let body = serde_json::to_vec_pretty(&digests)?;
            self.with_retry("write digest manifest", || async {
                self.store
                    .put(&manifest_key, body.clone().into())
                    .await
                    .map(|_| ())
                    .map_err(|e| map_store_error("put", e))
            })
            .await?;
        }

        info!(
            "Uploaded {} files ({} bytes), {} already present",
            summary.uploaded, summary.bytes, summary.skipped
        );
        Ok(summary)
    }

    /// Digests recorded by earlier uploads; empty when there were none.
    async fn load_digests(&self, key: &ObjectPath) -> Result<BTreeMap<String, String>> {
        let result = match self.store.get(key).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(BTreeMap::new()),
            Err(e) => return Err(map_store_error("get", e)),
        };
        let body = result.bytes().await.map_err(|e| map_store_error("read", e))?;
        match serde_json::from_slice(&body) {
            Ok(digests) => Ok(digests),
            Err(e) => {
                warn!("Ignoring unreadable digest manifest {}: {}", key, e);
                Ok(BTreeMap::new())
            }
        }
    }

    async fn upload_once(&self, local: &Path, key: &ObjectPath, unchanged: bool) -> Result<Option<u64>> {
        let size = tokio::fs::metadata(local).await?.len();
        if unchanged {
            match self.store.head(key).await {
                Ok(meta) if meta.size == size => {
                    debug!("{} already uploaded", key);
                    return Ok(None);
                }
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(map_store_error("head", e)),
            }
        }

        if size < MULTIPART_THRESHOLD {
            let data = tokio::fs::read(local).await?;
            self.store
                .put(key, data.into())
                .await
                .map_err(|e| map_store_error("put", e))?;
        } else {
            let upload = self
                .store
                .put_multipart(key)
                .await
                .map_err(|e| map_store_error("put_multipart", e))?;
            let mut writer = WriteMultipart::new(upload);
            let mut file = tokio::fs::File::open(local).await?;
            let mut buf = vec![0u8; UPLOAD_BLOCK];
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                writer
                    .wait_for_capacity(4)
                    .await
                    .map_err(|e| map_store_error("upload part", e))?;
                writer.write(&buf[..n]);
            }
            writer
                .finish()
                .await
                .map_err(|e| map_store_error("complete upload", e))?;
        }
        debug!("Uploaded {} ({} bytes)", key, size);
        Ok(Some(size))
    }
}

fn partial_path(local: &Path) -> PathBuf {
    with_suffix(local, ".partial")
}

/// Records which version of the remote object a local file was fetched from.
fn version_path(local: &Path) -> PathBuf {
    with_suffix(local, ".version")
}

fn with_suffix(local: &Path, suffix: &str) -> PathBuf {
    let mut name = local.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    local.with_file_name(name)
}

/// Entity tag of an object, or its size and modification time for stores
/// that do not report one.
fn object_version(meta: &ObjectMeta) -> String {
    meta.e_tag.clone().unwrap_or_else(|| {
        format!("{}@{}", meta.size, meta.last_modified.timestamp_nanos_opt().unwrap_or_default())
    })
}

/// Hex SHA-256 of a file's content.
async fn file_digest(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; UPLOAD_BLOCK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn join_key(prefix: &ObjectPath, relative: &str) -> ObjectPath {
    if prefix.as_ref().is_empty() {
        ObjectPath::from(relative)
    } else {
        ObjectPath::from(format!("{}/{}", prefix, relative))
    }
}

/// Files to upload with their `/`-separated paths relative to `root`,
/// sorted for a deterministic upload order.
fn collect_files(root: &Path, include: &glob::Pattern) -> Result<Vec<(PathBuf, String)>> {
    let meta = std::fs::metadata(root).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => PipelineError::NotFound(root.display().to_string()),
        _ => PipelineError::Io(e),
    })?;

    if meta.is_file() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Ok(vec![(root.to_path_buf(), name)]);
    }

    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_default();
            if include.matches(&relative) {
                files.push((path, relative));
            }
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
