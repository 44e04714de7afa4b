//! Object storage, secret store and HTTP client plumbing for spotlake.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod secrets;

pub use secrets::{EnvSecretProvider, FileSecretProvider, SecretError, SecretProvider, LATEST_VERSION};

pub const CRATE_NAME: &str = "spotlake-storage";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bucket: String,
    pub path: String,
    pub content_type: String,
    pub content_hash: String,
    pub byte_size: usize,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> anyhow::Result<StoredObject>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `prefix/year=YYYY/month=MM/day=DD/name_YYYYMMDD_HHMMSS.ext`
pub fn partitioned_object_path(
    prefix: &str,
    name: &str,
    at: DateTime<Utc>,
    extension: &str,
) -> String {
    let prefix = prefix.trim_matches('/');
    let ext = extension.trim_start_matches('.').trim();
    let ext = if ext.is_empty() { "bin" } else { ext };
    let partition = format!(
        "year={:04}/month={:02}/day={:02}",
        at.year(),
        at.month(),
        at.day()
    );
    let file = format!("{name}_{}.{ext}", at.format("%Y%m%d_%H%M%S"));
    if prefix.is_empty() {
        format!("{partition}/{file}")
    } else {
        format!("{prefix}/{partition}/{file}")
    }
}

/// Filesystem-backed bucket store: objects land at `<root>/<bucket>/<path>`.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, path: &str) -> anyhow::Result<PathBuf> {
        for part in [bucket, path] {
            let candidate = Path::new(part);
            if part.is_empty()
                || candidate
                    .components()
                    .any(|c| !matches!(c, Component::Normal(_)))
            {
                bail!("invalid object location {bucket:?}/{path:?}");
            }
        }
        Ok(self.root.join(bucket).join(path))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    /// Writes through a temp file and renames into place, so readers never
    /// observe a partial object.
    async fn put(
        &self,
        bucket: &str,
        path: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> anyhow::Result<StoredObject> {
        let absolute_path = self.object_path(bucket, path)?;
        let parent = absolute_path
            .parent()
            .with_context(|| format!("object path {} has no parent", absolute_path.display()))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating object directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp object file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp object file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp object file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp object {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(bucket, path, bytes = bytes.len(), "stored object");
        Ok(StoredObject {
            bucket: bucket.to_string(),
            path: path.to_string(),
            content_type: content_type.to_string(),
            content_hash: sha256_hex(bytes),
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_concurrency: 4,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = u32::try_from(elapsed.as_millis() / self.refill_every.as_millis())
                    .unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Turns a non-2xx response into [`FetchError::HttpStatus`].
    pub fn error_for_status(self) -> Result<Self, FetchError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(FetchError::HttpStatus {
                status: self.status.as_u16(),
                url: self.final_url.clone(),
                body: self.body_text(),
            })
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Decode { .. } => None,
        }
    }
}

/// Shared outbound HTTP client: bounded timeout, bounded concurrency and an
/// optional request-rate bucket. Single attempt per call.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            token_bucket,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends the request and buffers the body. Any status is returned as
    /// `Ok`; only transport failures are errors.
    pub async fn execute(
        &self,
        label: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        // The semaphore is never closed, so acquire only fails after shutdown.
        let _permit = self.limit.acquire().await.ok();

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", label);
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "http response");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn object_hashing_is_stable() {
        let hash = sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn partitioned_paths_are_zero_padded() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 7, 5, 9).single().unwrap();
        assert_eq!(
            partitioned_object_path("/spotify/raw/", "top_tracks_short_term", at, ".json"),
            "spotify/raw/year=2024/month=03/day=01/top_tracks_short_term_20240301_070509.json"
        );
        assert_eq!(
            partitioned_object_path("", "playlist_x", at, ""),
            "year=2024/month=03/day=01/playlist_x_20240301_070509.bin"
        );
    }

    #[tokio::test]
    async fn put_writes_atomically_and_overwrites() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());

        let first = store
            .put("raw", "a/b/data.json", br#"{"v":1}"#, CONTENT_TYPE_JSON)
            .await
            .expect("first put");
        let second = store
            .put("raw", "a/b/data.json", br#"{"v":2}"#, CONTENT_TYPE_JSON)
            .await
            .expect("second put");

        assert_ne!(first.content_hash, second.content_hash);
        let on_disk = std::fs::read(dir.path().join("raw/a/b/data.json")).expect("read");
        assert_eq!(on_disk, br#"{"v":2}"#);

        let leftovers = std::fs::read_dir(dir.path().join("raw/a/b"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn put_rejects_escaping_paths() {
        let dir = tempdir().expect("tempdir");
        let store = LocalObjectStore::new(dir.path());
        assert!(store.put("raw", "../outside.json", b"{}", CONTENT_TYPE_JSON).await.is_err());
        assert!(store.put("raw", "/abs.json", b"{}", CONTENT_TYPE_JSON).await.is_err());
        assert!(store.put("", "x.json", b"{}", CONTENT_TYPE_JSON).await.is_err());
    }

    #[tokio::test]
    async fn token_bucket_hands_out_capacity_without_waiting() {
        let bucket = SimpleTokenBucket::new(3, Duration::from_secs(60));
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
