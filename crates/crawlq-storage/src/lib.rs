//! Job/page stores, screenshot artifacts and HTTP fetch utilities for crawlq.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use store::{ClaimFilter, JobStore, PageStore, ReprocessOutcome, SeedSummary, StoreError};

pub const CRATE_NAME: &str = "crawlq-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed files (page screenshots) under one root directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(
        &self,
        site_id: &str,
        captured_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let site_dir: String = site_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        let site_dir = site_dir.trim_matches('.');
        let site_dir = if site_dir.is_empty() { "unknown-site" } else { site_dir };
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(site_dir)
            .join(captured_at.format("%Y%m%d").to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_screenshot(
        &self,
        site_id: &str,
        captured_at: DateTime<Utc>,
        png: &[u8],
    ) -> Result<StoredArtifact, ArtifactError> {
        self.store_bytes(site_id, captured_at, "png", png).await
    }

    /// Write bytes once per content hash, via a temp file and an atomic rename.
    pub async fn store_bytes(
        &self,
        site_id: &str,
        captured_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact, ArtifactError> {
        let content_hash = sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(site_id, captured_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated: bool| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .map_err(|source| ArtifactError::io("creating artifact directory", &parent, source))?;

        if fs::try_exists(&absolute_path)
            .await
            .map_err(|source| ArtifactError::io("checking artifact path", &absolute_path, source))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|source| ArtifactError::io("opening temp artifact", &temp_path, source))?;
        file.write_all(bytes)
            .await
            .map_err(|source| ArtifactError::io("writing temp artifact", &temp_path, source))?;
        file.flush()
            .await
            .map_err(|source| ArtifactError::io("flushing temp artifact", &temp_path, source))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(ArtifactError::io("renaming temp artifact", &absolute_path, err))
            }
        }
    }
}

#[derive(Debug, Error)]
#[error("{action} {}: {source}", path.display())]
pub struct ArtifactError {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: std::io::Error,
}

impl ArtifactError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reason a fetch is repeated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryCause {
    Throttled,
    ServerError,
    Transport,
}

impl RetryCause {
    fn of_status(status: StatusCode) -> Option<Self> {
        if status == StatusCode::TOO_MANY_REQUESTS {
            Some(Self::Throttled)
        } else if status.is_server_error() {
            Some(Self::ServerError)
        } else {
            None
        }
    }

    fn of_error(err: &reqwest::Error) -> Option<Self> {
        (err.is_timeout() || err.is_connect() || err.is_request()).then_some(Self::Transport)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// `base_delay` doubled per earlier retry, never above `max_delay`.
    pub fn delay_before_retry(&self, retry: usize) -> Duration {
        let doubling = u32::try_from(retry)
            .ok()
            .and_then(|r| 2u32.checked_pow(r))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(doubling).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_site_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_site_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared HTTP client for sitemap discovery and the static renderer.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_site_limit: usize,
    per_site: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    async fn read(resp: reqwest::Response) -> Result<Self, FetchError> {
        let status = resp.status();
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();
        Ok(Self {
            status,
            final_url,
            content_type,
            body,
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("building http client: {0}")]
    Client(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Request(err) if err.is_timeout())
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_site_limit: config.per_site_concurrency.max(1),
            per_site: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_site_semaphore(&self, site_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_site.lock().await;
        map.entry(site_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_site_limit)))
            .clone()
    }

    /// GET `url`, retrying transport errors and retryable statuses. The final
    /// response is returned whatever its status.
    pub async fn fetch(
        &self,
        site_id: &str,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_site = self.per_site_semaphore(site_id).await;
        let _site = per_site.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", site_id, url);
        self.fetch_with_retries(url, timeout).instrument(span).await
    }

    /// Like [`HttpFetcher::fetch`] but treats any non-2xx final status as an error.
    pub async fn fetch_success(&self, site_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.fetch(site_id, url, None).await?;
        if resp.status.is_success() {
            Ok(resp)
        } else {
            Err(FetchError::HttpStatus {
                status: resp.status.as_u16(),
                url: resp.final_url,
            })
        }
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<FetchedResponse, FetchError> {
        let mut retries = 0usize;
        loop {
            let mut request = self.client.get(url);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let sent = request.send().await;
            let cause = match &sent {
                Ok(resp) => RetryCause::of_status(resp.status()),
                Err(err) => RetryCause::of_error(err),
            };
            match (sent, cause) {
                (_, Some(cause)) if retries < self.backoff.max_retries => {
                    debug!(?cause, retries, "fetch will be retried");
                }
                (Ok(resp), _) => return FetchedResponse::read(resp).await,
                (Err(err), _) => return Err(FetchError::Request(err)),
            }
            tokio::time::sleep(self.backoff.delay_before_retry(retries)).await;
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn hashing_is_stable() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn screenshots_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let captured_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_screenshot("example.com", captured_at, b"\x89PNG same")
            .await
            .expect("first store");
        let second = store
            .store_screenshot("example.com", captured_at, b"\x89PNG same")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("example.com/20260224"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn artifact_paths_never_escape_the_root() {
        let store = ArtifactStore::new("/tmp/artifacts");
        let path = store.artifact_relative_path("../etc", Utc::now(), "abc", ".png");
        assert!(!path.to_string_lossy().contains(".."));
        assert!(path.to_string_lossy().ends_with("abc.png"));
    }

    #[test]
    fn retry_delay_doubles_until_the_ceiling() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(40),
            max_delay: Duration::from_millis(200),
        };
        let delays: Vec<u128> = (0..5).map(|r| policy.delay_before_retry(r).as_millis()).collect();
        assert_eq!(delays, [40, 80, 160, 200, 200]);
        assert_eq!(policy.delay_before_retry(usize::MAX), Duration::from_millis(200));
        assert_eq!(BackoffPolicy::none().max_retries, 0);
    }

    #[test]
    fn throttling_and_server_errors_are_retry_causes() {
        assert_eq!(RetryCause::of_status(StatusCode::TOO_MANY_REQUESTS), Some(RetryCause::Throttled));
        assert_eq!(RetryCause::of_status(StatusCode::SERVICE_UNAVAILABLE), Some(RetryCause::ServerError));
        assert_eq!(RetryCause::of_status(StatusCode::NOT_FOUND), None);
        assert_eq!(RetryCause::of_status(StatusCode::OK), None);
    }
}
