//! Object storage, tracker persistence and HTTP fetch utilities for HKB.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use hkb_core::TrackingRecord;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hkb-storage";

/// Tracking record lives at a fixed key inside the bucket.
pub const TRACKER_KEY: &str = "diabetes-scraper/tracker.json";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Dedup fingerprint of a URL.
pub fn hash_url(url: &str) -> String {
    sha256_hex(url.as_bytes())
}

/// Dedup fingerprint of extracted body text.
pub fn hash_content(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Eight-hex-char URL hash prefix used inside object keys.
pub fn short_url_hash(url: &str) -> String {
    hash_url(url)[..8].to_string()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error for object {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid object key {0}")]
    InvalidKey(String),
}

/// Minimal object-store surface the harvester needs: whole-object reads and
/// whole-object overwrites keyed by `/`-separated string keys.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Full object bytes, or `None` when nothing exists at `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    /// Overwrite the object at `key` in full.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
}

/// Filesystem-backed object store. Keys map to paths below `root`; writes go
/// through a temp file plus rename so readers never observe partial objects.
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

    fn object_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty()
            || key.starts_with('/')
            || key.split('/').any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io {
                key: key.to_string(),
                source: err,
            }),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.object_path(key)?;
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };

        let parent = path.parent().ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(io_err(err))
            }
        }
    }
}

/// Load the tracking record, degrading to a fresh record when it is missing,
/// unreadable, or corrupt. Losing the tracker only causes redundant
/// re-scraping, so this path never fails the run.
pub async fn load_tracker(store: &dyn ObjectStore) -> TrackingRecord {
    match store.get(TRACKER_KEY).await {
        Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(key = TRACKER_KEY, error = %err, "tracker is corrupt, starting fresh");
                TrackingRecord::fresh(Utc::now())
            }
        },
        Ok(None) => TrackingRecord::fresh(Utc::now()),
        Err(err) => {
            warn!(key = TRACKER_KEY, error = %err, "tracker load failed, starting fresh");
            TrackingRecord::fresh(Utc::now())
        }
    }
}

/// Serialize and overwrite the tracking record in full. Callers treat a save
/// failure as a warning, not a run failure.
pub async fn save_tracker(store: &dyn ObjectStore, record: &TrackingRecord) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(record).context("serializing tracker")?;
    store
        .put(TRACKER_KEY, &bytes)
        .await
        .with_context(|| format!("writing tracker at {TRACKER_KEY}"))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Single-request HTTP client with the fixed identity header and bounded
/// exponential backoff on transient failures. Timeouts are per request
/// because search and document fetches carry different limits.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).timeout(timeout).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}
