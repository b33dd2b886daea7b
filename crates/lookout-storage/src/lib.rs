//! Atomic JSON state files, the last-seen change store, and HTTP fetch utilities.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use lookout_core::RawItem;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lookout-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("storage key {0:?} must be a relative path without `..`")]
    InvalidKey(PathBuf),
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Reads and decodes a JSON file. A missing file is `Ok(None)`.
pub async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(StorageError::io(path, err)),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|source| StorageError::Json {
            path: path.to_path_buf(),
            source,
        })
}

/// Replaces `path` with the pretty-printed JSON of `value` via temp file + rename,
/// so readers see either the old or the new document.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .map_err(|e| StorageError::io(&parent, e))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let written = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<(), std::io::Error>(())
    }
    .await;

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StorageError::io(&temp_path, err));
    }

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(StorageError::io(path, err))
        }
    }
}

/// One JSON document on disk holding a whole `T`.
#[derive(Debug, Clone)]
pub struct JsonStateFile<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> JsonStateFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: std::marker::PhantomData,
        }
    }

    pub async fn load(&self) -> Result<Option<T>, StorageError> {
        read_json_file(&self.path).await
    }

    /// Unreadable or corrupt files start over from `T::default()`.
    pub async fn load_or_default(&self) -> T {
        match self.load().await {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!(path = %self.path.display(), "state file absent, starting empty");
                T::default()
            }
            Err(err) => {
                warn!(error = %err, "state file unreadable, starting empty");
                T::default()
            }
        }
    }

    pub async fn save(&self, value: &T) -> Result<(), StorageError> {
        write_json_atomic(&self.path, value).await
    }
}

/// Result of comparing a candidate against the last-seen item of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Novelty {
    /// Nothing stored yet; storing it is first-run initialization.
    FirstSeen,
    Changed,
    Unchanged,
}

impl Novelty {
    pub fn is_new(self) -> bool {
        !matches!(self, Novelty::Unchanged)
    }
}

/// Title equality wins over id equality; an item carrying neither key is always new.
pub fn novelty(prior: Option<&RawItem>, candidate: &RawItem) -> Novelty {
    let Some(prior) = prior else {
        return Novelty::FirstSeen;
    };
    if let Some(title) = prior.get("title") {
        if candidate.get("title") == Some(title) {
            return Novelty::Unchanged;
        }
    }
    if let Some(id) = prior.get("id") {
        if candidate.get("id") == Some(id) {
            return Novelty::Unchanged;
        }
    }
    Novelty::Changed
}

/// Per-source "last seen item" store: one JSON file per storage key under `root`.
#[derive(Debug)]
pub struct ChangeStore {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl ChangeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, key: &Path) -> Result<PathBuf, StorageError> {
        let valid = !key.as_os_str().is_empty()
            && key
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_path_buf()));
        }
        Ok(self.root.join(key))
    }

    /// Serializes read-compare-write sequences for one key.
    pub async fn lock(&self, key: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.locks.lock().await;
            map.entry(key.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Read failures count as "no prior record".
    pub async fn load(&self, key: &Path) -> Option<RawItem> {
        let path = match self.path_for(key) {
            Ok(path) => path,
            Err(err) => {
                warn!(error = %err, "rejecting storage key");
                return None;
            }
        };
        match read_json_file::<RawItem>(&path).await {
            Ok(item) => item,
            Err(err) => {
                warn!(error = %err, "last-seen record unreadable, treating as absent");
                None
            }
        }
    }

    pub async fn check(&self, key: &Path, candidate: &RawItem) -> Novelty {
        let prior = self.load(key).await;
        novelty(prior.as_ref(), candidate)
    }

    pub async fn is_new(&self, key: &Path, candidate: &RawItem) -> bool {
        self.check(key, candidate).await.is_new()
    }

    pub async fn persist(&self, key: &Path, candidate: &RawItem) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        write_json_atomic(&path, candidate).await
    }

    /// `true` when the candidate was new and is now stored.
    pub async fn offer_if_new(&self, key: &Path, candidate: &RawItem) -> Result<bool, StorageError> {
        let _guard = self.lock(key).await;
        if !self.is_new(key, candidate).await {
            return Ok(false);
        }
        self.persist(key, candidate).await?;
        Ok(true)
    }
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
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
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid utf-8")]
    Encoding { url: String },
}

/// GET seam used by pollers, so tests can serve canned bodies.
#[async_trait]
pub trait BodyFetcher: Send + Sync {
    async fn get_bytes(&self, source: &str, url: &str) -> Result<Vec<u8>, FetchError>;

    async fn get_text(&self, source: &str, url: &str) -> Result<String, FetchError> {
        let bytes = self.get_bytes(source, url).await?;
        String::from_utf8(bytes).map_err(|_| FetchError::Encoding {
            url: url.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
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
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, source: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        // The semaphore is never closed.
        let _permit = self.global_limit.acquire().await.ok();

        let span = info_span!("http_fetch", source, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, status = status.as_u16(), "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl BodyFetcher for HttpFetcher {
    async fn get_bytes(&self, source: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetch_bytes(source, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};
    use tempfile::tempdir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item(value: JsonValue) -> RawItem {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn novelty_prefers_title_then_id() {
        let prior = item(json!({ "title": "Patch 8.01", "id": 1 }));

        assert_eq!(novelty(None, &prior), Novelty::FirstSeen);
        assert_eq!(
            novelty(Some(&prior), &item(json!({ "title": "Patch 8.01", "id": 2 }))),
            Novelty::Unchanged
        );
        assert_eq!(
            novelty(Some(&prior), &item(json!({ "title": "Patch 8.02", "id": 1 }))),
            Novelty::Unchanged
        );
        assert_eq!(
            novelty(Some(&prior), &item(json!({ "title": "Patch 8.02", "id": 2 }))),
            Novelty::Changed
        );
    }

    #[test]
    fn id_only_sources_compare_by_id() {
        let prior = item(json!({ "id": 7781, "news": "Server save" }));
        assert_eq!(
            novelty(Some(&prior), &item(json!({ "id": 7781, "news": "edited" }))),
            Novelty::Unchanged
        );
        assert_eq!(
            novelty(Some(&prior), &item(json!({ "id": 7782 }))),
            Novelty::Changed
        );
    }

    #[test]
    fn items_without_title_or_id_are_always_new() {
        let prior = item(json!({ "headline": "same" }));
        assert_eq!(
            novelty(Some(&prior), &item(json!({ "headline": "same" }))),
            Novelty::Changed
        );
    }

    #[tokio::test]
    async fn first_offer_initializes_and_repeat_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = ChangeStore::new(dir.path());
        let key = Path::new("patchnotes/r6.json");
        let candidate = item(json!({ "title": "Y8S1 notes" }));

        assert!(store.offer_if_new(key, &candidate).await.unwrap());
        assert!(dir.path().join("patchnotes/r6.json").exists());
        assert!(!store.offer_if_new(key, &candidate).await.unwrap());

        let stored = store.load(key).await.unwrap();
        assert_eq!(stored, candidate);
    }

    #[tokio::test]
    async fn changed_item_overwrites_previous() {
        let dir = tempdir().expect("tempdir");
        let store = ChangeStore::new(dir.path());
        let key = Path::new("lol.json");

        store.persist(key, &item(json!({ "title": "14.1" }))).await.unwrap();
        assert!(store.offer_if_new(key, &item(json!({ "title": "14.2" }))).await.unwrap());
        assert_eq!(
            store.load(key).await.unwrap().get("title"),
            Some(&json!("14.2"))
        );
    }

    #[tokio::test]
    async fn corrupt_state_reads_as_absent() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("tibia.json"), b"{not json").unwrap();
        let store = ChangeStore::new(dir.path());
        let key = Path::new("tibia.json");

        assert!(store.load(key).await.is_none());
        assert_eq!(
            store.check(key, &item(json!({ "id": 1 }))).await,
            Novelty::FirstSeen
        );
    }

    #[test]
    fn storage_keys_must_stay_under_root() {
        let store = ChangeStore::new("/state");
        assert!(store.path_for(Path::new("../escape.json")).is_err());
        assert!(store.path_for(Path::new("/etc/passwd")).is_err());
        assert!(store.path_for(Path::new("")).is_err());
        assert_eq!(
            store.path_for(Path::new("patchnotes/a.json")).unwrap(),
            PathBuf::from("/state/patchnotes/a.json")
        );
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("team.json");
        write_json_atomic(&path, &json!({ "Bob": { "reason": "ally" } }))
            .await
            .unwrap();
        write_json_atomic(&path, &json!({ "Bob": { "reason": "friend" } }))
            .await
            .unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["team.json".to_string()]);

        let back: JsonValue = read_json_file(&path).await.unwrap().unwrap();
        assert_eq!(back["Bob"]["reason"], "friend");
    }

    #[tokio::test]
    async fn state_file_defaults_when_missing() {
        let dir = tempdir().expect("tempdir");
        let file: JsonStateFile<HashMap<String, u32>> = JsonStateFile::new(dir.path().join("x.json"));
        assert!(file.load_or_default().await.is_empty());

        let mut value = HashMap::new();
        value.insert("a".to_string(), 1);
        file.save(&value).await.unwrap();
        assert_eq!(file.load_or_default().await, value);
    }

    #[test]
    fn default_backoff_doubles_from_half_a_second_up_to_five() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
    }

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fetcher_retries_server_errors_then_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/news"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/news"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"data":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let body = quick_fetcher()
            .get_text("tibia", &format!("{}/news", server.uri()))
            .await
            .unwrap();
        assert_eq!(body, r#"{"data":[]}"#);
    }

    #[tokio::test]
    async fn fetcher_gives_up_on_client_errors_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = quick_fetcher()
            .get_bytes("tibia", &format!("{}/missing", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
