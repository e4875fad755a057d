//! Persistent conditional HTTP cache
//!
//! One record per request signature under
//! `{dir}/{key[0..2]}/{key}/` holding `info.json` and `body.raw`. Every read
//! reverifies the body checksum. Concurrent fetches of the same signature in
//! the same mode share a single in-flight operation whose result is handed to
//! every waiter; other modes queue behind it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use super::mode::CacheMode;
use super::rate::RateLimiter;
use super::request::{checksum, CacheRequest, HttpRequest, HttpResponse};
use super::transport::Transport;
use crate::error::{Result, TsdError};
use crate::events::{FetchOutcome, ProgressEvent, Reporter};

const INFO_FILE: &str = "info.json";
const BODY_FILE: &str = "body.raw";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response headers worth keeping next to the body
const KEPT_HEADERS: &[&str] = &[
    "content-type",
    "etag",
    "last-modified",
    "cache-control",
    "date",
];

/// Metadata record stored as `info.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub key: String,
    pub method: String,
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// `sha256:<hex>` of the stored body
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
}

impl CacheInfo {
    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// A verified cache record
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub info: CacheInfo,
    pub body: Bytes,
}

impl CacheEntry {
    /// Body as UTF-8, lossy
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| TsdError::json(&self.info.url, e))
    }
}

/// What is on disk for a signature
#[derive(Debug)]
enum Stored {
    Missing,
    Valid(CacheEntry),
    Corrupt { expected: String, actual: String },
}

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry>>>;

/// Conditional HTTP cache in front of a [`Transport`]
///
/// Cheap to clone; clones share the in-flight table and the rate limiter.
#[derive(Clone)]
pub struct CacheStore {
    dir: PathBuf,
    transport: Arc<dyn Transport>,
    rate: RateLimiter,
    timeout: Duration,
    reporter: Reporter,
    in_flight: Arc<Mutex<HashMap<String, (CacheMode, SharedFetch)>>>,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, transport: Arc<dyn Transport>, rate: RateLimiter) -> Self {
        Self {
            dir: dir.into(),
            transport,
            rate,
            timeout: DEFAULT_TIMEOUT,
            reporter: Reporter::silent(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn rate(&self) -> &RateLimiter {
        &self.rate
    }

    /// Directory holding the record for `request`
    pub fn entry_dir(&self, request: &CacheRequest) -> PathBuf {
        self.entry_dir_for_key(&request.key())
    }

    fn entry_dir_for_key(&self, key: &str) -> PathBuf {
        let prefix = key.get(..2).unwrap_or(key);
        self.dir.join(prefix).join(key)
    }

    /// Fetch `request` according to `mode`
    ///
    /// Concurrent calls for the same signature and mode join the fetch
    /// already in flight. A call in another mode waits for that fetch to
    /// finish and then runs its own, so fetches of one signature stay
    /// serialized and nobody receives an answer produced under different
    /// network rules. The fetch runs on its own task, so it completes and
    /// populates the cache even when every caller has gone away.
    pub async fn fetch(&self, request: &CacheRequest, mode: CacheMode) -> Result<CacheEntry> {
        let key = request.key();

        loop {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some((running, existing)) if *running == mode => {
                    trace!("Joining in-flight fetch for {}", request.url);
                    let shared = existing.clone();
                    drop(in_flight);
                    return shared.await;
                }
                Some((running, existing)) => {
                    trace!("Waiting for {} fetch of {}", running, request.url);
                    let previous = existing.clone();
                    drop(in_flight);
                    let _ = previous.await;
                }
                None => {
                    let shared = self.spawn_fetch(key.clone(), request.clone(), mode);
                    in_flight.insert(key, (mode, shared.clone()));
                    drop(in_flight);
                    return shared.await;
                }
            }
        }
    }

    fn spawn_fetch(&self, key: String, request: CacheRequest, mode: CacheMode) -> SharedFetch {
        let url = request.url.clone();
        let store = self.clone();
        let handle = tokio::spawn(async move {
            let result = store.fetch_uncoalesced(&request, mode).await;
            // the table lock is held by the spawner until the entry is inserted
            store.in_flight.lock().await.remove(&key);
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(TsdError::Network {
                    url,
                    message: format!("fetch task failed: {e}"),
                }),
            }
        }
        .boxed()
        .shared()
    }

    async fn fetch_uncoalesced(&self, request: &CacheRequest, mode: CacheMode) -> Result<CacheEntry> {
        let stored = self.read_entry(request).await;

        match (mode, stored) {
            (CacheMode::Offline, Stored::Valid(entry)) | (CacheMode::Default, Stored::Valid(entry)) => {
                self.report(&request.url, FetchOutcome::Cached);
                Ok(entry)
            }
            (CacheMode::Offline, Stored::Missing) => Err(TsdError::CacheMiss {
                url: request.url.clone(),
            }),
            (CacheMode::Offline, Stored::Corrupt { expected, actual }) => {
                Err(TsdError::CacheCorruption {
                    url: request.url.clone(),
                    expected,
                    actual,
                })
            }
            (CacheMode::Revalidate, Stored::Valid(entry)) if entry.info.has_validators() => {
                self.revalidate(request, entry).await
            }
            (_, Stored::Corrupt { expected, actual }) => {
                warn!(
                    "Cache entry for {} failed verification ({} != {}), refetching",
                    request.url, actual, expected
                );
                self.refetch_corrupt(request).await
            }
            (_, Stored::Missing) | (_, Stored::Valid(_)) => self.download(request).await,
        }
    }

    /// Discard a corrupt record and fetch it exactly once more
    async fn refetch_corrupt(&self, request: &CacheRequest) -> Result<CacheEntry> {
        self.discard(request).await?;
        self.download(request).await?;

        match self.read_entry(request).await {
            Stored::Valid(entry) => Ok(entry),
            Stored::Corrupt { expected, actual } => Err(TsdError::CacheCorruption {
                url: request.url.clone(),
                expected,
                actual,
            }),
            Stored::Missing => Err(TsdError::CacheCorruption {
                url: request.url.clone(),
                expected: "stored entry".to_string(),
                actual: "nothing on disk after refetch".to_string(),
            }),
        }
    }

    /// Unconditional GET, replacing whatever is stored
    async fn download(&self, request: &CacheRequest) -> Result<CacheEntry> {
        let response = self.send(request, None).await?;
        if !response.is_success() {
            return Err(TsdError::HttpStatus {
                url: request.url.clone(),
                status: response.status,
            });
        }

        let entry = self.store(request, &response, None).await?;
        self.report(&request.url, FetchOutcome::Downloaded);
        Ok(entry)
    }

    /// Conditional GET with the stored validators
    async fn revalidate(&self, request: &CacheRequest, stored: CacheEntry) -> Result<CacheEntry> {
        let response = self.send(request, Some(&stored.info)).await?;

        if response.is_not_modified() {
            debug!("Not modified: {}", request.url);
            let mut info = stored.info;
            info.validated_at = Utc::now();
            if let Some(etag) = response.headers.get("etag") {
                info.etag = Some(etag.clone());
            }
            if let Some(last_modified) = response.headers.get("last-modified") {
                info.last_modified = Some(last_modified.clone());
            }
            self.write_info(&self.entry_dir_for_key(&info.key), &info)
                .await?;
            self.report(&request.url, FetchOutcome::NotModified);
            return Ok(CacheEntry {
                info,
                body: stored.body,
            });
        }

        if !response.is_success() {
            return Err(TsdError::HttpStatus {
                url: request.url.clone(),
                status: response.status,
            });
        }

        let entry = self
            .store(request, &response, Some(stored.info.created_at))
            .await?;
        self.report(&request.url, FetchOutcome::Downloaded);
        Ok(entry)
    }

    /// Send `request` without consulting the cache or a blocked quota
    ///
    /// For endpoints GitHub does not count against the quota, such as
    /// `rate_limit`. The response still updates the rate state. Nothing is
    /// stored.
    pub async fn send_uncounted(&self, request: &CacheRequest) -> Result<HttpResponse> {
        let response = self.transmit(request, None).await?;
        if !response.is_success() {
            return Err(TsdError::HttpStatus {
                url: request.url.clone(),
                status: response.status,
            });
        }
        Ok(response)
    }

    /// Issue one network call, honouring the rate limiter and the timeout
    async fn send(&self, request: &CacheRequest, conditional: Option<&CacheInfo>) -> Result<HttpResponse> {
        if self.rate.is_blocked() {
            return Err(TsdError::RateLimitBlocked {
                reset_in: self.rate.time_to_reset(),
            });
        }
        self.transmit(request, conditional).await
    }

    async fn transmit(&self, request: &CacheRequest, conditional: Option<&CacheInfo>) -> Result<HttpResponse> {
        let mut headers = request.headers.clone();
        if let Some(info) = conditional {
            if let Some(etag) = &info.etag {
                headers.insert("if-none-match".to_string(), etag.clone());
            }
            if let Some(last_modified) = &info.last_modified {
                headers.insert("if-modified-since".to_string(), last_modified.clone());
            }
        }
        let http = HttpRequest {
            url: request.url.clone(),
            headers,
        };

        trace!("{} {} via {}", request.method, request.url, self.transport.name());
        let response = match tokio::time::timeout(self.timeout, self.transport.send(&http)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(TsdError::NetworkTimeout {
                    url: request.url.clone(),
                    timeout: self.timeout,
                })
            }
        };

        self.rate.observe(&response.headers);
        if response.headers.contains_key("x-ratelimit-remaining") {
            self.reporter
                .emit(ProgressEvent::RateLimit(self.rate.snapshot()));
        }
        if matches!(response.status, 403 | 429) && self.rate.is_blocked() {
            return Err(TsdError::RateLimitBlocked {
                reset_in: self.rate.time_to_reset(),
            });
        }

        Ok(response)
    }

    async fn store(
        &self,
        request: &CacheRequest,
        response: &HttpResponse,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<CacheEntry> {
        let key = request.key();
        let dir = self.entry_dir_for_key(&key);
        let now = Utc::now();

        let headers: BTreeMap<String, String> = response
            .headers
            .iter()
            .filter(|(name, _)| KEPT_HEADERS.contains(&name.as_str()))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let info = CacheInfo {
            key,
            method: request.method.clone(),
            url: request.url.clone(),
            status: response.status,
            etag: response.headers.get("etag").cloned(),
            last_modified: response.headers.get("last-modified").cloned(),
            headers,
            checksum: checksum(&response.body),
            created_at: created_at.unwrap_or(now),
            validated_at: now,
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TsdError::io(&dir, e))?;
        // body first: info never points at a body that was not written
        write_atomic(&dir.join(BODY_FILE), &response.body).await?;
        self.write_info(&dir, &info).await?;

        debug!("Stored {} ({} bytes) as {}", info.url, response.body.len(), info.key);
        Ok(CacheEntry {
            info,
            body: response.body.clone(),
        })
    }

    async fn write_info(&self, dir: &Path, info: &CacheInfo) -> Result<()> {
        let json =
            serde_json::to_vec_pretty(info).map_err(|e| TsdError::json(INFO_FILE, e))?;
        write_atomic(&dir.join(INFO_FILE), &json).await
    }

    async fn read_entry(&self, request: &CacheRequest) -> Stored {
        let key = request.key();
        let dir = self.entry_dir_for_key(&key);

        let raw_info = match tokio::fs::read(dir.join(INFO_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Stored::Missing,
            Err(e) => {
                return Stored::Corrupt {
                    expected: "readable info.json".to_string(),
                    actual: e.to_string(),
                }
            }
        };

        let info: CacheInfo = match serde_json::from_slice(&raw_info) {
            Ok(info) => info,
            Err(e) => {
                return Stored::Corrupt {
                    expected: "valid info.json".to_string(),
                    actual: e.to_string(),
                }
            }
        };
        if info.key != key {
            return Stored::Corrupt {
                expected: key,
                actual: info.key,
            };
        }

        let body = match tokio::fs::read(dir.join(BODY_FILE)).await {
            Ok(body) => body,
            Err(e) => {
                return Stored::Corrupt {
                    expected: info.checksum,
                    actual: format!("unreadable body: {e}"),
                }
            }
        };

        let actual = checksum(&body);
        if actual != info.checksum {
            return Stored::Corrupt {
                expected: info.checksum,
                actual,
            };
        }

        Stored::Valid(CacheEntry {
            info,
            body: Bytes::from(body),
        })
    }

    async fn discard(&self, request: &CacheRequest) -> Result<()> {
        let dir = self.entry_dir(request);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TsdError::io(&dir, e)),
        }
    }

    fn report(&self, url: &str, outcome: FetchOutcome) {
        self.reporter.emit(ProgressEvent::Fetched {
            url: url.to_string(),
            outcome,
        });
    }
}

/// Write to a sibling temp file, then rename over the target
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| TsdError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| TsdError::io(path, e))
}
