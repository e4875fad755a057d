//! HTTP transport abstraction
//!
//! The cache talks to the network only through [`Transport`], so the real
//! reqwest client can be swapped for a scripted stub in tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, trace};

use super::request::{HttpRequest, HttpResponse};
use crate::error::{Result, TsdError};

/// Something that can perform a GET
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request and return whatever status the server answered with
    ///
    /// Only transport failures are errors; status handling belongs to the caller.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;

    /// Transport identifier for logging
    fn name(&self) -> &'static str;
}

/// reqwest-backed transport
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
    /// Added to every request, never part of the cache signature
    extra_headers: Vec<(String, String)>,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .build()
            .map_err(|e| TsdError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            extra_headers: Vec::new(),
        })
    }

    /// Authenticate API calls with a GitHub token
    pub fn with_token(mut self, token: Option<&str>) -> Self {
        self.extra_headers.retain(|(name, _)| name != "authorization");
        if let Some(token) = token {
            self.extra_headers
                .push(("authorization".to_string(), format!("token {token}")));
        }
        self
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in request.headers.iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in &self.extra_headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        debug!("GET {}", request.url);

        let response = builder
            .send()
            .await
            .map_err(|e| map_error(&request.url, self.timeout, e))?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| map_error(&request.url, self.timeout, e))?;

        trace!("{} -> HTTP {} ({} bytes)", request.url, status, body.len());

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn name(&self) -> &'static str {
        "reqwest"
    }
}

fn map_error(url: &str, timeout: Duration, err: reqwest::Error) -> TsdError {
    if err.is_timeout() {
        TsdError::NetworkTimeout {
            url: url.to_string(),
            timeout,
        }
    } else {
        TsdError::Network {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Scripted transport for tests and offline replay
///
/// Responses are queued per URL and consumed in order; the last queued
/// response for a URL is repeated once the queue runs dry.
#[derive(Default)]
pub struct StubTransport {
    routes: Mutex<HashMap<String, Vec<StubReply>>>,
    requests: Mutex<Vec<HttpRequest>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

#[derive(Clone)]
enum StubReply {
    Response(HttpResponse),
    Error(TsdError),
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every reply, to widen concurrency windows
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn respond(&self, url: &str, status: u16, headers: &[(&str, &str)], body: &[u8]) {
        let response = HttpResponse {
            status,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                .collect(),
            body: Bytes::copy_from_slice(body),
        };
        self.push(url, StubReply::Response(response));
    }

    pub fn ok(&self, url: &str, body: &[u8]) {
        self.respond(url, 200, &[], body);
    }

    pub fn fail(&self, url: &str, error: TsdError) {
        self.push(url, StubReply::Error(error));
    }

    /// Total number of requests sent
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of requests sent to one URL
    pub fn calls_to(&self, url: &str) -> usize {
        self.lock_requests().iter().filter(|r| r.url == url).count()
    }

    /// Every request sent, in order
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.lock_requests().clone()
    }

    fn push(&self, url: &str, reply: StubReply) {
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(url.to_string())
            .or_default()
            .push(reply);
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, Vec<HttpRequest>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_reply(&self, url: &str) -> Option<StubReply> {
        let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
        let queue = routes.get_mut(url)?;
        if queue.len() > 1 {
            Some(queue.remove(0))
        } else {
            queue.first().cloned()
        }
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.lock_requests().push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_reply(&request.url) {
            Some(StubReply::Response(response)) => Ok(response),
            Some(StubReply::Error(error)) => Err(error),
            None => Ok(HttpResponse {
                status: 404,
                headers: BTreeMap::new(),
                body: Bytes::new(),
            }),
        }
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> HttpRequest {
        HttpRequest {
            url: url.to_string(),
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_stub_replays_in_order_then_repeats_last() {
        let stub = StubTransport::new();
        stub.ok("https://x/a", b"one");
        stub.ok("https://x/a", b"two");

        let first = stub.send(&request("https://x/a")).await.unwrap();
        let second = stub.send(&request("https://x/a")).await.unwrap();
        let third = stub.send(&request("https://x/a")).await.unwrap();

        assert_eq!(&first.body[..], b"one");
        assert_eq!(&second.body[..], b"two");
        assert_eq!(&third.body[..], b"two");
        assert_eq!(stub.calls(), 3);
        assert_eq!(stub.calls_to("https://x/a"), 3);
    }

    #[tokio::test]
    async fn test_stub_unknown_url_is_404() {
        let stub = StubTransport::new();
        let response = stub.send(&request("https://x/missing")).await.unwrap();
        assert_eq!(response.status, 404);
    }

    #[test]
    fn test_token_header_is_replaced() {
        let transport = ReqwestTransport::new("tsd-test", Duration::from_secs(5))
            .unwrap()
            .with_token(Some("abc"))
            .with_token(Some("def"));
        assert_eq!(
            transport.extra_headers,
            vec![("authorization".to_string(), "token def".to_string())]
        );
    }
}
