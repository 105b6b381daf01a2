//! # skincache net
//!
//! Requests, responses and the network seam used by the skincache worker.
//!
//! ## Design Goals
//!
//! 1. **One fetch seam**: everything that talks to the network goes through
//!    the [`Fetcher`] trait, so the worker can run against a real HTTP client
//!    or an in-memory [`MockFetcher`].
//! 2. **Explicit body ownership**: a [`Response`] is not `Clone`; a caller that
//!    needs a second consumer must [`Response::tee`] it first.
//! 3. **HTTP status is data**: a 404 or 500 is a successful fetch; only
//!    transport failures are errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use skincache_common::{retry_with_backoff, RetryConfig, Retryable, TimedOut};
use thiserror::Error;
use tracing::{debug, info, trace};
pub use url::Url;

pub mod mock;
pub mod pattern;

pub use mock::MockFetcher;
pub use pattern::{PatternType, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network unavailable")]
    Offline,

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl From<TimedOut> for NetError {
    fn from(TimedOut(duration): TimedOut) -> Self {
        NetError::Timeout(duration)
    }
}

impl Retryable for NetError {
    fn is_retryable(&self) -> bool {
        match self {
            NetError::Timeout(_) | NetError::RequestFailed(_) => true,
            NetError::HttpError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            NetError::InvalidUrl(_) | NetError::InvalidMethod(_) | NetError::Offline => false,
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP request as seen by the worker.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request with the given method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse a method name and URL string into a request.
    pub fn parse(method: &str, url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| NetError::InvalidMethod(method.to_string()))?;
        Ok(Self::new(method, url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Whether this is a GET request.
    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

/// HTTP response with a fully buffered body.
#[derive(Debug)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create a response with no headers.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Create a response from its parts.
    pub fn from_parts(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url: None,
            status,
            headers,
            body,
        }
    }

    /// Add or replace a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Canonical reason phrase for the status.
    pub fn status_text(&self) -> &'static str {
        self.status.canonical_reason().unwrap_or("")
    }

    /// Get a header value as a string.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Split into two independent responses with identical status, headers
    /// and body, one for the caller and one for storage.
    pub fn tee(self) -> (Response, Response) {
        let copy = Response {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            body: Bytes::copy_from_slice(&self.body),
        };
        (self, copy)
    }

    /// Consume the response and take the body.
    pub fn bytes(self) -> Bytes {
        self.body
    }

    /// Consume the response and decode the body as UTF-8 text.
    pub fn text(self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Consume the response and decode the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// The network seam. Implementations resolve with any HTTP status and only
/// fail on transport errors.
pub trait Fetcher: Send + Sync {
    /// Perform a request.
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>>;
}

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Per-request timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Retry policy for transport failures.
    pub retry: RetryConfig,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("skincache/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
            retry: RetryConfig::none(),
        }
    }
}

/// [`Fetcher`] backed by reqwest.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new HTTP fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    async fn send(&self, request: Request) -> Result<Response, NetError> {
        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }

        let response = req_builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::from_parts(status, headers, body).with_url(url))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(async move {
            debug!(url = %request.url, method = %request.method, "Fetching resource");
            retry_with_backoff(&self.config.retry, || self.send(request.clone())).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://example.com").unwrap();
        let request = Request::get(url.clone()).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("application/json"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.is_get());
        assert!(request.headers.contains_key("accept"));
    }

    #[test]
    fn test_request_parse() {
        let request = Request::parse("post", "https://example.com/submit").unwrap();
        assert_eq!(request.method, Method::POST);
        assert!(!request.is_get());

        assert!(matches!(
            Request::parse("GET", "not a url"),
            Err(NetError::InvalidUrl(_))
        ));
        assert!(matches!(
            Request::parse("BAD METHOD", "https://example.com/"),
            Err(NetError::InvalidMethod(_))
        ));
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_response_tee_gives_two_consumers() {
        let response = Response::new(StatusCode::OK, "payload").with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain"),
        );

        let (caller, stored) = response.tee();
        assert_eq!(caller.header_str("content-type"), Some("text/plain"));
        assert_eq!(stored.header_str("content-type"), Some("text/plain"));
        assert_eq!(caller.text().unwrap(), "payload");
        assert_eq!(stored.bytes(), Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_response_status_text() {
        let response = Response::new(StatusCode::SERVICE_UNAVAILABLE, "");
        assert!(!response.ok());
        assert_eq!(response.status_text(), "Service Unavailable");
    }

    #[test]
    fn test_timeout_error_conversion() {
        let err: NetError = TimedOut(Duration::from_secs(2)).into();
        assert!(matches!(err, NetError::Timeout(d) if d == Duration::from_secs(2)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_offline_and_bad_input_are_not_retried() {
        assert!(!NetError::Offline.is_retryable());
        assert!(!NetError::InvalidUrl("x".into()).is_retryable());
        assert!(NetError::RequestFailed("reset".into()).is_retryable());
    }

    #[test]
    fn test_request_body() {
        let request = Request::parse("POST", "https://example.com/submit")
            .unwrap()
            .with_body("name=ahri");
        assert_eq!(request.body, Some(Bytes::from_static(b"name=ahri")));
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("skincache/"));
        assert_eq!(config.retry.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_http_fetcher_returns_body_and_headers() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/versions.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"["14.1.1"]"#)
                    .insert_header("content-type", "application/json"),
            )
            .mount(&mock_server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/api/versions.json", mock_server.uri())).unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();

        assert!(response.ok());
        assert_eq!(response.header_str("content-type"), Some("application/json"));
        let versions: Vec<String> = response.json().unwrap();
        assert_eq!(versions, vec!["14.1.1".to_string()]);
    }

    #[tokio::test]
    async fn test_http_fetcher_error_status_is_not_an_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let fetcher = HttpFetcher::new(LoaderConfig::default()).unwrap();
        let url = Url::parse(&format!("{}/missing", mock_server.uri())).unwrap();
        let response = fetcher.fetch(Request::get(url)).await.unwrap();

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(!response.ok());
    }

    #[tokio::test]
    async fn test_http_fetcher_connection_refused_is_error() {
        let fetcher = HttpFetcher::new(LoaderConfig {
            default_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        // Port 9 (discard) is not listening on loopback in test environments
        let url = Url::parse("http://127.0.0.1:9/").unwrap();

        assert!(fetcher.fetch(Request::get(url)).await.is_err());
    }
}
