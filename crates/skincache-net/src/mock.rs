//! In-memory [`Fetcher`] for tests and offline runs.
//!
//! Routes are keyed by full URL. Unrouted URLs answer 404 while online; every
//! request fails with [`NetError::Offline`] while offline. Calls are counted
//! either way so tests can assert how often the network was touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::{Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
struct MockRoute {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Scriptable in-memory fetcher.
#[derive(Debug, Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, MockRoute>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockFetcher {
    /// Create an online fetcher with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fetcher whose every request fails.
    pub fn offline() -> Self {
        let fetcher = Self::default();
        fetcher.set_online(false);
        fetcher
    }

    /// Serve `body` with `status` for `url`, replacing any previous route.
    pub fn route(&self, url: &str, status: u16, body: impl Into<Bytes>) {
        self.insert_route(url, status, HeaderMap::new(), body.into());
    }

    /// Like [`MockFetcher::route`] with a `Content-Type` header.
    pub fn route_typed(&self, url: &str, status: u16, content_type: &str, body: impl Into<Bytes>) {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(http::header::CONTENT_TYPE, value);
        }
        self.insert_route(url, status, headers, body.into());
    }

    fn insert_route(&self, url: &str, status: u16, headers: HeaderMap, body: Bytes) {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(url.to_string(), MockRoute { status, headers, body });
        }
    }

    /// Switch network availability.
    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
    }

    /// Delay every response by `delay`.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut slot) = self.delay.lock() {
            *slot = delay;
        }
    }

    /// Total number of fetches attempted.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of fetches attempted for one URL.
    pub fn calls_to(&self, url: &str) -> usize {
        self.log
            .lock()
            .map(|log| log.iter().filter(|u| u.as_str() == url).count())
            .unwrap_or(0)
    }

    fn respond(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::Offline);
        }

        let route = self
            .routes
            .lock()
            .ok()
            .and_then(|routes| routes.get(request.url.as_str()).cloned());

        let response = match route {
            Some(route) => Response::from_parts(route.status, route.headers, route.body),
            None => Response::new(StatusCode::NOT_FOUND, "Not Found"),
        };
        Ok(response.with_url(request.url.clone()))
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.log.lock() {
            log.push(request.url.to_string());
        }
        let delay = self.delay.lock().ok().and_then(|d| *d);

        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.respond(&request)
        })
    }
}
