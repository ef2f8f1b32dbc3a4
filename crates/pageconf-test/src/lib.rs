//! Helpers for testing the loader and the web server.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The cache would otherwise silently recreate a directory that
//!    is never cleaned up.
//!
//!  - When using [`ConfigServer`], hold on to it until all requests to it have been made. The
//!    server stops accepting connections when dropped.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::{self, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use reqwest::Url;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `pageconf` crates and mutes all
///    other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("pageconf_service=trace,pageconf=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Returns an address on which nothing is listening.
///
/// Requests to it fail with "connection refused".
pub fn unreachable_url() -> Url {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/pages/").parse().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns a full URL pointing to the given path.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://{}/{}", self.socket, path).parse().unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A request received by the [`ConfigServer`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub resource_id: String,
    /// The `If-None-Match` header sent by the client.
    pub if_none_match: Option<String>,
    pub headers: HeaderMap,
}

#[derive(Debug, Default)]
struct Page {
    body: Option<String>,
    etag: Option<String>,
    cache_control: Option<String>,
    status: Option<StatusCode>,
}

#[derive(Debug, Default)]
struct ServerState {
    pages: BTreeMap<String, Page>,
    delay: Duration,
    requests: Vec<RecordedRequest>,
}

type SharedState = Arc<Mutex<ServerState>>;

/// An upstream serving page configurations at `/pages/{resource_id}`.
///
/// Pages carry an ETag and honor `If-None-Match` with a `304 Not Modified`. Unknown pages are
/// answered with `404`. Individual pages can be forced to respond with any status code, and all
/// responses can be delayed.
#[derive(Debug)]
pub struct ConfigServer {
    server: Server,
    state: SharedState,
}

impl ConfigServer {
    pub fn new() -> Self {
        let state = SharedState::default();
        let router = Router::new()
            .route("/pages/:resource_id", get(serve_page))
            .with_state(state.clone());

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// The base URL of the page endpoint, resource ids are appended to it.
    pub fn url(&self) -> Url {
        self.server.url("/pages/")
    }

    /// Serves `payload` for `resource_id` with the given ETag.
    pub fn set_page(&self, resource_id: &str, payload: &serde_json::Value, etag: &str) {
        self.set_raw_page(resource_id, &payload.to_string(), Some(etag));
    }

    /// Serves an arbitrary body for `resource_id`, which need not be valid JSON.
    pub fn set_raw_page(&self, resource_id: &str, body: &str, etag: Option<&str>) {
        self.with_page(resource_id, |page| {
            page.body = Some(body.to_owned());
            page.etag = etag.map(str::to_owned);
        });
    }

    /// Stops serving `resource_id`, which results in `404`.
    pub fn remove_page(&self, resource_id: &str) {
        self.state.lock().unwrap().pages.remove(resource_id);
    }

    /// Answers every request for `resource_id` with `status` and no body.
    pub fn set_status(&self, resource_id: &str, status: u16) {
        let status = StatusCode::from_u16(status).unwrap();
        self.with_page(resource_id, |page| page.status = Some(status));
    }

    /// Reverts [`set_status`](Self::set_status).
    pub fn clear_status(&self, resource_id: &str) {
        self.with_page(resource_id, |page| page.status = None);
    }

    /// Sends a `Cache-Control` header along with `resource_id`.
    pub fn set_cache_control(&self, resource_id: &str, value: &str) {
        self.with_page(resource_id, |page| page.cache_control = Some(value.to_owned()));
    }

    /// Delays every response by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = delay;
    }

    /// Number of requests received for `resource_id`.
    pub fn hits(&self, resource_id: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .requests
            .iter()
            .filter(|r| r.resource_id == resource_id)
            .count()
    }

    /// Number of requests received in total.
    pub fn accesses(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    /// The `If-None-Match` headers received for `resource_id`, in order.
    pub fn validators(&self, resource_id: &str) -> Vec<Option<String>> {
        let state = self.state.lock().unwrap();
        state
            .requests
            .iter()
            .filter(|r| r.resource_id == resource_id)
            .map(|r| r.if_none_match.clone())
            .collect()
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    fn with_page(&self, resource_id: &str, f: impl FnOnce(&mut Page)) {
        let mut state = self.state.lock().unwrap();
        f(state.pages.entry(resource_id.to_owned()).or_default());
    }
}

impl Default for ConfigServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve_page(
    State(state): State<SharedState>,
    extract::Path(resource_id): extract::Path<String>,
    headers: HeaderMap,
) -> Response {
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let delay = {
        let mut state = state.lock().unwrap();
        state.requests.push(RecordedRequest {
            resource_id: resource_id.clone(),
            if_none_match: if_none_match.clone(),
            headers,
        });
        state.delay
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let state = state.lock().unwrap();
    let Some(page) = state.pages.get(&resource_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if let Some(status) = page.status {
        return status.into_response();
    }
    let Some(body) = &page.body else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let mut response_headers = HeaderMap::new();
    if let Some(etag) = page.etag.as_deref().and_then(|v| v.parse().ok()) {
        response_headers.insert(header::ETAG, etag);
    }
    if let Some(cache_control) = page.cache_control.as_deref().and_then(|v| v.parse().ok()) {
        response_headers.insert(header::CACHE_CONTROL, cache_control);
    }

    if page.etag.is_some() && if_none_match == page.etag {
        return (StatusCode::NOT_MODIFIED, response_headers).into_response();
    }

    response_headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    (StatusCode::OK, response_headers, body.clone()).into_response()
}
