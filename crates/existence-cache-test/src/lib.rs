//! Helpers for testing the existence cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests that do not need real HTTP should use [`MockProbe`] and run with a paused clock
//!    (`#[tokio::test(start_paused = true)]`), so that TTLs and backoffs elapse instantly.
//!
//!  - When using [`OriginServer`], make sure that the server is held until all requests to
//!    it have been made. Dropping it stops serving, and later probes fail with a transport
//!    error.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Query, State};
use axum::routing::get;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use existence_cache::config::Config;
use existence_cache::probe::{ProbeClient, ProbeError};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `existence_cache` crate and mutes
///    all other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("existence_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The configuration used by tests.
///
/// Same as the defaults, except that indeterminate answers are only retried five times.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.retry.max_attempts = NonZeroUsize::new(5);
    config
}

/// Creates a display URL builder that does not depend on any origin.
pub fn display_urls() -> impl Fn(&str, u64) -> String + Send + Sync + 'static {
    |identifier: &str, marker: u64| format!("/icons/{identifier}?timestamp={marker}")
}

type Scripted = Result<StatusCode, ProbeError>;

#[derive(Debug, Default)]
struct MockState {
    responses: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
}

/// A [`ProbeClient`] with scripted answers.
///
/// Each identifier answers with its scripted results in order. The last one is repeated
/// forever, and identifiers without a script answer `404 Not Found`.
///
/// Clones share their scripts and call counts.
#[derive(Clone, Debug, Default)]
pub struct MockProbe {
    state: Arc<MockState>,
}

impl MockProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every answer by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.state.delay.lock().unwrap() = delay;
        self
    }

    /// Scripts the status codes `identifier` answers with, replacing any previous script.
    pub fn respond(&self, identifier: &str, statuses: impl IntoIterator<Item = u16>) {
        self.respond_with(
            identifier,
            statuses
                .into_iter()
                .map(|status| Ok(StatusCode::from_u16(status).unwrap())),
        );
    }

    /// Scripts raw results, including errors, for `identifier`.
    pub fn respond_with(&self, identifier: &str, results: impl IntoIterator<Item = Scripted>) {
        let results: VecDeque<_> = results.into_iter().collect();
        assert!(!results.is_empty(), "empty script for {identifier}");
        self.state
            .responses
            .lock()
            .unwrap()
            .insert(identifier.to_owned(), results);
    }

    /// Number of probes issued for `identifier` so far.
    pub fn calls(&self, identifier: &str) -> usize {
        let calls = self.state.calls.lock().unwrap();
        calls.get(identifier).copied().unwrap_or_default()
    }

    /// Number of probes issued for all identifiers so far.
    pub fn total_calls(&self) -> usize {
        self.state.calls.lock().unwrap().values().sum()
    }

    fn next_result(&self, identifier: &str) -> Scripted {
        let mut responses = self.state.responses.lock().unwrap();
        match responses.get_mut(identifier) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap(),
            Some(script) => script.front().cloned().unwrap(),
            None => Ok(StatusCode::NOT_FOUND),
        }
    }
}

#[async_trait]
impl ProbeClient for MockProbe {
    async fn probe(
        &self,
        identifier: &str,
        _cancel: &CancellationToken,
    ) -> Result<StatusCode, ProbeError> {
        *self
            .state
            .calls
            .lock()
            .unwrap()
            .entry(identifier.to_owned())
            .or_default() += 1;

        let result = self.next_result(identifier);
        let delay = *self.state.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
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

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses the loopback address rather than `localhost`, as the server only binds
    /// IPv4.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Returns the URL of a local port that nobody listens on.
///
/// Connections to it are refused right away.
pub fn unreachable_origin() -> Url {
    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/").parse().unwrap()
}

#[derive(Clone, Debug, Default)]
struct OriginState {
    scripts: Arc<Mutex<HashMap<String, VecDeque<StatusCode>>>>,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

#[derive(Debug, Deserialize)]
struct CheckQuery {
    asset_id: String,
}

async fn check_icon(
    State(state): State<OriginState>,
    Query(query): Query<CheckQuery>,
) -> StatusCode {
    *state
        .hits
        .lock()
        .unwrap()
        .entry(query.asset_id.clone())
        .or_default() += 1;

    let mut scripts = state.scripts.lock().unwrap();
    match scripts.get_mut(&query.asset_id) {
        Some(script) if script.len() > 1 => script.pop_front().unwrap(),
        Some(script) => script.front().copied().unwrap(),
        None => StatusCode::NOT_FOUND,
    }
}

/// An icon origin answering `/assets/icon/check` with scripted status codes.
///
/// Scripts work like the ones of [`MockProbe`]: the last status repeats, and unknown assets
/// answer `404 Not Found`.
pub struct OriginServer {
    server: Server,
    state: OriginState,
}

impl OriginServer {
    pub fn new() -> Self {
        let state = OriginState::default();
        let router = Router::new()
            .route("/assets/icon/check", get(check_icon))
            .with_state(state.clone());

        Self {
            server: Server::with_router(router),
            state,
        }
    }

    /// Scripts the status codes returned for `asset_id`.
    pub fn respond(&self, asset_id: &str, statuses: impl IntoIterator<Item = u16>) {
        let statuses = statuses
            .into_iter()
            .map(|status| StatusCode::from_u16(status).unwrap())
            .collect();
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(asset_id.to_owned(), statuses);
    }

    /// Number of checks received for `asset_id`.
    pub fn hits(&self, asset_id: &str) -> usize {
        let hits = self.state.hits.lock().unwrap();
        hits.get(asset_id).copied().unwrap_or_default()
    }

    /// The base URL to configure as origin.
    pub fn url(&self) -> Url {
        self.server.url("/")
    }
}

impl Default for OriginServer {
    fn default() -> Self {
        Self::new()
    }
}
