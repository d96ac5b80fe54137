//! Shared test fixtures: shell script helpers and a local Send-to-Kindle mock.

use crate::config::KindleConfig;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

#[cfg(unix)]
use std::path::{Path, PathBuf};

/// Write an executable `/bin/sh` script.
#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A stand-in for mobitool.
///
/// `-s FILE` dumps one HTML part and a cover next to FILE, unless FILE
/// contains `FAIL` (exit 1, "corrupt input" on stderr) or `SLEEP` (hangs).
/// Without a flag it prints fixed metadata.
#[cfg(unix)]
pub(crate) fn fake_mobitool(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "mobitool",
        r#"if [ "$1" = "-s" ]; then
  file="$2"
  if grep -q FAIL "$file"; then echo "corrupt input" >&2; exit 1; fi
  if grep -q SLEEP "$file"; then exec sleep 10; fi
  out="${file%.*}_markup"
  mkdir -p "$out"
  printf '<html><body><p>Hello</p><img src="cover.jpg"></body></html>' > "$out/part0000.html"
  printf 'JPEGDATA' > "$out/cover.jpg"
  exit 0
fi
if grep -q FAIL "$1"; then echo "corrupt input" >&2; exit 1; fi
echo "Title: Fake Title"
echo "Author: Fake Author""#,
    )
}

/// Behavior switches and recorded traffic of [`MockKindle`].
#[derive(Debug, Default)]
pub(crate) struct MockState {
    base_url: String,

    pub csrf_calls: AtomicUsize,
    pub init_calls: AtomicUsize,
    pub upload_calls: AtomicUsize,
    pub send_calls: AtomicUsize,

    /// Serve a page without a CSRF token.
    pub no_token: AtomicBool,
    /// Status for `/empty`, 0 for 200.
    pub csrf_status: AtomicU16,
    /// Status for `/init`, 0 for 200.
    pub init_status: AtomicU16,
    /// Answer `/init` with an empty upload URL.
    pub bad_init: AtomicBool,
    /// Number of uploads to reject before accepting.
    pub upload_failures: AtomicUsize,
    /// Reject `/send-v2` with an HTML page.
    pub send_html_error: AtomicBool,

    pub csrf_header: Mutex<Option<String>>,
    pub cookie_header: Mutex<Option<String>>,
    pub init_body: Mutex<Option<serde_json::Value>>,
    pub send_body: Mutex<Option<serde_json::Value>>,
    pub uploaded: Mutex<Vec<u8>>,
}

impl MockState {
    fn count(&self, counter: &AtomicUsize) -> usize {
        counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn record_headers(&self, headers: &HeaderMap) {
        if let Some(token) = header_string(headers, crate::kindle::client::CSRF_HEADER) {
            *self.csrf_header.lock() = Some(token);
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn status_override(code: &AtomicU16) -> Option<StatusCode> {
    match code.load(Ordering::SeqCst) {
        0 => None,
        n => Some(StatusCode::from_u16(n).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}

/// Local HTTP server speaking the four delivery endpoints.
pub(crate) struct MockKindle {
    pub base_url: String,
    pub state: Arc<MockState>,
}

impl MockKindle {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());

        let state = Arc::new(MockState {
            base_url: base_url.clone(),
            ..Default::default()
        });

        let app = Router::new()
            .route("/empty", get(empty))
            .route("/init", post(init))
            .route("/upload", put(upload))
            .route("/send-v2", post(send))
            .with_state(state.clone());

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, state }
    }

    /// Client configuration pointing at this server.
    pub fn config(&self) -> KindleConfig {
        KindleConfig {
            base_url: self.base_url.clone(),
            request_timeout_secs: 5,
            ..KindleConfig::default()
        }
    }
}

async fn empty(State(state): State<Arc<MockState>>, headers: HeaderMap) -> (StatusCode, String) {
    let n = state.count(&state.csrf_calls);
    *state.cookie_header.lock() = header_string(&headers, "cookie");

    if let Some(status) = status_override(&state.csrf_status) {
        return (status, "unavailable".to_string());
    }
    if state.no_token.load(Ordering::SeqCst) {
        return (StatusCode::OK, "<html><body>Sign in</body></html>".to_string());
    }

    (
        StatusCode::OK,
        format!(
            "<html><form><input type='hidden' name='csrfToken' value='tok-{}' /></form></html>",
            n
        ),
    )
}

async fn init(State(state): State<Arc<MockState>>, headers: HeaderMap, body: Bytes) -> (StatusCode, String) {
    state.count(&state.init_calls);
    state.record_headers(&headers);
    *state.init_body.lock() = serde_json::from_slice(&body).ok();

    if let Some(status) = status_override(&state.init_status) {
        return (status, "init failed".to_string());
    }
    if state.bad_init.load(Ordering::SeqCst) {
        return (StatusCode::OK, r#"{"uploadUrl":"","stkToken":"stk-1"}"#.to_string());
    }

    let response = serde_json::json!({
        "uploadUrl": format!("{}/upload", state.base_url),
        "stkToken": "stk-1",
    });
    (StatusCode::OK, response.to_string())
}

async fn upload(State(state): State<Arc<MockState>>, body: Bytes) -> StatusCode {
    state.count(&state.upload_calls);

    let rejected = state
        .upload_failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if rejected {
        return StatusCode::SERVICE_UNAVAILABLE;
    }

    *state.uploaded.lock() = body.to_vec();
    StatusCode::OK
}

async fn send(State(state): State<Arc<MockState>>, headers: HeaderMap, body: Bytes) -> (StatusCode, String) {
    state.count(&state.send_calls);
    state.record_headers(&headers);
    *state.send_body.lock() = serde_json::from_slice(&body).ok();

    if state.send_html_error.load(Ordering::SeqCst) {
        return (
            StatusCode::BAD_REQUEST,
            "<html><body>Something went wrong</body></html>".to_string(),
        );
    }
    (StatusCode::OK, r#"{"statusCode":0}"#.to_string())
}
