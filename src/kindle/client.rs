//! Send-to-Kindle web client.
//!
//! A delivery is four requests, strictly in order:
//!
//! 1. `GET {base}/empty` for the CSRF token embedded in the page.
//! 2. `POST {base}/init` for a presigned upload URL and an `stkToken`.
//! 3. `PUT <uploadUrl>` with the file bytes.
//! 4. `POST {base}/send-v2` to trigger delivery.
//!
//! A failing step ends the delivery. Every step logs under the
//! `booky_rs::kindle` target with a `step` field.

use crate::cancel::until_cancelled;
use crate::config::KindleConfig;
use crate::error::{AppError, Result};
use crate::kindle::session::AuthSession;
use regex::Regex;
use reqwest::cookie::Jar;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

static CSRF_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"name='csrfToken'\s+value='([^']+)'").expect("valid regex"));

/// Header carrying the CSRF token.
pub const CSRF_HEADER: &str = "anti-csrftoken-a2z";

/// Longest token prefix written to logs.
const LOGGED_TOKEN_CHARS: usize = 20;

/// Outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// Whether Amazon accepted the delivery.
    pub success: bool,
    /// User-facing failure message.
    pub error_message: Option<String>,
}

impl DeliveryResult {
    /// Successful delivery.
    pub fn delivered() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    /// Failed delivery.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
        }
    }
}

/// Delivery protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStep {
    /// CSRF token acquisition.
    Csrf,
    /// Upload negotiation.
    Init,
    /// Presigned upload.
    Upload,
    /// Delivery trigger.
    Send,
}

impl fmt::Display for SendStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SendStep::Csrf => "csrf",
            SendStep::Init => "init",
            SendStep::Upload => "upload",
            SendStep::Send => "send",
        })
    }
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    fetched_at: Instant,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InitRequest<'a> {
    ext_name: &'a str,
    app_version: &'a str,
    file_size: u64,
    file_extension: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitResponse {
    #[serde(default)]
    upload_url: Option<String>,
    #[serde(default)]
    stk_token: Option<String>,
}

/// Upload target negotiated by the init step.
#[derive(Debug, Clone, PartialEq, Eq)]
struct UploadTicket {
    upload_url: String,
    stk_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest<'a> {
    ext_name: &'a str,
    ext_version: &'a str,
    input_format: &'a str,
    stk_token: &'a str,
    title: &'a str,
    data_type: &'static str,
    archive: bool,
    device_list: Vec<String>,
    file_size: u64,
    input_file_name: String,
    batch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a str>,
}

/// Client for the Send-to-Kindle web endpoints.
///
/// Holds its own cookie jar, seeded from an [`AuthSession`], and a CSRF
/// token cache. Concurrent callers share one token refresh.
pub struct KindleClient {
    http: Client,
    config: KindleConfig,
    base_url: String,
    csrf: Mutex<Option<CachedToken>>,
    csrf_ttl: Duration,
}

impl fmt::Debug for KindleClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KindleClient")
            .field("base_url", &self.base_url)
            .field("csrf_ttl", &self.csrf_ttl)
            .finish_non_exhaustive()
    }
}

impl KindleClient {
    /// Build a client carrying the session's cookies.
    pub fn new(config: &KindleConfig, session: &AuthSession) -> Result<Self> {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let cookie_url = Url::parse(&format!("{}/", base_url))
            .map_err(|e| AppError::Config(format!("Invalid Kindle base URL: {}", e)))?;

        let jar = Arc::new(Jar::default());
        for cookie in session.cookies() {
            jar.add_cookie_str(&cookie.to_set_cookie(), &cookie_url);
        }

        let mut headers = HeaderMap::new();
        headers.insert(header::ORIGIN, header_value(&config.origin)?);
        headers.insert(header::REFERER, header_value(&config.referer)?);

        let http = Client::builder()
            .user_agent(config.user_agent.as_str())
            .default_headers(headers)
            .cookie_provider(jar)
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            config: config.clone(),
            base_url,
            csrf: Mutex::new(None),
            csrf_ttl: Duration::from_secs(config.csrf_ttl_secs),
        })
    }

    /// Override the CSRF token lifetime.
    pub fn with_csrf_ttl(mut self, ttl: Duration) -> Self {
        self.csrf_ttl = ttl;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// CSRF token, from cache unless `force_refresh` or older than the TTL.
    ///
    /// A page without a token means the session has expired.
    pub async fn csrf_token(&self, force_refresh: bool, cancel: &CancellationToken) -> Result<String> {
        let mut cached = self.csrf.lock().await;

        if !force_refresh
            && let Some(token) = &*cached
            && token.fetched_at.elapsed() < self.csrf_ttl
        {
            return Ok(token.value.clone());
        }

        let token = match self.fetch_csrf_token(cancel).await {
            Ok(token) => token,
            Err(e) => {
                // A failed refresh invalidates whatever was cached.
                *cached = None;
                return Err(e);
            }
        };
        *cached = Some(CachedToken {
            value: token.clone(),
            fetched_at: Instant::now(),
        });
        Ok(token)
    }

    async fn fetch_csrf_token(&self, cancel: &CancellationToken) -> Result<String> {
        let html = until_cancelled(cancel, async {
            let response = self
                .http
                .get(self.endpoint("empty"))
                .send()
                .await
                .map_err(|e| AppError::CsrfUnavailable(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(AppError::CsrfUnavailable(format!("status {}", status)));
            }

            response
                .text()
                .await
                .map_err(|e| AppError::CsrfUnavailable(e.to_string()))
        })
        .await?;

        CSRF_PATTERN
            .captures(&html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or(AppError::SessionExpired)
    }

    /// Check the session against Amazon with a fresh token fetch.
    pub async fn verify_session(&self, cancel: &CancellationToken) -> bool {
        match self.csrf_token(true, cancel).await {
            Ok(_) => true,
            Err(e) => {
                tracing::info!(step = %SendStep::Csrf, error = %e, "Session verification failed");
                false
            }
        }
    }

    /// Deliver `path` to the Kindle library.
    pub async fn send_file(
        &self,
        path: &Path,
        title: &str,
        author: &str,
        cancel: &CancellationToken,
    ) -> DeliveryResult {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let span = tracing::info_span!("kindle_send", file = %file);

        async {
            match self.deliver(path, title, author, cancel).await {
                Ok(()) => {
                    tracing::info!(step = %SendStep::Send, "Delivery accepted");
                    DeliveryResult::delivered()
                }
                Err(e) => DeliveryResult::failed(e.user_message()),
            }
        }
        .instrument(span)
        .await
    }

    async fn deliver(
        &self,
        path: &Path,
        title: &str,
        author: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m,
            _ => {
                tracing::warn!(path = %path.display(), "File not found");
                return Err(AppError::FileNotFound(path.display().to_string()));
            }
        };
        let size = metadata.len();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();

        tracing::info!(size, extension = %extension, "Sending file");

        let token = self
            .csrf_token(false, cancel)
            .await
            .inspect_err(|e| step_failed(SendStep::Csrf, e))?;
        tracing::info!(step = %SendStep::Csrf, token = %truncate_token(&token), "Got CSRF token");

        let ticket = self
            .init(&token, size, &extension, cancel)
            .await
            .inspect_err(|e| step_failed(SendStep::Init, e))?;
        tracing::info!(step = %SendStep::Init, "Got upload URL and token");

        self.upload_with_retry(&ticket.upload_url, path, size, cancel)
            .await
            .inspect_err(|e| step_failed(SendStep::Upload, e))?;
        tracing::info!(step = %SendStep::Upload, size, "File uploaded");

        self.send(&token, &ticket.stk_token, title, author, &extension, size, cancel)
            .await
            .inspect_err(|e| step_failed(SendStep::Send, e))
    }

    async fn init(
        &self,
        token: &str,
        size: u64,
        extension: &str,
        cancel: &CancellationToken,
    ) -> Result<UploadTicket> {
        let body = InitRequest {
            ext_name: &self.config.ext_name,
            app_version: &self.config.ext_version,
            file_size: size,
            file_extension: extension,
        };

        let (status, text) = until_cancelled(cancel, async {
            let response = self
                .http
                .post(self.endpoint("init"))
                .header(CSRF_HEADER, token)
                .header(header::ACCEPT, "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::InitApi(e.to_string()))?;
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Ok::<_, AppError>((status, text))
        })
        .await?;

        if !status.is_success() {
            return Err(AppError::InitApi(status.to_string()));
        }

        parse_init_response(&text)
    }

    async fn upload_with_retry(
        &self,
        url: &str,
        path: &Path,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let retries = self.config.upload_retries;
        let mut attempt = 0u32;

        loop {
            match self.upload(url, path, size, cancel).await {
                Ok(()) => return Ok(()),
                Err(AppError::UploadFailed(reason)) if attempt < retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                    tracing::warn!(
                        step = %SendStep::Upload,
                        attempt,
                        error = %reason,
                        ?backoff,
                        "Upload failed, retrying"
                    );
                    until_cancelled(cancel, async {
                        tokio::time::sleep(backoff).await;
                        Ok::<_, AppError>(())
                    })
                    .await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn upload(&self, url: &str, path: &Path, size: u64, cancel: &CancellationToken) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let status = until_cancelled(cancel, async {
            let response = self
                .http
                .put(url)
                .header(header::CONTENT_LENGTH, size)
                .body(body)
                .send()
                .await
                .map_err(|e| AppError::UploadFailed(e.to_string()))?;
            Ok::<_, AppError>(response.status())
        })
        .await?;

        if !status.is_success() {
            return Err(AppError::UploadFailed(format!("status {}", status)));
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn send(
        &self,
        token: &str,
        stk_token: &str,
        title: &str,
        author: &str,
        extension: &str,
        size: u64,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let body = SendRequest {
            ext_name: &self.config.ext_name,
            ext_version: &self.config.ext_version,
            input_format: extension,
            stk_token,
            title,
            data_type: "file",
            archive: false,
            device_list: Vec::new(),
            file_size: size,
            input_file_name: format!("{}.{}", title, extension),
            batch_id: batch_id(),
            author: (!author.is_empty()).then_some(author),
        };

        let (status, text) = until_cancelled(cancel, async {
            let response = self
                .http
                .post(self.endpoint("send-v2"))
                .header(CSRF_HEADER, token)
                .header(header::ACCEPT, "application/json")
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::SendApi(e.to_string()))?;
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            Ok::<_, AppError>((status, text))
        })
        .await?;

        if !status.is_success() {
            return Err(AppError::SendApi(send_error_message(status.as_u16(), &text)));
        }
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| AppError::Config(format!("Invalid header value {:?}: {}", value, e)))
}

fn step_failed(step: SendStep, error: &AppError) {
    tracing::warn!(step = %step, error = %error, "Delivery step failed");
}

fn parse_init_response(text: &str) -> Result<UploadTicket> {
    let response: InitResponse = serde_json::from_str(text).map_err(|e| {
        AppError::InvalidInitResponse(format!("Failed to parse init response: {}", e))
    })?;

    match (response.upload_url, response.stk_token) {
        (Some(upload_url), Some(stk_token)) if !upload_url.is_empty() && !stk_token.is_empty() => {
            Ok(UploadTicket {
                upload_url,
                stk_token,
            })
        }
        _ => Err(AppError::InvalidInitResponse(
            "missing uploadUrl or stkToken".to_string(),
        )),
    }
}

/// Error text for a rejected send. HTML error pages are replaced by the status.
fn send_error_message(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() || body.to_lowercase().contains("<html") {
        format!("Amazon returned error {}", status)
    } else {
        body.to_string()
    }
}

/// 16 hex chars of a fresh random id.
fn batch_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

fn truncate_token(token: &str) -> String {
    let prefix: String = token.chars().take(LOGGED_TOKEN_CHARS).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csrf_pattern() {
        let html = "<form><input type='hidden' name='csrfToken'   value='abc+/=123' /></form>";
        let token = CSRF_PATTERN.captures(html).and_then(|c| c.get(1)).unwrap();
        assert_eq!(token.as_str(), "abc+/=123");
        assert!(CSRF_PATTERN.captures("<input name=\"csrfToken\" value=\"x\">").is_none());
    }

    #[test]
    fn test_parse_init_response() {
        let ticket =
            parse_init_response(r#"{"uploadUrl":"https://s3/put","stkToken":"stk","extra":1}"#)
                .unwrap();
        assert_eq!(ticket.upload_url, "https://s3/put");
        assert_eq!(ticket.stk_token, "stk");

        assert!(matches!(
            parse_init_response(r#"{"uploadUrl":"https://s3/put","stkToken":""}"#),
            Err(AppError::InvalidInitResponse(_))
        ));
        assert!(matches!(
            parse_init_response(r#"{"uploadUrl":"https://s3/put"}"#),
            Err(AppError::InvalidInitResponse(_))
        ));
        assert!(matches!(
            parse_init_response("<html>"),
            Err(AppError::InvalidInitResponse(_))
        ));
    }

    #[test]
    fn test_send_error_message() {
        assert_eq!(
            send_error_message(503, "<!DOCTYPE html><HTML><body>oops</body></HTML>"),
            "Amazon returned error 503"
        );
        assert_eq!(send_error_message(400, r#"{"error":"bad"}"#), r#"{"error":"bad"}"#);
        assert_eq!(send_error_message(500, "  "), "Amazon returned error 500");
    }

    #[test]
    fn test_send_body_shape() {
        let body = SendRequest {
            ext_name: "chrome_ocs",
            ext_version: "2.1.1.7",
            input_format: "epub",
            stk_token: "stk",
            title: "Dune",
            data_type: "file",
            archive: false,
            device_list: Vec::new(),
            file_size: 42,
            input_file_name: "Dune.epub".to_string(),
            batch_id: batch_id(),
            author: None,
        };
        let json = serde_json::to_value(&body).unwrap();

        assert_eq!(json["extName"], "chrome_ocs");
        assert_eq!(json["inputFileName"], "Dune.epub");
        assert_eq!(json["dataType"], "file");
        assert_eq!(json["archive"], false);
        assert_eq!(json["deviceList"], serde_json::json!([]));
        assert_eq!(json["batchId"].as_str().unwrap().len(), 16);
        assert!(json.get("author").is_none());
    }

    #[test]
    fn test_truncate_token() {
        assert_eq!(truncate_token("short"), "short...");
        assert_eq!(
            truncate_token("0123456789abcdefghijKLMNOP"),
            "0123456789abcdefghij..."
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let config = KindleConfig {
            base_url: "not a url".to_string(),
            ..KindleConfig::default()
        };
        assert!(matches!(
            KindleClient::new(&config, &AuthSession::default()),
            Err(AppError::Config(_))
        ));
    }
}
