use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::arbiter::ViewportArbiter;
use crate::cdp::{CdpClient, CdpConfig, CdpError, CdpSession};
use crate::detect::NoticeDetector;
use crate::page::PageSession;
use crate::result::PageResult;
use crate::rules::RuleOracle;
use crate::screenshot::{ScreenshotSink, persist_screenshots};

/// Errors establishing or using the browser connection.
#[derive(Debug)]
pub enum BrowserError {
    /// The debugger endpoint URL could not be parsed.
    Endpoint(String),
    /// The `/json/version` probe failed.
    Discovery(String),
    /// The version payload was not understood.
    Parse(String),
    /// Error on the CDP connection itself.
    Cdp(CdpError),
}

impl fmt::Display for BrowserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Endpoint(msg) => write!(f, "invalid debugger endpoint: {msg}"),
            Self::Discovery(msg) => write!(f, "browser discovery failed: {msg}"),
            Self::Parse(msg) => write!(f, "invalid version payload: {msg}"),
            Self::Cdp(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for BrowserError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cdp(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CdpError> for BrowserError {
    fn from(e: CdpError) -> Self {
        Self::Cdp(e)
    }
}

/// Version information served at `/json/version`.
#[derive(Debug, Deserialize)]
pub struct BrowserVersion {
    /// Browser name and version (e.g. `Chrome/120.0.6099.71`).
    #[serde(rename = "Browser")]
    pub browser: String,
    /// Browser-level WebSocket debugger URL.
    #[serde(rename = "webSocketDebuggerUrl")]
    pub ws_debugger_url: String,
}

/// One attached tab: the session plus the target it is bound to.
pub struct Tab {
    pub session: CdpSession,
    pub target_id: String,
}

/// The long-lived connection to one headful browser.
///
/// Creates and destroys tabs on demand; tab creation runs under the
/// arbiter's tab turn so it never interleaves with a screenshot critical
/// section. Shared across all crawl workers via `Arc`.
pub struct BrowserSession {
    client: CdpClient,
    arbiter: ViewportArbiter,
}

impl BrowserSession {
    /// Discover the WebSocket debugger URL behind an HTTP endpoint (default
    /// `http://127.0.0.1:9222`) and connect to it.
    ///
    /// # Errors
    ///
    /// Returns `BrowserError::Endpoint` for a malformed endpoint,
    /// `Discovery`/`Parse` when the version probe fails, or the CDP
    /// connection error.
    pub async fn connect(endpoint: &str, config: CdpConfig) -> Result<Self, BrowserError> {
        let (host, port) = parse_endpoint(endpoint)?;
        let version = query_version(&host, port).await?;
        info!("connected to {} at {endpoint}", version.browser);

        let client = CdpClient::connect(&version.ws_debugger_url, config).await?;
        Ok(Self {
            client,
            arbiter: ViewportArbiter::new(),
        })
    }

    /// The process-wide viewport arbiter.
    #[must_use]
    pub fn arbiter(&self) -> &ViewportArbiter {
        &self.arbiter
    }

    /// Create a blank tab and attach a session to it.
    ///
    /// # Errors
    ///
    /// Returns the wire error if target creation or attachment fails.
    pub async fn new_tab(&self) -> Result<Tab, CdpError> {
        let _turn = self.arbiter.tab_turn().await;
        let reply = self
            .client
            .call(
                "Target.createTarget",
                Some(json!({ "url": "about:blank" })),
            )
            .await?;
        let target_id = reply["targetId"]
            .as_str()
            .ok_or_else(|| {
                CdpError::InvalidResponse("Target.createTarget reply missing targetId".into())
            })?
            .to_owned();
        let session = self.client.attach(&target_id).await?;
        Ok(Tab { session, target_id })
    }

    /// Close a tab by target id.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the close call fails.
    pub async fn close_tab(&self, target_id: &str) -> Result<(), CdpError> {
        self.client
            .call("Target.closeTarget", Some(json!({ "targetId": target_id })))
            .await?;
        Ok(())
    }

    /// Visit one page and run notice detection on it.
    ///
    /// CDP errors are terminal for the page, never for the run: they are
    /// folded into the result's failure record and the tab is still torn
    /// down. Only screenshot-sink write errors propagate — those are fatal
    /// to the whole process.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when persisting screenshots fails.
    pub async fn crawl_page(
        &self,
        rules: &RuleOracle,
        sink: &ScreenshotSink,
        mut result: PageResult,
    ) -> std::io::Result<PageResult> {
        if result.hostname.is_none() {
            result.set_failed("invalid url", None);
            return Ok(result);
        }

        let tab = match self.new_tab().await {
            Ok(tab) => tab,
            Err(e) => {
                result.set_failed(classify(&e), Some(e.to_string()));
                return Ok(result);
            }
        };
        let target_id = tab.target_id.clone();
        let mut page = PageSession::new(tab, result);

        let outcome = async {
            page.open().await?;
            NoticeDetector::new(&page, rules, &self.arbiter)
                .detect()
                .await
        }
        .await;

        let persist = match outcome {
            Ok(()) => persist_screenshots(&page, sink),
            Err(e) => {
                page.with_result(|result| result.set_failed(classify(&e), Some(e.to_string())));
                Ok(())
            }
        };

        page.close().await;
        if let Err(e) = self.close_tab(&target_id).await {
            warn!("closing tab {target_id} failed: {e}");
        }
        persist?;

        Ok(page.into_result())
    }
}

fn classify(error: &CdpError) -> &'static str {
    if error.is_timeout() {
        "timeout"
    } else {
        "call_method"
    }
}

fn parse_endpoint(endpoint: &str) -> Result<(String, u16), BrowserError> {
    let url = Url::parse(endpoint).map_err(|e| BrowserError::Endpoint(e.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| BrowserError::Endpoint(format!("no host in `{endpoint}`")))?
        .to_owned();
    let port = url.port_or_known_default().unwrap_or(9222);
    Ok((host, port))
}

/// Query the debugger's `/json/version` endpoint.
async fn query_version(host: &str, port: u16) -> Result<BrowserVersion, BrowserError> {
    let body = http_get(host, port, "/json/version").await?;
    serde_json::from_str(&body).map_err(|e| BrowserError::Parse(e.to_string()))
}

/// Minimal HTTP GET over a plain TCP stream, run on the blocking pool.
///
/// The debugger's HTTP server keeps connections open, so reads stop as
/// soon as `Content-Length` bytes of body have arrived rather than waiting
/// for EOF.
async fn http_get(host: &str, port: u16, path: &str) -> Result<String, BrowserError> {
    let addr = format!("{host}:{port}");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");

    tokio::task::spawn_blocking(move || {
        let socket_addr = addr
            .parse()
            .map_err(|e| BrowserError::Endpoint(format!("invalid address {addr}: {e}")))?;
        let mut stream = TcpStream::connect_timeout(&socket_addr, Duration::from_secs(2))
            .map_err(|e| BrowserError::Discovery(format!("connect to {addr} failed: {e}")))?;
        stream.set_read_timeout(Some(Duration::from_secs(5))).ok();

        stream
            .write_all(request.as_bytes())
            .map_err(|e| BrowserError::Discovery(format!("write failed: {e}")))?;

        let mut buf = Vec::with_capacity(4096);
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if response_is_complete(&buf) {
                        break;
                    }
                }
                Err(e) => {
                    if response_is_complete(&buf) {
                        break;
                    }
                    return Err(BrowserError::Discovery(format!("read failed: {e}")));
                }
            }
        }

        parse_http_response(&buf)
    })
    .await
    .map_err(|e| BrowserError::Discovery(format!("blocking task failed: {e}")))?
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn content_length(headers: &str) -> Option<usize> {
    headers.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim()
            .eq_ignore_ascii_case("content-length")
            .then(|| value.trim().parse().ok())?
    })
}

fn response_is_complete(buf: &[u8]) -> bool {
    let Some(end) = header_end(buf) else {
        return false;
    };
    let Ok(headers) = std::str::from_utf8(&buf[..end]) else {
        return false;
    };
    match content_length(headers) {
        Some(len) => buf.len() >= end + 4 + len,
        None => true,
    }
}

fn parse_http_response(buf: &[u8]) -> Result<String, BrowserError> {
    let end = header_end(buf)
        .ok_or_else(|| BrowserError::Discovery("malformed HTTP response".into()))?;
    let headers = std::str::from_utf8(&buf[..end])
        .map_err(|e| BrowserError::Discovery(format!("invalid UTF-8 in headers: {e}")))?;

    let status_line = headers
        .lines()
        .next()
        .ok_or_else(|| BrowserError::Discovery("empty response".into()))?;
    if !status_line.contains(" 200 ") {
        return Err(BrowserError::Discovery(format!(
            "unexpected HTTP status: {status_line}"
        )));
    }

    let body_start = end + 4;
    let body = match content_length(headers) {
        Some(len) => &buf[body_start..(body_start + len).min(buf.len())],
        None => &buf[body_start..],
    };
    String::from_utf8(body.to_vec())
        .map_err(|e| BrowserError::Discovery(format!("invalid UTF-8 in body: {e}")))
}
