use serde::Serialize;
use serde_json::Value;
use url::Url;

/// One observed outgoing request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub url: String,
}

/// One observed response.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseRecord {
    pub url: String,
    pub status: i64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub headers: Value,
}

/// A terminal page failure.
#[derive(Debug, Clone, Serialize)]
pub struct Failure {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

/// Cookie records captured under a label (e.g. `all`).
#[derive(Debug, Clone, Serialize)]
pub struct CookieJar {
    pub label: String,
    pub cookies: Vec<Value>,
}

/// One captured screenshot, still base64-encoded.
///
/// Kept in a vec rather than a map so insertion order survives into the
/// serialized record; the label encodes strategy and index.
#[derive(Debug, Clone, Serialize)]
pub struct Screenshot {
    pub label: String,
    /// Base64 PNG bytes as returned by `Page.captureScreenshot`. The bytes
    /// go to the screenshot sink; serialized records carry the label only.
    #[serde(skip_serializing)]
    pub data: String,
}

/// The per-page record: the sole sink for everything observed on one page.
///
/// Created by the controller before navigation; the page session's event
/// pump appends network records while the worker drives detection. Once an
/// outcome flag is set, later steps stay safe but detection returns early.
#[derive(Debug, Clone, Serialize)]
pub struct PageResult {
    /// Position in the input list (1-based).
    pub rank: usize,
    pub url: String,
    /// `Some` iff `url` parses; pages without a hostname are failed before
    /// a tab is ever opened.
    pub hostname: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(rename = "stoppedWaiting", skip_serializing_if = "Option::is_none")]
    pub stopped_waiting: Option<String>,

    pub requests: Vec<RequestRecord>,
    pub responses: Vec<ResponseRecord>,
    pub cookies: Vec<CookieJar>,
    pub screenshots: Vec<Screenshot>,

    /// Detected ISO 639-1 language code, when identification succeeded.
    pub language: Option<String>,
    /// Whether `window.__cmp` is defined on the page.
    #[serde(rename = "cmpDefined")]
    pub cmp_defined: bool,
}

impl PageResult {
    #[must_use]
    pub fn new(rank: usize, url: String) -> Self {
        let hostname = Url::parse(&url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned));
        Self {
            rank,
            url,
            hostname,
            failed: None,
            skipped: None,
            stopped_waiting: None,
            requests: Vec::new(),
            responses: Vec::new(),
            cookies: Vec::new(),
            screenshots: Vec::new(),
            language: None,
            cmp_defined: false,
        }
    }

    pub fn set_failed(&mut self, reason: impl Into<String>, cause: Option<String>) {
        self.failed = Some(Failure {
            reason: reason.into(),
            cause,
        });
    }

    pub fn set_skipped(&mut self, reason: impl Into<String>) {
        self.skipped = Some(reason.into());
    }

    pub fn set_stopped_waiting(&mut self, reason: impl Into<String>) {
        self.stopped_waiting = Some(reason.into());
    }

    pub fn add_request(&mut self, url: impl Into<String>) {
        self.requests.push(RequestRecord { url: url.into() });
    }

    pub fn add_response(&mut self, record: ResponseRecord) {
        self.responses.push(record);
    }

    pub fn set_cookies(&mut self, label: impl Into<String>, cookies: Vec<Value>) {
        self.cookies.push(CookieJar {
            label: label.into(),
            cookies,
        });
    }

    pub fn add_screenshot(&mut self, label: impl Into<String>, data: String) {
        self.screenshots.push(Screenshot {
            label: label.into(),
            data,
        });
    }

    /// Human-readable outcome lines for the progress report, one per flag.
    #[must_use]
    pub fn outcome_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(reason) = &self.stopped_waiting {
            lines.push(format!("-> stopped waiting for {reason}"));
        }
        if let Some(failure) = &self.failed {
            lines.push(format!("-> failed: {}", failure.reason));
        }
        if let Some(reason) = &self.skipped {
            lines.push(format!("-> skipped: {reason}"));
        }
        lines
    }
}
