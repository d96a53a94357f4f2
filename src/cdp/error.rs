use std::fmt;

/// Errors surfaced by the CDP client.
#[derive(Debug)]
pub enum CdpError {
    /// The WebSocket connection could not be established.
    Connection(String),

    /// The connection attempt exceeded its timeout.
    ConnectionTimeout,

    /// A call did not receive a reply within its budget.
    CallTimeout {
        /// The method that timed out.
        method: String,
    },

    /// The browser rejected a call (e.g., detached frame, unknown node).
    Protocol { code: i64, message: String },

    /// The WebSocket connection closed while calls were outstanding.
    ConnectionClosed,

    /// A reply arrived but did not have the expected shape.
    InvalidResponse(String),

    /// The transport task is gone or a channel closed underneath us.
    Internal(String),
}

impl CdpError {
    /// Whether this error is a timeout (connection or per-call).
    ///
    /// The crawl boundary uses this to classify a page failure as
    /// `timeout` rather than `call_method`.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout | Self::CallTimeout { .. })
    }
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "CDP connection error: {msg}"),
            Self::ConnectionTimeout => write!(f, "CDP connection timed out"),
            Self::CallTimeout { method } => write!(f, "CDP call timed out: {method}"),
            Self::Protocol { code, message } => {
                write!(f, "CDP protocol error ({code}): {message}")
            }
            Self::ConnectionClosed => write!(f, "CDP connection closed"),
            Self::InvalidResponse(msg) => write!(f, "CDP invalid response: {msg}"),
            Self::Internal(msg) => write!(f, "CDP internal error: {msg}"),
        }
    }
}

impl std::error::Error for CdpError {}
