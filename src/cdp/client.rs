use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

use super::error::CdpError;
use super::transport::{TransportHandle, TransportRequest, spawn_transport};
use super::wire::{CdpEvent, OutgoingCall};

/// Connection settings for a CDP client.
#[derive(Debug, Clone)]
pub struct CdpConfig {
    /// Timeout for the initial WebSocket handshake (default: 10 s).
    pub connect_timeout: Duration,
    /// Default timeout for individual calls (default: 30 s).
    pub call_timeout: Duration,
    /// Capacity of the internal request and event channels (default: 256).
    pub channel_capacity: usize,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            channel_capacity: 256,
        }
    }
}

/// A browser-level CDP client over one shared WebSocket.
///
/// Entry point for issuing calls and subscribing to events. The socket is
/// owned by a background transport task; this handle (and every
/// [`CdpSession`] derived from it) is cheap to share across workers.
#[derive(Debug)]
pub struct CdpClient {
    handle: TransportHandle,
    config: CdpConfig,
    url: String,
}

impl CdpClient {
    /// Connect to a browser's WebSocket debugger URL.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Connection` if the handshake fails, or
    /// `CdpError::ConnectionTimeout` if it exceeds the configured timeout.
    pub async fn connect(url: &str, config: CdpConfig) -> Result<Self, CdpError> {
        let handle =
            spawn_transport(url, config.channel_capacity, config.connect_timeout).await?;
        Ok(Self {
            handle,
            config,
            url: url.to_owned(),
        })
    }

    /// Issue a browser-level call (no session scope).
    ///
    /// # Errors
    ///
    /// Returns `CdpError::CallTimeout` if the browser does not reply in
    /// time, `CdpError::Protocol` if it rejects the call, or
    /// `CdpError::ConnectionClosed`/`Internal` on transport failure.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        call_impl(
            &self.handle,
            self.config.call_timeout,
            method,
            params,
            None,
        )
        .await
    }

    /// Subscribe to browser-level events matching a method name.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn subscribe(&self, method: &str) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        subscribe_impl(&self.handle, self.config.channel_capacity, method, None).await
    }

    /// Attach to a target and return a session scoped to it.
    ///
    /// Sends `Target.attachToTarget` in flat mode.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Protocol` if the target cannot be attached, or
    /// `CdpError::InvalidResponse` if the reply lacks a session ID.
    pub async fn attach(&self, target_id: &str) -> Result<CdpSession, CdpError> {
        let result = self
            .call(
                "Target.attachToTarget",
                Some(serde_json::json!({ "targetId": target_id, "flatten": true })),
            )
            .await?;
        let session_id = result["sessionId"]
            .as_str()
            .ok_or_else(|| {
                CdpError::InvalidResponse("Target.attachToTarget reply missing sessionId".into())
            })?
            .to_owned();

        Ok(CdpSession {
            session_id,
            handle: self.handle.clone(),
            config: self.config.clone(),
        })
    }

    /// Gracefully close the WebSocket connection.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has already exited.
    pub async fn close(self) -> Result<(), CdpError> {
        self.handle.send(TransportRequest::Shutdown).await
    }

    /// The WebSocket URL this client is connected to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A CDP session bound to one target (tab).
///
/// Shares the parent client's socket; calls and events are routed through
/// the session ID.
#[derive(Debug)]
pub struct CdpSession {
    session_id: String,
    handle: TransportHandle,
    config: CdpConfig,
}

impl CdpSession {
    /// Issue a call within this session, using the default call timeout.
    ///
    /// # Errors
    ///
    /// Same as [`CdpClient::call`].
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, CdpError> {
        self.call_with_timeout(method, params, self.config.call_timeout)
            .await
    }

    /// Issue a call with an explicit timeout, overriding the default.
    ///
    /// Navigation uses this for its tighter 15 s budget.
    ///
    /// # Errors
    ///
    /// Same as [`CdpClient::call`].
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, CdpError> {
        call_impl(
            &self.handle,
            timeout,
            method,
            params,
            Some(self.session_id.clone()),
        )
        .await
    }

    /// Subscribe to events scoped to this session.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the transport task has exited.
    pub async fn subscribe(&self, method: &str) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
        subscribe_impl(
            &self.handle,
            self.config.channel_capacity,
            method,
            Some(self.session_id.clone()),
        )
        .await
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

async fn call_impl(
    handle: &TransportHandle,
    timeout: Duration,
    method: &str,
    params: Option<serde_json::Value>,
    session_id: Option<String>,
) -> Result<serde_json::Value, CdpError> {
    let call = OutgoingCall {
        id: handle.next_call_id(),
        method: method.to_owned(),
        params,
        session_id,
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    handle
        .send(TransportRequest::Call {
            call,
            reply_tx,
            deadline: Instant::now() + timeout,
        })
        .await?;

    reply_rx
        .await
        .map_err(|_| CdpError::Internal("transport task exited before replying".into()))?
}

async fn subscribe_impl(
    handle: &TransportHandle,
    channel_capacity: usize,
    method: &str,
    session_id: Option<String>,
) -> Result<mpsc::Receiver<CdpEvent>, CdpError> {
    let (event_tx, event_rx) = mpsc::channel(channel_capacity);
    handle
        .send(TransportRequest::Subscribe {
            method: method.to_owned(),
            session_id,
            event_tx,
        })
        .await?;
    Ok(event_rx)
}
