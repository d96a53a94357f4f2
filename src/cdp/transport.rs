use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{SinkExt, StreamExt};
use log::{debug, trace};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::error::CdpError;
use super::wire::{CdpEvent, Incoming, IncomingMessage, OutgoingCall};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Subscriber map key: `(method, session_id)`.
type SubscriberKey = (String, Option<String>);

/// Request sent from a client handle to the transport task.
pub(crate) enum TransportRequest {
    /// Issue a call and deliver the reply via the oneshot channel.
    Call {
        call: OutgoingCall,
        reply_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    },
    /// Register an event subscription.
    Subscribe {
        method: String,
        session_id: Option<String>,
        event_tx: mpsc::Sender<CdpEvent>,
    },
    /// Close the socket and exit.
    Shutdown,
}

/// An issued call awaiting its reply.
struct InFlight {
    reply_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
    method: String,
    deadline: Instant,
}

/// Clonable handle to the transport task.
///
/// The whole crawl shares one browser socket through clones of this handle;
/// there is deliberately no reconnect machinery. If the socket dies, every
/// outstanding and subsequent call fails with [`CdpError::ConnectionClosed`]
/// and the run ends — per-page recovery is meaningless without the browser.
#[derive(Debug, Clone)]
pub(crate) struct TransportHandle {
    request_tx: mpsc::Sender<TransportRequest>,
    next_id: Arc<AtomicU64>,
}

impl TransportHandle {
    /// Forward a request to the transport task.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::Internal` if the task has exited.
    pub(crate) async fn send(&self, request: TransportRequest) -> Result<(), CdpError> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| CdpError::Internal("transport task is not running".into()))
    }

    /// Next unique call ID on this connection.
    pub(crate) fn next_call_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Connect the WebSocket and spawn the transport task.
///
/// # Errors
///
/// Returns `CdpError::Connection` if the handshake fails, or
/// `CdpError::ConnectionTimeout` if it exceeds `connect_timeout`.
pub(crate) async fn spawn_transport(
    url: &str,
    channel_capacity: usize,
    connect_timeout: Duration,
) -> Result<TransportHandle, CdpError> {
    let ws_stream =
        match tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => return Err(CdpError::Connection(e.to_string())),
            Err(_) => return Err(CdpError::ConnectionTimeout),
        };

    let (request_tx, request_rx) = mpsc::channel(channel_capacity);
    let handle = TransportHandle {
        request_tx,
        next_id: Arc::new(AtomicU64::new(1)),
    };

    tokio::spawn(async move {
        let mut task = TransportTask {
            ws_stream,
            request_rx,
            in_flight: HashMap::new(),
            subscribers: HashMap::new(),
        };
        task.run().await;
    });

    Ok(handle)
}

/// Background task owning the WebSocket connection.
struct TransportTask {
    ws_stream: WsStream,
    request_rx: mpsc::Receiver<TransportRequest>,
    in_flight: HashMap<u64, InFlight>,
    subscribers: HashMap<SubscriberKey, Vec<mpsc::Sender<CdpEvent>>>,
}

impl TransportTask {
    async fn run(&mut self) {
        loop {
            let sweep_at = self.earliest_deadline();
            let deadline_sleep = async {
                match sweep_at {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    // nothing in flight; this branch must never win the select
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                frame = self.ws_stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch_frame(&text),
                        Some(Ok(Message::Close(_)) | Err(_)) | None => {
                            debug!("browser socket closed; failing {} in-flight calls", self.in_flight.len());
                            self.fail_all(|| CdpError::ConnectionClosed);
                            self.drain_after_close().await;
                            return;
                        }
                        // Binary, Ping, Pong, Frame
                        Some(Ok(_)) => {}
                    }
                }

                request = self.request_rx.recv() => {
                    match request {
                        Some(TransportRequest::Call { call, reply_tx, deadline }) => {
                            self.issue_call(call, reply_tx, deadline).await;
                        }
                        Some(TransportRequest::Subscribe { method, session_id, event_tx }) => {
                            self.subscribers
                                .entry((method, session_id))
                                .or_default()
                                .push(event_tx);
                        }
                        Some(TransportRequest::Shutdown) | None => {
                            self.fail_all(|| CdpError::ConnectionClosed);
                            let _ = self.ws_stream.close(None).await;
                            return;
                        }
                    }
                }

                () = deadline_sleep => {
                    self.sweep_deadlines();
                }
            }
        }
    }

    fn dispatch_frame(&mut self, text: &str) {
        let Ok(raw) = serde_json::from_str::<IncomingMessage>(text) else {
            trace!("ignoring malformed frame");
            return;
        };
        match raw.classify() {
            Some(Incoming::Reply(reply)) => {
                if let Some(in_flight) = self.in_flight.remove(&reply.id) {
                    let outcome = reply.outcome.map_err(|e| CdpError::Protocol {
                        code: e.code,
                        message: e.message,
                    });
                    let _ = in_flight.reply_tx.send(outcome);
                }
            }
            Some(Incoming::Event(event)) => self.fan_out(&event),
            None => {}
        }
    }

    fn fan_out(&mut self, event: &CdpEvent) {
        let key = (event.method.clone(), event.session_id.clone());
        if let Some(senders) = self.subscribers.get_mut(&key) {
            // drop subscribers whose receiver is gone
            senders.retain(|tx| tx.try_send(event.clone()).is_ok() || !tx.is_closed());
            if senders.is_empty() {
                self.subscribers.remove(&key);
            }
        }
    }

    async fn issue_call(
        &mut self,
        call: OutgoingCall,
        reply_tx: oneshot::Sender<Result<serde_json::Value, CdpError>>,
        deadline: Instant,
    ) {
        let id = call.id;
        let method = call.method.clone();

        let json = match serde_json::to_string(&call) {
            Ok(json) => json,
            Err(e) => {
                let _ = reply_tx.send(Err(CdpError::Internal(format!("serialization error: {e}"))));
                return;
            }
        };

        if let Err(e) = self.ws_stream.send(Message::Text(json.into())).await {
            let _ = reply_tx.send(Err(CdpError::Connection(format!(
                "WebSocket write error: {e}"
            ))));
            return;
        }

        self.in_flight.insert(
            id,
            InFlight {
                reply_tx,
                method,
                deadline,
            },
        );
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.in_flight.values().map(|c| c.deadline).min()
    }

    fn sweep_deadlines(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .in_flight
            .iter()
            .filter(|(_, c)| c.deadline <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            if let Some(call) = self.in_flight.remove(&id) {
                let _ = call.reply_tx.send(Err(CdpError::CallTimeout {
                    method: call.method,
                }));
            }
        }
    }

    fn fail_all(&mut self, error: impl Fn() -> CdpError) {
        for (_, call) in std::mem::take(&mut self.in_flight) {
            let _ = call.reply_tx.send(Err(error()));
        }
    }

    /// After the socket is gone, keep answering requests with
    /// `ConnectionClosed` until every handle is dropped.
    async fn drain_after_close(&mut self) {
        while let Some(request) = self.request_rx.recv().await {
            match request {
                TransportRequest::Call { reply_tx, .. } => {
                    let _ = reply_tx.send(Err(CdpError::ConnectionClosed));
                }
                TransportRequest::Subscribe { .. } => {}
                TransportRequest::Shutdown => return,
            }
        }
    }
}
