use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::browser::Tab;
use crate::cdp::{CdpError, CdpEvent, CdpSession};
use crate::result::{PageResult, ResponseRecord};

/// Opaque DOM node handle, valid only within the current tab and document.
///
/// Handles are invalidated on navigation; nothing in this crate caches them
/// across navigations.
pub type NodeId = i64;

/// Outer wire budget for `Page.navigate`.
const NAVIGATE_TIMEOUT: Duration = Duration::from_secs(15);

/// Hard ceiling on waiting for the load event.
const LOAD_CEILING: Duration = Duration::from_secs(30);

/// Sampling interval of the load-wait poll.
const LOAD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Idle after load so script-injected UI (cookie banners, typically) can
/// mount before detection looks for it.
const POST_LOAD_IDLE: Duration = Duration::from_secs(5);

/// A single-use session bound to one tab and one target URL.
///
/// Owns the tab's event subscriptions and drives the visit sequence; all
/// wire calls are sequential and awaited. Network events arrive on a pump
/// task that only appends to the shared [`PageResult`] and flips the
/// `is_loaded` flag, so the worker and the pump need no coordination beyond
/// that atomic and the result mutex.
pub struct PageSession {
    tab: Tab,
    url: String,
    hostname: Option<String>,
    result: Arc<Mutex<PageResult>>,
    is_loaded: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl PageSession {
    #[must_use]
    pub fn new(tab: Tab, result: PageResult) -> Self {
        let url = result.url.clone();
        let hostname = result.hostname.clone();
        Self {
            tab,
            url,
            hostname,
            result: Arc::new(Mutex::new(result)),
            is_loaded: Arc::new(AtomicBool::new(false)),
            pump: None,
        }
    }

    /// The visit sequence: subscribe, enable domains, deny notification
    /// pop-ups, navigate, wait for load, idle, confirm DOM readiness.
    ///
    /// A load-event ceiling is not a failure — the page is marked
    /// `stopped waiting` and the visit proceeds with whatever loaded.
    ///
    /// # Errors
    ///
    /// Returns the first wire error; the caller classifies it into the
    /// page's failure record and still tears the session down.
    pub async fn open(&mut self) -> Result<(), CdpError> {
        self.start_event_pump().await?;

        for domain in ["Network", "Page", "DOM", "Runtime", "Overlay"] {
            self.tab
                .session
                .call(&format!("{domain}.enable"), None)
                .await?;
        }

        // Notification prompts can eclipse the very notice we are after.
        if let Some(hostname) = self.hostname.clone() {
            self.deny_permission("notifications", &format!("https://{hostname}/*"))
                .await?;
            self.deny_permission("notifications", &format!("https://www.{hostname}/*"))
                .await?;
        }

        self.tab
            .session
            .call_with_timeout(
                "Page.navigate",
                Some(json!({ "url": self.url.as_str() })),
                NAVIGATE_TIMEOUT,
            )
            .await?;

        let mut waited = Duration::ZERO;
        while !self.is_loaded() && waited < LOAD_CEILING {
            tokio::time::sleep(LOAD_POLL_INTERVAL).await;
            waited += LOAD_POLL_INTERVAL;
        }
        if !self.is_loaded() {
            self.with_result(|result| result.set_stopped_waiting("load event"));
        }

        tokio::time::sleep(POST_LOAD_IDLE).await;

        // confirms the DOM is materialized before any node work
        self.tab.session.call("DOM.getDocument", None).await?;

        Ok(())
    }

    /// Tear down the event pump. Always runs, even after failures; closing
    /// the target itself is the browser session's job.
    pub async fn close(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
            let _ = pump.await;
        }
    }

    /// Consume the session and hand back the accumulated result.
    #[must_use]
    pub fn into_result(self) -> PageResult {
        match Arc::try_unwrap(self.result) {
            Ok(mutex) => mutex
                .into_inner()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            Err(arc) => arc
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone(),
        }
    }

    /// Run a closure against the shared page result.
    pub fn with_result<T>(&self, f: impl FnOnce(&mut PageResult) -> T) -> T {
        let mut guard = self
            .result
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.is_loaded.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    #[must_use]
    pub fn target_id(&self) -> &str {
        &self.tab.target_id
    }

    async fn start_event_pump(&mut self) -> Result<(), CdpError> {
        let request_rx = self
            .tab
            .session
            .subscribe("Network.requestWillBeSent")
            .await?;
        let response_rx = self
            .tab
            .session
            .subscribe("Network.responseReceived")
            .await?;
        let failed_rx = self.tab.session.subscribe("Network.loadingFailed").await?;
        let load_rx = self.tab.session.subscribe("Page.loadEventFired").await?;

        let pump = EventPump {
            result: Arc::clone(&self.result),
            is_loaded: Arc::clone(&self.is_loaded),
            primary_request_id: None,
        };
        self.pump = Some(tokio::spawn(pump.run(
            request_rx,
            response_rx,
            failed_rx,
            load_rx,
        )));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // DOM / Runtime plumbing
    // -------------------------------------------------------------------------

    /// Evaluate an expression; returns the `result` remote object.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the evaluation is rejected.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let reply = self
            .tab
            .session
            .call("Runtime.evaluate", Some(json!({ "expression": expression })))
            .await?;
        Ok(reply["result"].clone())
    }

    /// Call a function declaration with the node bound as `this`, silently
    /// (page-side exceptions do not reach the console). Returns the
    /// `result` remote object.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the node cannot be resolved or the call is
    /// rejected.
    pub async fn call_on_node(
        &self,
        node_id: NodeId,
        declaration: &str,
    ) -> Result<Value, CdpError> {
        let object_id = self.object_for_node(node_id).await?;
        let reply = self
            .tab
            .session
            .call(
                "Runtime.callFunctionOn",
                Some(json!({
                    "functionDeclaration": declaration,
                    "objectId": object_id,
                    "silent": true,
                })),
            )
            .await?;
        Ok(reply["result"].clone())
    }

    /// Resolve a node handle to a remote-object handle.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::InvalidResponse` if the reply carries no object id.
    pub async fn object_for_node(&self, node_id: NodeId) -> Result<String, CdpError> {
        let reply = self
            .tab
            .session
            .call("DOM.resolveNode", Some(json!({ "nodeId": node_id })))
            .await?;
        reply["object"]["objectId"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                CdpError::InvalidResponse("DOM.resolveNode reply missing objectId".into())
            })
    }

    /// Round-trip a remote-object handle back to a node handle.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::InvalidResponse` if the reply carries no node id.
    pub async fn node_for_object(&self, object_id: &str) -> Result<NodeId, CdpError> {
        let reply = self
            .tab
            .session
            .call("DOM.requestNode", Some(json!({ "objectId": object_id })))
            .await?;
        reply["nodeId"]
            .as_i64()
            .ok_or_else(|| CdpError::InvalidResponse("DOM.requestNode reply missing nodeId".into()))
    }

    /// The document root node.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::InvalidResponse` if the reply carries no root.
    pub async fn document_root(&self) -> Result<NodeId, CdpError> {
        let reply = self.tab.session.call("DOM.getDocument", None).await?;
        reply["root"]["nodeId"]
            .as_i64()
            .ok_or_else(|| CdpError::InvalidResponse("DOM.getDocument reply missing root".into()))
    }

    /// `querySelectorAll` under the given node.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the selector is rejected.
    pub async fn query_selector_all(
        &self,
        node_id: NodeId,
        selector: &str,
    ) -> Result<Vec<NodeId>, CdpError> {
        let reply = self
            .tab
            .session
            .call(
                "DOM.querySelectorAll",
                Some(json!({ "nodeId": node_id, "selector": selector })),
            )
            .await?;
        Ok(node_id_array(&reply["nodeIds"]))
    }

    /// Run a DOM search query (XPath here) and collect every hit.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the search is rejected.
    pub async fn search_nodes(&self, query: &str) -> Result<Vec<NodeId>, CdpError> {
        let search = self
            .tab
            .session
            .call("DOM.performSearch", Some(json!({ "query": query })))
            .await?;
        let result_count = search["resultCount"].as_i64().unwrap_or(0);
        if result_count == 0 {
            return Ok(Vec::new());
        }
        let search_id = search["searchId"].as_str().ok_or_else(|| {
            CdpError::InvalidResponse("DOM.performSearch reply missing searchId".into())
        })?;
        let results = self
            .tab
            .session
            .call(
                "DOM.getSearchResults",
                Some(json!({
                    "searchId": search_id,
                    "fromIndex": 0,
                    "toIndex": result_count,
                })),
            )
            .await?;
        Ok(node_id_array(&results["nodeIds"]))
    }

    /// Lowercased node name (e.g. `div`, `html`, `iframe`).
    ///
    /// # Errors
    ///
    /// Returns `CdpError::InvalidResponse` if the reply carries no name.
    pub async fn node_name(&self, node_id: NodeId) -> Result<String, CdpError> {
        let reply = self
            .tab
            .session
            .call("DOM.describeNode", Some(json!({ "nodeId": node_id })))
            .await?;
        reply["node"]["nodeName"]
            .as_str()
            .map(str::to_lowercase)
            .ok_or_else(|| {
                CdpError::InvalidResponse("DOM.describeNode reply missing nodeName".into())
            })
    }

    /// The frame a node belongs to, when the browser reports one.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the node cannot be described.
    pub async fn node_frame_id(&self, node_id: NodeId) -> Result<Option<String>, CdpError> {
        let reply = self
            .tab
            .session
            .call("DOM.describeNode", Some(json!({ "nodeId": node_id })))
            .await?;
        Ok(reply["node"]["frameId"].as_str().map(str::to_owned))
    }

    /// The element owning the given frame in its parent document.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::InvalidResponse` if the reply carries no node id.
    pub async fn frame_owner(&self, frame_id: &str) -> Result<NodeId, CdpError> {
        let reply = self
            .tab
            .session
            .call("DOM.getFrameOwner", Some(json!({ "frameId": frame_id })))
            .await?;
        reply["nodeId"].as_i64().ok_or_else(|| {
            CdpError::InvalidResponse("DOM.getFrameOwner reply missing nodeId".into())
        })
    }

    /// The root frame's id from the frame tree.
    ///
    /// # Errors
    ///
    /// Returns `CdpError::InvalidResponse` if the reply carries no frame id.
    pub async fn root_frame_id(&self) -> Result<String, CdpError> {
        let reply = self.tab.session.call("Page.getFrameTree", None).await?;
        reply["frameTree"]["frame"]["id"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| {
                CdpError::InvalidResponse("Page.getFrameTree reply missing frame id".into())
            })
    }

    /// Pause or resume script execution in the page.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the emulation call is rejected.
    pub async fn set_script_execution_disabled(&self, disabled: bool) -> Result<(), CdpError> {
        self.tab
            .session
            .call(
                "Emulation.setScriptExecutionDisabled",
                Some(json!({ "value": disabled })),
            )
            .await?;
        Ok(())
    }

    /// Bring this tab to the foreground. Only call while holding the
    /// arbiter's screenshot turn.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the call is rejected.
    pub async fn bring_to_front(&self) -> Result<(), CdpError> {
        self.tab.session.call("Page.bringToFront", None).await?;
        Ok(())
    }

    /// All cookies the browser currently holds.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the call is rejected.
    pub async fn all_cookies(&self) -> Result<Vec<Value>, CdpError> {
        let reply = self.tab.session.call("Network.getAllCookies", None).await?;
        Ok(reply["cookies"].as_array().cloned().unwrap_or_default())
    }

    /// Delete one cookie by name, domain and path.
    ///
    /// # Errors
    ///
    /// Returns the wire error if the call is rejected.
    pub async fn delete_cookie(
        &self,
        name: &str,
        domain: &str,
        path: &str,
    ) -> Result<(), CdpError> {
        self.tab
            .session
            .call(
                "Network.deleteCookies",
                Some(json!({ "name": name, "domain": domain, "path": path })),
            )
            .await?;
        Ok(())
    }

    async fn deny_permission(&self, permission: &str, origin: &str) -> Result<(), CdpError> {
        self.tab
            .session
            .call(
                "Browser.setPermission",
                Some(json!({
                    "origin": origin,
                    "permission": { "name": permission },
                    "setting": "denied",
                })),
            )
            .await?;
        Ok(())
    }

    /// The underlying CDP session, for callers composing their own calls
    /// (screenshot capture, overlay highlighting).
    #[must_use]
    pub fn session(&self) -> &CdpSession {
        &self.tab.session
    }
}

fn node_id_array(value: &Value) -> Vec<NodeId> {
    value
        .as_array()
        .map(|ids| ids.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

/// Applies network and page events to the shared result.
struct EventPump {
    result: Arc<Mutex<PageResult>>,
    is_loaded: Arc<AtomicBool>,
    /// First request observed after navigation; anchors HTTP-level failure
    /// classification.
    primary_request_id: Option<String>,
}

impl EventPump {
    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<CdpEvent>,
        mut response_rx: mpsc::Receiver<CdpEvent>,
        mut failed_rx: mpsc::Receiver<CdpEvent>,
        mut load_rx: mpsc::Receiver<CdpEvent>,
    ) {
        loop {
            tokio::select! {
                event = request_rx.recv() => match event {
                    Some(event) => self.on_request_will_be_sent(&event.params),
                    None => break,
                },
                event = response_rx.recv() => match event {
                    Some(event) => self.on_response_received(&event.params),
                    None => break,
                },
                event = failed_rx.recv() => match event {
                    Some(event) => self.on_loading_failed(&event.params),
                    None => break,
                },
                event = load_rx.recv() => match event {
                    Some(_) => self.is_loaded.store(true, Ordering::Release),
                    None => break,
                },
            }
        }
        debug!("event pump finished");
    }

    fn on_request_will_be_sent(&mut self, params: &Value) {
        let url = params["request"]["url"].as_str().unwrap_or_default();
        self.with_result(|result| result.add_request(url));

        if self.primary_request_id.is_none() {
            self.primary_request_id = params["requestId"].as_str().map(str::to_owned);
        }
    }

    fn on_response_received(&self, params: &Value) {
        let response = &params["response"];
        let status = response["status"].as_i64().unwrap_or_default();
        let record = ResponseRecord {
            url: response["url"].as_str().unwrap_or_default().to_owned(),
            status,
            mime_type: response["mimeType"].as_str().unwrap_or_default().to_owned(),
            headers: response["headers"].clone(),
        };
        self.with_result(|result| result.add_response(record));

        if self.is_primary(params) && (400..=599).contains(&status) {
            self.with_result(|result| {
                result.set_failed(format!("status code `{status}`"), None);
            });
        }
    }

    fn on_loading_failed(&self, params: &Value) {
        if self.is_primary(params) {
            let error_text = params["errorText"].as_str().unwrap_or_default();
            self.with_result(|result| {
                result.set_failed(format!("loading failed `{error_text}`"), None);
            });
        }
    }

    fn is_primary(&self, params: &Value) -> bool {
        match (&self.primary_request_id, params["requestId"].as_str()) {
            (Some(primary), Some(id)) => primary == id,
            _ => false,
        }
    }

    fn with_result(&self, f: impl FnOnce(&mut PageResult)) {
        let mut guard = self
            .result
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard);
    }
}
