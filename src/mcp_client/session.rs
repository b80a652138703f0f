//! MCP protocol session.
//!
//! Runs the capability handshake, lists tools, and invokes them over a
//! [`Transport`]. A background reader task owns the inbound half of the
//! stream and routes each response to the caller waiting on the same id,
//! so several requests may be in flight at once and answered in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::Transport;
use super::types::{
    error_codes, CallToolResult, Implementation, InitializeParams, InitializeResult,
    JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    PeerInfo, SessionState, ToolDescriptor,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Protocol version offered in `initialize`.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Protocol versions accepted from the server.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Upper bound on `tools/list` pages followed for one listing.
const MAX_TOOL_PAGES: usize = 64;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ─── Timeouts ────────────────────────────────────────────────────────────────

/// Per-operation response windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    pub init: Duration,
    pub list: Duration,
    pub call: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            init: DEFAULT_TIMEOUT,
            list: DEFAULT_TIMEOUT,
            call: DEFAULT_TIMEOUT,
        }
    }
}

// ─── Pending Calls ───────────────────────────────────────────────────────────

type Responder = oneshot::Sender<Result<JsonRpcResponse, McpError>>;

/// A request awaiting its response.
struct PendingCall {
    method: String,
    sent_at: Instant,
    responder: Responder,
}

struct Inner {
    state: SessionState,
    pending: HashMap<u64, PendingCall>,
    /// Why the session closed, for requests that arrive afterwards.
    closed_by: Option<McpError>,
}

/// State shared between the session handle and its reader task.
struct Shared {
    server: String,
    inner: Mutex<Inner>,
    tools_changed: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Register a pending call if the session is in `required` state.
    fn register(
        &self,
        id: u64,
        method: &str,
        required: SessionState,
        responder: Responder,
    ) -> Result<(), McpError> {
        let mut inner = self.lock();
        if inner.state != required {
            if let Some(cause) = inner.closed_by.as_ref().filter(|e| e.is_fatal()) {
                return Err(cause.clone());
            }
            return Err(McpError::NotReady {
                server: self.server.clone(),
                state: inner.state,
            });
        }
        inner.pending.insert(
            id,
            PendingCall {
                method: method.to_string(),
                sent_at: Instant::now(),
                responder,
            },
        );
        Ok(())
    }

    fn forget(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    /// Deliver a response to the call waiting on its id.
    fn route(&self, response: JsonRpcResponse) {
        let call = response
            .request_id()
            .and_then(|id| self.lock().pending.remove(&id));

        match call {
            Some(call) => {
                tracing::debug!(
                    server = %self.server,
                    method = %call.method,
                    elapsed_ms = call.sent_at.elapsed().as_millis() as u64,
                    "response received"
                );
                // The caller may have timed out and dropped its receiver.
                let _ = call.responder.send(Ok(response));
            }
            None => {
                tracing::warn!(
                    server = %self.server,
                    id = %response.id,
                    "discarding response with unknown or expired id"
                );
            }
        }
    }

    /// Move to `Closed` and fail every pending call with `error`.
    ///
    /// Returns false if the session was already closed.
    fn close_with(&self, error: &McpError) -> bool {
        let drained: Vec<PendingCall> = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return false;
            }
            inner.state = SessionState::Closed;
            inner.closed_by = Some(error.clone());
            inner.pending.drain().map(|(_, call)| call).collect()
        };

        for call in drained {
            let _ = call.responder.send(Err(error.clone()));
        }
        true
    }

    fn handle_notification(&self, note: &JsonRpcNotification) {
        match note.method.as_str() {
            "notifications/tools/list_changed" => {
                tracing::info!(server = %self.server, "server reports tool list changed");
                self.tools_changed.store(true, Ordering::SeqCst);
            }
            "notifications/message" => {
                let params = note.params.clone().unwrap_or(Value::Null);
                let level = params.get("level").and_then(Value::as_str).unwrap_or("info");
                let data = params.get("data").cloned().unwrap_or(Value::Null);
                match level {
                    "debug" => tracing::debug!(server = %self.server, %data, "server log"),
                    "info" | "notice" => tracing::info!(server = %self.server, %data, "server log"),
                    "warning" => tracing::warn!(server = %self.server, %data, "server log"),
                    _ => tracing::error!(server = %self.server, level, %data, "server log"),
                }
            }
            other => {
                tracing::debug!(server = %self.server, method = other, "ignoring notification");
            }
        }
    }
}

/// Build the reply to a server-initiated request.
fn answer_server_request(request: &JsonRpcRequest) -> JsonRpcResponse {
    match request.method.as_str() {
        "ping" => JsonRpcResponse::success(request.id.clone(), json!({})),
        other => JsonRpcResponse::failure(
            request.id.clone(),
            error_codes::METHOD_NOT_FOUND,
            format!("method not supported by client: {other}"),
        ),
    }
}

async fn reader_loop(shared: Arc<Shared>, transport: Arc<dyn Transport>) {
    loop {
        match transport.receive().await {
            Ok(JsonRpcMessage::Response(response)) => shared.route(response),
            Ok(JsonRpcMessage::Notification(note)) => shared.handle_notification(&note),
            Ok(JsonRpcMessage::Request(request)) => {
                tracing::debug!(server = %shared.server, method = %request.method, "server request");
                let reply = JsonRpcMessage::Response(answer_server_request(&request));
                if let Err(e) = transport.send(&reply).await {
                    if shared.close_with(&e) {
                        tracing::error!(server = %shared.server, error = %e, "session closed");
                    }
                    return;
                }
            }
            Err(e) if e.is_fatal() => {
                if shared.close_with(&e) {
                    tracing::error!(server = %shared.server, error = %e, "session closed");
                }
                return;
            }
            Err(e) => {
                tracing::warn!(server = %shared.server, error = %e, "dropping unclassifiable frame");
            }
        }
    }
}

/// Turn a JSON-RPC response into its result value.
fn extract_result(response: JsonRpcResponse, server: &str) -> Result<Value, McpError> {
    if let Some(error) = response.error {
        return Err(McpError::ServerError {
            code: error.code,
            message: error.message,
            data: error.data,
        });
    }
    response.result.ok_or_else(|| McpError::Protocol {
        server: server.to_string(),
        reason: "response has neither result nor error".into(),
    })
}

// ─── Tool Executor ───────────────────────────────────────────────────────────

/// Capability to invoke a tool by name.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpError>;
}

// ─── McpSession ──────────────────────────────────────────────────────────────

/// One protocol session with one tool server.
pub struct McpSession {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
    timeouts: SessionTimeouts,
    peer: Mutex<Option<PeerInfo>>,
}

impl McpSession {
    /// Create a session in the `Disconnected` state.
    pub fn new(server: &str, transport: Arc<dyn Transport>, timeouts: SessionTimeouts) -> Self {
        Self {
            shared: Arc::new(Shared {
                server: server.to_string(),
                inner: Mutex::new(Inner {
                    state: SessionState::Disconnected,
                    pending: HashMap::new(),
                    closed_by: None,
                }),
                tools_changed: AtomicBool::new(false),
            }),
            transport,
            next_id: AtomicU64::new(1),
            reader: Mutex::new(None),
            released: AtomicBool::new(false),
            timeouts,
            peer: Mutex::new(None),
        }
    }

    /// Name of the server this session talks to.
    pub fn server_name(&self) -> &str {
        &self.shared.server
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Handshake result, once `Ready`.
    pub fn peer_info(&self) -> Option<PeerInfo> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Whether the server announced a tool list change since the last listing.
    pub fn tools_changed(&self) -> bool {
        self.shared.tools_changed.load(Ordering::SeqCst)
    }

    // ─── Handshake ───────────────────────────────────────────────────────

    /// Negotiate capabilities with the server.
    ///
    /// On failure the session is `Closed` and cannot be reused. Transport
    /// failures are reported as such; anything else is a handshake error.
    pub async fn initialize(&self) -> Result<PeerInfo, McpError> {
        {
            let mut inner = self.shared.lock();
            if inner.state != SessionState::Disconnected {
                return Err(McpError::NotReady {
                    server: self.shared.server.clone(),
                    state: inner.state,
                });
            }
            inner.state = SessionState::Handshaking;
        }
        self.start_reader();

        match self.handshake().await {
            Ok(peer) => {
                {
                    let mut inner = self.shared.lock();
                    if inner.state != SessionState::Handshaking {
                        return Err(McpError::Handshake {
                            server: self.shared.server.clone(),
                            reason: format!("session became {} during handshake", inner.state),
                        });
                    }
                    inner.state = SessionState::Ready;
                }
                *self.peer.lock().unwrap_or_else(|e| e.into_inner()) = Some(peer.clone());
                tracing::info!(
                    server = %self.shared.server,
                    protocol = %peer.protocol_version,
                    peer = ?peer.server.as_ref().map(|s| s.name.as_str()),
                    "session ready"
                );
                Ok(peer)
            }
            Err(e) => {
                let err = match e {
                    McpError::Transport { .. } | McpError::Handshake { .. } => e,
                    other => McpError::Handshake {
                        server: self.shared.server.clone(),
                        reason: other.to_string(),
                    },
                };
                self.shared.close_with(&err);
                Err(err)
            }
        }
    }

    async fn handshake(&self) -> Result<PeerInfo, McpError> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };
        let params = serde_json::to_value(&params).map_err(|e| self.handshake_error(e.to_string()))?;

        let value = self
            .request(
                "initialize",
                Some(params),
                SessionState::Handshaking,
                self.timeouts.init,
            )
            .await?;

        let result: InitializeResult = serde_json::from_value(value)
            .map_err(|e| self.handshake_error(format!("invalid initialize result: {e}")))?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(self.handshake_error(format!(
                "unsupported protocol version '{}' (supported: {})",
                result.protocol_version,
                SUPPORTED_PROTOCOL_VERSIONS.join(", ")
            )));
        }
        if !result.capabilities.is_object() {
            return Err(self.handshake_error("server capabilities missing".into()));
        }

        self.transport
            .send(&JsonRpcMessage::Notification(JsonRpcNotification::new(
                "notifications/initialized",
                None,
            )))
            .await?;

        Ok(PeerInfo {
            protocol_version: result.protocol_version,
            server: result.server_info,
            capabilities: result.capabilities,
            instructions: result.instructions,
        })
    }

    fn handshake_error(&self, reason: String) -> McpError {
        McpError::Handshake {
            server: self.shared.server.clone(),
            reason,
        }
    }

    fn start_reader(&self) {
        let handle = tokio::spawn(reader_loop(self.shared.clone(), self.transport.clone()));
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send one request and wait for its correlated response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        required: SessionState,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.register(id, method, required, tx)?;

        let message = JsonRpcMessage::Request(JsonRpcRequest::new(id, method, params));
        if let Err(e) = self.transport.send(&message).await {
            self.shared.forget(id);
            if e.is_fatal() {
                self.shared.close_with(&e);
            }
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(delivered)) => extract_result(delivered?, &self.shared.server),
            Ok(Err(_)) => Err(McpError::Cancelled {
                method: method.to_string(),
            }),
            Err(_) => {
                self.shared.forget(id);
                tracing::warn!(
                    server = %self.shared.server,
                    method,
                    id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// List the server's tools, following pagination, in server order.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self
                .request("tools/list", params, SessionState::Ready, self.timeouts.list)
                .await?;
            let page: ListToolsResult =
                serde_json::from_value(value).map_err(|e| McpError::Protocol {
                    server: self.shared.server.clone(),
                    reason: format!("invalid tools/list result: {e}"),
                })?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => {
                    self.shared.tools_changed.store(false, Ordering::SeqCst);
                    tracing::debug!(server = %self.shared.server, count = tools.len(), "listed tools");
                    return Ok(tools);
                }
            }
        }

        Err(McpError::Protocol {
            server: self.shared.server.clone(),
            reason: format!("tools/list pagination exceeded {MAX_TOOL_PAGES} pages"),
        })
    }

    /// Invoke one tool. A tool-level failure comes back as `is_error = true`.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpError> {
        let start = Instant::now();
        let params = json!({ "name": name, "arguments": Value::Object(arguments) });
        let value = self
            .request("tools/call", Some(params), SessionState::Ready, self.timeouts.call)
            .await?;

        let result: CallToolResult =
            serde_json::from_value(value).map_err(|e| McpError::Protocol {
                server: self.shared.server.clone(),
                reason: format!("invalid tools/call result for '{name}': {e}"),
            })?;

        tracing::info!(
            server = %self.shared.server,
            tool = name,
            is_error = result.is_error,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "tool call completed"
        );
        Ok(result)
    }

    // ─── Close ───────────────────────────────────────────────────────────

    /// Close the session and release the transport. Idempotent.
    pub async fn close(&self) -> Result<(), McpError> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.shared.close_with(&McpError::Cancelled {
            method: "session".into(),
        });
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        tracing::debug!(server = %self.shared.server, "session closed");
        self.transport.close().await
    }
}

#[async_trait]
impl ToolExecutor for McpSession {
    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, McpError> {
        McpSession::call_tool(self, name, arguments).await
    }
}

impl Drop for McpSession {
    fn drop(&mut self) {
        // The reader holds the transport; stop it so the child can be reaped.
        if let Some(handle) = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
