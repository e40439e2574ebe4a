//! MCP client: manages one server connection.
//!
//! Owns a single [`Transport`], correlates requests with responses through the
//! pending table, and routes server notifications to registered callbacks.
//! One background task per client runs the transport's read loop and is the
//! only consumer of inbound messages.

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::jsonrpc::{JsonRpcMessage, JsonRpcNotification, JsonRpcRequest};
use crate::notification::{NotificationRegistry, SubscriptionId};
use crate::pending::PendingRequests;
use crate::protocol::{
    CallToolParams, CallToolResult, ClientRequest, Implementation, InitializeParams,
    InitializeResult, ListResourcesResult, ListToolsResult, NOTIFICATION_INITIALIZED,
    PROTOCOL_VERSION, PageParams, ReadResourceParams, ReadResourceResult, Resource,
    ResourceContents, ServerCapabilities, Tool,
};
use crate::transport::{MessageHandler, SseTransport, StdioTransport, Transport};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `close` waits for the read loop to wind down before aborting it.
const READER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Connection lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Created,
    Started,
    Initialized,
    Closed,
}

/// Per-call deadline and cancellation.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the client's default deadline for this call.
    pub timeout: Option<Duration>,
    /// Abandons the call when cancelled.
    pub cancel: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    pub fn with_cancel(token: CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel: Some(token),
        }
    }
}

/// Client for a single MCP server.
pub struct McpClient {
    name: String,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    pending: Arc<PendingRequests>,
    notifications: Arc<NotificationRegistry>,
    state: Mutex<ClientState>,
    server: OnceLock<InitializeResult>,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Option<Duration>,
}

impl McpClient {
    /// Create a client over `transport`. Nothing happens on the wire until [`start`](Self::start).
    pub fn new(name: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self::with_transport(name, Arc::new(transport))
    }

    pub fn with_transport(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: name.into(),
            transport,
            next_id: AtomicU64::new(1),
            pending: Arc::new(PendingRequests::new()),
            notifications: Arc::new(NotificationRegistry::new()),
            state: Mutex::new(ClientState::Created),
            server: OnceLock::new(),
            reader: Mutex::new(None),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    /// Set the default per-request deadline; `None` waits indefinitely.
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build a client with the transport `config` describes.
    pub fn from_config(name: impl Into<String>, config: &McpServerConfig) -> Result<Self, McpError> {
        let name = name.into();
        let client = match config {
            McpServerConfig::Stdio(stdio) => {
                Self::new(name.clone(), StdioTransport::new(name, stdio.clone()))
            }
            McpServerConfig::Sse(sse) => Self::new(name, SseTransport::new(sse)?),
        };
        Ok(client.with_request_timeout(config.request_timeout()))
    }

    /// Build, start and initialize a client in one step.
    pub async fn connect(name: impl Into<String>, config: &McpServerConfig) -> Result<Self, McpError> {
        let client = Self::from_config(name, config)?;
        if let Err(e) = client.start_and_initialize().await {
            let _ = client.close().await;
            return Err(e);
        }
        Ok(client)
    }

    async fn start_and_initialize(&self) -> Result<(), McpError> {
        self.start().await?;
        self.initialize().await?;
        Ok(())
    }

    /// Get the server name.
    pub fn server_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Everything the server reported during the handshake.
    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.server.get()
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server.get().map(|r| &r.server_info)
    }

    pub fn capabilities(&self) -> Option<&ServerCapabilities> {
        self.server.get().map(|r| &r.capabilities)
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Register `handler` for server notifications with the given method.
    pub fn on_notification<F>(&self, method: impl Into<String>, handler: F) -> SubscriptionId
    where
        F: Fn(&JsonRpcNotification) + Send + Sync + 'static,
    {
        self.notifications.register(method, Arc::new(handler))
    }

    pub fn remove_notification_handler(&self, id: SubscriptionId) -> bool {
        self.notifications.unregister(id)
    }

    /// Start the transport and the background read loop.
    pub async fn start(&self) -> Result<(), McpError> {
        match self.state() {
            ClientState::Created => {}
            ClientState::Closed => return Err(McpError::Closed),
            ClientState::Started | ClientState::Initialized => {
                return Err(McpError::AlreadyStarted);
            }
        }

        self.transport.start().await?;
        let handle = self.spawn_reader();
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self.advance(ClientState::Created, ClientState::Started);
        tracing::debug!("MCP server '{}' transport started", self.name);
        Ok(())
    }

    fn spawn_reader(&self) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let pending = Arc::clone(&self.pending);
        let notifications = Arc::clone(&self.notifications);
        let server = self.name.clone();

        tokio::spawn(async move {
            let handler: MessageHandler = {
                let pending = Arc::clone(&pending);
                let server = server.clone();
                Box::new(move |bytes: &[u8]| dispatch(&server, &pending, &notifications, bytes))
            };

            match transport.run_read_loop(handler).await {
                Ok(()) => tracing::debug!("MCP server '{server}' read loop ended"),
                Err(e) => tracing::warn!("MCP server '{server}' read loop failed: {e}"),
            }

            let failed = pending.fail_all();
            if failed > 0 {
                tracing::debug!("MCP server '{server}' closed with {failed} requests in flight");
            }
        })
    }

    /// Perform the `initialize` handshake and cache what the server reports.
    ///
    /// Calling it again after success returns the cached result.
    pub async fn initialize(&self) -> Result<&InitializeResult, McpError> {
        match self.state() {
            ClientState::Created => return Err(McpError::NotStarted),
            ClientState::Closed => return Err(McpError::Closed),
            ClientState::Started | ClientState::Initialized => {}
        }
        if let Some(result) = self.server.get() {
            return Ok(result);
        }

        let request = ClientRequest::Initialize(InitializeParams::default());
        let result: InitializeResult = self.request(request, &RequestOptions::default()).await?;
        if result.protocol_version != PROTOCOL_VERSION {
            tracing::debug!(
                "MCP server '{}' answered with protocol version {}",
                self.name,
                result.protocol_version
            );
        }
        let result = self.server.get_or_init(|| result);

        // Many servers work without it, so a failure here is not fatal.
        if let Err(e) = self.send_notification(NOTIFICATION_INITIALIZED, None).await {
            tracing::warn!(
                "MCP server '{}': failed to send initialized notification: {e}",
                self.name
            );
        }

        self.advance(ClientState::Started, ClientState::Initialized);
        tracing::info!(
            "MCP server '{}' initialized ({} {})",
            self.name,
            result.server_info.name,
            result.server_info.version
        );
        Ok(result)
    }

    /// List every tool, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        self.ensure_initialized()?;
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = ClientRequest::ListTools(PageParams {
                cursor: cursor.clone(),
            });
            let page: ListToolsResult = self.request(request, &RequestOptions::default()).await?;
            tools.extend(page.tools);
            cursor = next_page(cursor, page.next_cursor)?;
            if cursor.is_none() {
                return Ok(tools);
            }
        }
    }

    /// Call a tool on this server.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        self.call_tool_with(tool_name, arguments, &RequestOptions::default())
            .await
    }

    /// Call a tool with an explicit deadline or cancellation token.
    pub async fn call_tool_with(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        options: &RequestOptions,
    ) -> Result<CallToolResult, McpError> {
        self.ensure_initialized()?;
        let request = ClientRequest::CallTool(CallToolParams {
            name: tool_name.to_string(),
            arguments,
        });
        self.request(request, options).await
    }

    /// List every resource, following pagination cursors.
    pub async fn list_resources(&self) -> Result<Vec<Resource>, McpError> {
        self.ensure_initialized()?;
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = ClientRequest::ListResources(PageParams {
                cursor: cursor.clone(),
            });
            let page: ListResourcesResult =
                self.request(request, &RequestOptions::default()).await?;
            resources.extend(page.resources);
            cursor = next_page(cursor, page.next_cursor)?;
            if cursor.is_none() {
                return Ok(resources);
            }
        }
    }

    /// Read a resource by URI. One URI may yield several representations.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        self.ensure_initialized()?;
        let request = ClientRequest::ReadResource(ReadResourceParams {
            uri: uri.to_string(),
        });
        let result: ReadResourceResult = self.request(request, &RequestOptions::default()).await?;
        Ok(result.contents)
    }

    async fn request<T: DeserializeOwned>(
        &self,
        request: ClientRequest,
        options: &RequestOptions,
    ) -> Result<T, McpError> {
        let method = request.method();
        let value = self
            .send_request_with(method, Some(request.params()?), options)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| McpError::Protocol(format!("Failed to parse {method} result: {e}")))
    }

    /// Send a JSON-RPC request and wait for its raw result, using the default deadline.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.send_request_with(method, params, &RequestOptions::default())
            .await
    }

    /// Send a JSON-RPC request and wait for its raw result.
    ///
    /// The pending entry is removed on every exit path: delivery, write
    /// failure, deadline, cancellation, or the caller dropping this future.
    pub async fn send_request_with(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        options: &RequestOptions,
    ) -> Result<serde_json::Value, McpError> {
        self.ensure_started()?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let encoded = serde_json::to_vec(&request)?;

        let mut slot = self.pending.register(id)?;
        let timeout = options.timeout.or(self.request_timeout);
        let deadline = deadline(timeout);
        let cancelled = cancelled(options.cancel.as_ref());
        let write = self.transport.write_message(&encoded);
        tokio::pin!(deadline, cancelled, write);

        // The deadline and cancellation cover the write as well as the wait.
        let mut written = false;
        let reply = loop {
            tokio::select! {
                result = &mut write, if !written => {
                    result?;
                    written = true;
                    tracing::debug!("MCP server '{}' <- {method} (id {id})", self.name);
                }
                reply = &mut slot.rx => break reply,
                _ = &mut deadline => {
                    return Err(McpError::Timeout {
                        method: method.to_string(),
                        timeout_ms: timeout.map_or(0, |d| d.as_millis() as u64),
                    });
                }
                _ = &mut cancelled => {
                    return Err(McpError::Cancelled { method: method.to_string() });
                }
            }
        };

        // A dropped sender means the table was torn down.
        let response = reply.map_err(|_| McpError::Closed)??;
        response.into_result()
    }

    /// Send a JSON-RPC notification (fire-and-forget, no response expected).
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.ensure_started()?;
        let notification = JsonRpcNotification::new(method, params);
        let encoded = serde_json::to_vec(&notification)?;
        self.transport.write_message(&encoded).await
    }

    /// Shut down the connection. Every in-flight request fails with [`McpError::Closed`].
    pub async fn close(&self) -> Result<(), McpError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ClientState::Closed {
                return Ok(());
            }
            *state = ClientState::Closed;
        }

        let result = self.transport.close().await;
        self.pending.fail_all();

        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reader {
            let abort = handle.abort_handle();
            if tokio::time::timeout(READER_SHUTDOWN_GRACE, handle).await.is_err() {
                abort.abort();
            }
        }

        tracing::debug!("MCP server '{}' closed", self.name);
        result
    }

    fn advance(&self, from: ClientState, to: ClientState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == from {
            *state = to;
        }
    }

    fn ensure_started(&self) -> Result<(), McpError> {
        match self.state() {
            ClientState::Created => Err(McpError::NotStarted),
            ClientState::Closed => Err(McpError::Closed),
            ClientState::Started | ClientState::Initialized => Ok(()),
        }
    }

    fn ensure_initialized(&self) -> Result<(), McpError> {
        match self.state() {
            ClientState::Initialized => Ok(()),
            ClientState::Closed => Err(McpError::Closed),
            ClientState::Created | ClientState::Started => Err(McpError::NotInitialized),
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        // The reader task holds the transport; aborting it lets the transport drop.
        let reader = self.reader.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = reader.take() {
            handle.abort();
        }
    }
}

/// Route one inbound message. Runs on the read-loop task only.
fn dispatch(
    server: &str,
    pending: &PendingRequests,
    notifications: &NotificationRegistry,
    bytes: &[u8],
) {
    match JsonRpcMessage::parse(bytes) {
        Ok(JsonRpcMessage::Response(response)) => {
            let id = response.id;
            if !pending.complete(response) {
                tracing::debug!("MCP server '{server}' answered unknown request id {id:?}");
            }
        }
        Ok(JsonRpcMessage::Notification(notification)) => {
            if notifications.dispatch(&notification) == 0 {
                tracing::debug!(
                    "MCP server '{server}' sent unhandled notification {}",
                    notification.method
                );
            }
        }
        Ok(JsonRpcMessage::ServerRequest { id, method }) => {
            tracing::debug!("MCP server '{server}' sent unsupported request {method} (id {id})");
        }
        Err(e) => {
            tracing::debug!(
                "MCP server '{server}' sent undecodable message: {e}: {}",
                String::from_utf8_lossy(bytes)
            );
        }
    }
}

/// Advance a pagination cursor, rejecting a server that repeats itself.
fn next_page(current: Option<String>, next: Option<String>) -> Result<Option<String>, McpError> {
    match next {
        Some(next) if current.as_deref() == Some(next.as_str()) => Err(McpError::Protocol(
            format!("server repeated pagination cursor '{next}'"),
        )),
        next => Ok(next),
    }
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
