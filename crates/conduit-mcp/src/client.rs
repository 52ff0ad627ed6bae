//! MCP client managing one server connection.
//!
//! Handles the protocol handshake (initialize + initialized notification),
//! request/response correlation over a background receive pump, and the
//! tool and resource operations.

use crate::config::{DEFAULT_TIMEOUT_MS, ServerDescriptor};
use crate::error::McpError;
use crate::events::{
    ConnectionEvent, ConnectionSignal, ConnectionState, Direction, TraceSink, TracingSink,
};
use crate::jsonrpc::{Envelope, Notification, Request, RequestId, Response};
use crate::pending::PendingRequests;
use crate::transport::{EnvelopeStream, ProcessTransport, Transport};
use crate::types::{
    McpToolInfo, ResourceContents, ResourceInfo, ServerInfo, ToolCallResult, next_cursor,
    parse_resource_contents, parse_resources, parse_tools,
};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const CLIENT_NAME: &str = "conduit";
const NOTIFICATION_CAPACITY: usize = 256;

/// Client for a single MCP server.
///
/// One client owns at most one live connection. Requests may be issued
/// concurrently from any number of tasks; responses are matched by id.
pub struct McpClient {
    name: String,
    next_id: AtomicU64,
    request_timeout: Duration,
    sink: Arc<dyn TraceSink>,
    signal: Arc<ConnectionSignal>,
    notifications: broadcast::Sender<Notification>,
    unmatched: Arc<AtomicU64>,
    lifecycle: Mutex<()>,
    connecting: std::sync::Mutex<Option<CancellationToken>>,
    session: RwLock<Option<Arc<Session>>>,
}

/// Everything that lives exactly as long as one connection.
struct Session {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingRequests>,
    ready: Arc<AtomicBool>,
    timeout: Duration,
    cancel: CancellationToken,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    server_info: OnceLock<ServerInfo>,
}

impl Session {
    /// Stop the pump, fail whatever is still waiting, close the transport.
    async fn shutdown(&self) -> usize {
        self.ready.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let pump = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pump) = pump {
            let _ = pump.await;
        }
        let cancelled = self.pending.fail_all(|| McpError::Cancelled {
            method: String::new(),
        });
        self.transport.disconnect().await;
        cancelled
    }
}

impl McpClient {
    pub fn new(name: impl Into<String>) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            name: name.into(),
            next_id: AtomicU64::new(1),
            request_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            sink: Arc::new(TracingSink),
            signal: Arc::new(ConnectionSignal::new()),
            notifications,
            unmatched: Arc::new(AtomicU64::new(0)),
            lifecycle: Mutex::new(()),
            connecting: std::sync::Mutex::new(None),
            session: RwLock::new(None),
        }
    }

    /// Request timeout used by [`McpClient::connect_with`].
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Get the server name.
    pub fn server_name(&self) -> &str {
        &self.name
    }

    /// True once the handshake has completed and until the connection ends.
    pub fn is_connected(&self) -> bool {
        self.signal.get() == ConnectionState::Connected
    }

    /// Client-level connection transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.signal.subscribe()
    }

    /// Notifications pushed by the server.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Responses that arrived for ids nobody was waiting on (late, duplicate,
    /// or already timed out).
    pub fn unmatched_responses(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// What the server reported during the handshake.
    pub async fn server_info(&self) -> Option<ServerInfo> {
        let session = self.session.read().await.clone()?;
        session.server_info.get().cloned()
    }

    /// Requests currently waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        match self.session.read().await.as_ref() {
            Some(session) => session.pending.len(),
            None => 0,
        }
    }

    /// Launch the server described by `descriptor` and handshake with it.
    pub async fn connect(&self, descriptor: &ServerDescriptor) -> Result<(), McpError> {
        if self.is_connected() {
            return Ok(());
        }
        let transport = Arc::new(ProcessTransport::new(descriptor.clone()));
        self.open(transport, descriptor.timeout()).await
    }

    /// Handshake over an arbitrary transport.
    pub async fn connect_with(&self, transport: Arc<dyn Transport>) -> Result<(), McpError> {
        self.open(transport, self.request_timeout).await
    }

    async fn open(&self, transport: Arc<dyn Transport>, timeout: Duration) -> Result<(), McpError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        // Whatever is left of a connection that died on its own.
        let stale = self.session.write().await.take();
        if let Some(stale) = stale {
            stale.shutdown().await;
        }

        self.signal.transition(ConnectionState::Connecting, None);
        let abort = CancellationToken::new();
        *lock_connecting(&self.connecting) = Some(abort.clone());
        let established = self.establish(transport, timeout, &abort).await;
        lock_connecting(&self.connecting).take();
        let session = match established {
            Ok(session) => session,
            Err(e) => {
                self.signal
                    .transition(ConnectionState::Disconnected, Some(e.to_string()));
                return Err(e);
            }
        };

        let ready = Arc::clone(&session.ready);
        *self.session.write().await = Some(session);
        self.signal.transition(ConnectionState::Connected, None);
        // The pump may have seen the server exit in the meantime.
        if !ready.load(Ordering::SeqCst) {
            self.signal.transition(ConnectionState::Disconnected, None);
            return Err(McpError::ConnectionClosed);
        }
        tracing::info!("MCP server '{}' connected", self.name);
        Ok(())
    }

    async fn establish(
        &self,
        transport: Arc<dyn Transport>,
        timeout: Duration,
        abort: &CancellationToken,
    ) -> Result<Arc<Session>, McpError> {
        let transport_events = transport.subscribe();
        transport.connect().await?;
        let stream = match transport.receive() {
            Ok(stream) => stream,
            Err(e) => {
                transport.disconnect().await;
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            transport,
            pending: PendingRequests::new(),
            ready: Arc::new(AtomicBool::new(false)),
            timeout,
            cancel: CancellationToken::new(),
            pump: std::sync::Mutex::new(None),
            server_info: OnceLock::new(),
        });

        let pump = Pump {
            server: self.name.clone(),
            transport: Arc::clone(&session.transport),
            pending: Arc::clone(&session.pending),
            ready: Arc::clone(&session.ready),
            signal: Arc::clone(&self.signal),
            notifications: self.notifications.clone(),
            sink: Arc::clone(&self.sink),
            unmatched: Arc::clone(&self.unmatched),
            cancel: session.cancel.clone(),
        };
        let handle = tokio::spawn(pump.run(stream, transport_events));
        *session.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        if let Err(e) = self.handshake(&session, abort).await {
            tracing::debug!("MCP handshake with '{}' failed: {e}", self.name);
            session.shutdown().await;
            return Err(e);
        }
        Ok(session)
    }

    async fn handshake(
        &self,
        session: &Session,
        abort: &CancellationToken,
    ) -> Result<(), McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let response = self
            .call(session, "initialize", Some(params), Some(abort))
            .await?;
        let result = response
            .into_result()
            .map_err(|err| McpError::Initialize {
                server: self.name.clone(),
                code: err.code,
                message: err.message,
            })?;

        let info = ServerInfo::from_value(&result);
        if let Some(version) = info.protocol_version.as_deref() {
            if version != PROTOCOL_VERSION {
                tracing::debug!(
                    "MCP server '{}' negotiated protocol {version} (we asked for {PROTOCOL_VERSION})",
                    self.name
                );
            }
        }
        let _ = session.server_info.set(info);

        let initialized = Envelope::from(Notification::new("notifications/initialized", None));
        self.sink
            .message(&self.name, Direction::Outbound, &initialized);
        session.transport.send(&initialized).await?;

        session.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the connection. Every request still waiting fails with
    /// [`McpError::Cancelled`]. Safe to call at any time, any number of times.
    pub async fn disconnect(&self) {
        // A handshake in progress gives up instead of holding the lock.
        if let Some(abort) = lock_connecting(&self.connecting).as_ref() {
            abort.cancel();
        }
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.session.write().await.take();
        if let Some(session) = session {
            let cancelled = session.shutdown().await;
            if cancelled > 0 {
                tracing::debug!(
                    "Cancelled {cancelled} pending request(s) to MCP server '{}'",
                    self.name
                );
            }
        }
        self.signal.transition(ConnectionState::Disconnected, None);
    }

    async fn ready_session(&self) -> Result<Arc<Session>, McpError> {
        let session = self.session.read().await.clone();
        match session {
            Some(session) if session.ready.load(Ordering::SeqCst) => Ok(session),
            _ => Err(McpError::NotReady {
                server: self.name.clone(),
            }),
        }
    }

    /// Send one request and wait for its response.
    async fn call(
        &self,
        session: &Session,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, McpError> {
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed) as i64);
        // Registered before sending: the reply may beat `send` back.
        let pending = session.pending.register(id.clone())?;

        let request = Envelope::from(Request::new(id, method, params));
        self.sink.message(&self.name, Direction::Outbound, &request);
        session.transport.send(&request).await?;

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outcome = pending => outcome.map_err(|e| match e {
                McpError::Cancelled { .. } => McpError::Cancelled { method: method.to_string() },
                other => other,
            }),
            _ = tokio::time::sleep(session.timeout) => Err(McpError::Timeout {
                method: method.to_string(),
                timeout_ms: session.timeout.as_millis() as u64,
            }),
            _ = cancelled => Err(McpError::Cancelled { method: method.to_string() }),
        }
    }

    /// Generic request; a peer error object becomes [`McpError::Rpc`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        self.request_inner(method, params, None).await
    }

    /// Like [`McpClient::request`], abandoning the wait when `cancel` fires.
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, McpError> {
        self.request_inner(method, params, Some(cancel)).await
    }

    async fn request_inner(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value, McpError> {
        let session = self.ready_session().await?;
        let response = self.call(&session, method, params, cancel).await?;
        response.into_result().map_err(McpError::from)
    }

    /// All tools the server exposes, following pagination.
    pub async fn list_tools(&self) -> Result<Vec<McpToolInfo>, McpError> {
        let mut tools = Vec::new();
        self.paginate("tools/list", |result| tools.extend(parse_tools(result)))
            .await?;
        Ok(tools)
    }

    /// All resources the server exposes, following pagination.
    pub async fn list_resources(&self) -> Result<Vec<ResourceInfo>, McpError> {
        let mut resources = Vec::new();
        self.paginate("resources/list", |result| {
            resources.extend(parse_resources(result))
        })
        .await?;
        Ok(resources)
    }

    async fn paginate(
        &self,
        method: &str,
        mut page: impl FnMut(&Value),
    ) -> Result<(), McpError> {
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let result = self.request(method, params).await?;
            page(&result);
            match next_cursor(&result) {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(next) => {
                    tracing::warn!(
                        "MCP server '{}' repeated cursor '{next}' for {method}; stopping",
                        self.name
                    );
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    /// Read one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<ResourceContents>, McpError> {
        let result = self
            .request("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await?;
        Ok(parse_resource_contents(&result))
    }

    /// Call a tool on this server.
    ///
    /// A peer-side failure (error object or `isError`) comes back as a
    /// result with `success == false`; only local failures are `Err`.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        self.call_tool_inner(tool_name, arguments, None).await
    }

    pub async fn call_tool_with_cancel(
        &self,
        tool_name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolCallResult, McpError> {
        self.call_tool_inner(tool_name, arguments, Some(cancel))
            .await
    }

    async fn call_tool_inner(
        &self,
        tool_name: &str,
        arguments: Value,
        cancel: Option<&CancellationToken>,
    ) -> Result<ToolCallResult, McpError> {
        let session = self.ready_session().await?;
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let response = self
            .call(&session, "tools/call", Some(params), cancel)
            .await?;
        Ok(match response.into_result() {
            Ok(result) => ToolCallResult::from_value(result),
            Err(err) => {
                tracing::debug!(
                    "Tool '{tool_name}' on '{}' failed (code {}): {}",
                    self.name,
                    err.code,
                    err.message
                );
                ToolCallResult::from_rpc_error(err)
            }
        })
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        // Without an explicit disconnect: stop the pump and release waiters.
        // The process itself is killed when its transport is dropped.
        if let Some(session) = self.session.get_mut().take() {
            session.ready.store(false, Ordering::SeqCst);
            session.cancel.cancel();
            session.pending.fail_all(|| McpError::ConnectionClosed);
        }
    }
}

/// The background receive loop of one connection.
struct Pump {
    server: String,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingRequests>,
    ready: Arc<AtomicBool>,
    signal: Arc<ConnectionSignal>,
    notifications: broadcast::Sender<Notification>,
    sink: Arc<dyn TraceSink>,
    unmatched: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Pump {
    async fn run(
        self,
        mut stream: EnvelopeStream,
        transport_events: broadcast::Receiver<ConnectionEvent>,
    ) {
        let mut events = Some(transport_events);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                event = next_event(&mut events) => match event {
                    Ok(event) => self.sink.connection(&self.server, &event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::trace!("Missed {n} transport event(s) from '{}'", self.server);
                    }
                    Err(broadcast::error::RecvError::Closed) => events = None,
                },
                next = stream.next() => match next {
                    Some(envelope) => self.dispatch(envelope),
                    None => break,
                },
            }
        }

        // The stream ended on its own: the server exited or closed stdout.
        self.ready.store(false, Ordering::SeqCst);
        let failed = self.pending.fail_all(|| McpError::ConnectionClosed);
        if failed > 0 {
            tracing::warn!(
                "MCP server '{}' went away with {failed} request(s) outstanding",
                self.server
            );
        } else {
            tracing::debug!("MCP server '{}' went away", self.server);
        }
        self.signal
            .transition(ConnectionState::Disconnected, None);
        // A server that only closed stdout is still running.
        self.transport.disconnect().await;
    }

    fn dispatch(&self, envelope: Envelope) {
        self.sink
            .message(&self.server, Direction::Inbound, &envelope);
        match envelope {
            Envelope::Response(response) => {
                let id = response.id.clone();
                if !self.pending.resolve(response) {
                    self.unmatched.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(
                        "Dropping response {id} from '{}': no pending request",
                        self.server
                    );
                }
            }
            Envelope::Notification(notification) => {
                let _ = self.notifications.send(notification);
            }
            Envelope::Request(request) => {
                tracing::warn!(
                    "MCP server '{}' sent unsupported request '{}' (id {})",
                    self.server,
                    request.method,
                    request.id
                );
            }
        }
    }
}

fn lock_connecting(
    slot: &std::sync::Mutex<Option<CancellationToken>>,
) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<ConnectionEvent>>,
) -> Result<ConnectionEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::RpcErrorObject;
    use crate::transport::TransportFuture;
    use serde_json::json;
    use tokio::sync::mpsc;

    /// In-memory transport; the test plays the server through [`Peer`].
    struct MockTransport {
        outbound: mpsc::UnboundedSender<Envelope>,
        inbound: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
        signal: ConnectionSignal,
    }

    struct Peer {
        requests: mpsc::UnboundedReceiver<Envelope>,
        replies: Option<mpsc::UnboundedSender<Envelope>>,
    }

    fn mock_pair() -> (Arc<MockTransport>, Peer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(MockTransport {
            outbound: out_tx,
            inbound: std::sync::Mutex::new(Some(in_rx)),
            signal: ConnectionSignal::new(),
        });
        let peer = Peer {
            requests: out_rx,
            replies: Some(in_tx),
        };
        (transport, peer)
    }

    impl Transport for MockTransport {
        fn connect(&self) -> TransportFuture<'_, Result<(), McpError>> {
            Box::pin(async move {
                self.signal.transition(ConnectionState::Connected, None);
                Ok(())
            })
        }

        fn send<'a>(
            &'a self,
            envelope: &'a Envelope,
        ) -> TransportFuture<'a, Result<(), McpError>> {
            Box::pin(async move {
                if !self.is_connected() {
                    return Err(McpError::not_connected());
                }
                self.outbound
                    .send(envelope.clone())
                    .map_err(|_| McpError::Transport("peer gone".into()))
            })
        }

        fn receive(&self) -> Result<EnvelopeStream, McpError> {
            let rx = self
                .inbound
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| McpError::Transport("already taken".into()))?;
            Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|env| (env, rx))
            })))
        }

        fn disconnect(&self) -> TransportFuture<'_, ()> {
            Box::pin(async move {
                self.signal.transition(ConnectionState::Disconnected, None);
            })
        }

        fn is_connected(&self) -> bool {
            self.signal.get() == ConnectionState::Connected
        }

        fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
            self.signal.subscribe()
        }
    }

    impl Peer {
        async fn next_request(&mut self) -> Request {
            loop {
                match self.requests.recv().await.expect("client hung up") {
                    Envelope::Request(req) => return req,
                    _ => continue,
                }
            }
        }

        fn send(&self, envelope: impl Into<Envelope>) {
            if let Some(tx) = &self.replies {
                let _ = tx.send(envelope.into());
            }
        }

        async fn handshake(&mut self) {
            let init = self.next_request().await;
            assert_eq!(init.method, "initialize");
            let params = init.params.clone().unwrap();
            assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
            assert_eq!(params["clientInfo"]["name"], CLIENT_NAME);
            self.send(Response::success(
                init.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "mock", "version": "1.0"}
                }),
            ));
            match self.requests.recv().await.unwrap() {
                Envelope::Notification(n) => assert_eq!(n.method, "notifications/initialized"),
                other => panic!("Expected initialized notification, got {other:?}"),
            }
        }

        /// Simulate the server process exiting.
        fn hang_up(&mut self) {
            self.replies = None;
        }
    }

    async fn connected(timeout: Duration) -> (McpClient, Peer) {
        let (transport, mut peer) = mock_pair();
        let client = McpClient::new("mock").with_request_timeout(timeout);
        let (res, ()) = tokio::join!(client.connect_with(transport), peer.handshake());
        res.unwrap();
        (client, peer)
    }

    #[tokio::test]
    async fn handshake_marks_client_connected() {
        let (client, _peer) = connected(Duration::from_secs(5)).await;
        assert!(client.is_connected());
        let info = client.server_info().await.unwrap();
        assert_eq!(info.name.as_deref(), Some("mock"));
        assert_eq!(info.protocol_version.as_deref(), Some(PROTOCOL_VERSION));
        client.disconnect().await;
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn calls_before_handshake_fail_not_ready() {
        let client = McpClient::new("idle");
        assert!(matches!(
            client.list_tools().await,
            Err(McpError::NotReady { .. })
        ));
        assert!(matches!(
            client.call_tool("echo", json!({})).await,
            Err(McpError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn handshake_error_fails_connect() {
        let (transport, mut peer) = mock_pair();
        let client = McpClient::new("grumpy");
        let mut events = client.subscribe();
        let server = async {
            let init = peer.next_request().await;
            peer.send(Response::failure(
                init.id,
                RpcErrorObject::new(-32602, "Unsupported protocol version"),
            ));
        };
        let (res, ()) = tokio::join!(client.connect_with(transport.clone()), server);
        match res {
            Err(McpError::Initialize { code, message, .. }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "Unsupported protocol version");
            }
            other => panic!("Expected Initialize error, got {other:?}"),
        }
        assert!(!client.is_connected());
        assert!(!transport.is_connected());
        assert_eq!(events.recv().await.unwrap().state, ConnectionState::Connecting);
        let last = events.recv().await.unwrap();
        assert_eq!(last.state, ConnectionState::Disconnected);
        assert!(last.error.is_some());
    }

    #[tokio::test]
    async fn call_tool_echo() {
        let (client, mut peer) = connected(Duration::from_secs(5)).await;
        let server = async {
            let req = peer.next_request().await;
            assert_eq!(req.method, "tools/call");
            let params = req.params.unwrap();
            assert_eq!(params["name"], "echo");
            assert_eq!(params["arguments"]["text"], "hi");
            peer.send(Response::success(
                req.id,
                json!({"content": [{"type": "text", "text": "hi"}]}),
            ));
        };
        let (result, ()) = tokio::join!(client.call_tool("echo", json!({"text": "hi"})), server);
        let result = result.unwrap();
        assert!(result.is_success());
        assert_eq!(result.content.len(), 1);
        assert_eq!(result.content[0].as_text(), Some("hi"));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn tool_rpc_error_is_a_failed_result() {
        let (client, mut peer) = connected(Duration::from_secs(5)).await;
        let server = async {
            let req = peer.next_request().await;
            peer.send(Response::failure(
                req.id,
                RpcErrorObject::new(-32602, "Unknown tool: nope"),
            ));
        };
        let (result, ()) = tokio::join!(client.call_tool("nope", json!({})), server);
        let result = result.unwrap();
        assert!(!result.is_success());
        assert!(matches!(
            result.error,
            Some(crate::types::ToolCallError::Rpc { code: -32602, .. })
        ));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_callers() {
        let (client, mut peer) = connected(Duration::from_secs(5)).await;
        let server = async {
            let first = peer.next_request().await;
            let second = peer.next_request().await;
            let answer = |req: &Request| {
                let tool = req.params.as_ref().unwrap()["name"].as_str().unwrap().to_string();
                Response::success(
                    req.id.clone(),
                    json!({"content": [{"type": "text", "text": tool}]}),
                )
            };
            peer.send(answer(&second));
            peer.send(answer(&first));
        };
        let (a, b, ()) = tokio::join!(
            client.call_tool("alpha", json!({})),
            client.call_tool("beta", json!({})),
            server
        );
        assert_eq!(a.unwrap().text(), "alpha");
        assert_eq!(b.unwrap().text(), "beta");
        client.disconnect().await;
    }

    #[tokio::test]
    async fn ids_are_unique_and_increasing() {
        let (client, mut peer) = connected(Duration::from_secs(5)).await;
        let server = async {
            let mut ids = Vec::new();
            for _ in 0..5 {
                let req = peer.next_request().await;
                ids.push(req.id.clone());
                peer.send(Response::success(req.id, json!({"tools": []})));
            }
            ids
        };
        let calls = async {
            for _ in 0..5 {
                client.list_tools().await.unwrap();
            }
        };
        let ((), ids) = tokio::join!(calls, server);
        let numbers: Vec<i64> = ids
            .into_iter()
            .map(|id| match id {
                RequestId::Number(n) => n,
                other => panic!("Expected numeric id, got {other}"),
            })
            .collect();
        // The handshake used id 1.
        assert_eq!(numbers, vec![2, 3, 4, 5, 6]);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_late_reply_is_dropped() {
        let (client, mut peer) = connected(Duration::from_millis(100)).await;
        let result = client.list_tools().await;
        match result {
            Err(McpError::Timeout { method, timeout_ms }) => {
                assert_eq!(method, "tools/list");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert_eq!(client.pending_requests().await, 0);

        let late = peer.next_request().await;
        peer.send(Response::success(late.id, json!({"tools": []})));
        // Give the pump a moment to see it.
        for _ in 0..50 {
            if client.unmatched_responses() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.unmatched_responses(), 1);
        assert!(client.is_connected());
        client.disconnect().await;
    }

    #[tokio::test]
    async fn caller_cancellation_is_local() {
        let (client, mut peer) = connected(Duration::from_secs(5)).await;
        let token = CancellationToken::new();
        let cancel = async {
            let req = peer.next_request().await;
            token.cancel();
            req
        };
        let (result, req) = tokio::join!(
            client.request_with_cancel("tools/list", None, &token),
            cancel
        );
        assert!(matches!(result, Err(McpError::Cancelled { ref method }) if method == "tools/list"));
        assert_eq!(client.pending_requests().await, 0);

        // The connection is still usable.
        let server = async {
            peer.send(Response::success(req.id, json!({"tools": []})));
            let next = peer.next_request().await;
            peer.send(Response::success(next.id, json!({"tools": [{"name": "t"}]})));
        };
        let (tools, ()) = tokio::join!(client.list_tools(), server);
        assert_eq!(tools.unwrap().len(), 1);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_drains_concurrent_requests() {
        let (client, mut peer) = connected(Duration::from_secs(30)).await;
        let client = Arc::new(client);
        let mut calls = Vec::new();
        for i in 0..3 {
            let client = Arc::clone(&client);
            calls.push(tokio::spawn(async move {
                client.call_tool(&format!("slow{i}"), json!({})).await
            }));
        }
        for _ in 0..3 {
            peer.next_request().await;
        }
        client.disconnect().await;
        for call in calls {
            let result = tokio::time::timeout(Duration::from_secs(1), call)
                .await
                .expect("caller left hanging")
                .unwrap();
            assert!(matches!(result, Err(McpError::Cancelled { .. })));
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn server_exit_fails_pending_and_disconnects() {
        let (client, mut peer) = connected(Duration::from_secs(30)).await;
        let mut events = client.subscribe();
        let server = async {
            peer.next_request().await;
            peer.hang_up();
        };
        let (result, ()) = tokio::join!(client.list_resources(), server);
        assert!(matches!(result, Err(McpError::ConnectionClosed)));
        assert_eq!(events.recv().await.unwrap().state, ConnectionState::Disconnected);
        assert!(!client.is_connected());
        assert!(matches!(
            client.list_tools().await,
            Err(McpError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn server_exit_tears_down_transport() {
        let (transport, mut peer) = mock_pair();
        let client = McpClient::new("mock");
        let (res, ()) = tokio::join!(client.connect_with(transport.clone()), peer.handshake());
        res.unwrap();
        let mut transport_events = transport.subscribe();

        peer.hang_up();
        let event = tokio::time::timeout(Duration::from_secs(5), transport_events.recv())
            .await
            .expect("transport was never disconnected")
            .unwrap();
        assert_eq!(event.state, ConnectionState::Disconnected);
        assert!(!transport.is_connected());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn disconnect_interrupts_stalled_handshake() {
        let (transport, mut peer) = mock_pair();
        let client = McpClient::new("stalled").with_request_timeout(Duration::from_secs(30));
        let server = async {
            let init = peer.next_request().await;
            assert_eq!(init.method, "initialize");
            tokio::time::timeout(Duration::from_secs(2), client.disconnect())
                .await
                .expect("disconnect waited for the handshake timeout");
        };
        let (res, ()) = tokio::join!(client.connect_with(transport.clone()), server);
        assert!(
            matches!(res, Err(McpError::Cancelled { ref method }) if method == "initialize"),
            "got {res:?}"
        );
        assert!(!client.is_connected());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn notifications_reach_subscribers() {
        let (client, peer) = connected(Duration::from_secs(5)).await;
        let mut notifications = client.subscribe_notifications();
        peer.send(Notification::new(
            "notifications/tools/list_changed",
            None,
        ));
        let received = notifications.recv().await.unwrap();
        assert_eq!(received.method, "notifications/tools/list_changed");
        client.disconnect().await;
    }

    #[tokio::test]
    async fn list_tools_follows_cursor() {
        let (client, mut peer) = connected(Duration::from_secs(5)).await;
        let server = async {
            let first = peer.next_request().await;
            assert!(first.params.is_none());
            peer.send(Response::success(
                first.id,
                json!({"tools": [{"name": "a"}], "nextCursor": "p2"}),
            ));
            let second = peer.next_request().await;
            assert_eq!(second.params.unwrap()["cursor"], "p2");
            peer.send(Response::success(second.id, json!({"tools": [{"name": "b"}]})));
        };
        let (tools, ()) = tokio::join!(client.list_tools(), server);
        let names: Vec<String> = tools.unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["a", "b"]);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn read_resource_maps_contents_and_errors() {
        let (client, mut peer) = connected(Duration::from_secs(5)).await;
        let server = async {
            let ok = peer.next_request().await;
            assert_eq!(ok.method, "resources/read");
            assert_eq!(ok.params.unwrap()["uri"], "file:///a.txt");
            peer.send(Response::success(
                ok.id,
                json!({"contents": [{"uri": "file:///a.txt", "text": "hello"}]}),
            ));
            let missing = peer.next_request().await;
            peer.send(Response::failure(
                missing.id,
                RpcErrorObject::new(-32002, "Resource not found"),
            ));
        };
        let reads = async {
            let found = client.read_resource("file:///a.txt").await;
            let missing = client.read_resource("file:///nope").await;
            (found, missing)
        };
        let ((found, missing), ()) = tokio::join!(reads, server);
        assert_eq!(found.unwrap()[0].text.as_deref(), Some("hello"));
        assert!(matches!(missing, Err(McpError::Rpc { code: -32002, .. })));
        client.disconnect().await;
    }

    #[tokio::test]
    async fn connect_is_a_noop_when_connected() {
        let (client, _peer) = connected(Duration::from_secs(5)).await;
        let (other, _other_peer) = mock_pair();
        client.connect_with(other.clone()).await.unwrap();
        // The second transport was never touched.
        assert!(!other.is_connected());
        client.disconnect().await;
        client.disconnect().await;
    }
}
