use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use ctxlink_core::config::{BridgeConfig, PortRange};
use ctxlink_core::protocol::{
    decode_message, encode_message, initialize_result, MessageKind, RpcMessage, AUTH_HEADER,
    DEFAULT_MAX_FRAME_BYTES, INVALID_REQUEST, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_NOT_FOUND, METHOD_PING, PARSE_ERROR, SERVER_NOT_INITIALIZED,
};
use ctxlink_core::AuthToken;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no free port in range {min}-{max}")]
    NoPortAvailable { min: u16, max: u16 },
    #[error("invalid port range {min}-{max}")]
    InvalidPortRange { min: u16, max: u16 },
    #[error("server io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub port_range: PortRange,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub server_name: String,
}

impl From<&BridgeConfig> for ServerConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            port_range: config.port_range,
            ping_interval: config.ping_interval,
            write_timeout: config.write_timeout,
            queue_capacity: config.client_queue_capacity,
            server_name: config.ide_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    HandshakePending,
    Connected,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub conn_id: String,
    pub state: ConnectionState,
    pub handshake_complete: bool,
    pub accepted_at: DateTime<Utc>,
}

impl ClientStatus {
    /// Transport connected and readiness exchange finished.
    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected && self.handshake_complete
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub clients: Vec<ClientStatus>,
    pub client_count: usize,
}

impl ServerStatus {
    pub fn stopped() -> Self {
        Self {
            running: false,
            port: None,
            clients: Vec::new(),
            client_count: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.clients.iter().any(ClientStatus::is_ready)
    }
}

/// Connection lifecycle notifications for the owner of the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Token accepted and socket upgraded; readiness exchange still pending.
    ClientConnected { conn_id: String },
    ClientReady { conn_id: String },
    ClientDisconnected { conn_id: String, reason: String },
}

struct ClientEntry {
    seq: u64,
    state: ConnectionState,
    initialize_seen: bool,
    handshake_complete: bool,
    accepted_at: DateTime<Utc>,
    sender: Option<mpsc::Sender<Message>>,
    closer: Arc<Notify>,
}

impl ClientEntry {
    fn is_ready(&self) -> bool {
        self.state == ConnectionState::Connected && self.handshake_complete
    }
}

struct ServerShared {
    config: ServerConfig,
    token: AuthToken,
    conn_counter: AtomicU64,
    clients: Mutex<HashMap<String, ClientEntry>>,
    events: mpsc::UnboundedSender<ServerEvent>,
}

impl ServerShared {
    fn new(config: ServerConfig, token: AuthToken, events: mpsc::UnboundedSender<ServerEvent>) -> Self {
        Self {
            config,
            token,
            conn_counter: AtomicU64::new(0),
            clients: Mutex::new(HashMap::new()),
            events,
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<String, ClientEntry>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.events.send(event);
    }

    fn register_pending(&self) -> (String, Arc<Notify>) {
        let seq = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let conn_id = format!("conn-{seq}");
        let closer = Arc::new(Notify::new());
        self.clients().insert(
            conn_id.clone(),
            ClientEntry {
                seq,
                state: ConnectionState::HandshakePending,
                initialize_seen: false,
                handshake_complete: false,
                accepted_at: Utc::now(),
                sender: None,
                closer: closer.clone(),
            },
        );
        (conn_id, closer)
    }

    /// `handshake_pending -> connected`. False if the entry is gone (server stopped).
    fn mark_connected(&self, conn_id: &str, sender: mpsc::Sender<Message>) -> bool {
        let mut clients = self.clients();
        let Some(entry) = clients.get_mut(conn_id) else {
            return false;
        };
        entry.state = ConnectionState::Connected;
        entry.sender = Some(sender);
        true
    }

    fn mark_initialize_seen(&self, conn_id: &str) {
        if let Some(entry) = self.clients().get_mut(conn_id) {
            entry.initialize_seen = true;
        }
    }

    /// Completes the readiness exchange. Returns true on the first transition only.
    fn mark_ready(&self, conn_id: &str) -> Result<bool, &'static str> {
        let mut clients = self.clients();
        let Some(entry) = clients.get_mut(conn_id) else {
            return Err("unknown_connection");
        };
        if entry.state != ConnectionState::Connected {
            return Err("not_connected");
        }
        if !entry.initialize_seen {
            return Err("initialize_missing");
        }
        if entry.handshake_complete {
            return Ok(false);
        }
        entry.handshake_complete = true;
        Ok(true)
    }

    fn is_ready(&self, conn_id: &str) -> bool {
        self.clients()
            .get(conn_id)
            .map(ClientEntry::is_ready)
            .unwrap_or(false)
    }

    /// Drop a connection from tracking (`-> closed`) and wake its socket task.
    fn unregister(&self, conn_id: &str, reason: &str) {
        let Some(entry) = self.clients().remove(conn_id) else {
            return;
        };
        entry.closer.notify_one();
        match entry.state {
            ConnectionState::HandshakePending => {
                debug!(event = "client_discarded", conn_id = conn_id, reason = reason);
            }
            _ => {
                info!(
                    event = "client_disconnected",
                    conn_id = conn_id,
                    handshake_complete = entry.handshake_complete,
                    reason = reason
                );
                self.emit(ServerEvent::ClientDisconnected {
                    conn_id: conn_id.to_string(),
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn close_all(&self, reason: &str) {
        let drained = self.clients().drain().collect::<Vec<_>>();
        for (conn_id, entry) in drained {
            if let Some(sender) = &entry.sender {
                let _ = sender.try_send(Message::Close(Some(axum::extract::ws::CloseFrame {
                    code: 1001,
                    reason: reason.to_string().into(),
                })));
            }
            entry.closer.notify_one();
            if entry.state == ConnectionState::Connected {
                self.emit(ServerEvent::ClientDisconnected {
                    conn_id,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn snapshot(&self) -> Vec<ClientStatus> {
        let clients = self.clients();
        let mut entries = clients.iter().collect::<Vec<_>>();
        entries.sort_by_key(|(_, entry)| entry.seq);
        entries
            .into_iter()
            .map(|(conn_id, entry)| ClientStatus {
                conn_id: conn_id.clone(),
                state: entry.state,
                handshake_complete: entry.handshake_complete,
                accepted_at: entry.accepted_at,
            })
            .collect()
    }

    fn has_ready_client(&self) -> bool {
        self.clients().values().any(ClientEntry::is_ready)
    }

    fn broadcast(&self, method: &str, params: Value) -> bool {
        let message = RpcMessage::notification(method, Some(params));
        let text = match encode_message(&message, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "broadcast_encode_error", method = method, error = %err);
                return false;
            }
        };

        let targets = self
            .clients()
            .iter()
            .filter(|(_, entry)| entry.is_ready())
            .filter_map(|(conn_id, entry)| entry.sender.clone().map(|tx| (conn_id.clone(), tx)))
            .collect::<Vec<_>>();
        if targets.is_empty() {
            debug!(event = "broadcast_no_clients", method = method);
            return false;
        }

        let mut delivered = 0usize;
        let mut failed = Vec::new();
        for (conn_id, sender) in targets {
            match sender.try_send(Message::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(event = "send_error", conn_id = %conn_id, method = method);
                    failed.push(conn_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "slow_consumer", conn_id = %conn_id, method = method);
                    failed.push(conn_id);
                }
            }
        }
        for conn_id in failed {
            self.unregister(&conn_id, "send_error");
        }

        debug!(event = "broadcast", method = method, delivered = delivered);
        delivered > 0
    }

    fn reply(&self, conn_id: &str, tx: &mpsc::Sender<Message>, message: RpcMessage) {
        match encode_message(&message, DEFAULT_MAX_FRAME_BYTES) {
            Ok(text) => {
                if tx.try_send(Message::Text(text)).is_err() {
                    warn!(event = "reply_dropped", conn_id = conn_id);
                }
            }
            Err(err) => warn!(event = "reply_encode_error", conn_id = conn_id, error = %err),
        }
    }

    fn handle_frame(&self, conn_id: &str, tx: &mpsc::Sender<Message>, data: &[u8]) {
        let message: RpcMessage = match decode_message(data, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = conn_id, error = %err);
                self.reply(
                    conn_id,
                    tx,
                    RpcMessage::error_response(None, PARSE_ERROR, "parse error"),
                );
                return;
            }
        };

        match message.kind() {
            MessageKind::Request => self.handle_request(conn_id, tx, message),
            MessageKind::Notification => self.handle_notification(conn_id, &message),
            MessageKind::Response => {
                debug!(event = "response_ignored", conn_id = conn_id);
            }
            MessageKind::Invalid => {
                warn!(event = "request_invalid", conn_id = conn_id);
                self.reply(
                    conn_id,
                    tx,
                    RpcMessage::error_response(message.id, INVALID_REQUEST, "invalid request"),
                );
            }
        }
    }

    fn handle_request(&self, conn_id: &str, tx: &mpsc::Sender<Message>, message: RpcMessage) {
        let id = message.id.clone().unwrap_or(Value::Null);
        match message.method() {
            METHOD_INITIALIZE => {
                self.mark_initialize_seen(conn_id);
                info!(event = "initialize", conn_id = conn_id);
                self.reply(
                    conn_id,
                    tx,
                    RpcMessage::response(
                        id,
                        initialize_result(&self.config.server_name, env!("CARGO_PKG_VERSION")),
                    ),
                );
            }
            METHOD_PING => {
                self.reply(conn_id, tx, RpcMessage::response(id, serde_json::json!({})));
            }
            other if !self.is_ready(conn_id) => {
                warn!(event = "request_before_ready", conn_id = conn_id, method = other);
                self.reply(
                    conn_id,
                    tx,
                    RpcMessage::error_response(Some(id), SERVER_NOT_INITIALIZED, "server not initialized"),
                );
            }
            other => {
                debug!(event = "unknown_method", conn_id = conn_id, method = other);
                self.reply(
                    conn_id,
                    tx,
                    RpcMessage::error_response(Some(id), METHOD_NOT_FOUND, "method not found"),
                );
            }
        }
    }

    fn handle_notification(&self, conn_id: &str, message: &RpcMessage) {
        match message.method() {
            METHOD_INITIALIZED => match self.mark_ready(conn_id) {
                Ok(true) => {
                    info!(event = "handshake_complete", conn_id = conn_id);
                    self.emit(ServerEvent::ClientReady {
                        conn_id: conn_id.to_string(),
                    });
                }
                Ok(false) => debug!(event = "duplicate_initialized", conn_id = conn_id),
                Err(reason) => warn!(event = "handshake_rejected", conn_id = conn_id, reason = reason),
            },
            other => debug!(event = "notification_ignored", conn_id = conn_id, method = other),
        }
    }

    async fn handle_socket(
        self: Arc<Self>,
        socket: WebSocket,
        conn_id: String,
        closer: Arc<Notify>,
        remote: SocketAddr,
    ) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(self.config.queue_capacity);
        let write_timeout = self.config.write_timeout;
        let conn_for_writer = conn_id.clone();
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                match tokio::time::timeout(write_timeout, ws_sender.send(msg)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(event = "write_error", conn_id = %conn_for_writer, error = %err);
                        return;
                    }
                    Err(_) => {
                        warn!(event = "write_timeout", conn_id = %conn_for_writer);
                        return;
                    }
                }
                if closing {
                    return;
                }
            }
            let _ = ws_sender.close().await;
        });

        if !self.mark_connected(&conn_id, tx.clone()) {
            drop(tx);
            let _ = write_task.await;
            return;
        }
        info!(event = "client_connected", conn_id = %conn_id, remote = %remote);
        self.emit(ServerEvent::ClientConnected {
            conn_id: conn_id.clone(),
        });

        let ping_interval = self.config.ping_interval;
        let keepalive = !ping_interval.is_zero();
        let mut ticker = tokio::time::interval(if keepalive {
            ping_interval
        } else {
            Duration::from_secs(3600)
        });
        ticker.tick().await;
        let mut last_seen = Instant::now();

        let reason = loop {
            tokio::select! {
                _ = closer.notified() => break "closed_by_server",
                _ = ticker.tick(), if keepalive => {
                    if last_seen.elapsed() > ping_interval * 2 {
                        warn!(event = "stale_close", conn_id = %conn_id);
                        break "stale";
                    }
                    if tx.try_send(Message::Ping(Vec::new())).is_err() {
                        warn!(event = "ping_failed", conn_id = %conn_id);
                        break "ping_failed";
                    }
                }
                incoming = ws_receiver.next() => {
                    let msg = match incoming {
                        Some(Ok(value)) => value,
                        Some(Err(err)) => {
                            warn!(event = "read_error", conn_id = %conn_id, error = %err);
                            break "read_error";
                        }
                        None => break "disconnect",
                    };
                    last_seen = Instant::now();
                    match msg {
                        Message::Text(text) => self.handle_frame(&conn_id, &tx, text.as_bytes()),
                        Message::Binary(bytes) => self.handle_frame(&conn_id, &tx, &bytes),
                        Message::Ping(_) | Message::Pong(_) => {}
                        Message::Close(_) => break "client_close",
                    }
                }
            }
        };

        self.unregister(&conn_id, reason);
        drop(tx);
        let _ = write_task.await;
    }
}

/// Locally bound, token-authenticated WebSocket endpoint for the agent.
pub struct ConnectionServer {
    shared: Arc<ServerShared>,
    port: u16,
    running: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionServer {
    /// Bind the first free port in range and start accepting connections.
    pub async fn start(
        config: ServerConfig,
        token: AuthToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), ServerError> {
        let (listener, port) = bind_first_free(config.port_range).await?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ServerShared::new(config, token, events_tx));

        let app = Router::new()
            .route("/", get(ws_handler))
            .with_state(shared.clone());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let shutdown = async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if let Err(err) = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await
            {
                error!(event = "server_error", error = %err);
            }
        });

        info!(event = "server_start", port = port);
        Ok((
            Self {
                shared,
                port,
                running: AtomicBool::new(true),
                shutdown: shutdown_tx,
                task: Mutex::new(Some(task)),
            },
            events_rx,
        ))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// At least one connection is transport-connected *and* past the readiness exchange.
    pub fn is_connected(&self) -> bool {
        self.is_running() && self.shared.has_ready_client()
    }

    pub fn status(&self) -> ServerStatus {
        if !self.is_running() {
            return ServerStatus::stopped();
        }
        let clients = self.shared.snapshot();
        ServerStatus {
            running: true,
            port: Some(self.port),
            client_count: clients.len(),
            clients,
        }
    }

    /// Push a notification to every ready connection. True if at least one accepted it.
    pub fn broadcast(&self, method: &str, params: Value) -> bool {
        if !self.is_running() {
            return false;
        }
        self.shared.broadcast(method, params)
    }

    /// Begin shutdown without waiting for the listener to close.
    pub fn request_stop(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.shared.close_all("server_stop");
        let _ = self.shutdown.send(true);
        true
    }

    /// Close every connection and release the port. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.request_stop();
        self.wait_stopped().await;
    }

    /// Wait for the listener task after [`request_stop`](Self::request_stop).
    /// Returns immediately once the task has been joined.
    pub async fn wait_stopped(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
                warn!(event = "server_stop_timeout", port = self.port);
                task.abort();
                let _ = task.await;
            }
            info!(event = "server_stop", port = self.port);
        }
    }
}

async fn bind_first_free(range: PortRange) -> Result<(TcpListener, u16), ServerError> {
    if range.min == 0 || range.min > range.max {
        return Err(ServerError::InvalidPortRange {
            min: range.min,
            max: range.max,
        });
    }
    for port in range.ports() {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(err) => debug!(event = "port_unavailable", port = port, error = %err),
        }
    }
    Err(ServerError::NoPortAvailable {
        min: range.min,
        max: range.max,
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(shared): State<Arc<ServerShared>>,
) -> Response {
    if !remote.ip().is_loopback() {
        warn!(event = "remote_rejected", remote = %remote);
        return StatusCode::FORBIDDEN.into_response();
    }

    let (conn_id, closer) = shared.register_pending();
    let presented = headers.get(AUTH_HEADER).and_then(|value| value.to_str().ok());
    if !presented.is_some_and(|value| shared.token.matches(value)) {
        warn!(
            event = "auth_rejected",
            conn_id = %conn_id,
            remote = %remote,
            header_present = presented.is_some()
        );
        shared.unregister(&conn_id, "auth_failed");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let failed = shared.clone();
    let failed_id = conn_id.clone();
    ws.max_message_size(DEFAULT_MAX_FRAME_BYTES)
        .on_failed_upgrade(move |err| {
            warn!(event = "upgrade_failed", conn_id = %failed_id, error = %err);
            failed.unregister(&failed_id, "upgrade_failed");
        })
        .on_upgrade(move |socket| shared.handle_socket(socket, conn_id, closer, remote))
        .into_response()
}
