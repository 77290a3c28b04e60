use crate::scheduler::{MentionScheduler, SchedulerConfig};
use crate::server::{ConnectionServer, ServerConfig, ServerError, ServerEvent, ServerStatus};
use chrono::{DateTime, Utc};
use ctxlink_core::mention::format_mention_path;
use ctxlink_core::protocol::METHOD_AT_MENTIONED;
use ctxlink_core::{
    AuthToken, BridgeConfig, DiscoveryError, DiscoveryRecord, DiscoveryStore, Mention,
    MentionError, TokenGenerationError,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// The editor panel hosting the agent.
pub trait AgentSurface: Send + Sync {
    fn open(&self);

    fn is_visible(&self) -> bool;

    fn focus(&self) {}

    /// Identifier of the active agent terminal, if any.
    fn active_handle(&self) -> Option<u64> {
        None
    }

    /// User-facing error notification.
    fn notify_error(&self, _message: &str) {}
}

/// Headless surface: always visible, never opens anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSurface;

impl AgentSurface for NoopSurface {
    fn open(&self) {}

    fn is_visible(&self) -> bool {
        true
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge already running on port {0}")]
    AlreadyRunning(u16),
    #[error("bridge is not running")]
    NotRunning,
    #[error(transparent)]
    Token(#[from] TokenGenerationError),
    #[error("failed to start connection server: {0}")]
    Bind(#[from] ServerError),
    #[error("failed to write discovery record: {0}")]
    DiscoveryWrite(#[source] DiscoveryError),
    #[error("discovery record for port {port} does not hold the issued token")]
    TokenMismatch { port: u16 },
    #[error("invalid mention: {0}")]
    Mention(#[from] MentionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MentionOutcome {
    /// Broadcast directly to a ready agent.
    Sent,
    /// A ready agent existed but no connection accepted the message.
    SendFailed,
    Queued,
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub started_at: Option<DateTime<Utc>>,
    pub pending_mentions: usize,
    /// Active agent terminal reported by the surface.
    pub agent_handle: Option<u64>,
    pub server: ServerStatus,
}

struct AgentSession {
    port: u16,
    token: AuthToken,
    started_at: DateTime<Utc>,
    server: Arc<ConnectionServer>,
    scheduler: Arc<MentionScheduler>,
    events: JoinHandle<()>,
}

/// Owns the server, discovery record and mention queue for one editor instance.
pub struct AgentBridge {
    config: BridgeConfig,
    store: Arc<dyn DiscoveryStore>,
    surface: Arc<dyn AgentSurface>,
    session: Option<AgentSession>,
}

impl AgentBridge {
    pub fn new(
        config: BridgeConfig,
        store: Arc<dyn DiscoveryStore>,
        surface: Arc<dyn AgentSurface>,
    ) -> Self {
        Self {
            config,
            store,
            surface,
            session: None,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Issue a token, bind the server, publish the discovery record and
    /// verify it. Any failure leaves nothing running and no record behind.
    pub async fn start(&mut self) -> Result<u16, BridgeError> {
        if let Some(session) = &self.session {
            return Err(BridgeError::AlreadyRunning(session.port));
        }

        let token = AuthToken::issue().map_err(|err| {
            error!(event = "token_issue_failed", error = %err);
            self.surface.notify_error(&format!("agent bridge failed to start: {err}"));
            err
        })?;

        let (server, events) = ConnectionServer::start(ServerConfig::from(&self.config), token.clone())
            .await
            .map_err(|err| {
                error!(event = "server_start_failed", error = %err);
                self.surface.notify_error(&format!("agent bridge failed to start: {err}"));
                err
            })?;
        let port = server.port();

        let record = DiscoveryRecord::new(
            port,
            token.clone(),
            &self.config.workspace,
            &self.config.ide_name,
        );
        let echoed = match self.store.create(&record) {
            Ok(value) => value,
            Err(err) => {
                error!(event = "discovery_write_failed", port = port, error = %err);
                if let Err(remove_err) = self.store.remove(port) {
                    warn!(event = "discovery_remove_failed", port = port, error = %remove_err);
                }
                server.stop().await;
                self.surface
                    .notify_error(&format!("agent bridge failed to publish discovery record: {err}"));
                return Err(BridgeError::DiscoveryWrite(err));
            }
        };
        if echoed != token {
            error!(event = "discovery_token_mismatch", port = port);
            if let Err(err) = self.store.remove(port) {
                warn!(event = "discovery_remove_failed", port = port, error = %err);
            }
            server.stop().await;
            self.surface
                .notify_error("agent bridge failed to start: discovery token mismatch");
            return Err(BridgeError::TokenMismatch { port });
        }

        let server = Arc::new(server);
        let surface = self.surface.clone();
        let timeout_ms = self.config.connection_timeout.as_millis() as u64;
        let scheduler = Arc::new(
            MentionScheduler::new(SchedulerConfig::from(&self.config), server.clone())
                .with_drop_notifier(move |dropped| {
                    surface.notify_error(&format!(
                        "{dropped} queued mention(s) dropped: no agent connected within {timeout_ms}ms"
                    ));
                }),
        );
        let events = tokio::spawn(drive_events(events, scheduler.clone()));

        info!(
            event = "bridge_started",
            port = port,
            ide_name = %self.config.ide_name,
            workspace = %self.config.workspace.display()
        );
        self.session = Some(AgentSession {
            port,
            token,
            started_at: Utc::now(),
            server,
            scheduler,
            events,
        });
        Ok(port)
    }

    /// Remove the discovery record, close the server and drop queued mentions.
    /// Queue timers are cancelled before the server shutdown is awaited.
    pub async fn stop(&mut self) -> Result<(), BridgeError> {
        let session = self.session.take().ok_or(BridgeError::NotRunning)?;
        if let Err(err) = self.store.remove(session.port) {
            warn!(event = "discovery_remove_failed", port = session.port, error = %err);
        }
        session.server.request_stop();
        session.events.abort();
        session.scheduler.reset();
        session.server.wait_stopped().await;
        info!(event = "bridge_stopped", port = session.port);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.session.as_ref().map(|session| session.port)
    }

    pub fn token(&self) -> Option<&AuthToken> {
        self.session.as_ref().map(|session| &session.token)
    }

    /// A transport-connected agent has finished the readiness exchange.
    pub fn is_connected(&self) -> bool {
        self.session
            .as_ref()
            .map(|session| session.server.is_connected())
            .unwrap_or(false)
    }

    pub fn status(&self) -> BridgeStatus {
        match &self.session {
            Some(session) => BridgeStatus {
                running: true,
                port: Some(session.port),
                started_at: Some(session.started_at),
                pending_mentions: session.scheduler.pending(),
                agent_handle: self.surface.active_handle(),
                server: session.server.status(),
            },
            None => BridgeStatus {
                running: false,
                port: None,
                started_at: None,
                pending_mentions: 0,
                agent_handle: None,
                server: ServerStatus::stopped(),
            },
        }
    }

    /// Hand a file (and optional 1-indexed editor line range) to the agent.
    ///
    /// Sent immediately when an agent is ready and nothing is waiting ahead of
    /// it. Otherwise queued behind the earlier mentions, and the agent surface
    /// is opened.
    pub fn send_mention(
        &self,
        path: &Path,
        start_line: Option<u32>,
        end_line: Option<u32>,
    ) -> Result<MentionOutcome, BridgeError> {
        let session = self.session.as_ref().ok_or(BridgeError::NotRunning)?;
        let (file_path, is_dir) = format_mention_path(path, &self.config.workspace)?;
        let mention = if is_dir {
            Mention::new(file_path, None, None)?
        } else {
            Mention::from_editor_lines(file_path, start_line, end_line)?
        };

        if session.server.is_connected() && session.scheduler.backlog() == 0 {
            let params = match serde_json::to_value(mention.to_params()) {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "mention_encode_error", error = %err);
                    return Ok(MentionOutcome::SendFailed);
                }
            };
            if !session.server.broadcast(METHOD_AT_MENTIONED, params) {
                warn!(event = "mention_direct_send_failed", file_path = mention.file_path());
                return Ok(MentionOutcome::SendFailed);
            }
            debug!(event = "mention_sent_direct", file_path = mention.file_path());
            if self.config.focus_after_send {
                self.surface.focus();
            }
            return Ok(MentionOutcome::Sent);
        }

        session.scheduler.enqueue(mention);
        if !self.surface.is_visible() {
            debug!(event = "agent_surface_open");
            self.surface.open();
        }
        Ok(MentionOutcome::Queued)
    }
}

impl Drop for AgentBridge {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(err) = self.store.remove(session.port) {
                warn!(event = "discovery_remove_failed", port = session.port, error = %err);
            }
            session.server.request_stop();
            session.events.abort();
            session.scheduler.reset();
        }
    }
}

async fn drive_events(
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    scheduler: Arc<MentionScheduler>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::ClientConnected { conn_id } | ServerEvent::ClientReady { conn_id } => {
                debug!(event = "agent_connection_progress", conn_id = %conn_id);
                scheduler.on_client_connected();
            }
            ServerEvent::ClientDisconnected { conn_id, reason } => {
                debug!(event = "agent_disconnected", conn_id = %conn_id, reason = %reason);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxlink_core::config::PortRange;
    use ctxlink_core::LockFileStore;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSurface {
        visible: AtomicBool,
        opened: AtomicUsize,
        errors: Mutex<Vec<String>>,
    }

    impl AgentSurface for RecordingSurface {
        fn open(&self) {
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.visible.store(true, Ordering::SeqCst);
        }

        fn is_visible(&self) -> bool {
            self.visible.load(Ordering::SeqCst)
        }

        fn active_handle(&self) -> Option<u64> {
            self.is_visible().then_some(7)
        }

        fn notify_error(&self, message: &str) {
            self.errors.lock().expect("errors").push(message.to_string());
        }
    }

    /// Persists nothing and echoes a token other than the one written.
    #[derive(Default)]
    struct MismatchStore {
        removed: Mutex<Vec<u16>>,
    }

    impl DiscoveryStore for MismatchStore {
        fn create(&self, _record: &DiscoveryRecord) -> Result<AuthToken, DiscoveryError> {
            Ok(AuthToken::from_raw("someone-elses-token"))
        }

        fn remove(&self, port: u16) -> Result<(), DiscoveryError> {
            self.removed.lock().expect("removed").push(port);
            Ok(())
        }
    }

    struct FailingStore;

    impl DiscoveryStore for FailingStore {
        fn create(&self, record: &DiscoveryRecord) -> Result<AuthToken, DiscoveryError> {
            Err(DiscoveryError::Write {
                path: format!("/nonexistent/{}.lock", record.port).into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            })
        }

        fn remove(&self, _port: u16) -> Result<(), DiscoveryError> {
            Ok(())
        }
    }

    /// Writes the lock file, then reports that it could not be read back.
    struct HalfWrittenStore {
        inner: LockFileStore,
    }

    impl DiscoveryStore for HalfWrittenStore {
        fn create(&self, record: &DiscoveryRecord) -> Result<AuthToken, DiscoveryError> {
            self.inner.create(record)?;
            Err(DiscoveryError::Parse {
                path: self.inner.path_for(record.port),
                message: "truncated".to_string(),
            })
        }

        fn remove(&self, port: u16) -> Result<(), DiscoveryError> {
            self.inner.remove(port)
        }
    }

    fn test_config(workspace: &Path) -> BridgeConfig {
        let spare = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = spare.local_addr().expect("addr").port();
        drop(spare);
        BridgeConfig {
            port_range: PortRange {
                min: port,
                max: port,
            },
            workspace: workspace.to_path_buf(),
            discovery_dir: workspace.join("ide"),
            ping_interval: std::time::Duration::ZERO,
            ..BridgeConfig::default()
        }
    }

    fn port_is_free(port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_publishes_record_and_stop_removes_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let store = Arc::new(LockFileStore::new(config.discovery_dir.clone()));
        let mut bridge = AgentBridge::new(config, store.clone(), Arc::new(NoopSurface));

        let port = bridge.start().await.expect("start");
        let record = store.read(port).expect("record");
        assert_eq!(Some(&record.auth_token), bridge.token());
        assert_eq!(record.ide_name, "ctxlink");
        assert!(bridge.status().running);
        assert!(!bridge.is_connected());

        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::AlreadyRunning(p)) if p == port
        ));

        bridge.stop().await.expect("stop");
        assert!(!store.path_for(port).exists());
        assert!(!bridge.is_running());
        assert!(port_is_free(port));
        assert!(matches!(bridge.stop().await, Err(BridgeError::NotRunning)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn token_mismatch_rolls_back_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let port = config.port_range.min;
        let store = Arc::new(MismatchStore::default());
        let surface = Arc::new(RecordingSurface::default());
        let mut bridge = AgentBridge::new(config, store.clone(), surface.clone());

        let result = bridge.start().await;
        assert!(matches!(result, Err(BridgeError::TokenMismatch { port: p }) if p == port));
        assert!(!bridge.is_running());
        assert_eq!(*store.removed.lock().expect("removed"), vec![port]);
        assert!(port_is_free(port));
        assert_eq!(surface.errors.lock().expect("errors").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn discovery_write_failure_stops_server() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let port = config.port_range.min;
        let mut bridge = AgentBridge::new(config, Arc::new(FailingStore), Arc::new(NoopSurface));

        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::DiscoveryWrite(_))
        ));
        assert!(!bridge.is_running());
        assert!(port_is_free(port));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_publish_leaves_no_lock_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let port = config.port_range.min;
        let store = Arc::new(HalfWrittenStore {
            inner: LockFileStore::new(config.discovery_dir.clone()),
        });
        let surface = Arc::new(RecordingSurface::default());
        let mut bridge = AgentBridge::new(config, store.clone(), surface.clone());

        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::DiscoveryWrite(DiscoveryError::Parse { .. }))
        ));
        assert!(!store.inner.path_for(port).exists());
        assert!(store.inner.list().expect("list").is_empty());
        assert!(port_is_free(port));
        assert_eq!(surface.errors.lock().expect("errors").len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bind_failure_surfaces_as_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let held = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("hold");
        let port = held.local_addr().expect("addr").port();
        let mut config = test_config(dir.path());
        config.port_range = PortRange {
            min: port,
            max: port,
        };
        let store = Arc::new(LockFileStore::new(config.discovery_dir.clone()));
        let mut bridge = AgentBridge::new(config, store.clone(), Arc::new(NoopSurface));

        assert!(matches!(
            bridge.start().await,
            Err(BridgeError::Bind(ServerError::NoPortAvailable { .. }))
        ));
        assert!(store.list().expect("list").is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mention_without_agent_is_queued_and_opens_surface() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.rs"), b"fn main() {}").expect("file");
        let config = test_config(dir.path());
        let store = Arc::new(LockFileStore::new(config.discovery_dir.clone()));
        let surface = Arc::new(RecordingSurface::default());
        let mut bridge = AgentBridge::new(config, store, surface.clone());

        assert!(matches!(
            bridge.send_mention(Path::new("main.rs"), None, None),
            Err(BridgeError::NotRunning)
        ));

        bridge.start().await.expect("start");
        let outcome = bridge
            .send_mention(Path::new("main.rs"), Some(1), Some(3))
            .expect("mention");
        assert_eq!(outcome, MentionOutcome::Queued);
        let status = bridge.status();
        assert_eq!(status.pending_mentions, 1);
        assert_eq!(status.agent_handle, Some(7));
        assert_eq!(surface.opened.load(Ordering::SeqCst), 1);

        bridge
            .send_mention(Path::new("main.rs"), None, None)
            .expect("second mention");
        assert_eq!(surface.opened.load(Ordering::SeqCst), 1, "already visible");

        assert!(matches!(
            bridge.send_mention(Path::new("missing.rs"), None, None),
            Err(BridgeError::Mention(MentionError::MissingPath(_)))
        ));
        assert!(matches!(
            bridge.send_mention(Path::new("main.rs"), Some(4), Some(2)),
            Err(BridgeError::Mention(MentionError::InvertedRange { .. }))
        ));

        bridge.stop().await.expect("stop");
        assert_eq!(bridge.status().pending_mentions, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_cancels_queue_timers() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("lib.rs"), b"").expect("file");
        let mut config = test_config(dir.path());
        config.connection_timeout = std::time::Duration::from_millis(100);
        let store = Arc::new(LockFileStore::new(config.discovery_dir.clone()));
        let surface = Arc::new(RecordingSurface::default());
        let mut bridge = AgentBridge::new(config, store, surface.clone());

        bridge.start().await.expect("start");
        for _ in 0..3 {
            bridge
                .send_mention(Path::new("lib.rs"), None, None)
                .expect("mention");
        }
        assert_eq!(bridge.status().pending_mentions, 3);

        bridge.stop().await.expect("stop");
        assert_eq!(bridge.status().pending_mentions, 0);
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(
            surface.errors.lock().expect("errors").is_empty(),
            "no queue timeout after stop"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drop_removes_discovery_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let store = Arc::new(LockFileStore::new(config.discovery_dir.clone()));
        let mut bridge = AgentBridge::new(config, store.clone(), Arc::new(NoopSurface));
        let port = bridge.start().await.expect("start");
        assert!(store.path_for(port).exists());

        drop(bridge);
        assert!(!store.path_for(port).exists());
    }
}
