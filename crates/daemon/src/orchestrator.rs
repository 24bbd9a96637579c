//! Daemon orchestrator for wiring together all components.
//!
//! The `DaemonOrchestrator` owns the session manager and runs the three
//! background services of a daemon: the WebSocket viewer server, the IPC
//! control server and the periodic cleanup of ended sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::future::join_all;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::ipc::{
    get_daemon_pid, get_socket_path, pid_file_path, remove_pid_file, write_pid_file, IpcHandler,
    IpcRequest, IpcResponse, IpcServer, IpcSessionInfo,
};
use crate::network::{ViewerServer, ViewerServerConfig};
use crate::session::{SessionDefaults, SessionManager};

/// How often ended sessions are swept out of the registry.
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(10);

/// How long background services get to wind down on stop.
const SERVICE_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, initializing components.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client asked the daemon to stop over IPC.
    StopRequested,
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    config: Config,
    state: Arc<RwLock<OrchestratorState>>,
    session_manager: Arc<SessionManager>,
    socket_path: PathBuf,
    pid_path: PathBuf,
    listen_addr: Option<SocketAddr>,
    /// Cancels every background service.
    shutdown_token: CancellationToken,
    /// Fired by an IPC `Stop`; the owner decides when to call [`stop`](Self::stop).
    stop_request: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator. Nothing is bound until
    /// [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let session_manager = Arc::new(SessionManager::new(SessionDefaults::from(&config.session)));
        let pid_path = pid_file_path(&config.daemon.data_dir);
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            session_manager,
            socket_path: get_socket_path(),
            pid_path,
            listen_addr: None,
            shutdown_token: CancellationToken::new(),
            stop_request: CancellationToken::new(),
            tasks: Vec::new(),
            event_tx,
        })
    }

    /// Overrides the IPC socket path.
    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = path.into();
        self
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Subscribe to orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    /// Returns the address the viewer server is bound to, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Returns the IPC socket path.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Resolves once a client has asked the daemon to stop.
    pub async fn stop_requested(&self) {
        self.stop_request.cancelled().await
    }

    /// Binds the viewer and IPC servers, writes the PID file and starts
    /// the background services.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        match self.start_services().await {
            Ok(()) => {
                self.set_state(OrchestratorState::Running).await;
                info!("Daemon orchestrator started successfully");
                Ok(())
            }
            Err(e) => {
                self.shutdown_token.cancel();
                self.set_state(OrchestratorState::Stopped).await;
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("{:#}", e),
                });
                Err(e)
            }
        }
    }

    async fn start_services(&mut self) -> Result<()> {
        if let Some(pid) = get_daemon_pid(&self.pid_path) {
            anyhow::bail!("Daemon is already running (PID {})", pid);
        }

        std::fs::create_dir_all(&self.config.daemon.data_dir).with_context(|| {
            format!(
                "Failed to create data directory: {}",
                self.config.daemon.data_dir.display()
            )
        })?;

        let addr = self.config.listen_addr()?;
        let viewer_server = ViewerServer::bind(
            addr,
            Arc::clone(&self.session_manager),
            ViewerServerConfig::from(&self.config),
        )
        .await
        .with_context(|| format!("Failed to bind viewer server on {}", addr))?;
        let listen_addr = viewer_server.local_addr()?;
        self.listen_addr = Some(listen_addr);

        let ipc_server = IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind IPC socket: {}", self.socket_path.display()))?;
        info!(path = %self.socket_path.display(), "IPC server listening");

        write_pid_file(&self.pid_path)
            .with_context(|| format!("Failed to write PID file: {}", self.pid_path.display()))?;

        self.tasks.push(
            self.session_manager
                .start_cleanup_task(SESSION_CLEANUP_INTERVAL, self.shutdown_token.clone()),
        );
        debug!("Started session cleanup task");

        self.tasks
            .push(tokio::spawn(viewer_server.serve(self.shutdown_token.clone())));

        let handler = Arc::new(ControlHandler {
            manager: Arc::clone(&self.session_manager),
            started_at: Instant::now(),
            listen_addr: listen_addr.to_string(),
            stop_request: self.stop_request.clone(),
            event_tx: self.event_tx.clone(),
        });
        self.tasks
            .push(tokio::spawn(ipc_server.serve(handler, self.shutdown_token.clone())));

        Ok(())
    }

    /// Stops the background services, terminates every session and
    /// removes the PID file.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::ShuttingDown));

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();

        let tasks = std::mem::take(&mut self.tasks);
        if tokio::time::timeout(SERVICE_STOP_TIMEOUT, join_all(tasks))
            .await
            .is_err()
        {
            warn!("Background services did not stop in time");
        }

        self.session_manager.shutdown_all().await;
        remove_pid_file(&self.pid_path);

        self.set_state(OrchestratorState::Stopped).await;
        info!("Daemon orchestrator stopped");
        Ok(())
    }

    async fn set_state(&self, state: OrchestratorState) {
        *self.state.write().await = state;
        self.emit_event(OrchestratorEvent::StateChanged(state));
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(event);
    }
}

/// Answers IPC requests against the live session manager.
struct ControlHandler {
    manager: Arc<SessionManager>,
    started_at: Instant,
    listen_addr: String,
    stop_request: CancellationToken,
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl IpcHandler for ControlHandler {
    async fn handle(&self, request: IpcRequest) -> IpcResponse {
        match request {
            IpcRequest::Ping => IpcResponse::Pong,
            IpcRequest::Status => IpcResponse::Status {
                running: true,
                uptime_secs: self.started_at.elapsed().as_secs(),
                session_count: self.manager.count(),
                viewer_count: self.manager.viewer_count().await,
                listen_addr: self.listen_addr.clone(),
            },
            IpcRequest::Stop => {
                info!("Stop requested over IPC");
                self.stop_request.cancel();
                let _ = self.event_tx.send(OrchestratorEvent::StopRequested);
                IpcResponse::Stopping
            }
            IpcRequest::ListSessions => IpcResponse::Sessions {
                sessions: self
                    .manager
                    .list()
                    .await
                    .into_iter()
                    .map(IpcSessionInfo::from)
                    .collect(),
            },
            IpcRequest::KillSession { session_id } => match self.manager.kill(&session_id).await {
                Ok(status) => IpcResponse::SessionKilled {
                    session_id,
                    exit_code: status.exit_code(),
                },
                Err(e) => IpcResponse::Error {
                    message: e.to_string(),
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::IpcClient;
    use crate::session::SessionRequest;
    use tempfile::TempDir;

    fn create_test_config(temp_dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.daemon.data_dir = temp_dir.path().join("data");
        config.network.listen_addr = "127.0.0.1:0".to_string();
        config.session.default_shell = Some("/bin/sh".to_string());
        config.session.login_shell = false;
        config.session.terminate_grace_ms = 1000;
        config
    }

    fn create_orchestrator(temp_dir: &TempDir) -> DaemonOrchestrator {
        DaemonOrchestrator::new(create_test_config(temp_dir))
            .unwrap()
            .with_socket_path(temp_dir.path().join("daemon.sock"))
    }

    #[tokio::test]
    async fn test_orchestrator_creation() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = create_orchestrator(&temp_dir);

        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(orchestrator.listen_addr().is_none());
    }

    #[tokio::test]
    async fn test_orchestrator_rejects_invalid_config() {
        let mut config = Config::default();
        config.session.max_sessions = 0;
        assert!(DaemonOrchestrator::new(config).is_err());
    }

    #[tokio::test]
    async fn test_orchestrator_start_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_orchestrator(&temp_dir);
        let mut events = orchestrator.subscribe();

        orchestrator.start().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Running);
        assert!(orchestrator.listen_addr().is_some());

        let pid_path = temp_dir.path().join("data").join("daemon.pid");
        assert_eq!(get_daemon_pid(&pid_path), Some(std::process::id()));
        assert!(orchestrator.start().await.is_err());

        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
        assert!(!pid_path.exists());
        assert!(!temp_dir.path().join("daemon.sock").exists());

        let mut states = Vec::new();
        while let Ok(OrchestratorEvent::StateChanged(state)) = events.try_recv() {
            states.push(state);
        }
        assert_eq!(
            states,
            vec![
                OrchestratorState::Starting,
                OrchestratorState::Running,
                OrchestratorState::ShuttingDown,
                OrchestratorState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_orchestrator(&temp_dir);
        orchestrator.stop().await.unwrap();
        assert_eq!(orchestrator.state().await, OrchestratorState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ipc_status_list_kill_stop() {
        let temp_dir = TempDir::new().unwrap();
        let mut orchestrator = create_orchestrator(&temp_dir);
        orchestrator.start().await.unwrap();

        let managed = orchestrator
            .session_manager()
            .create(SessionRequest::default())
            .await
            .unwrap();
        let session_id = managed.session().id().clone();

        let mut client = IpcClient::connect(orchestrator.socket_path()).await.unwrap();
        assert!(client.ping().await.unwrap());

        let status = client.status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.session_count, 1);
        assert_eq!(status.viewer_count, 0);
        assert_eq!(
            status.listen_addr,
            orchestrator.listen_addr().unwrap().to_string()
        );

        let sessions = client.list_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session_id);

        client.kill_session(&session_id).await.unwrap();
        assert_eq!(orchestrator.session_manager().count(), 0);

        let err = client.kill_session(&session_id).await.unwrap_err();
        assert!(err.to_string().contains(&session_id));

        client.stop().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), orchestrator.stop_requested())
            .await
            .unwrap();

        orchestrator.stop().await.unwrap();
    }
}
