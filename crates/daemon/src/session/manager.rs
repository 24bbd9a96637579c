//! Session manager for managing multiple PTY sessions.
//!
//! This module provides a thread-safe session manager that can create,
//! retrieve, and manage multiple PTY sessions concurrently. Each session is
//! paired with a [`Broadcaster`] that its reader delivers into; viewers
//! attach and detach by joining or leaving that broadcaster.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::WindowSize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::multiplexer::{Broadcaster, ViewerId};
use super::pty::{Session, SessionError, SessionId, SessionStatus, SpawnOptions};
use super::reader::ReaderConfig;
use super::sink::OutputChunk;
use crate::config::SessionConfig;

/// Settings applied to every session the manager creates.
#[derive(Debug, Clone)]
pub struct SessionDefaults {
    /// Shell used when a request names none.
    pub shell: Option<String>,
    /// Start shells as login shells.
    pub login: bool,
    /// `TERM` for spawned shells.
    pub term: String,
    /// Size used when a request names none.
    pub size: WindowSize,
    /// Upper bound on concurrently open sessions.
    pub max_sessions: usize,
    /// Reader tuning.
    pub reader: ReaderConfig,
    /// Grace period between terminate signal and force-kill.
    pub terminate_grace: Duration,
    /// Per-viewer output queue length.
    pub viewer_queue_capacity: usize,
    /// How long one viewer may stall delivery.
    pub viewer_send_timeout: Duration,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for SessionDefaults {
    fn from(config: &SessionConfig) -> Self {
        Self {
            shell: config.default_shell.clone(),
            login: config.login_shell,
            term: config.term.clone(),
            size: WindowSize::new(config.rows, config.cols),
            max_sessions: config.max_sessions,
            reader: ReaderConfig {
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                buffer_size: config.read_buffer_size,
                ..ReaderConfig::default()
            },
            terminate_grace: Duration::from_millis(config.terminate_grace_ms),
            viewer_queue_capacity: config.viewer_queue_capacity,
            viewer_send_timeout: Duration::from_millis(config.viewer_send_timeout_ms),
        }
    }
}

/// Parameters for a new session. Unset fields fall back to the defaults.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    pub shell: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub size: Option<WindowSize>,
}

/// A session together with its viewer set.
pub struct ManagedSession {
    session: Session,
    broadcaster: Arc<Broadcaster>,
    created_at: SystemTime,
}

impl ManagedSession {
    /// Returns the underlying session.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Returns the session's broadcaster.
    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Returns when the session was created.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }
}

/// Information about a session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Current terminal rows.
    pub rows: u16,
    /// Current terminal columns.
    pub cols: u16,
    /// Whether the session is still running.
    pub running: bool,
    /// Number of attached viewers.
    pub viewers: usize,
    /// Creation time, Unix seconds.
    pub created_at: u64,
    /// When the shell last produced output, Unix seconds.
    pub last_output: u64,
    /// Directory the shell was started in.
    pub cwd: PathBuf,
}

/// Thread-safe session manager using DashMap.
///
/// This implementation provides concurrent access to sessions without
/// requiring external locking at the call site.
pub struct SessionManager {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<ManagedSession>>,
    /// Spawns in flight, each holding one of the `max_sessions` slots.
    pending: AtomicUsize,
    defaults: SessionDefaults,
}

/// A claimed session slot, released when the spawn that holds it returns.
struct SlotReservation<'a> {
    pending: &'a AtomicUsize,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionManager {
    /// Creates a new session manager.
    pub fn new(defaults: SessionDefaults) -> Self {
        Self {
            sessions: DashMap::new(),
            pending: AtomicUsize::new(0),
            defaults,
        }
    }

    /// Returns the defaults applied to new sessions.
    pub fn defaults(&self) -> &SessionDefaults {
        &self.defaults
    }

    /// Creates a new session and starts relaying its output.
    ///
    /// Spawn failures propagate and no session is registered.
    pub async fn create(&self, request: SessionRequest) -> Result<Arc<ManagedSession>, SessionError> {
        self.spawn_session(request, None).await.map(|(managed, _)| managed)
    }

    /// Creates a new session with `viewer_id` already attached, so the
    /// viewer sees the shell's output from the first byte.
    pub async fn create_attached(
        &self,
        request: SessionRequest,
        viewer_id: ViewerId,
    ) -> Result<(Arc<ManagedSession>, mpsc::Receiver<OutputChunk>), SessionError> {
        let (managed, rx) = self.spawn_session(request, Some(viewer_id)).await?;
        match rx {
            Some(rx) => Ok((managed, rx)),
            None => Err(SessionError::Terminated(managed.session.id().clone())),
        }
    }

    async fn spawn_session(
        &self,
        request: SessionRequest,
        first_viewer: Option<ViewerId>,
    ) -> Result<(Arc<ManagedSession>, Option<mpsc::Receiver<OutputChunk>>), SessionError> {
        // Held until the session is registered or the spawn fails.
        let _slot = self.reserve_slot()?;

        let session = Session::spawn(SpawnOptions {
            shell: request.shell.or_else(|| self.defaults.shell.clone()),
            login: self.defaults.login,
            cwd: request.cwd,
            term: self.defaults.term.clone(),
            env: request.env,
            size: request.size.unwrap_or(self.defaults.size),
        })?;

        let broadcaster = Arc::new(Broadcaster::with_send_timeout(
            self.defaults.viewer_send_timeout,
        ));

        let rx = match &first_viewer {
            Some(viewer_id) => Some(
                broadcaster
                    .add_viewer_with_capacity(viewer_id.clone(), self.defaults.viewer_queue_capacity)
                    .await,
            ),
            None => None,
        };

        if let Err(e) = session
            .start_reader(Arc::clone(&broadcaster), self.defaults.reader)
            .await
        {
            session.terminate(self.defaults.terminate_grace).await;
            return Err(e);
        }

        let managed = Arc::new(ManagedSession {
            session,
            broadcaster,
            created_at: SystemTime::now(),
        });

        let session_id = managed.session.id().clone();
        self.sessions.insert(session_id.clone(), Arc::clone(&managed));

        tracing::info!(
            session_id = %session_id,
            pid = ?managed.session.pid(),
            sessions = self.sessions.len(),
            "Created new session"
        );
        if let Some(viewer_id) = first_viewer {
            tracing::info!(session_id = %session_id, viewer_id = %viewer_id, "Viewer attached");
        }

        Ok((managed, rx))
    }

    /// Claims a slot for a new session.
    ///
    /// `pending` is read before the registry, so a spawn that registers in
    /// between is counted at least once; the exchange fails and retries if
    /// `pending` moved meanwhile.
    fn reserve_slot(&self) -> Result<SlotReservation<'_>, SessionError> {
        let mut pending = self.pending.load(Ordering::SeqCst);
        loop {
            if self.sessions.len() + pending >= self.defaults.max_sessions {
                return Err(SessionError::LimitReached(self.defaults.max_sessions));
            }
            match self.pending.compare_exchange(
                pending,
                pending + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Ok(SlotReservation {
                        pending: &self.pending,
                    })
                }
                Err(current) => pending = current,
            }
        }
    }

    /// Attaches a viewer to an existing session.
    ///
    /// Returns the session and a receiver for its output. The receiver
    /// yields `None` once the session's output has ended.
    pub async fn attach(
        &self,
        session_id: &SessionId,
        viewer_id: ViewerId,
    ) -> Result<(Arc<ManagedSession>, mpsc::Receiver<OutputChunk>), SessionError> {
        let managed = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        if !managed.session.is_running() {
            return Err(SessionError::Terminated(session_id.clone()));
        }

        let rx = managed
            .broadcaster
            .add_viewer_with_capacity(viewer_id.clone(), self.defaults.viewer_queue_capacity)
            .await;

        tracing::info!(session_id = %session_id, viewer_id = %viewer_id, "Viewer attached");
        Ok((managed, rx))
    }

    /// Detaches a viewer from a session.
    ///
    /// The session continues running after detachment. Returns the number
    /// of viewers still attached.
    pub async fn detach(&self, session_id: &SessionId, viewer_id: &ViewerId) -> Result<usize, SessionError> {
        let managed = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        if let Some(stats) = managed.broadcaster.remove_viewer(viewer_id).await {
            tracing::info!(
                session_id = %session_id,
                viewer_id = %viewer_id,
                chunks_sent = stats.chunks_sent,
                bytes_sent = stats.bytes_sent,
                "Viewer detached"
            );
        }

        Ok(managed.broadcaster.viewer_count().await)
    }

    /// Writes data to a session's input.
    pub async fn write(&self, session_id: &SessionId, data: &[u8]) -> Result<(), SessionError> {
        let managed = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        managed.session.write(data).await
    }

    /// Resizes a session's terminal.
    pub async fn resize(&self, session_id: &SessionId, size: WindowSize) -> Result<(), SessionError> {
        let managed = self
            .get(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;
        managed.session.resize(size).await
    }

    /// Terminates a session and removes it from the manager.
    pub async fn kill(&self, session_id: &SessionId) -> Result<SessionStatus, SessionError> {
        let (_, managed) = self
            .sessions
            .remove(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.clone()))?;

        let status = managed.session.terminate(self.defaults.terminate_grace).await;
        tracing::info!(session_id = %session_id, status = ?status, "Session killed");
        Ok(status)
    }

    /// Lists all sessions.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<ManagedSession>> =
            self.sessions.iter().map(|e| Arc::clone(e.value())).collect();

        let mut infos = Vec::with_capacity(sessions.len());
        for managed in sessions {
            infos.push(Self::info(&managed).await);
        }
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Returns a session by ID.
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<ManagedSession>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    /// Gets information about a specific session.
    pub async fn info_for(&self, session_id: &SessionId) -> Option<SessionInfo> {
        let managed = self.get(session_id)?;
        Some(Self::info(&managed).await)
    }

    /// Checks if a session exists and is running.
    pub fn exists(&self, session_id: &SessionId) -> bool {
        self.sessions
            .get(session_id)
            .map(|e| e.value().session.is_running())
            .unwrap_or(false)
    }

    /// Returns the number of registered sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns the total number of attached viewers across sessions.
    pub async fn viewer_count(&self) -> usize {
        let broadcasters: Vec<Arc<Broadcaster>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(&e.value().broadcaster))
            .collect();

        let mut total = 0;
        for broadcaster in broadcasters {
            total += broadcaster.viewer_count().await;
        }
        total
    }

    /// Cleans up sessions whose shell has exited.
    ///
    /// Each one is terminated, which releases its descriptors, and removed.
    /// Returns the number of sessions cleaned up.
    pub async fn cleanup(&self) -> usize {
        let to_remove: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| !e.value().session.is_running())
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in to_remove {
            if let Some((id, managed)) = self.sessions.remove(&id) {
                let status = managed.session.terminate(self.defaults.terminate_grace).await;
                tracing::info!(session_id = %id, status = ?status, "Cleaned up ended session");
                removed += 1;
            }
        }
        removed
    }

    /// Starts a background task that periodically cleans up ended sessions.
    pub fn start_cleanup_task(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        manager.cleanup().await;
                    }
                }
            }
            tracing::debug!("Session cleanup task stopped");
        })
    }

    /// Terminates every session concurrently.
    pub async fn shutdown_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let sessions: Vec<Arc<ManagedSession>> = ids
            .iter()
            .filter_map(|id| self.sessions.remove(id).map(|(_, managed)| managed))
            .collect();

        if sessions.is_empty() {
            return;
        }

        tracing::info!(count = sessions.len(), "Terminating all sessions");
        let grace = self.defaults.terminate_grace;
        join_all(sessions.iter().map(|m| m.session.terminate(grace))).await;
    }

    async fn info(managed: &ManagedSession) -> SessionInfo {
        let size = managed.session.size();
        SessionInfo {
            id: managed.session.id().clone(),
            pid: managed.session.pid(),
            rows: size.rows,
            cols: size.cols,
            running: managed.session.is_running(),
            viewers: managed.broadcaster.viewer_count().await,
            created_at: managed
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            last_output: managed.broadcaster.last_activity() / 1000,
            cwd: managed.session.cwd().to_path_buf(),
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(SessionDefaults::default())
    }
}
