//! PTY session management.
//!
//! This module provides the core PTY spawning and I/O functionality.
//! A session represents a single terminal session with a shell process.
//! The session exclusively owns the master descriptor and the child handle;
//! everything else goes through `write`, `resize` and `terminate`.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::WindowSize;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

use super::reader::{PtyReader, ReaderConfig};
use super::sink::Sink;

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has been terminated or its shell has exited.
    #[error("session terminated: {0}")]
    Terminated(SessionId),

    /// The shell could not be launched.
    #[error("failed to spawn shell: {0}")]
    Spawn(String),

    /// The terminal descriptor is closed or broken.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The window-size ioctl failed.
    #[error("failed to resize PTY: {0}")]
    Resize(String),

    /// Too many sessions are open.
    #[error("session limit reached ({0})")]
    LimitReached(usize),
}

/// Status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Session is running.
    Running,
    /// The shell exited with a code.
    Exited(i32),
    /// The shell ignored the grace period and was killed with this signal.
    Killed(i32),
}

impl SessionStatus {
    /// Returns the exit code, if the shell exited on its own terms.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            SessionStatus::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

/// Default grace period between the terminate signal and force-kill.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How long a write may keep retrying a full terminal buffer.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between retries of a write that would block.
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(5);

/// Interval between child status checks while terminating.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Bound on waiting for a killed child and for the reader to wind down.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How to launch a session's shell.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell program. `None` resolves `$SHELL`, then `/bin/sh`.
    pub shell: Option<String>,
    /// Start the shell as a login shell (`-l`).
    pub login: bool,
    /// Working directory. `None` uses the current directory.
    pub cwd: Option<PathBuf>,
    /// Value of `TERM` in the shell's environment.
    pub term: String,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
    /// Initial terminal size.
    pub size: WindowSize,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            shell: None,
            login: false,
            cwd: None,
            term: "xterm-256color".to_string(),
            env: Vec::new(),
            size: WindowSize::default(),
        }
    }
}

/// A PTY session with a shell process.
///
/// The shell runs in its own session and process group with the
/// subordinate side as its controlling terminal. The master side is
/// non-blocking from the moment it is created.
pub struct Session {
    /// Unique session identifier.
    id: SessionId,

    /// The PTY master handle. Taken, and so closed, exactly once.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// The writer for the PTY.
    writer: Mutex<Option<Box<dyn Write + Send>>>,

    /// The child process.
    child: Mutex<Box<dyn Child + Send + Sync>>,

    /// The output reader, once started.
    reader: Mutex<Option<PtyReader>>,

    /// Cleared when the reader sees end of stream or the session stops.
    running: Arc<AtomicBool>,

    /// Set when termination begins.
    terminated: AtomicBool,

    /// Final status, recorded by the first `terminate`.
    final_status: OnceCell<SessionStatus>,

    /// Last size applied to the terminal.
    size: std::sync::Mutex<WindowSize>,

    /// Process ID.
    pid: Option<u32>,

    /// Directory the shell was started in.
    cwd: PathBuf,
}

impl Session {
    /// Spawns a new PTY session.
    ///
    /// On failure nothing is left behind: the pair and any child are
    /// released before the error is returned.
    pub fn spawn(options: SpawnOptions) -> Result<Self, SessionError> {
        let id = Uuid::new_v4().to_string();
        let shell = detect_shell(options.shell);
        let cwd = match options.cwd {
            Some(dir) => dir,
            None => std::env::current_dir()
                .ok()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("/")),
        };

        if !cwd.is_dir() {
            return Err(SessionError::Spawn(format!(
                "working directory does not exist: {}",
                cwd.display()
            )));
        }

        let pair = native_pty_system()
            .openpty(pty_size(options.size))
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let fd = pair
            .master
            .as_raw_fd()
            .ok_or_else(|| SessionError::Spawn("PTY master has no descriptor".to_string()))?;
        set_nonblocking(fd).map_err(|e| SessionError::Spawn(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell);
        if options.login {
            cmd.arg("-l");
        }
        cmd.cwd(&cwd);
        cmd.env("TERM", &options.term);
        for (key, value) in options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("{}: {}", shell, e)))?;

        // Only the child keeps the subordinate side open, so its exit is
        // visible to the reader as end of stream.
        drop(pair.slave);

        let pid = child.process_id();

        tracing::info!(
            session_id = %id,
            shell = %shell,
            pid = ?pid,
            cwd = %cwd.display(),
            size = %options.size,
            "Spawned shell"
        );

        Ok(Session {
            id,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(child),
            reader: Mutex::new(None),
            running: Arc::new(AtomicBool::new(true)),
            terminated: AtomicBool::new(false),
            final_status: OnceCell::new(),
            size: std::sync::Mutex::new(options.size),
            pid,
            cwd,
        })
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the directory the shell was started in.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Returns the last size applied to the terminal.
    pub fn size(&self) -> WindowSize {
        self.size.lock().map(|s| *s).unwrap_or_default()
    }

    /// Returns whether the session is still live.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.terminated.load(Ordering::SeqCst)
    }

    /// Returns whether `terminate` has been called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Starts relaying output to `sink`.
    ///
    /// The reader gets its own duplicate of the master descriptor, so it
    /// can never observe the master being closed underneath it.
    pub async fn start_reader<S: Sink>(
        &self,
        sink: Arc<S>,
        config: ReaderConfig,
    ) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Terminated(self.id.clone()));
        }

        let mut slot = self.reader.lock().await;
        if slot.is_some() {
            return Err(SessionError::Io(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "reader already started",
            )));
        }

        let source = {
            let master = self.master.lock().await;
            let master = master
                .as_ref()
                .ok_or_else(|| SessionError::Terminated(self.id.clone()))?;
            let fd = master
                .as_raw_fd()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no master descriptor"))?;
            // SAFETY: `fd` belongs to the master we hold locked, so it is
            // open for the duration of the borrow.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            File::from(borrowed.try_clone_to_owned()?)
        };

        *slot = Some(PtyReader::spawn(
            source,
            sink,
            config,
            Arc::clone(&self.running),
            self.id.clone(),
        ));

        tracing::debug!(session_id = %self.id, "Started output reader");
        Ok(())
    }

    /// Writes data to the PTY.
    ///
    /// The bytes must already be in the form the shell expects (see
    /// [`protocol::KeyTranslator`]). Safe to call concurrently with the
    /// reader; concurrent writers are serialized.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Terminated(self.id.clone()));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| SessionError::Terminated(self.id.clone()))?;

        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut remaining = data;

        while !remaining.is_empty() {
            match writer.write(remaining) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::from(io::ErrorKind::TimedOut).into());
                    }
                    tokio::time::sleep(WRITE_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        match writer.flush() {
            Err(e) if e.kind() != io::ErrorKind::WouldBlock => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Resizes the PTY and notifies the foreground process group.
    ///
    /// A session whose shell has exited, or that has been terminated, is
    /// left alone and `Ok` is returned.
    pub async fn resize(&self, size: WindowSize) -> Result<(), SessionError> {
        size.validate().map_err(|e| SessionError::Resize(e.to_string()))?;

        let master = self.master.lock().await;
        let Some(master) = master.as_ref() else {
            tracing::debug!(session_id = %self.id, "Ignoring resize of closed session");
            return Ok(());
        };

        if !self.running.load(Ordering::SeqCst) {
            tracing::debug!(session_id = %self.id, "Ignoring resize of exited session");
            return Ok(());
        }

        master
            .resize(pty_size(size))
            .map_err(|e| SessionError::Resize(e.to_string()))?;

        if let Ok(mut current) = self.size.lock() {
            *current = size;
        }

        let group = master
            .process_group_leader()
            .or_else(|| self.pid.map(|pid| pid as i32));
        if let Some(group) = group {
            match killpg(Pid::from_raw(group), Signal::SIGWINCH) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    tracing::debug!(session_id = %self.id, error = %e, "Failed to signal window change")
                }
            }
        }

        tracing::debug!(session_id = %self.id, size = %size, "Resized PTY");
        Ok(())
    }

    /// Queries the terminal's window-size attribute.
    pub async fn window_size(&self) -> Result<WindowSize, SessionError> {
        let master = self.master.lock().await;
        let master = master
            .as_ref()
            .ok_or_else(|| SessionError::Terminated(self.id.clone()))?;
        let size = master
            .get_size()
            .map_err(|e| SessionError::Io(io::Error::other(e.to_string())))?;
        Ok(WindowSize::new(size.rows, size.cols))
    }

    /// Checks if the child process has exited and returns its status.
    ///
    /// This does not wait for the process to exit.
    pub async fn try_wait(&self) -> Result<Option<SessionStatus>, SessionError> {
        if let Some(status) = self.final_status.get() {
            return Ok(Some(*status));
        }

        let mut child = self.child.lock().await;
        match child.try_wait()? {
            Some(status) => {
                self.running.store(false, Ordering::SeqCst);
                Ok(Some(SessionStatus::Exited(status.exit_code() as i32)))
            }
            None => Ok(None),
        }
    }

    /// Terminates the session.
    ///
    /// Stops the reader, sends the terminate signal, waits up to `grace`,
    /// then force-kills. Both descriptors are closed exactly once.
    /// Idempotent: later and concurrent calls wait for the first one and
    /// return the same status.
    pub async fn terminate(&self, grace: Duration) -> SessionStatus {
        *self
            .final_status
            .get_or_init(|| self.shutdown(grace))
            .await
    }

    async fn shutdown(&self, grace: Duration) -> SessionStatus {
        self.terminated.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        let status = self.stop_child(grace).await;

        if let Some(reader) = self.reader.lock().await.take() {
            if reader.join(REAP_TIMEOUT).await.is_none() {
                tracing::warn!(session_id = %self.id, "Reader did not stop in time");
            }
        }

        drop(self.writer.lock().await.take());
        drop(self.master.lock().await.take());

        tracing::info!(session_id = %self.id, status = ?status, "Session terminated");
        status
    }

    async fn stop_child(&self, grace: Duration) -> SessionStatus {
        if let Some(status) = self.poll_exit().await {
            return status;
        }

        if let Some(pid) = self.pid {
            let pid = Pid::from_raw(pid as i32);
            // Interactive shells ignore SIGTERM; SIGHUP is what a closing
            // terminal sends.
            for signal in [Signal::SIGHUP, Signal::SIGTERM] {
                if let Err(e) = kill(pid, signal) {
                    if e != Errno::ESRCH {
                        tracing::debug!(session_id = %self.id, signal = ?signal, error = %e, "Failed to signal shell");
                    }
                }
            }
        }

        if let Some(status) = self.wait_exit(grace).await {
            return status;
        }

        tracing::warn!(
            session_id = %self.id,
            grace_ms = grace.as_millis() as u64,
            "Shell ignored termination, killing"
        );

        {
            let mut child = self.child.lock().await;
            if let Err(e) = child.kill() {
                tracing::debug!(session_id = %self.id, error = %e, "Kill failed");
            }
        }

        if self.wait_exit(REAP_TIMEOUT).await.is_none() {
            tracing::warn!(session_id = %self.id, "Shell still not reaped after kill");
        }
        SessionStatus::Killed(Signal::SIGKILL as i32)
    }

    async fn poll_exit(&self) -> Option<SessionStatus> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => Some(SessionStatus::Exited(status.exit_code() as i32)),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(session_id = %self.id, error = %e, "Failed to query shell status");
                None
            }
        }
    }

    async fn wait_exit(&self, limit: Duration) -> Option<SessionStatus> {
        let deadline = Instant::now() + limit;
        loop {
            if let Some(status) = self.poll_exit().await {
                return Some(status);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.terminated.load(Ordering::SeqCst) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(pid) = self.pid {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGHUP);
            }
        }
    }
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn set_nonblocking(fd: RawFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s;
    }

    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}
