//! IPC Client for communicating with the daemon via Unix Domain Sockets.
//!
//! The client connects to the daemon's Unix socket and sends commands,
//! receiving responses in a request-response pattern. The typed helpers
//! turn `Error` responses into [`IpcError::Daemon`].

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse, IpcSessionInfo};
use super::server::IpcError;

/// Default timeout for client operations.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Daemon status as reported over IPC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub session_count: usize,
    pub viewer_count: usize,
    pub listen_addr: String,
}

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// A failure here usually means the daemon is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        Self::connect_with_timeout(path, DEFAULT_TIMEOUT).await
    }

    /// Connect to the daemon, bounding both the connect and every later
    /// request by `timeout`.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;

        let (read_half, write_half) = tokio::io::split(stream);

        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        })
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for the raw response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    async fn exchange(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon answers with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<DaemonStatus, IpcError> {
        match self.send(IpcRequest::Status).await? {
            IpcResponse::Status {
                running,
                uptime_secs,
                session_count,
                viewer_count,
                listen_addr,
            } => Ok(DaemonStatus {
                running,
                uptime_secs,
                session_count,
                viewer_count,
                listen_addr,
            }),
            other => Err(unexpected(other)),
        }
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<(), IpcError> {
        match self.send(IpcRequest::Stop).await? {
            IpcResponse::Stopping => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// List all open sessions.
    pub async fn list_sessions(&mut self) -> Result<Vec<IpcSessionInfo>, IpcError> {
        match self.send(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Kill a specific session by ID, returning the shell's exit code if
    /// it exited on its own.
    pub async fn kill_session(&mut self, session_id: &str) -> Result<Option<i32>, IpcError> {
        let request = IpcRequest::KillSession {
            session_id: session_id.to_string(),
        };
        match self.send(request).await? {
            IpcResponse::SessionKilled { exit_code, .. } => Ok(exit_code),
            other => Err(unexpected(other)),
        }
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}

fn unexpected(response: IpcResponse) -> IpcError {
    match response {
        IpcResponse::Error { message } => IpcError::Daemon(message),
        other => IpcError::UnexpectedResponse(format!("{:?}", other)),
    }
}
