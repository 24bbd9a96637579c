//! IPC message types for CLI-daemon communication.
//!
//! This module defines the request and response types used for communication
//! between the CLI and the daemon over Unix Domain Sockets.

use serde::{Deserialize, Serialize};

use crate::session::SessionInfo;

/// Requests that can be sent from the CLI to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcRequest {
    /// Check if the daemon is alive.
    Ping,
    /// Get the current status of the daemon.
    Status,
    /// Request the daemon to stop gracefully.
    Stop,
    /// List all sessions.
    ListSessions,
    /// Terminate a specific session by ID.
    KillSession {
        /// The unique identifier of the session to terminate.
        session_id: String,
    },
}

/// Responses sent from the daemon to the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum IpcResponse {
    /// Response to a Ping request.
    Pong,
    /// Current daemon status.
    Status {
        /// Whether the daemon is running.
        running: bool,
        /// Uptime in seconds.
        uptime_secs: u64,
        /// Number of open sessions.
        session_count: usize,
        /// Number of attached viewers across all sessions.
        viewer_count: usize,
        /// Address of the viewer surface.
        listen_addr: String,
    },
    /// Acknowledgment that the daemon is stopping.
    Stopping,
    /// List of sessions.
    Sessions {
        /// Information about each session.
        sessions: Vec<IpcSessionInfo>,
    },
    /// Confirmation that a session was terminated.
    SessionKilled {
        /// The ID of the terminated session.
        session_id: String,
        /// Exit code, if the shell exited on its own terms.
        exit_code: Option<i32>,
    },
    /// An error occurred processing the request.
    Error {
        /// Human-readable error message.
        message: String,
    },
}

/// Information about a session for IPC communication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IpcSessionInfo {
    /// Unique session identifier.
    pub id: String,
    /// Process ID of the shell.
    pub pid: Option<u32>,
    /// Terminal rows.
    pub rows: u16,
    /// Terminal columns.
    pub cols: u16,
    /// Number of attached viewers.
    pub viewers: usize,
    /// Whether the shell is still running.
    pub running: bool,
    /// Unix timestamp when the session was created.
    pub created_at: u64,
    /// Unix timestamp of the shell's most recent output.
    #[serde(default)]
    pub last_output: u64,
    /// Directory the shell was started in.
    pub cwd: String,
}

impl From<SessionInfo> for IpcSessionInfo {
    fn from(info: SessionInfo) -> Self {
        Self {
            id: info.id,
            pid: info.pid,
            rows: info.rows,
            cols: info.cols,
            viewers: info.viewers,
            running: info.running,
            created_at: info.created_at,
            last_output: info.last_output,
            cwd: info.cwd.display().to_string(),
        }
    }
}
