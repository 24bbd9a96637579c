//! Unix Domain Socket IPC module for CLI-daemon communication.
//!
//! The CLI talks to a running daemon over a Unix socket using
//! newline-delimited JSON: one [`IpcRequest`] per line, answered by one
//! [`IpcResponse`] per line.
//!
//! ## Socket Path
//!
//! - Primary: `$XDG_RUNTIME_DIR/ptyrelay/daemon.sock`
//! - Fallback: `/tmp/ptyrelay-$UID/daemon.sock`
//!
//! ## Example
//!
//! ```rust,no_run
//! use daemon::ipc::{get_socket_path, IpcClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = IpcClient::connect(&get_socket_path()).await?;
//!     for session in client.list_sessions().await? {
//!         println!("{} ({} viewers)", session.id, session.viewers);
//!     }
//!     Ok(())
//! }
//! ```

mod client;
mod messages;
pub mod pidfile;
mod server;

pub use client::{DaemonStatus, IpcClient};
pub use messages::{IpcRequest, IpcResponse, IpcSessionInfo};
pub use pidfile::{get_daemon_pid, is_daemon_running, pid_file_path, remove_pid_file, write_pid_file};
pub use server::{IpcConnection, IpcError, IpcHandler, IpcServer};

use std::path::PathBuf;

/// Get the socket path for IPC communication.
///
/// `$XDG_RUNTIME_DIR` is preferred since it is private to the user and
/// cleared on logout; otherwise a per-UID directory under `/tmp` is used.
pub fn get_socket_path() -> PathBuf {
    match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(runtime_dir) if !runtime_dir.is_empty() => PathBuf::from(runtime_dir)
            .join("ptyrelay")
            .join("daemon.sock"),
        _ => {
            let uid = nix::unistd::getuid();
            PathBuf::from(format!("/tmp/ptyrelay-{}", uid)).join("daemon.sock")
        }
    }
}
