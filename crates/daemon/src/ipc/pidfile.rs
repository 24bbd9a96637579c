//! PID file utilities for daemon running detection.
//!
//! The daemon writes its PID to `<data_dir>/daemon.pid` on startup and
//! removes it on shutdown. Readers verify the process still exists and
//! clean up stale files left behind by a crash.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Name of the PID file inside the data directory.
pub const PID_FILE_NAME: &str = "daemon.pid";

/// Returns the PID file path for a data directory.
pub fn pid_file_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

/// Writes the current process ID, creating parent directories.
pub fn write_pid_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
}

/// Removes the PID file if it still names this process.
///
/// A newer daemon may have replaced the file; that one is left alone.
pub fn remove_pid_file(path: &Path) {
    let ours = fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(|pid| pid == std::process::id());

    if ours {
        if let Err(e) = fs::remove_file(path) {
            tracing::debug!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }
}

/// Returns `true` if the PID file names a live process.
pub fn is_daemon_running(path: &Path) -> bool {
    get_daemon_pid(path).is_some()
}

/// Get the PID of the running daemon, if any.
///
/// Unparsable files and files naming a dead process are removed.
pub fn get_daemon_pid(path: &Path) -> Option<u32> {
    let contents = fs::read_to_string(path).ok()?;

    match contents.trim().parse::<u32>() {
        Ok(pid) if is_process_running(pid) => Some(pid),
        _ => {
            let _ = fs::remove_file(path);
            None
        }
    }
}

/// Checks for a process with `kill(pid, 0)`.
///
/// `EPERM` means the process exists but belongs to someone else.
pub fn is_process_running(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
