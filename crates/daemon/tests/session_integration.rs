//! Integration tests against real shells on real PTYs.
//!
//! These tests verify complete flows work correctly:
//! - Keystrokes reach the shell and its output reaches every viewer
//! - Resizes are visible to programs in the session
//! - Shell exit ends the output stream and reports the exit code

use std::time::{Duration, Instant};

use daemon::session::{SessionDefaults, SessionManager, SessionRequest, SessionStatus};
use daemon::OutputChunk;
use protocol::WindowSize;
use tempfile::TempDir;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(10);

fn test_manager() -> SessionManager {
    SessionManager::new(SessionDefaults {
        shell: Some("/bin/sh".to_string()),
        login: false,
        terminate_grace: Duration::from_secs(1),
        ..SessionDefaults::default()
    })
}

fn sh_request() -> SessionRequest {
    SessionRequest {
        env: vec![("PS1".to_string(), "$ ".to_string())],
        ..SessionRequest::default()
    }
}

/// Collects output until `needle` shows up or `limit` passes.
async fn read_until(rx: &mut mpsc::Receiver<OutputChunk>, needle: &str, limit: Duration) -> String {
    let deadline = Instant::now() + limit;
    let mut seen = String::new();
    while !seen.contains(needle) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(chunk)) => seen.push_str(&String::from_utf8_lossy(&chunk)),
            Ok(None) | Err(_) => break,
        }
    }
    seen
}

/// Drains the receiver until the stream closes.
async fn read_to_end(rx: &mut mpsc::Receiver<OutputChunk>, limit: Duration) -> Option<String> {
    let mut seen = String::new();
    let drained = tokio::time::timeout(limit, async {
        while let Some(chunk) = rx.recv().await {
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await;
    drained.ok().map(|_| seen)
}

// =============================================================================
// Input and output
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_echo_round_trip() {
    let manager = test_manager();
    let (managed, mut rx) = manager
        .create_attached(sh_request(), "viewer-1".to_string())
        .await
        .unwrap();
    let id = managed.session().id().clone();

    manager.write(&id, b"echo hello-$((40+2))\n").await.unwrap();

    let seen = read_until(&mut rx, "hello-42", WAIT).await;
    assert!(seen.contains("hello-42"), "output was: {:?}", seen);

    manager.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_starts_in_requested_directory() {
    let temp_dir = TempDir::new().unwrap();
    let cwd = temp_dir.path().canonicalize().unwrap();

    let manager = test_manager();
    let request = SessionRequest {
        cwd: Some(cwd.clone()),
        ..sh_request()
    };
    let (managed, mut rx) = manager
        .create_attached(request, "viewer-1".to_string())
        .await
        .unwrap();
    assert_eq!(managed.session().cwd(), cwd.as_path());

    manager
        .write(managed.session().id(), b"echo \"at:$(pwd -P):end\"\n")
        .await
        .unwrap();

    let expected = format!("at:{}:end", cwd.display());
    let seen = read_until(&mut rx, &expected, WAIT).await;
    assert!(seen.contains(&expected), "output was: {:?}", seen);

    manager.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resize_visible_to_programs() {
    let manager = test_manager();
    let (managed, mut rx) = manager
        .create_attached(sh_request(), "viewer-1".to_string())
        .await
        .unwrap();
    let id = managed.session().id().clone();

    manager.resize(&id, WindowSize::new(40, 120)).await.unwrap();
    assert_eq!(managed.session().size(), WindowSize::new(40, 120));
    assert_eq!(
        managed.session().window_size().await.unwrap(),
        WindowSize::new(40, 120)
    );

    manager.write(&id, b"stty size\n").await.unwrap();
    let seen = read_until(&mut rx, "40 120", WAIT).await;
    assert!(seen.contains("40 120"), "output was: {:?}", seen);

    manager.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_viewer_sees_output() {
    let manager = test_manager();
    let (managed, mut first) = manager
        .create_attached(sh_request(), "viewer-1".to_string())
        .await
        .unwrap();
    let id = managed.session().id().clone();
    let (_, mut second) = manager.attach(&id, "viewer-2".to_string()).await.unwrap();

    let info = manager.info_for(&id).await.unwrap();
    assert_eq!(info.viewers, 2);

    manager.write(&id, b"echo fan-$((2*21))\n").await.unwrap();

    let seen_first = read_until(&mut first, "fan-42", WAIT).await;
    let seen_second = read_until(&mut second, "fan-42", WAIT).await;
    assert!(seen_first.contains("fan-42"), "first viewer saw: {:?}", seen_first);
    assert!(seen_second.contains("fan-42"), "second viewer saw: {:?}", seen_second);

    manager.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_detached_session_keeps_running() {
    let manager = test_manager();
    let (managed, _rx) = manager
        .create_attached(sh_request(), "viewer-1".to_string())
        .await
        .unwrap();
    let id = managed.session().id().clone();

    let remaining = manager.detach(&id, &"viewer-1".to_string()).await.unwrap();
    assert_eq!(remaining, 0);
    assert!(managed.session().is_running());

    let (_, mut rx) = manager.attach(&id, "viewer-2".to_string()).await.unwrap();
    manager.write(&id, b"echo back-$((1+1))\n").await.unwrap();
    let seen = read_until(&mut rx, "back-2", WAIT).await;
    assert!(seen.contains("back-2"), "output was: {:?}", seen);

    manager.shutdown_all().await;
}

// =============================================================================
// Session end
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_shell_exit_ends_output_and_reports_code() {
    let manager = test_manager();
    let (managed, mut rx) = manager
        .create_attached(sh_request(), "viewer-1".to_string())
        .await
        .unwrap();
    let id = managed.session().id().clone();

    manager.write(&id, b"exit 3\n").await.unwrap();

    assert!(read_to_end(&mut rx, WAIT).await.is_some(), "output never ended");
    assert!(!managed.session().is_running());

    let status = manager.kill(&id).await.unwrap();
    assert_eq!(status, SessionStatus::Exited(3));
    assert!(!manager.exists(&id));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kill_ends_output_for_every_viewer() {
    let manager = test_manager();
    let (managed, mut first) = manager
        .create_attached(sh_request(), "viewer-1".to_string())
        .await
        .unwrap();
    let id = managed.session().id().clone();
    let (_, mut second) = manager.attach(&id, "viewer-2".to_string()).await.unwrap();

    manager.kill(&id).await.unwrap();

    assert!(read_to_end(&mut first, WAIT).await.is_some());
    assert!(read_to_end(&mut second, WAIT).await.is_some());
    assert_eq!(manager.count(), 0);

    // Writing to a killed session reports it as gone.
    assert!(manager.write(&id, b"echo\n").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cleanup_reaps_exited_sessions() {
    let manager = test_manager();
    let (managed, mut rx) = manager
        .create_attached(sh_request(), "viewer-1".to_string())
        .await
        .unwrap();
    let id = managed.session().id().clone();

    manager.write(&id, b"exit 0\n").await.unwrap();
    read_to_end(&mut rx, WAIT).await;

    assert_eq!(manager.cleanup().await, 1);
    assert!(!manager.exists(&id));
}
