//! ptyrelay daemon
//!
//! Relays interactive shell sessions to WebSocket viewers, and attaches
//! the current terminal to a local shell.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::command::{render, CommandError, CommandOutcome, CommandRunner};
use daemon::config::Config;
use daemon::ipc::{
    get_daemon_pid, get_socket_path, pid_file_path, DaemonStatus, IpcClient, IpcSessionInfo,
};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use daemon::ui::{run_attach, AttachOptions};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Timeout for connecting to the daemon's control socket.
const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit status of `run` when the command hit its time limit.
const TIMEOUT_EXIT_CODE: u8 = 124;

/// ptyrelay - bridge interactive shells to local and remote viewers.
#[derive(Parser, Debug)]
#[command(name = "ptyrelay-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and serve viewers until stopped
    Start,

    /// Stop the running daemon
    Stop {
        /// Force immediate termination (SIGKILL)
        #[arg(long, short)]
        force: bool,

        /// Timeout in seconds for graceful shutdown
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Show daemon status
    Status,

    /// Manage open sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),

    /// Run a shell in this terminal (Ctrl+] detaches)
    Attach {
        /// Shell to run instead of the configured one
        #[arg(long, value_name = "PATH")]
        shell: Option<String>,

        /// Directory to start the shell in
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,
    },

    /// Run one command and print its output
    Run {
        /// Command line, joined with spaces
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,

        /// Directory to run the command in
        #[arg(long, value_name = "DIR")]
        cwd: Option<PathBuf>,

        /// Time limit in seconds (defaults to the configured limit)
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

/// Subcommands for session management.
#[derive(Subcommand, Debug, Clone)]
pub enum SessionsCommands {
    /// List all open sessions
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Terminate a session
    Kill {
        /// Session ID to terminate
        session_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let attach_mode = matches!(cli.command, Commands::Attach { .. });
    let _log_guard = init_tracing(&config, cli.verbose, attach_mode)?;

    if let Some(config_path) = &cli.config {
        tracing::debug!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Start => {
            let pid_path = pid_file_path(&config.daemon.data_dir);
            if let Some(pid) = get_daemon_pid(&pid_path) {
                eprintln!("Error: Daemon already running (PID: {})", pid);
                eprintln!();
                eprintln!("To stop the existing daemon, run:");
                eprintln!("  ptyrelay-daemon stop");
                return Ok(ExitCode::FAILURE);
            }

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_daemon(&mut orchestrator).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop { force, timeout } => {
            tracing::info!("Stopping daemon (force: {})", force);

            let result = if force {
                force_stop_daemon(&config.daemon.data_dir)
            } else {
                graceful_stop_daemon(&config.daemon.data_dir, timeout).await
            };

            match result {
                Ok(()) => {
                    println!("Daemon stopped");
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Failed to stop daemon: {:#}", e);
                    if !force {
                        eprintln!("Try: ptyrelay-daemon stop --force");
                    }
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Status => match query_daemon_status().await {
            Ok(status) => {
                println!(
                    "Daemon Status: {}",
                    if status.running { "running" } else { "stopped" }
                );
                println!("  Uptime:   {}", format_duration(status.uptime_secs));
                println!("  Sessions: {}", status.session_count);
                println!("  Viewers:  {}", status.viewer_count);
                println!("  Listen:   ws://{}", status.listen_addr);
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("Daemon is not running: {:#}", e);
                Ok(ExitCode::FAILURE)
            }
        },
        Commands::Sessions(SessionsCommands::List { json }) => match query_sessions_list().await {
            Ok(sessions) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                } else {
                    print_sessions_table(&sessions);
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("Failed to list sessions: {:#}", e);
                Ok(ExitCode::FAILURE)
            }
        },
        Commands::Sessions(SessionsCommands::Kill { session_id }) => {
            match kill_session(&session_id).await {
                Ok(Some(code)) => {
                    println!("Session {} ended (exit code {})", session_id, code);
                    Ok(ExitCode::SUCCESS)
                }
                Ok(None) => {
                    println!("Session {} killed", session_id);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("Failed to kill session: {:#}", e);
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Commands::Attach { shell, cwd } => {
            let exit_code = run_attach(&config, AttachOptions { shell, cwd }).await?;
            Ok(exit_status(exit_code.unwrap_or(0)))
        }
        Commands::Run {
            command,
            cwd,
            timeout,
        } => {
            let cwd = match cwd {
                Some(cwd) => cwd,
                None => std::env::current_dir().context("Failed to read current directory")?,
            };
            let timeout = timeout
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.command.timeout());

            let mut runner = CommandRunner::new(cwd, timeout);
            let result = runner.run(&command.join(" ")).await;
            Ok(print_command_result(&result))
        }
    }
}

/// Initializes tracing.
///
/// Logs go to a daily file when `log_dir` is configured. Attach mode always
/// logs to a file (under the data directory if needed) since the terminal
/// belongs to the shell.
fn init_tracing(
    config: &Config,
    verbose: bool,
    attach_mode: bool,
) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug"
    } else {
        config.daemon.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let log_dir = match (&config.daemon.log_dir, attach_mode) {
        (Some(dir), _) => Some(dir.clone()),
        (None, true) => Some(config.daemon.data_dir.join("logs")),
        (None, false) => None,
    };

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(&dir, "ptyrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Runs the daemon until a signal or an IPC stop request arrives.
async fn run_daemon(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    orchestrator.start().await?;

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::StopRequested => {
                    tracing::info!("Stop requested by a client");
                }
                OrchestratorEvent::Error { message } => {
                    tracing::error!("Orchestrator error: {}", message);
                }
            }
        }
    });

    if let Some(addr) = orchestrator.listen_addr() {
        tracing::info!("Viewers can connect at ws://{}/", addr);
    }

    tokio::select! {
        result = wait_for_shutdown_signal() => {
            result?;
            tracing::info!("Received shutdown signal");
        }
        _ = orchestrator.stop_requested() => {}
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

async fn connect_daemon() -> anyhow::Result<IpcClient> {
    IpcClient::connect_with_timeout(&get_socket_path(), IPC_CONNECT_TIMEOUT)
        .await
        .map_err(|_| anyhow::anyhow!("Daemon is not running (cannot connect to socket)"))
}

/// Query the daemon status via IPC.
async fn query_daemon_status() -> anyhow::Result<DaemonStatus> {
    let mut client = connect_daemon().await?;
    client.status().await.context("Failed to query status")
}

/// Query the list of open sessions from the daemon.
async fn query_sessions_list() -> anyhow::Result<Vec<IpcSessionInfo>> {
    let mut client = connect_daemon().await?;
    client
        .list_sessions()
        .await
        .context("Failed to query sessions")
}

/// Kill a session via IPC, returning its exit code if it exited cleanly.
async fn kill_session(session_id: &str) -> anyhow::Result<Option<i32>> {
    let mut client = connect_daemon().await?;
    Ok(client.kill_session(session_id).await?)
}

/// Print sessions in a formatted ASCII table.
fn print_sessions_table(sessions: &[IpcSessionInfo]) {
    if sessions.is_empty() {
        println!("No open sessions.");
        return;
    }

    let id_width = sessions
        .iter()
        .map(|s| s.id.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<id_width$}  {:>8}  {:>9}  {:>7}  {:<7}  {:>10}  {:>10}  CWD",
        "ID",
        "PID",
        "SIZE",
        "VIEWERS",
        "STATE",
        "CREATED",
        "OUTPUT",
        id_width = id_width
    );
    println!("{}", "-".repeat(id_width + 68));

    for session in sessions {
        let pid = session
            .pid
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        let size = format!("{}x{}", session.rows, session.cols);
        let state = if session.running { "running" } else { "ended" };

        println!(
            "{:<id_width$}  {:>8}  {:>9}  {:>7}  {:<7}  {:>10}  {:>10}  {}",
            truncate_str(&session.id, id_width),
            pid,
            size,
            session.viewers,
            state,
            format_relative_time(session.created_at),
            format_relative_time(session.last_output),
            session.cwd,
            id_width = id_width
        );
    }

    println!();
    println!("Total: {} session(s)", sessions.len());
}

/// Prints a one-shot command's result the way a terminal user expects:
/// the command's own streams pass through and its exit status is ours.
fn print_command_result(result: &Result<CommandOutcome, CommandError>) -> ExitCode {
    match result {
        Ok(CommandOutcome::Completed(output)) => {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
        }
        Ok(_) => print!("{}", render(result)),
        Err(_) => eprint!("{}", render(result)),
    }
    ExitCode::from(command_status(result))
}

/// The process exit status for a one-shot command result.
fn command_status(result: &Result<CommandOutcome, CommandError>) -> u8 {
    match result {
        Ok(CommandOutcome::Completed(output)) => clamp_exit_code(output.exit_code),
        Ok(_) => 0,
        Err(CommandError::Timeout(_)) => TIMEOUT_EXIT_CODE,
        Err(_) => 1,
    }
}

/// Maps a shell exit code onto a process exit status.
fn exit_status(code: i32) -> ExitCode {
    ExitCode::from(clamp_exit_code(code))
}

fn clamp_exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}

/// Format a Unix timestamp as relative time (e.g., "5m ago").
fn format_relative_time(timestamp: u64) -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let elapsed = now.saturating_sub(timestamp);

    if elapsed < 60 {
        format!("{}s ago", elapsed)
    } else if elapsed < 3600 {
        format!("{}m ago", elapsed / 60)
    } else if elapsed < 86400 {
        format!("{}h ago", elapsed / 3600)
    } else {
        format!("{}d ago", elapsed / 86400)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Gracefully stop the daemon via IPC, then wait for it to exit.
async fn graceful_stop_daemon(data_dir: &Path, timeout_secs: u64) -> anyhow::Result<()> {
    let mut client = connect_daemon().await?;

    println!("Sending shutdown request...");
    client.set_timeout(Duration::from_secs(timeout_secs));
    client.stop().await.context("Failed to send stop request")?;
    println!("Shutdown acknowledged, waiting for daemon to exit...");

    let pid_path = pid_file_path(data_dir);
    let socket_path = get_socket_path();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);

    while tokio::time::Instant::now() < deadline {
        if get_daemon_pid(&pid_path).is_none() && !socket_path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    anyhow::bail!("Timeout waiting for daemon to exit ({}s)", timeout_secs)
}

/// Force stop the daemon with SIGKILL, using the PID file.
fn force_stop_daemon(data_dir: &Path) -> anyhow::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid_path = pid_file_path(data_dir);
    let pid = get_daemon_pid(&pid_path)
        .ok_or_else(|| anyhow::anyhow!("No running daemon found in {}", pid_path.display()))?;
    let raw = i32::try_from(pid).context("Invalid PID in file")?;

    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .with_context(|| format!("Failed to kill daemon (PID {})", pid))?;
    println!("Sent SIGKILL to daemon (PID {})", pid);

    let _ = std::fs::remove_file(&pid_path);
    let _ = std::fs::remove_file(get_socket_path());
    Ok(())
}

/// Format a duration in seconds to human-readable format.
fn format_duration(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
