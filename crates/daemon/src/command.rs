//! One-shot command execution.
//!
//! A [`CommandRunner`] runs single non-interactive commands without a PTY
//! and captures their output. `cd`, `clear` and `help` are built in.
//! The working directory belongs to the runner, so two viewers with their
//! own runners never see each other's `cd`.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use protocol::CLEAR_AND_HOME;
use thiserror::Error;

/// Errors from running a one-shot command.
#[derive(Error, Debug)]
pub enum CommandError {
    /// The command did not finish in time and was killed.
    #[error("command timed out after {} seconds", .0.as_secs_f64())]
    Timeout(Duration),

    /// The command could not be started or waited on.
    #[error("failed to run command: {0}")]
    Spawn(#[from] io::Error),

    /// `cd` named a directory that cannot be entered.
    #[error("cd: {path}: {reason}")]
    ChangeDirectory { path: String, reason: String },
}

/// Captured result of a completed command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, or -1 if the command was killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// Returns whether the command exited with code zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// What a command line did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// A subprocess ran to completion.
    Completed(CommandOutput),
    /// `cd` moved the runner to this directory.
    DirectoryChanged(PathBuf),
    /// `clear` was requested.
    ClearScreen,
    /// `help` was requested.
    Help,
}

/// Text shown for `help`.
pub const HELP_TEXT: &str = "Available commands:
  help        Show this help message
  clear       Clear the screen
  cd <path>   Change directory (empty or ~ for home)
  Anything else runs in a shell and its output is shown
";

/// Runs one-shot commands in a runner-scoped working directory.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    cwd: PathBuf,
    timeout: Duration,
    shell: String,
}

impl CommandRunner {
    /// Creates a runner starting in `cwd`.
    pub fn new(cwd: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cwd: cwd.into(),
            timeout,
            shell: "/bin/sh".to_string(),
        }
    }

    /// Uses `shell -c` instead of `/bin/sh -c` for subprocesses.
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Returns the current working directory.
    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    /// Returns the time limit for one command.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs one command line.
    pub async fn run(&mut self, line: &str) -> Result<CommandOutcome, CommandError> {
        let line = line.trim();

        if line == "clear" {
            return Ok(CommandOutcome::ClearScreen);
        }

        if line == "help" {
            return Ok(CommandOutcome::Help);
        }

        if line == "cd" || line.starts_with("cd ") {
            let target = line[2..].trim();
            let dir = resolve_directory(&self.cwd, target)?;
            tracing::debug!(from = %self.cwd.display(), to = %dir.display(), "Changed directory");
            self.cwd = dir.clone();
            return Ok(CommandOutcome::DirectoryChanged(dir));
        }

        if line.is_empty() {
            return Ok(CommandOutcome::Completed(CommandOutput::default()));
        }

        self.execute(line).await.map(CommandOutcome::Completed)
    }

    async fn execute(&self, line: &str) -> Result<CommandOutput, CommandError> {
        let child = tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(line)
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        tracing::debug!(command = %line, pid = ?pid, cwd = %self.cwd.display(), "Running command");

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                })
            }
            Err(_) => {
                // The shell is gone via kill_on_drop; its children share its group.
                if let Some(pid) = pid {
                    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
                }
                tracing::warn!(command = %line, timeout_secs = self.timeout.as_secs(), "Command timed out");
                Err(CommandError::Timeout(self.timeout))
            }
        }
    }
}

/// Resolves a `cd` argument against `current`.
///
/// Empty or `~` means the home directory, `..` the parent of `current`,
/// and a relative path is joined onto `current`.
pub fn resolve_directory(current: &Path, target: &str) -> Result<PathBuf, CommandError> {
    let fail = |reason: &str| CommandError::ChangeDirectory {
        path: target.to_string(),
        reason: reason.to_string(),
    };

    let home = || dirs::home_dir().ok_or_else(|| fail("no home directory"));

    let candidate = if target.is_empty() || target == "~" {
        home()?
    } else if target == ".." {
        current.parent().unwrap_or(current).to_path_buf()
    } else if let Some(rest) = target.strip_prefix("~/") {
        home()?.join(rest)
    } else {
        current.join(target)
    };

    let resolved = candidate
        .canonicalize()
        .map_err(|e| fail(&e.to_string()))?;

    if !resolved.is_dir() {
        return Err(fail("Not a directory"));
    }

    Ok(resolved)
}

/// Renders a command result as text for a terminal viewer.
pub fn render(result: &Result<CommandOutcome, CommandError>) -> String {
    let text = match result {
        Ok(CommandOutcome::ClearScreen) => {
            return String::from_utf8_lossy(CLEAR_AND_HOME).into_owned();
        }
        Ok(CommandOutcome::Help) => HELP_TEXT.to_string(),
        Ok(CommandOutcome::DirectoryChanged(dir)) => {
            format!("Changed directory to: {}\n", dir.display())
        }
        Ok(CommandOutcome::Completed(output)) => {
            let mut text = String::new();
            text.push_str(&output.stdout);
            text.push_str(&output.stderr);
            if text.is_empty() {
                text = format!("Command completed (exit code: {})\n", output.exit_code);
            }
            text
        }
        Err(e @ CommandError::ChangeDirectory { .. }) => format!("{}\n", e),
        Err(e @ CommandError::Timeout(_)) => format!("{}\n", capitalize(&e.to_string())),
        Err(e) => format!("Error: {}\n", e),
    };

    to_terminal_newlines(&text)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn to_terminal_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\n', "\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn runner_in(dir: &Path) -> CommandRunner {
        CommandRunner::new(dir.canonicalize().unwrap(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_run_captures_stdout_and_exit_code() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner_in(dir.path());

        let outcome = runner.run("echo hello; exit 3").await.unwrap();
        let CommandOutcome::Completed(output) = outcome else {
            panic!("expected completed command");
        };
        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_help_is_builtin() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner_in(dir.path());

        let result = runner.run("  help ").await;
        assert!(matches!(result, Ok(CommandOutcome::Help)));

        let text = render(&result);
        assert!(text.starts_with("Available commands:\r\n"));
        assert!(text.contains("cd <path>"));
    }

    #[tokio::test]
    async fn test_run_nonexistent_command() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner_in(dir.path());

        let outcome = runner.run("nonexistent-cmd-xyz").await.unwrap();
        let CommandOutcome::Completed(output) = outcome else {
            panic!("expected completed command");
        };
        assert_ne!(output.exit_code, 0);
        assert!(!output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let dir = TempDir::new().unwrap();
        let mut runner = CommandRunner::new(dir.path(), Duration::from_secs(1));

        let started = Instant::now();
        let result = runner.run("sleep 60").await;

        assert!(matches!(result, Err(CommandError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_run_uses_runner_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("child")).unwrap();
        let mut runner = runner_in(dir.path());

        runner.run("cd child").await.unwrap();
        let outcome = runner.run("pwd").await.unwrap();
        let CommandOutcome::Completed(output) = outcome else {
            panic!("expected completed command");
        };
        assert!(output.stdout.trim_end().ends_with("child"));
    }

    #[tokio::test]
    async fn test_cd_parent_and_relative() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        let base = dir.path().canonicalize().unwrap();
        let mut runner = CommandRunner::new(base.join("a"), Duration::from_secs(5));

        let outcome = runner.run("cd ..").await.unwrap();
        assert_eq!(outcome, CommandOutcome::DirectoryChanged(base.clone()));
        assert_eq!(runner.cwd(), base.as_path());

        runner.run("cd a").await.unwrap();
        assert_eq!(runner.cwd(), base.join("a").as_path());
    }

    #[tokio::test]
    async fn test_cd_empty_goes_home() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner_in(dir.path());

        if let Some(home) = dirs::home_dir().and_then(|h| h.canonicalize().ok()) {
            runner.run("cd").await.unwrap();
            assert_eq!(runner.cwd(), home.as_path());
        }
    }

    #[tokio::test]
    async fn test_cd_missing_directory_keeps_cwd() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner_in(dir.path());
        let before = runner.cwd().to_path_buf();

        let result = runner.run("cd does-not-exist").await;
        assert!(matches!(result, Err(CommandError::ChangeDirectory { .. })));
        assert_eq!(runner.cwd(), before.as_path());
    }

    #[tokio::test]
    async fn test_cd_to_file_fails() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();
        let mut runner = runner_in(dir.path());

        let result = runner.run("cd file.txt").await;
        assert!(matches!(result, Err(CommandError::ChangeDirectory { .. })));
    }

    #[tokio::test]
    async fn test_runners_do_not_share_cwd() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("elsewhere")).unwrap();
        let process_cwd = std::env::current_dir().unwrap();
        let mut first = runner_in(dir.path());
        let second = runner_in(dir.path());

        first.run("cd elsewhere").await.unwrap();
        assert_ne!(first.cwd(), second.cwd());
        assert_eq!(std::env::current_dir().unwrap(), process_cwd);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = TempDir::new().unwrap();
        let mut runner = runner_in(dir.path());
        assert_eq!(runner.run("  clear ").await.unwrap(), CommandOutcome::ClearScreen);
    }

    #[test]
    fn test_render() {
        let cleared = render(&Ok(CommandOutcome::ClearScreen));
        assert_eq!(cleared.as_bytes(), CLEAR_AND_HOME);

        let output = CommandOutput {
            stdout: "a\nb\n".to_string(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(render(&Ok(CommandOutcome::Completed(output))), "a\r\nb\r\n");

        let silent = CommandOutput {
            exit_code: 2,
            ..CommandOutput::default()
        };
        assert_eq!(
            render(&Ok(CommandOutcome::Completed(silent))),
            "Command completed (exit code: 2)\r\n"
        );

        let timeout = render(&Err(CommandError::Timeout(Duration::from_secs(30))));
        assert_eq!(timeout, "Command timed out after 30 seconds\r\n");

        let moved = render(&Ok(CommandOutcome::DirectoryChanged(PathBuf::from("/tmp"))));
        assert_eq!(moved, "Changed directory to: /tmp\r\n");
    }

    #[test]
    fn test_timeout_display() {
        let err = CommandError::Timeout(Duration::from_secs(1));
        assert_eq!(err.to_string(), "command timed out after 1 seconds");
    }
}
