//! # ptyrelay Daemon Library
//!
//! This crate bridges interactive shells running on pseudo-terminals to
//! one or more viewers.
//!
//! ## Overview
//!
//! - **PTY Sessions**: spawn a shell on a fresh PTY, write to it, resize it
//!   and terminate it
//! - **Output relay**: a dedicated reader drains each PTY and hands chunks to
//!   a sink, either a single local viewer or a broadcaster fanning out to
//!   many remote viewers
//! - **Command runner**: one-shot commands with a per-viewer working
//!   directory and a time limit
//! - **Viewer surface**: WebSocket server for remote viewers
//! - **Control surface**: Unix-socket IPC for the CLI
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌────────────┐  │
//! │  │ WebSocket viewer │  │    IPC server    │  │  cleanup   │  │
//! │  │      server      │  │  (status, kill)  │  │    task    │  │
//! │  └────────┬─────────┘  └────────┬─────────┘  └─────┬──────┘  │
//! │           └─────────────────────┼──────────────────┘         │
//! │                        ┌────────▼────────┐                   │
//! │                        │ Session Manager │                   │
//! │                        └────────┬────────┘                   │
//! │       Session (PTY + shell) ──► PtyReader ──► Broadcaster    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     orchestrator.stop_requested().await;
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod command;
pub mod config;
pub mod ipc;
pub mod network;
pub mod orchestrator;
pub mod session;
pub mod ui;

// Re-export protocol for convenience
pub use protocol;

pub use command::{CommandError, CommandOutcome, CommandOutput, CommandRunner};
pub use config::Config;
pub use network::{ViewerServer, ViewerServerConfig};
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
pub use session::{
    Broadcaster, DirectSink, ManagedSession, OutputChunk, PtyReader, ReaderConfig, Session,
    SessionError, SessionId, SessionManager, SessionStatus, Sink, SpawnOptions,
};
