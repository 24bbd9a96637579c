//! Session management module.
//!
//! This module provides PTY spawning, output relaying and session lifecycle
//! management. Sessions can be created, attached to, detached from,
//! resized, and terminated.

pub mod manager;
pub mod multiplexer;
pub mod pty;
pub mod reader;
pub mod sink;

pub use manager::{ManagedSession, SessionDefaults, SessionInfo, SessionManager, SessionRequest};
pub use multiplexer::{Broadcaster, ViewerId, ViewerStats};
pub use pty::{Session, SessionError, SessionId, SessionStatus, SpawnOptions};
pub use reader::{PtyReader, ReaderConfig, ReaderExit};
pub use sink::{DirectSink, OutputChunk, Sink};
