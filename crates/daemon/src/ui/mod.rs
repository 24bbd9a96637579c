//! User interface module for ptyrelay.
//!
//! The only local interface is [`local`]: attaching the current terminal
//! to a shell of its own.

pub mod local;

pub use local::{interpret_event, map_key, run_attach, AttachOptions, LocalInput, RawModeGuard};
