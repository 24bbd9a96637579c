//! Network module for remote viewers.
//!
//! Viewers connect over WebSocket; see [`viewer`] for the routing and
//! framing rules.

pub mod viewer;

pub use viewer::{Route, ViewerServer, ViewerServerConfig};
