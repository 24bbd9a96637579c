//! Viewer message definitions for ptyrelay.
//!
//! A viewer talks to a session over a duplex stream. Outbound traffic is raw
//! terminal output. Inbound traffic is either raw keystroke bytes or a small
//! structured JSON control message:
//!
//! ```json
//! {"type": "resize", "rows": 40, "cols": 120}
//! {"type": "command", "data": "ls -la"}
//! ```
//!
//! Every inbound frame is decoded exactly once, at the boundary, into a
//! [`ViewerMessage`]. Text that does not parse as a control message is
//! keystroke input.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Terminal window size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowSize {
    /// Number of rows.
    pub rows: u16,
    /// Number of columns.
    pub cols: u16,
}

impl WindowSize {
    /// Creates a new window size.
    pub const fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Validates that neither dimension is zero.
    pub fn validate(self) -> Result<Self> {
        if self.rows == 0 || self.cols == 0 {
            return Err(ProtocolError::InvalidWindowSize {
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(self)
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl std::fmt::Display for WindowSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Structured control messages as they appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Change the session's window size.
    Resize {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
    },
    /// Run a one-shot command in the viewer's command panel.
    Command {
        /// The command line.
        data: String,
    },
}

impl ControlMessage {
    /// Serializes the control message to its JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

/// An inbound viewer message, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerMessage {
    /// Resize the session's terminal.
    Resize(WindowSize),
    /// Bytes to write to the shell verbatim.
    RawInput(Vec<u8>),
    /// A one-shot command line for the command runner.
    Command(String),
}

impl ViewerMessage {
    /// Strictly parses a text frame as a structured control message.
    pub fn parse_control(text: &str) -> Result<Self> {
        let control: ControlMessage = serde_json::from_str(text)?;
        match control {
            ControlMessage::Resize { rows, cols } => {
                let size = WindowSize::new(rows, cols).validate()?;
                Ok(ViewerMessage::Resize(size))
            }
            ControlMessage::Command { data } => Ok(ViewerMessage::Command(data)),
        }
    }

    /// Decodes a text frame.
    ///
    /// Anything that is not a valid control message is raw input, so this
    /// never fails.
    pub fn decode_text(text: &str) -> Self {
        // Cheap pre-check: keystrokes are almost never JSON objects.
        if !text.trim_start().starts_with('{') {
            return ViewerMessage::RawInput(text.as_bytes().to_vec());
        }

        match Self::parse_control(text) {
            Ok(message) => message,
            Err(_) => ViewerMessage::RawInput(text.as_bytes().to_vec()),
        }
    }

    /// Decodes a binary frame. Binary frames are always raw input.
    pub fn decode_binary(bytes: &[u8]) -> Self {
        ViewerMessage::RawInput(bytes.to_vec())
    }
}
