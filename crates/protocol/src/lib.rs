//! # ptyrelay Protocol Library
//!
//! Pure, framework-independent definitions shared by the ptyrelay daemon and
//! its viewers.
//!
//! ## Overview
//!
//! - **Viewer messages**: inbound frames decoded once into
//!   [`ViewerMessage`] (`Resize`, `RawInput` or `Command`)
//! - **Key translation**: logical key events to terminal input bytes
//! - **Control sequences**: the clear-screen and cursor-home conventions
//!
//! ## Data flow
//!
//! ```text
//!  viewer keystrokes ──► KeyTranslator ──► RawInput ──► PTY master ──► shell
//!  viewer resize     ──► {"type":"resize"} ──► Resize ──► TIOCSWINSZ + SIGWINCH
//!  shell output      ──► PTY master ──► reader ──► sink ──► viewer(s)
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{KeyEvent, KeyTranslator, Key, ViewerMessage, WindowSize};
//!
//! let translator = KeyTranslator::default();
//! assert_eq!(translator.translate(&KeyEvent::new(Key::Up)), b"\x1b[A");
//!
//! let msg = ViewerMessage::decode_text(r#"{"type":"resize","rows":40,"cols":120}"#);
//! assert_eq!(msg, ViewerMessage::Resize(WindowSize::new(40, 120)));
//! ```

pub mod control;
pub mod error;
pub mod keys;
pub mod messages;

pub use control::{interpret_chunk, session_ended_notice, RenderStep, CLEAR_AND_HOME};
pub use error::{ProtocolError, Result};
pub use keys::{EnterConvention, Key, KeyEvent, KeyTranslator, Modifiers};
pub use messages::{ControlMessage, ViewerMessage, WindowSize};
