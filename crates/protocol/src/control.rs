//! In-band control sequences shared by the daemon and viewers.
//!
//! Output chunks are relayed untouched; the daemon never interprets them.
//! Two sequences carry a viewer-side convention: clear-screen resets the
//! viewer's display buffer and cursor-home resets its write position.
//! [`interpret_chunk`] applies that convention for simple viewers that do not
//! run a full terminal emulator.

use crate::keys::ESC;

/// `ESC [ 2 J`: erase the whole display.
pub const CLEAR_SCREEN: &[u8] = b"\x1b[2J";

/// `ESC [ H`: move the cursor to the top-left cell.
pub const CURSOR_HOME: &[u8] = b"\x1b[H";

/// What the `clear` command emits: erase, then home.
pub const CLEAR_AND_HOME: &[u8] = b"\x1b[2J\x1b[H";

/// How a simple viewer should render one output chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RenderStep {
    /// Discard everything displayed so far before rendering `text`.
    pub reset_display: bool,
    /// Move the write position back to the top before rendering `text`.
    pub cursor_home: bool,
    /// The bytes to render, with the two sequences above removed.
    pub text: Vec<u8>,
}

/// Splits a chunk into display directives and renderable bytes.
///
/// Only whole sequences inside this chunk are recognised. A sequence split
/// across two chunks is rendered as-is, matching a viewer that does not
/// buffer partial escapes.
pub fn interpret_chunk(chunk: &[u8]) -> RenderStep {
    let mut step = RenderStep::default();

    let remainder = match rfind(chunk, CLEAR_SCREEN) {
        Some(pos) => {
            step.reset_display = true;
            &chunk[pos + CLEAR_SCREEN.len()..]
        }
        None => chunk,
    };

    let mut text = Vec::with_capacity(remainder.len());
    let mut i = 0;
    while i < remainder.len() {
        if remainder[i] == ESC && remainder[i..].starts_with(CURSOR_HOME) {
            step.cursor_home = true;
            i += CURSOR_HOME.len();
            continue;
        }
        if remainder[i] == ESC && remainder[i..].starts_with(CLEAR_SCREEN) {
            i += CLEAR_SCREEN.len();
            continue;
        }
        text.push(remainder[i]);
        i += 1;
    }

    step.text = text;
    step
}

/// The text shown to viewers when their session ends.
pub fn session_ended_notice(exit_code: Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("\r\n[session ended (exit code {})]\r\n", code),
        None => "\r\n[session ended]\r\n".to_string(),
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .rev()
        .find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_chunk_passes_through() {
        let step = interpret_chunk(b"hello\r\n");
        assert!(!step.reset_display);
        assert!(!step.cursor_home);
        assert_eq!(step.text, b"hello\r\n".to_vec());
    }

    #[test]
    fn test_clear_screen_resets_and_keeps_remainder() {
        let step = interpret_chunk(b"old output\x1b[2Jnew prompt$ ");
        assert!(step.reset_display);
        assert_eq!(step.text, b"new prompt$ ".to_vec());
    }

    #[test]
    fn test_clear_and_home() {
        let step = interpret_chunk(b"\x1b[2J\x1b[H$ ");
        assert!(step.reset_display);
        assert!(step.cursor_home);
        assert_eq!(step.text, b"$ ".to_vec());
    }

    #[test]
    fn test_cursor_home_only() {
        let step = interpret_chunk(b"a\x1b[Hb");
        assert!(!step.reset_display);
        assert!(step.cursor_home);
        assert_eq!(step.text, b"ab".to_vec());
    }

    #[test]
    fn test_other_escapes_untouched() {
        let step = interpret_chunk(b"\x1b[31mred\x1b[0m");
        assert_eq!(step.text, b"\x1b[31mred\x1b[0m".to_vec());
    }

    #[test]
    fn test_split_sequence_is_not_recognised() {
        let first = interpret_chunk(b"abc\x1b[2");
        let second = interpret_chunk(b"Jdef");
        assert!(!first.reset_display);
        assert!(!second.reset_display);
        assert_eq!(first.text, b"abc\x1b[2".to_vec());
    }

    #[test]
    fn test_session_ended_notice() {
        assert_eq!(
            session_ended_notice(Some(0)),
            "\r\n[session ended (exit code 0)]\r\n"
        );
        assert_eq!(session_ended_notice(None), "\r\n[session ended]\r\n");
    }
}
