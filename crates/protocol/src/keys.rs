//! Translation of logical key events into terminal input bytes.
//!
//! The table is pure and stateless: it maps a [`KeyEvent`] to the exact byte
//! sequence a VT100/xterm-compatible terminal would send to the program
//! running behind it. It knows nothing about any GUI toolkit; viewers convert
//! their native key events into [`KeyEvent`] first.

use serde::{Deserialize, Serialize};

/// Escape byte.
pub const ESC: u8 = 0x1b;

/// A logical key, independent of any windowing toolkit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Enter,
    Backspace,
    Tab,
    Escape,
    Up,
    Down,
    Right,
    Left,
    Delete,
    Home,
    End,
    PageUp,
    PageDown,
    /// Function key `F1`..`F12`.
    F(u8),
    /// A character key. For letters this is the key identity, not the
    /// shifted text; the text travels in [`KeyEvent::text`].
    Char(char),
}

/// Modifier state accompanying a key press.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Modifiers {
    pub control: bool,
    pub alt: bool,
    pub shift: bool,
}

impl Modifiers {
    /// No modifiers held.
    pub const NONE: Modifiers = Modifiers {
        control: false,
        alt: false,
        shift: false,
    };

    /// Only Control held.
    pub const CONTROL: Modifiers = Modifiers {
        control: true,
        alt: false,
        shift: false,
    };

    /// Only Shift held.
    pub const SHIFT: Modifiers = Modifiers {
        control: false,
        alt: false,
        shift: true,
    };

    /// Only Alt held.
    pub const ALT: Modifiers = Modifiers {
        control: false,
        alt: true,
        shift: false,
    };
}

/// A key press as reported by a viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
    /// The logical key.
    pub key: Key,
    /// Modifiers held during the press.
    pub modifiers: Modifiers,
    /// Printable text produced by the press, if any.
    pub text: Option<String>,
}

impl KeyEvent {
    /// A key press without modifiers or text.
    pub fn new(key: Key) -> Self {
        Self {
            key,
            modifiers: Modifiers::NONE,
            text: None,
        }
    }

    /// A key press with modifiers.
    pub fn with_modifiers(key: Key, modifiers: Modifiers) -> Self {
        Self {
            key,
            modifiers,
            text: None,
        }
    }

    /// A plain character press whose text is the character itself.
    pub fn char(c: char) -> Self {
        Self {
            key: Key::Char(c),
            modifiers: Modifiers::NONE,
            text: Some(c.to_string()),
        }
    }

    /// Control plus a character.
    pub fn ctrl(c: char) -> Self {
        Self::with_modifiers(Key::Char(c), Modifiers::CONTROL)
    }

    /// Attaches printable text to the event.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// What the Enter key sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnterConvention {
    /// `\r`, what a real terminal sends. The line discipline maps it to `\n`.
    #[default]
    CarriageReturn,
    /// `\n`.
    LineFeed,
}

impl EnterConvention {
    fn bytes(self) -> &'static [u8] {
        match self {
            EnterConvention::CarriageReturn => b"\r",
            EnterConvention::LineFeed => b"\n",
        }
    }
}

/// Translates key events into terminal input bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyTranslator {
    enter: EnterConvention,
}

impl KeyTranslator {
    /// Creates a translator with the given Enter convention.
    pub fn new(enter: EnterConvention) -> Self {
        Self { enter }
    }

    /// Returns the Enter convention in use.
    pub fn enter_convention(&self) -> EnterConvention {
        self.enter
    }

    /// Translates one key event. An empty vector means the event produces
    /// no input. Alt sends the unmodified bytes behind an ESC prefix.
    pub fn translate(&self, event: &KeyEvent) -> Vec<u8> {
        let mut bytes = self.translate_unprefixed(event);
        if event.modifiers.alt && !bytes.is_empty() {
            bytes.insert(0, ESC);
        }
        bytes
    }

    fn translate_unprefixed(&self, event: &KeyEvent) -> Vec<u8> {
        if let Some(bytes) = self.special_key(event) {
            return bytes.to_vec();
        }

        if event.modifiers.control {
            if let Key::Char(c) = event.key {
                if let Some(byte) = control_byte(c) {
                    return vec![byte];
                }
            }
        }

        // Unmapped chords and plain presses fall back to the printable text.
        match &event.text {
            Some(text) => text.as_bytes().to_vec(),
            None => match event.key {
                Key::Char(c) if !event.modifiers.control => {
                    let mut buf = [0u8; 4];
                    c.encode_utf8(&mut buf).as_bytes().to_vec()
                }
                _ => Vec::new(),
            },
        }
    }

    fn special_key(&self, event: &KeyEvent) -> Option<&'static [u8]> {
        let bytes: &'static [u8] = match event.key {
            Key::Enter => self.enter.bytes(),
            Key::Backspace => b"\x08",
            Key::Tab if event.modifiers.shift => b"\x1b[Z",
            Key::Tab => b"\t",
            Key::Escape => b"\x1b",
            Key::Up => b"\x1b[A",
            Key::Down => b"\x1b[B",
            Key::Right => b"\x1b[C",
            Key::Left => b"\x1b[D",
            Key::Delete => b"\x1b[3~",
            Key::Home => b"\x1b[H",
            Key::End => b"\x1b[F",
            Key::PageUp => b"\x1b[5~",
            Key::PageDown => b"\x1b[6~",
            Key::F(n) => function_key(n)?,
            Key::Char(_) => return None,
        };
        Some(bytes)
    }
}

/// Returns the control byte for Control+`c`, for ASCII letters only.
///
/// `Control+<letter>` is `letter - 'A' + 1`, case-insensitively, so
/// Control+C is 0x03 and Control+Z is 0x1A.
pub fn control_byte(c: char) -> Option<u8> {
    if c.is_ascii_alphabetic() {
        let upper = c.to_ascii_uppercase() as u8;
        Some(upper - b'A' + 1)
    } else {
        None
    }
}

fn function_key(n: u8) -> Option<&'static [u8]> {
    let bytes: &'static [u8] = match n {
        1 => b"\x1bOP",
        2 => b"\x1bOQ",
        3 => b"\x1bOR",
        4 => b"\x1bOS",
        5 => b"\x1b[15~",
        6 => b"\x1b[17~",
        7 => b"\x1b[18~",
        8 => b"\x1b[19~",
        9 => b"\x1b[20~",
        10 => b"\x1b[21~",
        11 => b"\x1b[23~",
        12 => b"\x1b[24~",
        _ => return None,
    };
    Some(bytes)
}
