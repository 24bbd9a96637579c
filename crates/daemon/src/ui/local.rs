//! Local attach: one shell in the current terminal.
//!
//! The terminal is put in raw mode and the shell's output is copied to
//! stdout through a [`DirectSink`]. Keyboard events from crossterm are
//! mapped to protocol [`KeyEvent`]s and translated into input bytes, and
//! terminal resizes are forwarded to the session. Ctrl+] detaches.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use protocol::control::session_ended_notice;
use protocol::keys::{Key, KeyEvent, KeyTranslator, Modifiers};
use protocol::WindowSize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::session::{DirectSink, Session, SessionDefaults, SpawnOptions};

/// How often the input thread re-checks whether it should stop.
const INPUT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Options for a local attach.
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    /// Shell override.
    pub shell: Option<String>,
    /// Working directory override.
    pub cwd: Option<PathBuf>,
}

/// Raw mode for the lifetime of the guard.
pub struct RawModeGuard;

impl RawModeGuard {
    pub fn enable() -> io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// What one terminal event means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInput {
    /// Bytes for the shell.
    Bytes(Vec<u8>),
    /// The terminal changed size.
    Resize(WindowSize),
    /// The user asked to detach.
    Detach,
    /// Nothing to do.
    Ignore,
}

/// Converts a crossterm key event into a protocol key event.
///
/// Returns `None` for keys the translation table has no entry for.
pub fn map_key(event: &event::KeyEvent) -> Option<KeyEvent> {
    let modifiers = Modifiers {
        control: event.modifiers.contains(KeyModifiers::CONTROL),
        alt: event.modifiers.contains(KeyModifiers::ALT),
        shift: event.modifiers.contains(KeyModifiers::SHIFT),
    };

    let key = match event.code {
        KeyCode::Enter => Key::Enter,
        KeyCode::Backspace => Key::Backspace,
        KeyCode::Tab => Key::Tab,
        KeyCode::BackTab => {
            return Some(KeyEvent::with_modifiers(
                Key::Tab,
                Modifiers {
                    shift: true,
                    ..modifiers
                },
            ))
        }
        KeyCode::Esc => Key::Escape,
        KeyCode::Up => Key::Up,
        KeyCode::Down => Key::Down,
        KeyCode::Left => Key::Left,
        KeyCode::Right => Key::Right,
        KeyCode::Delete => Key::Delete,
        KeyCode::Home => Key::Home,
        KeyCode::End => Key::End,
        KeyCode::PageUp => Key::PageUp,
        KeyCode::PageDown => Key::PageDown,
        KeyCode::F(n) => Key::F(n),
        KeyCode::Char(c) => {
            let event = KeyEvent::with_modifiers(Key::Char(c), modifiers);
            return Some(if modifiers.control {
                event
            } else {
                event.with_text(c.to_string())
            });
        }
        _ => return None,
    };

    Some(KeyEvent::with_modifiers(key, modifiers))
}

/// Interprets one terminal event.
pub fn interpret_event(translator: &KeyTranslator, event: &Event) -> LocalInput {
    match event {
        Event::Key(key) if key.kind == KeyEventKind::Release => LocalInput::Ignore,
        Event::Key(key) if is_detach_key(key) => LocalInput::Detach,
        Event::Key(key) => {
            let Some(mapped) = map_key(key) else {
                return LocalInput::Ignore;
            };
            let bytes = translator.translate(&mapped);
            if bytes.is_empty() {
                LocalInput::Ignore
            } else {
                LocalInput::Bytes(bytes)
            }
        }
        Event::Paste(text) => LocalInput::Bytes(text.as_bytes().to_vec()),
        Event::Resize(cols, rows) => match WindowSize::new(*rows, *cols).validate() {
            Ok(size) => LocalInput::Resize(size),
            Err(_) => LocalInput::Ignore,
        },
        _ => LocalInput::Ignore,
    }
}

/// Ctrl+]. Raw terminals report the 0x1d byte as Ctrl+5.
fn is_detach_key(key: &event::KeyEvent) -> bool {
    key.modifiers.contains(KeyModifiers::CONTROL)
        && matches!(key.code, KeyCode::Char(']') | KeyCode::Char('5'))
}

/// Runs a shell in the current terminal until it exits or the user
/// detaches. Returns the shell's exit code, if it exited on its own.
pub async fn run_attach(config: &Config, options: AttachOptions) -> Result<Option<i32>> {
    let defaults = SessionDefaults::from(&config.session);
    let size = match crossterm::terminal::size() {
        Ok((cols, rows)) => WindowSize::new(rows, cols).validate().unwrap_or(defaults.size),
        Err(_) => defaults.size,
    };

    let session = Session::spawn(SpawnOptions {
        shell: options.shell.or(defaults.shell.clone()),
        login: defaults.login,
        cwd: options.cwd,
        term: defaults.term.clone(),
        env: Vec::new(),
        size,
    })
    .context("Failed to start shell")?;

    let (sink, mut output) =
        DirectSink::channel(defaults.viewer_queue_capacity, defaults.viewer_send_timeout);
    session
        .start_reader(Arc::new(sink), defaults.reader)
        .await
        .context("Failed to start output reader")?;

    tracing::info!(session_id = %session.id(), pid = ?session.pid(), size = %size, "Local attach started");

    let guard = RawModeGuard::enable().context("Failed to enable raw mode")?;

    let translator = KeyTranslator::new(config.keys.enter);
    let running = Arc::new(AtomicBool::new(true));
    let (input_tx, mut input_rx) = mpsc::channel::<Event>(64);
    let input = spawn_input_thread(input_tx, Arc::clone(&running));
    let mut stdout = tokio::io::stdout();

    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    if let Err(e) = write_flush(&mut stdout, &chunk).await {
                        tracing::warn!(error = %e, "Failed to write to terminal");
                        break;
                    }
                }
                None => break,
            },
            Some(event) = input_rx.recv() => match interpret_event(&translator, &event) {
                LocalInput::Bytes(bytes) => {
                    if let Err(e) = session.write(&bytes).await {
                        tracing::debug!(error = %e, "Dropped local input");
                    }
                }
                LocalInput::Resize(size) => {
                    if let Err(e) = session.resize(size).await {
                        tracing::warn!(size = %size, error = %e, "Resize failed");
                    }
                }
                LocalInput::Detach => {
                    tracing::info!(session_id = %session.id(), "Detached by user");
                    break;
                }
                LocalInput::Ignore => {}
            },
        }
    }

    running.store(false, Ordering::SeqCst);
    let status = session.terminate(defaults.terminate_grace).await;
    drop(guard);
    let _ = input.await;

    let exit_code = status.exit_code();
    write_flush(&mut stdout, session_ended_notice(exit_code).as_bytes()).await?;

    tracing::info!(session_id = %session.id(), status = ?status, "Local attach ended");
    Ok(exit_code)
}

async fn write_flush(stdout: &mut tokio::io::Stdout, bytes: &[u8]) -> io::Result<()> {
    stdout.write_all(bytes).await?;
    stdout.flush().await
}

/// Reads terminal events on a blocking thread until `running` clears or
/// the receiver goes away.
fn spawn_input_thread(
    tx: mpsc::Sender<Event>,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::SeqCst) {
            match event::poll(INPUT_POLL_INTERVAL) {
                Ok(true) => match event::read() {
                    Ok(event) => {
                        if tx.blocking_send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read terminal event");
                        break;
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to poll terminal events");
                    break;
                }
            }
        }
    })
}
