//! PTY output reader.
//!
//! Output is drained by a dedicated blocking loop that waits for readability
//! with a bounded timeout, so a stop request is observed within one poll
//! interval. Chunks travel through a bounded channel to an async pump, which
//! is the only caller of the [`Sink`]. The loop never touches viewer state.
//!
//! ```text
//!  master fd ──poll/read──► [blocking loop] ──mpsc──► [pump task] ──deliver──► Sink
//! ```

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::sink::{OutputChunk, Sink};

/// Default wait for readability before re-checking the stop flag.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default maximum size of one chunk.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Default number of chunks buffered between the loop and the pump.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Tuning for a [`PtyReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Bounded wait for readability.
    pub poll_interval: Duration,
    /// Maximum bytes read per call.
    pub buffer_size: usize,
    /// Chunks buffered before the loop blocks on the pump.
    pub channel_capacity: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Why the read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    /// The subordinate side closed: the shell and everything holding the
    /// terminal has exited.
    EndOfStream,
    /// The stop flag was cleared.
    Stopped,
    /// The pump went away before the stream ended.
    ConsumerGone,
    /// An unexpected I/O error. Treated as end of session.
    Failed(String),
}

/// Handle to a running reader.
pub struct PtyReader {
    running: Arc<AtomicBool>,
    producer: JoinHandle<ReaderExit>,
    pump: JoinHandle<()>,
}

impl PtyReader {
    /// Starts draining `source` into `sink`.
    ///
    /// `source` must be in non-blocking mode. The reader owns it and closes
    /// it when the loop ends, so it never reads after close. `running` is
    /// cleared when the loop ends for any reason; clearing it from outside
    /// stops the loop.
    pub fn spawn<S: Sink>(
        source: File,
        sink: Arc<S>,
        config: ReaderConfig,
        running: Arc<AtomicBool>,
        label: String,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<OutputChunk>(config.channel_capacity.max(1));

        let loop_running = Arc::clone(&running);
        let loop_label = label.clone();
        let producer = tokio::task::spawn_blocking(move || {
            let exit = read_loop(source, &tx, &config, &loop_running);
            loop_running.store(false, Ordering::SeqCst);
            match &exit {
                ReaderExit::Failed(error) => {
                    tracing::warn!(session_id = %loop_label, error = %error, "PTY read failed, ending session")
                }
                other => tracing::debug!(session_id = %loop_label, exit = ?other, "PTY read loop ended"),
            }
            exit
        });

        let pump = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                sink.deliver(chunk).await;
            }
            sink.end().await;
            tracing::trace!(session_id = %label, "Output pump finished");
        });

        Self {
            running,
            producer,
            pump,
        }
    }

    /// Asks the loop to stop at its next poll boundary.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stops the reader and waits, up to `timeout` per stage, for the loop
    /// and then the pump to finish.
    ///
    /// Returns `None` if the loop did not finish in time.
    pub async fn join(mut self, timeout: Duration) -> Option<ReaderExit> {
        self.stop();

        let exit = match tokio::time::timeout(timeout, &mut self.producer).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => ReaderExit::Failed(e.to_string()),
            Err(_) => return None,
        };

        if tokio::time::timeout(timeout, &mut self.pump).await.is_err() {
            tracing::warn!("Output pump did not finish in time");
        }

        Some(exit)
    }
}

fn read_loop(
    mut source: File,
    tx: &mpsc::Sender<OutputChunk>,
    config: &ReaderConfig,
    running: &AtomicBool,
) -> ReaderExit {
    let mut buffer = vec![0u8; config.buffer_size.max(1)];
    let millis = config.poll_interval.as_millis().min(u16::MAX as u128) as u16;

    loop {
        if !running.load(Ordering::SeqCst) {
            return ReaderExit::Stopped;
        }

        {
            let mut fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(millis)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => return ReaderExit::Failed(e.to_string()),
            }
        }

        match source.read(&mut buffer) {
            Ok(0) => return ReaderExit::EndOfStream,
            Ok(n) => {
                if tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                    return ReaderExit::ConsumerGone;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                continue
            }
            // Linux reports a closed subordinate side as EIO on the master.
            Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => {
                return ReaderExit::EndOfStream
            }
            Err(e) => return ReaderExit::Failed(e.to_string()),
        }
    }
}
