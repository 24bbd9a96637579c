//! Delivery targets for PTY output.
//!
//! The reader hands every chunk it reads to a [`Sink`]. There are two
//! implementations: [`DirectSink`] for a single local viewer whose rendering
//! happens on its own execution context, and the
//! [`Broadcaster`](super::multiplexer::Broadcaster) for a dynamic set of
//! remote viewers.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

/// An immutable chunk of PTY output, as produced by one read call.
///
/// Cheap to clone, so fan-out to many viewers does not copy the payload.
pub type OutputChunk = Bytes;

/// A delivery target for PTY output.
///
/// `deliver` is called once per chunk, in read order, by a single producer.
/// `end` is called exactly once after the last chunk.
pub trait Sink: Send + Sync + 'static {
    /// Delivers one chunk.
    fn deliver(&self, chunk: OutputChunk) -> impl Future<Output = ()> + Send;

    /// Signals that no more output will follow.
    fn end(&self) -> impl Future<Output = ()> + Send;
}

/// Hands output to exactly one consumer through a bounded channel.
///
/// The consumer owns the [`mpsc::Receiver`] and drains it on whatever
/// context is allowed to touch its display, so the reader never mutates
/// viewer state directly. A full channel applies backpressure to the reader.
/// If the consumer stops draining for longer than the send timeout it is
/// treated as gone and the sink closes.
pub struct DirectSink {
    tx: Mutex<Option<mpsc::Sender<OutputChunk>>>,
    send_timeout: Duration,
}

impl DirectSink {
    /// Creates a sink and the receiver the viewer context drains.
    pub fn channel(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<OutputChunk>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = DirectSink {
            tx: Mutex::new(Some(tx)),
            send_timeout,
        };
        (sink, rx)
    }

    /// Returns whether the consumer is still attached.
    pub async fn is_open(&self) -> bool {
        matches!(&*self.tx.lock().await, Some(tx) if !tx.is_closed())
    }
}

impl Sink for DirectSink {
    async fn deliver(&self, chunk: OutputChunk) {
        let mut guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return;
        };

        match tx.send_timeout(chunk, self.send_timeout).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                tracing::warn!(
                    timeout_ms = self.send_timeout.as_millis() as u64,
                    "Viewer stopped draining output, closing direct sink"
                );
                guard.take();
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                tracing::debug!("Direct viewer went away");
                guard.take();
            }
        }
    }

    async fn end(&self) {
        self.tx.lock().await.take();
    }
}
