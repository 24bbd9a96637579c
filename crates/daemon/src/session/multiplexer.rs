//! Session output multiplexer.
//!
//! This module provides broadcasting of PTY output to multiple attached viewers.
//! Each viewer owns a bounded channel. A viewer whose channel is closed, or
//! that cannot accept a chunk within the send timeout, is pruned from the
//! set; every other viewer still receives the chunk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio::sync::RwLock;

use super::sink::{OutputChunk, Sink};

/// Unique identifier for a viewer.
pub type ViewerId = String;

/// Default channel capacity for viewer output.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default time a viewer may take to accept one chunk.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Statistics about a viewer's deliveries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewerStats {
    /// Chunks delivered to the viewer's channel.
    pub chunks_sent: u64,
    /// Bytes delivered to the viewer's channel.
    pub bytes_sent: u64,
}

/// A handle representing a connected viewer that receives output.
struct ViewerHandle {
    tx: mpsc::Sender<OutputChunk>,
    chunks_sent: AtomicU64,
    bytes_sent: AtomicU64,
}

impl ViewerHandle {
    fn new(tx: mpsc::Sender<OutputChunk>) -> Self {
        Self {
            tx,
            chunks_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    fn record(&self, len: usize) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn stats(&self) -> ViewerStats {
        ViewerStats {
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

/// Broadcasts PTY output to every connected viewer.
///
/// A single viewer is simply a broadcaster with one member. Membership may
/// change concurrently with delivery: each broadcast works on a snapshot of
/// the viewer set taken under the read lock, and pruning takes the write
/// lock afterwards.
pub struct Broadcaster {
    /// Map of viewer ID to viewer handle.
    viewers: Arc<RwLock<HashMap<ViewerId, Arc<ViewerHandle>>>>,
    /// Set once the session's output has ended.
    closed: AtomicBool,
    /// Last activity timestamp (Unix epoch milliseconds).
    last_activity: AtomicU64,
    /// How long one viewer may block a single delivery.
    send_timeout: Duration,
}

impl Broadcaster {
    /// Creates a new broadcaster with the default send timeout.
    pub fn new() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }

    /// Creates a new broadcaster with a specific send timeout.
    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            viewers: Arc::new(RwLock::new(HashMap::new())),
            closed: AtomicBool::new(false),
            last_activity: AtomicU64::new(Self::now_millis()),
            send_timeout,
        }
    }

    /// Returns the current Unix timestamp in milliseconds.
    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Registers a new viewer to receive output.
    ///
    /// Returns a receiver for the viewer's output. If the session has
    /// already ended the receiver yields `None` immediately.
    pub async fn add_viewer(&self, viewer_id: ViewerId) -> mpsc::Receiver<OutputChunk> {
        self.add_viewer_with_capacity(viewer_id, DEFAULT_CHANNEL_CAPACITY)
            .await
    }

    /// Registers a new viewer with a specific channel capacity.
    pub async fn add_viewer_with_capacity(
        &self,
        viewer_id: ViewerId,
        capacity: usize,
    ) -> mpsc::Receiver<OutputChunk> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut viewers = self.viewers.write().await;

        // Checked under the lock so a concurrent `end` cannot miss this viewer.
        if self.is_closed() {
            tracing::debug!(viewer_id = %viewer_id, "Viewer joined after output ended");
            return rx;
        }

        viewers.insert(viewer_id.clone(), Arc::new(ViewerHandle::new(tx)));
        tracing::debug!(viewer_id = %viewer_id, "Added viewer to broadcaster");
        rx
    }

    /// Removes a viewer from the broadcaster.
    ///
    /// Returns the viewer's statistics if the viewer existed.
    pub async fn remove_viewer(&self, viewer_id: &ViewerId) -> Option<ViewerStats> {
        let mut viewers = self.viewers.write().await;
        viewers.remove(viewer_id).map(|h| h.stats())
    }

    /// Returns the number of connected viewers.
    pub async fn viewer_count(&self) -> usize {
        self.viewers.read().await.len()
    }

    /// Returns statistics for a specific viewer.
    pub async fn viewer_stats(&self, viewer_id: &ViewerId) -> Option<ViewerStats> {
        self.viewers.read().await.get(viewer_id).map(|h| h.stats())
    }

    /// Returns the last activity timestamp in Unix milliseconds.
    pub fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Relaxed)
    }

    /// Returns whether the session's output has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Broadcasts a chunk to all connected viewers.
    ///
    /// Viewers whose delivery fails are removed. Returns the number of
    /// viewers that received the chunk.
    pub async fn broadcast(&self, chunk: OutputChunk) -> usize {
        self.last_activity
            .store(Self::now_millis(), Ordering::Relaxed);

        let snapshot: Vec<(ViewerId, Arc<ViewerHandle>)> = self
            .viewers
            .read()
            .await
            .iter()
            .map(|(id, handle)| (id.clone(), Arc::clone(handle)))
            .collect();

        let mut failed = Vec::new();
        let mut success_count = 0;

        for (viewer_id, handle) in snapshot {
            match handle.tx.send_timeout(chunk.clone(), self.send_timeout).await {
                Ok(()) => {
                    handle.record(chunk.len());
                    success_count += 1;
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                    tracing::debug!(viewer_id = %viewer_id, "Viewer channel closed");
                    failed.push((viewer_id, handle));
                }
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    tracing::warn!(
                        viewer_id = %viewer_id,
                        timeout_ms = self.send_timeout.as_millis() as u64,
                        "Viewer stopped draining output, disconnecting it"
                    );
                    failed.push((viewer_id, handle));
                }
            }
        }

        if !failed.is_empty() {
            let mut viewers = self.viewers.write().await;
            for (viewer_id, handle) in failed {
                // A viewer may have re-registered under the same ID meanwhile.
                if viewers
                    .get(&viewer_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &handle))
                {
                    viewers.remove(&viewer_id);
                    tracing::debug!(viewer_id = %viewer_id, "Removed failed viewer");
                }
            }
        }

        success_count
    }

    /// Marks output as ended and drops every viewer's sender, so each
    /// viewer's receiver drains and then yields `None`.
    pub async fn close(&self) {
        let mut viewers = self.viewers.write().await;
        self.closed.store(true, Ordering::SeqCst);
        let count = viewers.len();
        viewers.clear();
        tracing::debug!(viewers = count, "Broadcaster closed");
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for Broadcaster {
    async fn deliver(&self, chunk: OutputChunk) {
        self.broadcast(chunk).await;
    }

    async fn end(&self) {
        self.close().await;
    }
}
