//! Fan-out of committed frames to a session's connected participants.
//!
//! Uses a tokio broadcast channel of pre-encoded frames. Each connection
//! holds an independent receiver buffering up to `capacity` messages; a
//! receiver that falls behind drops the oldest frames and is reported as
//! lagged by the channel.
//!
//! Frames are `Arc<Vec<u8>>` so a commit encodes once regardless of how
//! many participants are connected. Origin filtering (never echo a frame
//! back to its author) happens at the connection forwarder, which knows
//! its own participant id — the group itself sends to every subscriber.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ProtocolError, WireMessage};

/// Counters for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

/// Lock-free counters — the send path never takes a lock.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// The fan-out channel for one session.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a group with the given per-receiver buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats {
                frames_sent: AtomicU64::new(0),
                frames_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Subscribe a new receiver. Only frames sent after this call are
    /// delivered, which is why sessions subscribe under the same lock
    /// that snapshots the document for a joining participant.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    /// Encode and send a message to every subscriber.
    ///
    /// Returns the number of receivers the frame reached. Zero receivers
    /// is not an error — a session with no connected participants simply
    /// drops the frame.
    pub fn send(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.send_raw(Arc::new(encoded)))
    }

    /// Send pre-encoded bytes (zero-copy fast path).
    pub fn send_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        if count == 0 {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Number of live receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Per-receiver buffer capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free stats snapshot.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
        }
    }
}
