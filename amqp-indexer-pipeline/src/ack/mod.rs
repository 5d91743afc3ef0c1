//! Acknowledgment tracking for delivery handles.
//!
//! Acks are best-effort: a failed ack is logged and counted but never
//! retried, since the broker redelivers unacknowledged messages on its own.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::consumer::BrokerChannel;

/// Snapshot of acknowledgment counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckStats {
    pub acked: u64,
    pub failed: u64,
    /// Handles dropped because their channel was already closed.
    pub discarded: u64,
}

/// Acknowledges delivery handles on the channel that issued them.
#[derive(Debug, Default)]
pub struct AckTracker {
    acked: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acknowledge one delivery.
    ///
    /// Handles from a channel that is no longer open are discarded instead:
    /// after a reconnect the broker redelivers them under fresh tags.
    ///
    /// Returns `true` if the broker accepted the ack.
    pub async fn ack(&self, channel: &dyn BrokerChannel, delivery_tag: u64) -> bool {
        if !channel.is_open() {
            debug!(delivery_tag, "Channel closed, discarding delivery handle");
            self.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match channel.ack(delivery_tag).await {
            Ok(()) => {
                self.acked.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(delivery_tag, error = %e, "Failed to ack");
                self.failed.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Acknowledge every handle of a resolved batch.
    ///
    /// Takes the handles by value so a batch cannot be acknowledged twice.
    pub async fn ack_all(&self, channel: &dyn BrokerChannel, delivery_tags: Vec<u64>) {
        let count = delivery_tags.len();
        let mut acked = 0;
        for delivery_tag in delivery_tags {
            if self.ack(channel, delivery_tag).await {
                acked += 1;
            }
        }
        debug!(count, acked, "Acknowledged batch");
    }

    pub fn stats(&self) -> AckStats {
        AckStats {
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
