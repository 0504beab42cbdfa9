//! Delivery to subscriber channels under the configured backpressure policy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};

/// What to do when a subscriber channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Drop the event immediately.
    Drop,
    /// Wait until the subscriber makes room. Stalls the dispatcher.
    Block,
    /// Wait up to the given duration, then drop.
    Deadline(Duration),
}

impl SendPolicy {
    /// Negative drops, zero blocks, positive waits that many milliseconds.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Self::Drop,
            0 => Self::Block,
            ms => Self::Deadline(Duration::from_millis(ms as u64)),
        }
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchMetrics {
    pub blocks_received: u64,
    pub filtered_blocks_received: u64,
    pub events_published: u64,
    pub events_dropped: u64,
    pub out_of_order_blocks: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) blocks_received: AtomicU64,
    pub(crate) filtered_blocks_received: AtomicU64,
    pub(crate) events_published: AtomicU64,
    pub(crate) events_dropped: AtomicU64,
    pub(crate) out_of_order_blocks: AtomicU64,
}

impl Counters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> DispatchMetrics {
        DispatchMetrics {
            blocks_received: self.blocks_received.load(Ordering::Relaxed),
            filtered_blocks_received: self.filtered_blocks_received.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            out_of_order_blocks: self.out_of_order_blocks.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct Publisher {
    policy: SendPolicy,
    counters: Arc<Counters>,
}

impl Publisher {
    pub(crate) fn new(policy: SendPolicy, counters: Arc<Counters>) -> Self {
        Self { policy, counters }
    }

    /// Send `event` to one subscriber. Failures are counted and logged, never returned.
    pub(crate) async fn publish<T: Send>(&self, kind: &'static str, sender: &mpsc::Sender<T>, event: T) {
        let outcome = match self.policy {
            SendPolicy::Drop => sender.try_send(event).map_err(|e| match e {
                TrySendError::Full(_) => "subscriber channel is full",
                TrySendError::Closed(_) => "subscriber channel is closed",
            }),
            SendPolicy::Block => sender
                .send(event)
                .await
                .map_err(|_| "subscriber channel is closed"),
            SendPolicy::Deadline(deadline) => {
                match tokio::time::timeout(deadline, sender.send(event)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err("subscriber channel is closed"),
                    Err(_) => Err("timed out waiting for subscriber"),
                }
            }
        };

        match outcome {
            Ok(()) => Counters::incr(&self.counters.events_published),
            Err(reason) => {
                Counters::incr(&self.counters.events_dropped);
                tracing::warn!(kind, reason, "dropping event");
            }
        }
    }
}
