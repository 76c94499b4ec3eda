//! Non-blocking fan-out channels for depth updates
//!
//! A [`Topic`] hands every published message to each of its subscribers
//! through a bounded queue. Publishing never blocks: a subscriber whose
//! queue is full misses that message, and subscribers that went away are
//! pruned on the next publish.

#![deny(clippy::all)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use crossbeam::channel;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Bus errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    /// The publishing side was closed
    #[error("topic closed")]
    Disconnected,
}

/// Receiver for messages from a topic
pub struct Receiver<T> {
    rx: channel::Receiver<T>,
}

impl<T> Receiver<T> {
    /// Receive a message, blocking if necessary
    ///
    /// # Errors
    /// Returns an error if the topic was closed and the queue is drained
    pub fn recv(&self) -> Result<T, BusError> {
        self.rx.recv().map_err(|_| BusError::Disconnected)
    }

    /// Try to receive a message without blocking
    ///
    /// # Errors
    /// Returns an error if the topic was closed and the queue is drained
    pub fn try_recv(&self) -> Result<Option<T>, BusError> {
        match self.rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(channel::TryRecvError::Empty) => Ok(None),
            Err(channel::TryRecvError::Disconnected) => Err(BusError::Disconnected),
        }
    }

    /// Wait up to `timeout` for a message
    ///
    /// # Errors
    /// Returns an error if the topic was closed and the queue is drained
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, BusError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(channel::RecvTimeoutError::Disconnected) => Err(BusError::Disconnected),
        }
    }

    /// Take everything currently queued
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// Number of queued messages
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Check if nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

/// Outcome of one publish
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that received the message
    pub delivered: usize,
    /// Subscribers whose queue was full
    pub dropped: usize,
    /// Subscribers removed because their receiver was gone
    pub pruned: usize,
}

/// Bounded fan-out topic
pub struct Topic<T> {
    subscribers: Mutex<Vec<channel::Sender<T>>>,
    capacity: usize,
    dropped: AtomicU64,
}

impl<T: Clone + Send> Topic<T> {
    /// Create a topic whose subscriber queues hold `capacity` messages
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber
    #[must_use]
    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = channel::bounded(self.capacity);
        self.subscribers.lock().push(tx);
        Receiver { rx }
    }

    /// Offer `msg` to every subscriber without blocking
    pub fn publish(&self, msg: &T) -> PublishReport {
        let mut report = PublishReport::default();
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(msg.clone()) {
            Ok(()) => {
                report.delivered += 1;
                true
            }
            Err(channel::TrySendError::Full(_)) => {
                report.dropped += 1;
                true
            }
            Err(channel::TrySendError::Disconnected(_)) => {
                report.pruned += 1;
                false
            }
        });
        drop(subscribers);

        if report.dropped > 0 {
            self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
            debug!("Dropped message for {} slow subscribers", report.dropped);
        }
        report
    }

    /// Disconnect every subscriber; queued messages stay readable
    pub fn close(&self) {
        self.subscribers.lock().clear();
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Messages dropped for full queues since creation
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
