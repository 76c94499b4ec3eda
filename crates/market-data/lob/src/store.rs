//! Subscription table plus latest snapshot and history per instrument
//!
//! One writer (the ingest path) applies snapshots; any number of readers
//! query them. Every applied snapshot is fanned out to the instrument's
//! watchers through a bounded [`bus::Topic`].

use crate::error::DepthError;
use crate::history::{HISTORY_CAPACITY, History};
use bus::{Receiver, Topic};
use common::{ExchangeSegment, InstrumentId, Snapshot, Subscription, Ts};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Store sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Snapshots kept per instrument
    pub history_capacity: usize,
    /// Pending updates per watcher before updates are dropped for it
    pub watcher_queue: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_capacity: HISTORY_CAPACITY,
            watcher_queue: 256,
        }
    }
}

/// Result of registering an instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// New subscription created
    Added(Subscription),
    /// Instrument was already registered; nothing changed
    Existing(Subscription),
}

impl Registration {
    /// The subscription either way
    #[must_use]
    pub const fn subscription(&self) -> &Subscription {
        match self {
            Self::Added(sub) | Self::Existing(sub) => sub,
        }
    }

    /// Check if this call created the subscription
    #[must_use]
    pub const fn is_new(&self) -> bool {
        matches!(self, Self::Added(_))
    }
}

struct InstrumentDepth {
    subscription: Subscription,
    latest: Option<Arc<Snapshot>>,
    history: History,
    topic: Arc<Topic<Arc<Snapshot>>>,
}

/// Depth state for all subscribed instruments
pub struct DepthStore {
    config: StoreConfig,
    entries: RwLock<FxHashMap<InstrumentId, InstrumentDepth>>,
    applied: AtomicU64,
    dropped_updates: AtomicU64,
}

impl DepthStore {
    /// Create an empty store
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(FxHashMap::default()),
            applied: AtomicU64::new(0),
            dropped_updates: AtomicU64::new(0),
        }
    }

    /// Register an instrument, refusing once `max` are active.
    ///
    /// # Errors
    /// [`DepthError::CapacityExceeded`] when the table is full; the table
    /// is left untouched.
    pub fn register(
        &self,
        instrument: InstrumentId,
        segment: ExchangeSegment,
        max: usize,
    ) -> Result<Registration, DepthError> {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&instrument) {
            return Ok(Registration::Existing(existing.subscription));
        }
        if entries.len() >= max {
            return Err(DepthError::CapacityExceeded { limit: max });
        }

        let subscription = Subscription {
            instrument,
            segment,
            subscribed_at: Ts::now(),
        };
        entries.insert(
            instrument,
            InstrumentDepth {
                subscription,
                latest: None,
                history: History::new(self.config.history_capacity),
                topic: Arc::new(Topic::new(self.config.watcher_queue)),
            },
        );
        info!("Registered depth for {} ({})", instrument, segment);
        Ok(Registration::Added(subscription))
    }

    /// Drop an instrument with its history; watchers see the channel close.
    pub fn remove(&self, instrument: InstrumentId) -> bool {
        let removed = self.entries.write().remove(&instrument);
        match removed {
            Some(entry) => {
                entry.topic.close();
                info!(
                    "Removed depth for {} after {} snapshots",
                    instrument,
                    entry.history.len()
                );
                true
            }
            None => false,
        }
    }

    /// Check if an instrument is registered
    #[must_use]
    pub fn contains(&self, instrument: InstrumentId) -> bool {
        self.entries.read().contains_key(&instrument)
    }

    /// Segment an instrument was registered under
    #[must_use]
    pub fn segment(&self, instrument: InstrumentId) -> Option<ExchangeSegment> {
        self.entries
            .read()
            .get(&instrument)
            .map(|e| e.subscription.segment)
    }

    /// Latest snapshot
    ///
    /// # Errors
    /// [`DepthError::NotSubscribed`] or [`DepthError::NoDataYet`]
    pub fn snapshot(&self, instrument: InstrumentId) -> Result<Arc<Snapshot>, DepthError> {
        let entries = self.entries.read();
        let entry = entries
            .get(&instrument)
            .ok_or(DepthError::NotSubscribed(instrument))?;
        entry
            .latest
            .clone()
            .ok_or(DepthError::NoDataYet(instrument))
    }

    /// Retained snapshots, oldest first (possibly empty)
    ///
    /// # Errors
    /// [`DepthError::NotSubscribed`]
    pub fn history(&self, instrument: InstrumentId) -> Result<Vec<Arc<Snapshot>>, DepthError> {
        let entries = self.entries.read();
        entries
            .get(&instrument)
            .map(|e| e.history.to_vec())
            .ok_or(DepthError::NotSubscribed(instrument))
    }

    /// Latest snapshot and history read under a single lock
    ///
    /// # Errors
    /// [`DepthError::NotSubscribed`] or [`DepthError::NoDataYet`]
    pub fn latest_with_history(
        &self,
        instrument: InstrumentId,
    ) -> Result<(Arc<Snapshot>, Vec<Arc<Snapshot>>), DepthError> {
        let entries = self.entries.read();
        let entry = entries
            .get(&instrument)
            .ok_or(DepthError::NotSubscribed(instrument))?;
        let latest = entry
            .latest
            .clone()
            .ok_or(DepthError::NoDataYet(instrument))?;
        Ok((latest, entry.history.to_vec()))
    }

    /// Install a snapshot as the latest, append it to history and notify
    /// watchers.
    ///
    /// # Errors
    /// [`DepthError::NotSubscribed`] for unregistered instruments; no entry
    /// is created.
    pub fn apply(&self, snapshot: Snapshot) -> Result<Arc<Snapshot>, DepthError> {
        let instrument = snapshot.instrument;
        let snapshot = Arc::new(snapshot);

        let topic = {
            let mut entries = self.entries.write();
            let entry = entries
                .get_mut(&instrument)
                .ok_or(DepthError::NotSubscribed(instrument))?;
            entry.latest = Some(Arc::clone(&snapshot));
            entry.history.push(Arc::clone(&snapshot));
            Arc::clone(&entry.topic)
        };
        self.applied.fetch_add(1, Ordering::Relaxed);

        // Fan out without holding the table lock
        let report = topic.publish(&snapshot);
        if report.dropped > 0 {
            self.dropped_updates
                .fetch_add(report.dropped as u64, Ordering::Relaxed);
            debug!(
                "Instrument {}: {} watchers lagging, update dropped for them",
                instrument, report.dropped
            );
        }
        Ok(snapshot)
    }

    /// Open an update channel for one instrument
    ///
    /// # Errors
    /// [`DepthError::NotSubscribed`]
    pub fn watch(&self, instrument: InstrumentId) -> Result<Receiver<Arc<Snapshot>>, DepthError> {
        let entries = self.entries.read();
        entries
            .get(&instrument)
            .map(|e| e.topic.subscribe())
            .ok_or(DepthError::NotSubscribed(instrument))
    }

    /// Active subscriptions ordered by instrument
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subs: Vec<Subscription> = self
            .entries
            .read()
            .values()
            .map(|e| e.subscription)
            .collect();
        subs.sort_by_key(|s| s.instrument);
        subs
    }

    /// Registered instrument ids, ascending
    #[must_use]
    pub fn instruments(&self) -> Vec<InstrumentId> {
        let mut ids: Vec<InstrumentId> = self.entries.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Number of registered instruments
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if nothing is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every instrument
    pub fn clear(&self) {
        let drained: Vec<InstrumentDepth> = self.entries.write().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.topic.close();
        }
    }

    /// Snapshots applied since creation
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Watcher deliveries dropped for full queues
    #[must_use]
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates.load(Ordering::Relaxed)
    }
}

impl Default for DepthStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DepthLevel, Px, Side, SideDepth};

    fn snap(instrument: InstrumentId, sequence: u32, bid: f64) -> Snapshot {
        Snapshot::new(
            instrument,
            ExchangeSegment::NseEq,
            SideDepth::from_levels(Side::Bid, &[DepthLevel::new(Px::new(bid), 10, 1)]),
            SideDepth::from_levels(Side::Ask, &[DepthLevel::new(Px::new(bid + 0.05), 10, 1)]),
            sequence,
            Ts::from_nanos(u64::from(sequence)),
        )
    }

    #[test]
    fn test_register_is_idempotent() -> Result<(), DepthError> {
        let store = DepthStore::default();
        assert!(store.register(1333, ExchangeSegment::NseEq, 50)?.is_new());
        assert!(!store.register(1333, ExchangeSegment::NseEq, 50)?.is_new());
        assert_eq!(store.len(), 1);
        Ok(())
    }

    #[test]
    fn test_register_rejects_past_capacity() -> Result<(), DepthError> {
        let store = DepthStore::default();
        for id in 0..3 {
            store.register(id, ExchangeSegment::NseFno, 3)?;
        }
        assert_eq!(
            store.register(99, ExchangeSegment::NseFno, 3),
            Err(DepthError::CapacityExceeded { limit: 3 })
        );
        assert_eq!(store.instruments(), vec![0, 1, 2]);
        // Existing instruments still resolve at capacity
        assert!(store.register(1, ExchangeSegment::NseFno, 3).is_ok());
        Ok(())
    }

    #[test]
    fn test_snapshot_errors() -> Result<(), DepthError> {
        let store = DepthStore::default();
        assert_eq!(store.snapshot(7), Err(DepthError::NotSubscribed(7)));
        store.register(7, ExchangeSegment::NseEq, 50)?;
        assert_eq!(store.snapshot(7), Err(DepthError::NoDataYet(7)));
        assert_eq!(store.history(7)?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_apply_updates_latest_and_history() -> Result<(), DepthError> {
        let store = DepthStore::default();
        store.register(1333, ExchangeSegment::NseEq, 50)?;
        store.apply(snap(1333, 1, 100.0))?;
        store.apply(snap(1333, 2, 100.1))?;

        assert_eq!(store.snapshot(1333)?.sequence, 2);
        let seqs: Vec<u32> = store.history(1333)?.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(store.applied(), 2);
        Ok(())
    }

    #[test]
    fn test_apply_for_unknown_instrument_creates_nothing() {
        let store = DepthStore::default();
        assert_eq!(
            store.apply(snap(42, 1, 100.0)).map(|s| s.sequence),
            Err(DepthError::NotSubscribed(42))
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_history_capped_at_hundred() -> Result<(), DepthError> {
        let store = DepthStore::default();
        store.register(1, ExchangeSegment::NseEq, 50)?;
        for seq in 1..=101 {
            store.apply(snap(1, seq, 100.0))?;
        }
        let history = store.history(1)?;
        assert_eq!(history.len(), 100);
        assert_eq!(history.first().map(|s| s.sequence), Some(2));
        assert_eq!(history.last().map(|s| s.sequence), Some(101));
        Ok(())
    }

    #[test]
    fn test_watchers_receive_updates_and_close_on_remove() -> Result<(), Box<dyn std::error::Error>> {
        let store = DepthStore::default();
        store.register(1333, ExchangeSegment::NseEq, 50)?;
        let rx = store.watch(1333)?;

        store.apply(snap(1333, 5, 100.0))?;
        assert_eq!(rx.try_recv()?.map(|s| s.sequence), Some(5));

        let held = store.snapshot(1333)?;
        assert!(store.remove(1333));
        assert!(!store.remove(1333));
        assert!(rx.try_recv().is_err());
        // Readers keep their snapshot after unsubscribe
        assert_eq!(held.sequence, 5);
        assert_eq!(store.snapshot(1333), Err(DepthError::NotSubscribed(1333)));
        Ok(())
    }

    #[test]
    fn test_slow_watcher_does_not_block_apply() -> Result<(), DepthError> {
        let store = DepthStore::new(StoreConfig {
            history_capacity: 10,
            watcher_queue: 1,
        });
        store.register(1, ExchangeSegment::NseEq, 50)?;
        let _slow = store.watch(1)?;
        for seq in 1..=4 {
            store.apply(snap(1, seq, 100.0))?;
        }
        assert_eq!(store.dropped_updates(), 3);
        assert_eq!(store.snapshot(1)?.sequence, 4);
        Ok(())
    }
}
