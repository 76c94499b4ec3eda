//! Bounded per-instrument snapshot history

use common::Snapshot;
use std::sync::Arc;

/// Snapshots retained per instrument
pub const HISTORY_CAPACITY: usize = 100;

/// Fixed-capacity ring of recent snapshots
#[derive(Debug, Clone)]
pub struct History {
    /// Snapshot storage (circular once full)
    entries: Vec<Arc<Snapshot>>,
    /// Slot holding the oldest entry once full
    pos: usize,
    /// Max entries
    capacity: usize,
}

impl History {
    /// Create an empty history holding at most `capacity` snapshots
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Vec::with_capacity(capacity),
            pos: 0,
            capacity,
        }
    }

    /// Append a snapshot, returning the evicted one when full
    pub fn push(&mut self, snapshot: Arc<Snapshot>) -> Option<Arc<Snapshot>> {
        if self.entries.len() < self.capacity {
            self.entries.push(snapshot);
            return None;
        }

        let evicted = std::mem::replace(&mut self.entries[self.pos], snapshot);
        self.pos = (self.pos + 1) % self.capacity;
        Some(evicted)
    }

    /// Snapshots from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Snapshot>> {
        let (newer, older) = self.entries.split_at(self.pos);
        older.iter().chain(newer.iter())
    }

    /// Most recent snapshot
    #[must_use]
    pub fn latest(&self) -> Option<&Arc<Snapshot>> {
        if self.entries.len() < self.capacity || self.pos == 0 {
            self.entries.last()
        } else {
            self.entries.get(self.pos - 1)
        }
    }

    /// Owned copy, oldest first
    #[must_use]
    pub fn to_vec(&self) -> Vec<Arc<Snapshot>> {
        self.iter().cloned().collect()
    }

    /// Number of retained snapshots
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Max retained snapshots
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reset the history
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pos = 0;
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{ExchangeSegment, Side, SideDepth, Ts};

    fn snap(sequence: u32) -> Arc<Snapshot> {
        Arc::new(Snapshot::new(
            1333,
            ExchangeSegment::NseEq,
            SideDepth::empty(Side::Bid),
            SideDepth::empty(Side::Ask),
            sequence,
            Ts::from_nanos(u64::from(sequence)),
        ))
    }

    fn sequences(history: &History) -> Vec<u32> {
        history.iter().map(|s| s.sequence).collect()
    }

    #[test]
    fn test_keeps_insertion_order_below_capacity() {
        let mut history = History::new(4);
        for seq in 1..=3 {
            assert!(history.push(snap(seq)).is_none());
        }
        assert_eq!(sequences(&history), vec![1, 2, 3]);
        assert_eq!(history.latest().map(|s| s.sequence), Some(3));
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let mut history = History::default();
        for seq in 1..=100 {
            history.push(snap(seq));
        }
        let evicted = history.push(snap(101));

        assert_eq!(evicted.map(|s| s.sequence), Some(1));
        assert_eq!(history.len(), HISTORY_CAPACITY);
        let seqs = sequences(&history);
        assert_eq!(seqs.first(), Some(&2));
        assert_eq!(seqs.last(), Some(&101));
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(history.latest().map(|s| s.sequence), Some(101));
    }

    #[test]
    fn test_wraps_repeatedly() {
        let mut history = History::new(3);
        for seq in 1..=10 {
            history.push(snap(seq));
        }
        assert_eq!(sequences(&history), vec![8, 9, 10]);
        assert_eq!(history.latest().map(|s| s.sequence), Some(10));

        history.clear();
        assert!(history.is_empty());
        assert!(history.latest().is_none());
    }
}
