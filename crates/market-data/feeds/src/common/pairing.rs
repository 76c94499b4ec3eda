//! Bid/ask pairing and per-instrument delivery throttling

use crate::dhan::codec::DepthPacket;
use common::{ExchangeSegment, InstrumentId, Side, SideDepth, Snapshot, Ts};
use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Bid and ask sides ready to become a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDepth {
    /// Security id
    pub instrument: InstrumentId,
    /// Exchange segment
    pub segment: ExchangeSegment,
    /// Bid side, `None` if it never arrived
    pub bids: Option<SideDepth>,
    /// Ask side, `None` if it never arrived
    pub asks: Option<SideDepth>,
    /// Highest sequence of the packets combined
    pub sequence: u32,
    /// Wall time the first packet of the pair arrived
    pub opened_at: Ts,
    /// Emitted on window expiry rather than on a match
    pub forced: bool,
}

#[derive(Debug)]
struct PendingPair {
    segment: ExchangeSegment,
    bids: Option<(SideDepth, u32)>,
    asks: Option<(SideDepth, u32)>,
    opened: Instant,
    opened_at: Ts,
}

impl PendingPair {
    fn new(segment: ExchangeSegment, now: Instant) -> Self {
        Self {
            segment,
            bids: None,
            asks: None,
            opened: now,
            opened_at: Ts::now(),
        }
    }

    fn slot(&mut self, side: Side) -> &mut Option<(SideDepth, u32)> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    fn into_paired(self, instrument: InstrumentId, forced: bool) -> PairedDepth {
        let sequence = self
            .bids
            .as_ref()
            .map(|(_, s)| *s)
            .max(self.asks.as_ref().map(|(_, s)| *s))
            .unwrap_or(0);
        PairedDepth {
            instrument,
            segment: self.segment,
            bids: self.bids.map(|(d, _)| d),
            asks: self.asks.map(|(d, _)| d),
            sequence,
            opened_at: self.opened_at,
            forced,
        }
    }
}

/// Holds the latest packet of each side until its partner arrives
#[derive(Debug)]
pub struct PairingBuffer {
    window: Duration,
    pending: FxHashMap<InstrumentId, PendingPair>,
}

impl PairingBuffer {
    /// Create a buffer that waits up to `window` for the partner side
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: FxHashMap::default(),
        }
    }

    /// Accept a packet; returns the pairs it completes or displaces.
    ///
    /// A repeat of the same side replaces the pending one. A pending pair
    /// older than the window is forced out first and this packet opens a
    /// new one, so the result holds at most two pairs.
    pub fn offer(&mut self, side: Side, packet: DepthPacket, now: Instant) -> Vec<PairedDepth> {
        let instrument = packet.instrument;
        let depth = packet.side_depth(side);
        let mut out = Vec::new();

        let window = self.window;
        let outdated = self
            .pending
            .get(&instrument)
            .is_some_and(|p| now.saturating_duration_since(p.opened) >= window);
        if outdated {
            if let Some(expired) = self.pending.remove(&instrument) {
                out.push(expired.into_paired(instrument, true));
            }
        }

        let pair = self
            .pending
            .entry(instrument)
            .or_insert_with(|| PendingPair::new(packet.segment, now));
        *pair.slot(side) = Some((depth, packet.sequence));

        if pair.bids.is_some() && pair.asks.is_some() {
            if let Some(complete) = self.pending.remove(&instrument) {
                out.push(complete.into_paired(instrument, false));
            }
        }
        out
    }

    /// Force out every pair whose window has elapsed
    pub fn expire(&mut self, now: Instant) -> Vec<PairedDepth> {
        let expired: Vec<InstrumentId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.opened) >= self.window)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| p.into_paired(id, true)))
            .collect()
    }

    /// Drop whatever is pending for one instrument
    pub fn remove(&mut self, instrument: InstrumentId) {
        self.pending.remove(&instrument);
    }

    /// Drop everything pending
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Instruments with a pending side
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Check if nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Default)]
struct ThrottleSlot {
    last_delivery: Option<Instant>,
    pending: Option<Snapshot>,
}

/// Outcome of offering a snapshot to the throttle
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleDecision {
    /// Deliver now
    Deliver(Snapshot),
    /// Held back until the interval elapses
    Deferred,
}

/// Limits deliveries to one per interval per instrument, keeping the
/// newest snapshot that arrived in between
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    slots: FxHashMap<InstrumentId, ThrottleSlot>,
}

impl Throttle {
    /// Create a throttle
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            slots: FxHashMap::default(),
        }
    }

    /// Deliver now or hold as the instrument's latest.
    ///
    /// A continuity marker on a replaced snapshot moves to its successor.
    pub fn offer(&mut self, mut snapshot: Snapshot, now: Instant) -> ThrottleDecision {
        let interval = self.interval;
        let slot = self.slots.entry(snapshot.instrument).or_default();
        if let Some(replaced) = slot.pending.take() {
            if snapshot.stale.is_none() {
                snapshot.stale = replaced.stale;
            }
        }

        let due = slot
            .last_delivery
            .is_none_or(|last| now.saturating_duration_since(last) >= interval);
        if due {
            slot.last_delivery = Some(now);
            ThrottleDecision::Deliver(snapshot)
        } else {
            slot.pending = Some(snapshot);
            ThrottleDecision::Deferred
        }
    }

    /// Release held snapshots whose interval has elapsed
    pub fn flush(&mut self, now: Instant) -> Vec<Snapshot> {
        let interval = self.interval;
        self.slots
            .values_mut()
            .filter(|slot| {
                slot.pending.is_some()
                    && slot
                        .last_delivery
                        .is_none_or(|last| now.saturating_duration_since(last) >= interval)
            })
            .filter_map(|slot| {
                slot.last_delivery = Some(now);
                slot.pending.take()
            })
            .collect()
    }

    /// Release every held snapshot regardless of timing
    pub fn drain(&mut self) -> Vec<Snapshot> {
        self.slots
            .values_mut()
            .filter_map(|slot| slot.pending.take())
            .collect()
    }

    /// Forget one instrument
    pub fn remove(&mut self, instrument: InstrumentId) {
        self.slots.remove(&instrument);
    }

    /// Number of held snapshots
    #[must_use]
    pub fn pending(&self) -> usize {
        self.slots.values().filter(|s| s.pending.is_some()).count()
    }
}
