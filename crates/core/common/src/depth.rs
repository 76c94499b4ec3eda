//! Twenty-level depth model: levels, sides and combined snapshots

use crate::types::{ExchangeSegment, InstrumentId, Px, Side, Ts};
use serde::{Deserialize, Serialize};

/// Fixed depth of the feed (levels per side)
pub const DEPTH_LEVELS: usize = 20;

/// One price level: price, resting quantity and number of orders
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepthLevel {
    /// Level price
    pub price: Px,
    /// Total quantity resting at this price
    pub quantity: u32,
    /// Number of orders making up the quantity
    pub orders: u32,
}

impl DepthLevel {
    /// Zero-filled slot
    pub const EMPTY: Self = Self {
        price: Px::ZERO,
        quantity: 0,
        orders: 0,
    };

    /// Create a new level
    #[must_use]
    pub const fn new(price: Px, quantity: u32, orders: u32) -> Self {
        Self {
            price,
            quantity,
            orders,
        }
    }

    /// A level with no quantity carries no liquidity
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.quantity == 0
    }
}

impl Default for DepthLevel {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// One side of a snapshot, always exactly [`DEPTH_LEVELS`] slots.
///
/// Non-empty levels occupy a best-first prefix; the remaining slots are
/// zero-filled. Bids are ordered by descending price, asks by ascending.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideDepth {
    side: Side,
    levels: [DepthLevel; DEPTH_LEVELS],
}

impl SideDepth {
    /// Side with every slot zero-filled
    #[must_use]
    pub const fn empty(side: Side) -> Self {
        Self {
            side,
            levels: [DepthLevel::EMPTY; DEPTH_LEVELS],
        }
    }

    /// Build a side from levels in any order.
    ///
    /// Empty levels are dropped, the rest sorted best-first and truncated
    /// to [`DEPTH_LEVELS`]; missing slots are zero-filled.
    #[must_use]
    pub fn from_levels(side: Side, input: &[DepthLevel]) -> Self {
        let mut live: Vec<DepthLevel> = input.iter().copied().filter(|l| !l.is_empty()).collect();
        match side {
            Side::Bid => live.sort_by(|a, b| b.price.cmp(&a.price)),
            Side::Ask => live.sort_by(|a, b| a.price.cmp(&b.price)),
        }

        let mut levels = [DepthLevel::EMPTY; DEPTH_LEVELS];
        for (slot, level) in levels.iter_mut().zip(live) {
            *slot = level;
        }
        Self { side, levels }
    }

    /// Which side of the book this is
    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    /// All slots, best first
    #[must_use]
    pub const fn levels(&self) -> &[DepthLevel; DEPTH_LEVELS] {
        &self.levels
    }

    /// Level at `index` (0 = best)
    #[must_use]
    pub fn level(&self, index: usize) -> Option<&DepthLevel> {
        self.levels.get(index)
    }

    /// Best non-empty level
    #[must_use]
    pub fn best(&self) -> Option<&DepthLevel> {
        self.levels.first().filter(|l| !l.is_empty())
    }

    /// Non-empty levels, best first
    pub fn non_empty(&self) -> impl Iterator<Item = &DepthLevel> {
        self.levels.iter().take_while(|l| !l.is_empty())
    }

    /// Number of non-empty levels
    #[must_use]
    pub fn non_empty_count(&self) -> usize {
        self.non_empty().count()
    }

    /// Check if side has no liquidity
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.best().is_none()
    }

    /// Total quantity over the top `depth` levels
    #[must_use]
    pub fn total_quantity(&self, depth: usize) -> u64 {
        self.levels
            .iter()
            .take(depth)
            .map(|l| u64::from(l.quantity))
            .sum()
    }

    /// Total order count over the top `depth` levels
    #[must_use]
    pub fn total_orders(&self, depth: usize) -> u64 {
        self.levels
            .iter()
            .take(depth)
            .map(|l| u64::from(l.orders))
            .sum()
    }

    /// Prices never improve going deeper into the book
    #[must_use]
    pub fn is_ordered(&self) -> bool {
        let live: Vec<&DepthLevel> = self.non_empty().collect();
        let tail_clear = self.levels[live.len()..].iter().all(DepthLevel::is_empty);
        let ordered = live.windows(2).all(|w| match self.side {
            Side::Bid => w[0].price >= w[1].price,
            Side::Ask => w[0].price <= w[1].price,
        });
        tail_clear && ordered
    }
}

/// Why a snapshot does not continue the previous one seamlessly
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaleReason {
    /// Upstream connection dropped and was re-established
    ConnectionLost,
    /// Connection was recycled after too many malformed frames
    ErrorBudgetExceeded,
    /// Only one side arrived within the pairing window
    PairingTimeout,
}

/// Continuity marker attached to the first snapshot after a gap
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleMarker {
    /// When the gap began
    pub outage_started: Ts,
    /// When data started flowing again
    pub restored_at: Ts,
    /// Cause of the gap
    pub reason: StaleReason,
}

/// Combined bid/ask view of one instrument at one point in time
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Instrument security id
    pub instrument: InstrumentId,
    /// Exchange segment
    pub segment: ExchangeSegment,
    /// Bid side, best (highest) first
    pub bids: SideDepth,
    /// Ask side, best (lowest) first
    pub asks: SideDepth,
    /// Highest feed sequence among the packets combined
    pub sequence: u32,
    /// Time the snapshot was assembled
    pub ts: Ts,
    /// Present when continuity with the previous snapshot is broken
    pub stale: Option<StaleMarker>,
}

impl Snapshot {
    /// Create a new snapshot
    #[must_use]
    pub const fn new(
        instrument: InstrumentId,
        segment: ExchangeSegment,
        bids: SideDepth,
        asks: SideDepth,
        sequence: u32,
        ts: Ts,
    ) -> Self {
        Self {
            instrument,
            segment,
            bids,
            asks,
            sequence,
            ts,
            stale: None,
        }
    }

    /// Attach a continuity marker
    #[must_use]
    pub fn with_stale(mut self, marker: StaleMarker) -> Self {
        self.stale = Some(marker);
        self
    }

    /// Depth for one side
    #[must_use]
    pub const fn side(&self, side: Side) -> &SideDepth {
        match side {
            Side::Bid => &self.bids,
            Side::Ask => &self.asks,
        }
    }

    /// Best bid level
    #[must_use]
    pub fn best_bid(&self) -> Option<&DepthLevel> {
        self.bids.best()
    }

    /// Best ask level
    #[must_use]
    pub fn best_ask(&self) -> Option<&DepthLevel> {
        self.asks.best()
    }

    /// Mid price when both sides are present
    #[must_use]
    pub fn mid(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Some((bid.price.as_f64() + ask.price.as_f64()) / 2.0)
    }

    /// Best ask minus best bid
    #[must_use]
    pub fn spread(&self) -> Option<Px> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }

    /// Check if continuity was broken before this snapshot
    #[must_use]
    pub const fn is_stale(&self) -> bool {
        self.stale.is_some()
    }
}

/// Active depth subscription
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Instrument security id
    pub instrument: InstrumentId,
    /// Exchange segment
    pub segment: ExchangeSegment,
    /// When the subscription was created
    pub subscribed_at: Ts,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lvl(price: f64, quantity: u32) -> DepthLevel {
        DepthLevel::new(Px::new(price), quantity, 1)
    }

    #[test]
    fn test_from_levels_zero_fills() {
        let side = SideDepth::from_levels(Side::Bid, &[lvl(100.0, 10), lvl(99.5, 20)]);
        assert_eq!(side.levels().len(), DEPTH_LEVELS);
        assert_eq!(side.non_empty_count(), 2);
        assert!(side.levels()[2..].iter().all(DepthLevel::is_empty));
        assert!(side.is_ordered());
    }

    #[test]
    fn test_from_levels_orders_best_first() {
        let bids = SideDepth::from_levels(Side::Bid, &[lvl(99.0, 5), lvl(100.0, 10), lvl(99.5, 7)]);
        let prices: Vec<Px> = bids.non_empty().map(|l| l.price).collect();
        assert_eq!(prices, vec![Px::new(100.0), Px::new(99.5), Px::new(99.0)]);

        let asks = SideDepth::from_levels(Side::Ask, &[lvl(101.0, 5), lvl(100.5, 10)]);
        assert_eq!(asks.best().map(|l| l.price), Some(Px::new(100.5)));
        assert!(asks.is_ordered());
    }

    #[test]
    fn test_from_levels_drops_empty_and_truncates() {
        let mut input: Vec<DepthLevel> = (0..25).map(|i| lvl(100.0 + f64::from(i), 1)).collect();
        input.push(lvl(50.0, 0));
        let asks = SideDepth::from_levels(Side::Ask, &input);
        assert_eq!(asks.non_empty_count(), DEPTH_LEVELS);
        assert_eq!(asks.best().map(|l| l.price), Some(Px::new(100.0)));
    }

    #[test]
    fn test_totals() {
        let bids = SideDepth::from_levels(
            Side::Bid,
            &[
                DepthLevel::new(Px::new(100.0), 10, 2),
                DepthLevel::new(Px::new(99.5), 20, 3),
                DepthLevel::new(Px::new(99.0), 30, 4),
            ],
        );
        assert_eq!(bids.total_quantity(2), 30);
        assert_eq!(bids.total_quantity(DEPTH_LEVELS), 60);
        assert_eq!(bids.total_orders(DEPTH_LEVELS), 9);
    }

    #[test]
    fn test_snapshot_mid_and_spread() {
        let snap = Snapshot::new(
            1333,
            ExchangeSegment::NseEq,
            SideDepth::from_levels(Side::Bid, &[lvl(99.5, 10)]),
            SideDepth::from_levels(Side::Ask, &[lvl(100.5, 10)]),
            7,
            Ts::from_nanos(1),
        );
        assert_eq!(snap.mid(), Some(100.0));
        assert_eq!(snap.spread(), Some(Px::new(1.0)));
        assert!(!snap.is_stale());
    }

    #[test]
    fn test_one_sided_snapshot_has_no_mid() {
        let snap = Snapshot::new(
            1333,
            ExchangeSegment::NseEq,
            SideDepth::from_levels(Side::Bid, &[lvl(99.5, 10)]),
            SideDepth::empty(Side::Ask),
            1,
            Ts::from_nanos(1),
        );
        assert_eq!(snap.mid(), None);
        assert_eq!(snap.asks.levels().len(), DEPTH_LEVELS);
    }
}
