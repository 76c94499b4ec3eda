//! Demand and supply zones: runs of unusually dense levels

use common::{DepthLevel, Px, Side, SideDepth};
use serde::{Deserialize, Serialize};

/// Contiguous block of levels holding outsized quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    /// Bid side yields a demand zone, ask side a supply zone
    pub side: Side,
    /// First level index of the run (0 = best)
    pub start_level: usize,
    /// Last level index of the run, inclusive
    pub end_level: usize,
    /// Lowest price in the run
    pub price_low: Px,
    /// Highest price in the run
    pub price_high: Px,
    /// Quantity resting inside the run
    pub total_quantity: u64,
}

impl Zone {
    /// Boundary facing the spread
    #[must_use]
    pub const fn near_boundary(&self) -> Px {
        match self.side {
            Side::Bid => self.price_high,
            Side::Ask => self.price_low,
        }
    }

    /// Boundary away from the spread
    #[must_use]
    pub const fn far_boundary(&self) -> Px {
        match self.side {
            Side::Bid => self.price_low,
            Side::Ask => self.price_high,
        }
    }

    /// Number of levels in the run
    #[must_use]
    pub const fn width(&self) -> usize {
        self.end_level - self.start_level + 1
    }

    /// Check if the zone starts within `levels` of best
    #[must_use]
    pub const fn starts_within(&self, levels: usize) -> bool {
        self.start_level < levels
    }
}

/// Indices of levels whose quantity exceeds `threshold` times the mean
/// quantity of the side's non-empty levels
#[must_use]
pub fn dense_levels(depth: &SideDepth, threshold: f64) -> Vec<usize> {
    let live: Vec<&DepthLevel> = depth.non_empty().collect();
    if live.is_empty() {
        return Vec::new();
    }

    let total: u64 = live.iter().map(|l| u64::from(l.quantity)).sum();
    #[allow(clippy::cast_precision_loss)]
    let mean = total as f64 / live.len() as f64;
    let cutoff = mean * threshold;

    live.iter()
        .enumerate()
        .filter(|(_, l)| f64::from(l.quantity) > cutoff)
        .map(|(i, _)| i)
        .collect()
}

/// Densest run of consecutive dense levels on one side.
///
/// Ties go to the run nearer best.
#[must_use]
pub fn detect_zone(depth: &SideDepth, threshold: f64) -> Option<Zone> {
    let dense = dense_levels(depth, threshold);
    let levels = depth.levels();

    let mut best: Option<Zone> = None;
    let mut run_start = 0;
    while run_start < dense.len() {
        let mut run_end = run_start;
        while run_end + 1 < dense.len() && dense[run_end + 1] == dense[run_end] + 1 {
            run_end += 1;
        }

        let (first, last) = (dense[run_start], dense[run_end]);
        let run = &levels[first..=last];
        let total_quantity = run.iter().map(|l| u64::from(l.quantity)).sum();
        let price_low = run.iter().map(|l| l.price).min().unwrap_or(Px::ZERO);
        let price_high = run.iter().map(|l| l.price).max().unwrap_or(Px::ZERO);

        let candidate = Zone {
            side: depth.side(),
            start_level: first,
            end_level: last,
            price_low,
            price_high,
            total_quantity,
        };
        if best.is_none_or(|z| candidate.total_quantity > z.total_quantity) {
            best = Some(candidate);
        }
        run_start = run_end + 1;
    }
    best
}
