//! Microstructure metrics over twenty-level snapshots
//!
//! Every function here is pure: it reads a snapshot (or a side of one, or
//! a history slice) and returns a number or a small report.

#![allow(clippy::cast_precision_loss)]

use common::{DEPTH_LEVELS, DepthLevel, Px, Side, SideDepth, Snapshot};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Volume imbalance over the top `depth` levels, in [-1, 1].
///
/// Positive when bids outweigh asks; 0 when both sides are empty.
#[must_use]
pub fn imbalance(snapshot: &Snapshot, depth: usize) -> f64 {
    let bid = snapshot.bids.total_quantity(depth) as f64;
    let ask = snapshot.asks.total_quantity(depth) as f64;
    let total = bid + ask;
    if total <= 0.0 {
        return 0.0;
    }
    ((bid - ask) / total).clamp(-1.0, 1.0)
}

fn side_liquidity(depth: &SideDepth, reference_quantity: u64) -> f64 {
    let quantity = depth.total_quantity(DEPTH_LEVELS);
    let volume = if reference_quantity == 0 {
        if quantity > 0 { 1.0 } else { 0.0 }
    } else {
        (quantity as f64 / reference_quantity as f64).min(1.0)
    };
    let breadth = depth.non_empty_count() as f64 / DEPTH_LEVELS as f64;
    0.6 * volume + 0.4 * breadth
}

/// Liquidity score in [0, 1], averaged over both sides
#[must_use]
pub fn liquidity_score(snapshot: &Snapshot, reference_quantity: u64) -> f64 {
    let score = (side_liquidity(&snapshot.bids, reference_quantity)
        + side_liquidity(&snapshot.asks, reference_quantity))
        / 2.0;
    score.clamp(0.0, 1.0)
}

fn relative_distance(price: Px, best: Px) -> f64 {
    if best.is_zero() {
        return if price == best { 0.0 } else { f64::INFINITY };
    }
    price.distance(best).as_f64() / best.as_f64().abs()
}

/// Largest order one side absorbs without walking past `tolerance`
/// (relative to best), capped at `max_fraction` of the side's visible
/// quantity
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn optimal_order_size(depth: &SideDepth, tolerance: f64, max_fraction: f64) -> u64 {
    let Some(best) = depth.best() else {
        return 0;
    };

    let fillable: u64 = depth
        .non_empty()
        .take_while(|l| relative_distance(l.price, best.price) <= tolerance)
        .map(|l| u64::from(l.quantity))
        .sum();

    let visible = depth.total_quantity(DEPTH_LEVELS);
    let cap = (visible as f64 * max_fraction.clamp(0.0, 1.0)).floor() as u64;
    fillable.min(cap)
}

/// Outcome of walking one side of the book with a market order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpactEstimate {
    /// Side of the book consumed (asks for a buy, bids for a sell)
    pub side: Side,
    /// Quantity asked for
    pub requested: u64,
    /// Quantity the visible book could fill
    pub filled: u64,
    /// Quantity-weighted execution price
    pub average_price: f64,
    /// Best price on the consumed side
    pub best_price: Px,
    /// Absolute distance between average and best
    pub impact: f64,
    /// Impact relative to best
    pub relative_impact: f64,
    /// Whether the whole request was filled
    pub fully_filled: bool,
}

/// Walk `depth` from best for `quantity`.
///
/// `None` for an empty side or a zero quantity.
#[must_use]
pub fn price_impact(depth: &SideDepth, quantity: u64) -> Option<ImpactEstimate> {
    let best = depth.best()?;
    if quantity == 0 {
        return None;
    }

    let mut remaining = quantity;
    let mut filled = 0_u64;
    let mut notional = 0.0;
    for level in depth.non_empty() {
        if remaining == 0 {
            break;
        }
        let take = remaining.min(u64::from(level.quantity));
        notional += take as f64 * level.price.as_f64();
        filled += take;
        remaining -= take;
    }

    let average_price = notional / filled as f64;
    let best_price = best.price;
    let impact = (average_price - best_price.as_f64()).abs();
    let relative_impact = if best_price.is_zero() {
        0.0
    } else {
        impact / best_price.as_f64().abs()
    };

    Some(ImpactEstimate {
        side: depth.side(),
        requested: quantity,
        filled,
        average_price,
        best_price,
        impact,
        relative_impact,
        fully_filled: remaining == 0,
    })
}

/// One point of an impact curve
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImpactPoint {
    /// Level index
    pub level: usize,
    /// Quantity available up to and including this level
    pub cumulative_quantity: u64,
    /// Distance of this level from best, relative to best
    pub relative_impact: f64,
}

/// Cumulative quantity against relative price distance, per level
#[must_use]
pub fn impact_curve(depth: &SideDepth) -> Vec<ImpactPoint> {
    let Some(best) = depth.best() else {
        return Vec::new();
    };
    let mut cumulative = 0_u64;
    depth
        .non_empty()
        .enumerate()
        .map(|(level, l)| {
            cumulative += u64::from(l.quantity);
            ImpactPoint {
                level,
                cumulative_quantity: cumulative,
                relative_impact: relative_distance(l.price, best.price),
            }
        })
        .collect()
}

/// Coefficient of variation of mid prices over the last `window`
/// two-sided snapshots; 0 with fewer than two
#[must_use]
pub fn estimated_volatility(history: &[Arc<Snapshot>], window: usize) -> f64 {
    let mids: Vec<f64> = history.iter().filter_map(|s| s.mid()).collect();
    let mids = &mids[mids.len().saturating_sub(window)..];
    if mids.len() < 2 {
        return 0.0;
    }

    let n = mids.len() as f64;
    let mean = mids.iter().sum::<f64>() / n;
    if mean <= 0.0 {
        return 0.0;
    }
    let variance = mids.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt() / mean
}

/// Average orders per unit of quantity across all visible levels
#[must_use]
pub fn fragmentation_score(snapshot: &Snapshot) -> f64 {
    let quantity =
        snapshot.bids.total_quantity(DEPTH_LEVELS) + snapshot.asks.total_quantity(DEPTH_LEVELS);
    if quantity == 0 {
        return 0.0;
    }
    let orders =
        snapshot.bids.total_orders(DEPTH_LEVELS) + snapshot.asks.total_orders(DEPTH_LEVELS);
    orders as f64 / quantity as f64
}

/// Total bid over total ask quantity; `None` without asks
#[must_use]
pub fn bid_ask_ratio(snapshot: &Snapshot) -> Option<f64> {
    let ask = snapshot.asks.total_quantity(DEPTH_LEVELS);
    if ask == 0 {
        return None;
    }
    Some(snapshot.bids.total_quantity(DEPTH_LEVELS) as f64 / ask as f64)
}

/// Share of visible quantity by depth band, in percent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LiquidityDistribution {
    /// Levels 0..5 on both sides
    pub top_5: f64,
    /// Levels 5..15
    pub mid_10: f64,
    /// Levels 15..20
    pub bottom_5: f64,
}

/// Split visible quantity into top, middle and bottom bands
#[must_use]
pub fn liquidity_distribution(snapshot: &Snapshot) -> LiquidityDistribution {
    let band = |from: usize, to: usize| -> u64 {
        [&snapshot.bids, &snapshot.asks]
            .iter()
            .flat_map(|d| d.levels()[from..to].iter())
            .map(|l| u64::from(l.quantity))
            .sum()
    };
    let top = band(0, 5);
    let mid = band(5, 15);
    let bottom = band(15, DEPTH_LEVELS);
    let total = top + mid + bottom;
    if total == 0 {
        return LiquidityDistribution::default();
    }

    let pct = |q: u64| q as f64 / total as f64 * 100.0;
    LiquidityDistribution {
        top_5: pct(top),
        mid_10: pct(mid),
        bottom_5: pct(bottom),
    }
}

/// Where liquidity concentrates on each side
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthSummary {
    /// Visible bid quantity
    pub total_bid_quantity: u64,
    /// Visible ask quantity
    pub total_ask_quantity: u64,
    /// Bid over ask quantity
    pub bid_ask_ratio: Option<f64>,
    /// Largest bid level (nearest best on ties)
    pub strongest_bid: Option<DepthLevel>,
    /// Largest ask level
    pub strongest_ask: Option<DepthLevel>,
    /// Smallest non-empty bid level
    pub weakest_bid: Option<DepthLevel>,
    /// Smallest non-empty ask level
    pub weakest_ask: Option<DepthLevel>,
}

/// Largest non-empty level, first one on ties
#[must_use]
pub fn strongest_level(depth: &SideDepth) -> Option<DepthLevel> {
    depth.non_empty().fold(None, |acc: Option<DepthLevel>, l| match acc {
        Some(best) if best.quantity >= l.quantity => Some(best),
        _ => Some(*l),
    })
}

/// Smallest non-empty level, first one on ties
#[must_use]
pub fn weakest_level(depth: &SideDepth) -> Option<DepthLevel> {
    depth.non_empty().fold(None, |acc: Option<DepthLevel>, l| match acc {
        Some(worst) if worst.quantity <= l.quantity => Some(worst),
        _ => Some(*l),
    })
}

/// Build a [`DepthSummary`]
#[must_use]
pub fn summarize(snapshot: &Snapshot) -> DepthSummary {
    DepthSummary {
        total_bid_quantity: snapshot.bids.total_quantity(DEPTH_LEVELS),
        total_ask_quantity: snapshot.asks.total_quantity(DEPTH_LEVELS),
        bid_ask_ratio: bid_ask_ratio(snapshot),
        strongest_bid: strongest_level(&snapshot.bids),
        strongest_ask: strongest_level(&snapshot.asks),
        weakest_bid: weakest_level(&snapshot.bids),
        weakest_ask: weakest_level(&snapshot.asks),
    }
}

fn gap_consistency(depth: &SideDepth) -> Option<f64> {
    let prices: Vec<i64> = depth.non_empty().map(|l| l.price.as_i64()).collect();
    if prices.len() < 3 {
        return None;
    }
    let gaps: Vec<f64> = prices.windows(2).map(|w| (w[0] - w[1]).abs() as f64).collect();
    let avg = gaps.iter().sum::<f64>() / gaps.len() as f64;
    if avg <= 0.0 {
        return Some(1.0);
    }
    let max = gaps.iter().copied().fold(f64::MIN, f64::max);
    let min = gaps.iter().copied().fold(f64::MAX, f64::min);
    Some((1.0 - (max - min) / avg).clamp(0.0, 1.0))
}

/// Regularity of price gaps between adjacent levels, 0..100.
///
/// Evenly spaced books score 100; a side needs three levels to count.
/// Returns 50 when neither side qualifies.
#[must_use]
pub fn market_efficiency(snapshot: &Snapshot) -> f64 {
    let scores: Vec<f64> = [&snapshot.bids, &snapshot.asks]
        .into_iter()
        .filter_map(gap_consistency)
        .collect();
    if scores.is_empty() {
        return 50.0;
    }
    scores.iter().sum::<f64>() / scores.len() as f64 * 100.0
}
