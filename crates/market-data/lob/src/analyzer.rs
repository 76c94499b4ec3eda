//! Depth analyzer: turns a snapshot plus its history into an
//! [`AnalysisResult`] with a directional signal.

use crate::analytics::{
    self, DepthSummary, ImpactEstimate, LiquidityDistribution, strongest_level,
};
use crate::zones::{Zone, detect_zone};
use common::{DEPTH_LEVELS, ExchangeSegment, InstrumentId, Px, Snapshot, Ts};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Analyzer tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Levels per side used for imbalance
    pub imbalance_depth: usize,
    /// Minimum |imbalance| for a directional signal
    pub hold_threshold: f64,
    /// Multiple of mean level quantity that marks a zone level
    pub zone_threshold: f64,
    /// Zones starting within this many levels of best count as nearby
    pub zone_proximity_levels: usize,
    /// Side quantity that scores full volume liquidity
    pub reference_quantity: u64,
    /// Relative price tolerance for optimal order size
    pub impact_tolerance: f64,
    /// Max share of visible side quantity for optimal order size
    pub max_depth_fraction: f64,
    /// Order size used for the headline price impact
    pub impact_reference_quantity: u64,
    /// Snapshots considered for volatility
    pub volatility_window: usize,
    /// Volatility at or below which a move can be scalped
    pub scalp_volatility: f64,
    /// Volatility at or above which a move is a swing
    pub swing_volatility: f64,
    /// Target distance (relative to mid) at or below which a move can be scalped
    pub scalp_distance: f64,
    /// Target distance at or above which a move is a swing
    pub swing_distance: f64,
    /// Liquidity below which no direction is taken
    pub min_liquidity: f64,
    /// Minimum age of a cached analysis before recomputing
    pub recompute_interval_ms: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            imbalance_depth: DEPTH_LEVELS,
            hold_threshold: 0.3,
            zone_threshold: 2.0,
            zone_proximity_levels: 5,
            reference_quantity: 10_000,
            impact_tolerance: 0.002,
            max_depth_fraction: 0.25,
            impact_reference_quantity: 1_000,
            volatility_window: 100,
            scalp_volatility: 0.0005,
            swing_volatility: 0.005,
            scalp_distance: 0.001,
            swing_distance: 0.005,
            min_liquidity: 0.05,
            recompute_interval_ms: 100,
        }
    }
}

/// Directional call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Signal {
    /// Bids dominate
    Buy,
    /// Asks dominate
    Sell,
    /// No edge
    Hold,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
            Self::Hold => "HOLD",
        })
    }
}

/// Expected holding period of a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeHorizon {
    /// Quiet market, nearby target
    Scalp,
    /// Neither scalp nor swing
    Intraday,
    /// Volatile market or distant target
    Swing,
}

impl fmt::Display for TimeHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Scalp => "SCALP",
            Self::Intraday => "INTRADAY",
            Self::Swing => "SWING",
        })
    }
}

/// Full analysis of one snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Instrument analysed
    pub instrument: InstrumentId,
    /// Exchange segment
    pub segment: ExchangeSegment,
    /// Volume imbalance over `imbalance_depth`, in [-1, 1]
    pub imbalance: f64,
    /// Liquidity score in [0, 1]
    pub liquidity_score: f64,
    /// Smaller of the bid and ask optimal sizes
    pub optimal_order_size: u64,
    /// Larger of the buy and sell impacts for the reference quantity
    pub estimated_price_impact: f64,
    /// Coefficient of variation of recent mids
    pub estimated_volatility: f64,
    /// Orders per unit quantity
    pub fragmentation_score: f64,
    /// Densest bid run
    pub demand_zone: Option<Zone>,
    /// Densest ask run
    pub supply_zone: Option<Zone>,
    /// Directional call
    pub signal: Signal,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Price objective for BUY/SELL
    pub target_level: Option<Px>,
    /// Invalidation price for BUY/SELL
    pub stop_level: Option<Px>,
    /// Expected holding period
    pub time_horizon: TimeHorizon,
    /// When the analysis ran
    pub computed_at: Ts,
    /// Sequence of the analysed snapshot
    pub snapshot_sequence: u32,
    /// Assembly time of the analysed snapshot
    pub snapshot_ts: Ts,
    /// Analysed snapshot followed a continuity gap
    pub stale: bool,
    /// Mid price
    pub mid: Option<f64>,
    /// Best ask minus best bid
    pub spread: Option<Px>,
    /// Walk of the asks for the reference quantity
    pub buy_impact: Option<ImpactEstimate>,
    /// Walk of the bids for the reference quantity
    pub sell_impact: Option<ImpactEstimate>,
    /// Price gap regularity, 0..100
    pub market_efficiency: f64,
    /// Quantity by depth band
    pub distribution: LiquidityDistribution,
    /// Strongest and weakest levels
    pub summary: DepthSummary,
    /// Why the signal was chosen
    pub reasons: Vec<String>,
}

/// Signal with its confidence and reasons
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDecision {
    /// Directional call
    pub signal: Signal,
    /// Confidence in [0, 1]
    pub confidence: f64,
    /// Human-readable reasons
    pub reasons: Vec<String>,
}

/// Stateless analyzer over snapshots
#[derive(Debug, Clone, Default)]
pub struct DepthAnalyzer {
    config: AnalyzerConfig,
}

impl DepthAnalyzer {
    /// Create an analyzer
    #[must_use]
    pub const fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyse `snapshot`; `history` (oldest first) feeds volatility
    #[must_use]
    pub fn analyze(&self, snapshot: &Snapshot, history: &[Arc<Snapshot>]) -> AnalysisResult {
        let cfg = &self.config;

        let imbalance = analytics::imbalance(snapshot, cfg.imbalance_depth);
        let liquidity_score = analytics::liquidity_score(snapshot, cfg.reference_quantity);
        let optimal_order_size = analytics::optimal_order_size(
            &snapshot.bids,
            cfg.impact_tolerance,
            cfg.max_depth_fraction,
        )
        .min(analytics::optimal_order_size(
            &snapshot.asks,
            cfg.impact_tolerance,
            cfg.max_depth_fraction,
        ));

        let buy_impact = analytics::price_impact(&snapshot.asks, cfg.impact_reference_quantity);
        let sell_impact = analytics::price_impact(&snapshot.bids, cfg.impact_reference_quantity);
        let estimated_price_impact = buy_impact
            .iter()
            .chain(sell_impact.iter())
            .map(|e| e.impact)
            .fold(0.0, f64::max);

        let estimated_volatility = analytics::estimated_volatility(history, cfg.volatility_window);
        let fragmentation_score = analytics::fragmentation_score(snapshot);
        let demand_zone = detect_zone(&snapshot.bids, cfg.zone_threshold);
        let supply_zone = detect_zone(&snapshot.asks, cfg.zone_threshold);

        let decision = self.decide(imbalance, liquidity_score, demand_zone, supply_zone);
        let target_level = self.target_level(decision.signal, snapshot, demand_zone, supply_zone);
        let stop_level = self.stop_level(decision.signal, snapshot, demand_zone, supply_zone);

        let mid = snapshot.mid();
        let distance = match (target_level, mid) {
            (Some(target), Some(mid)) if mid > 0.0 => (target.as_f64() - mid).abs() / mid,
            _ => 0.0,
        };
        let time_horizon = self.time_horizon(estimated_volatility, distance);

        debug!(
            "Instrument {}: imbalance {:.3} liquidity {:.3} -> {} ({:.2})",
            snapshot.instrument, imbalance, liquidity_score, decision.signal, decision.confidence
        );

        AnalysisResult {
            instrument: snapshot.instrument,
            segment: snapshot.segment,
            imbalance,
            liquidity_score,
            optimal_order_size,
            estimated_price_impact,
            estimated_volatility,
            fragmentation_score,
            demand_zone,
            supply_zone,
            signal: decision.signal,
            confidence: decision.confidence,
            target_level,
            stop_level,
            time_horizon,
            computed_at: Ts::now(),
            snapshot_sequence: snapshot.sequence,
            snapshot_ts: snapshot.ts,
            stale: snapshot.is_stale(),
            mid,
            spread: snapshot.spread(),
            buy_impact,
            sell_impact,
            market_efficiency: analytics::market_efficiency(snapshot),
            distribution: analytics::liquidity_distribution(snapshot),
            summary: analytics::summarize(snapshot),
            reasons: decision.reasons,
        }
    }

    /// Choose a signal from imbalance, liquidity and zones
    #[must_use]
    pub fn decide(
        &self,
        imbalance: f64,
        liquidity: f64,
        demand_zone: Option<Zone>,
        supply_zone: Option<Zone>,
    ) -> SignalDecision {
        let cfg = &self.config;
        let base = 0.6 * imbalance.abs() + 0.4 * liquidity;
        let mut reasons = Vec::new();

        if imbalance.abs() < cfg.hold_threshold {
            reasons.push(format!(
                "Balanced book: imbalance {imbalance:.3} inside ±{:.2}",
                cfg.hold_threshold
            ));
            return SignalDecision {
                signal: Signal::Hold,
                confidence: base.clamp(0.0, 1.0),
                reasons,
            };
        }
        if liquidity < cfg.min_liquidity {
            reasons.push(format!("Thin book: liquidity {liquidity:.3}"));
            return SignalDecision {
                signal: Signal::Hold,
                confidence: base.clamp(0.0, 1.0),
                reasons,
            };
        }

        let (direction, supporting, opposing) = if imbalance > 0.0 {
            reasons.push(format!("Bid pressure: imbalance {imbalance:.3}"));
            (Signal::Buy, demand_zone, supply_zone)
        } else {
            reasons.push(format!("Ask pressure: imbalance {imbalance:.3}"));
            (Signal::Sell, supply_zone, demand_zone)
        };

        let near = |zone: Option<Zone>| zone.filter(|z| z.starts_within(cfg.zone_proximity_levels));
        let supporting = near(supporting);
        let opposing = near(opposing);

        let mut adjustment = 0.0;
        if let Some(zone) = supporting {
            adjustment += 0.1;
            reasons.push(format!(
                "Supporting zone {}..{} ({} qty)",
                zone.price_low, zone.price_high, zone.total_quantity
            ));
        }
        if let Some(zone) = opposing {
            adjustment -= 0.1;
            reasons.push(format!(
                "Opposing zone {}..{} ({} qty)",
                zone.price_low, zone.price_high, zone.total_quantity
            ));
        }

        let signal = if opposing.is_some() && supporting.is_none() {
            reasons.push("Opposing zone near best without support".to_string());
            Signal::Hold
        } else {
            direction
        };

        SignalDecision {
            signal,
            confidence: (base + adjustment).clamp(0.0, 1.0),
            reasons,
        }
    }

    fn target_level(
        &self,
        signal: Signal,
        snapshot: &Snapshot,
        demand_zone: Option<Zone>,
        supply_zone: Option<Zone>,
    ) -> Option<Px> {
        match signal {
            Signal::Buy => supply_zone
                .map(|z| z.near_boundary())
                .or_else(|| strongest_level(&snapshot.asks).map(|l| l.price)),
            Signal::Sell => demand_zone
                .map(|z| z.near_boundary())
                .or_else(|| strongest_level(&snapshot.bids).map(|l| l.price)),
            Signal::Hold => None,
        }
    }

    fn stop_level(
        &self,
        signal: Signal,
        snapshot: &Snapshot,
        demand_zone: Option<Zone>,
        supply_zone: Option<Zone>,
    ) -> Option<Px> {
        let spread = snapshot.spread();
        match signal {
            Signal::Buy => demand_zone.map(|z| z.far_boundary()).or_else(|| {
                let spread = spread?;
                Some(snapshot.best_bid()?.price - spread - spread)
            }),
            Signal::Sell => supply_zone.map(|z| z.far_boundary()).or_else(|| {
                let spread = spread?;
                Some(snapshot.best_ask()?.price + spread + spread)
            }),
            Signal::Hold => None,
        }
    }

    /// Holding period from volatility and relative target distance
    #[must_use]
    pub fn time_horizon(&self, volatility: f64, distance: f64) -> TimeHorizon {
        let cfg = &self.config;
        if volatility <= cfg.scalp_volatility && distance <= cfg.scalp_distance {
            TimeHorizon::Scalp
        } else if volatility >= cfg.swing_volatility || distance >= cfg.swing_distance {
            TimeHorizon::Swing
        } else {
            TimeHorizon::Intraday
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DepthLevel, Side, SideDepth};
    use proptest::prelude::*;

    fn book(bid_qty: &[u32], ask_qty: &[u32]) -> Snapshot {
        let bids: Vec<DepthLevel> = bid_qty
            .iter()
            .enumerate()
            .map(|(i, &q)| {
                #[allow(clippy::cast_precision_loss)]
                let price = 100.0 - 0.05 * i as f64;
                DepthLevel::new(Px::new(price), q, 2)
            })
            .collect();
        let asks: Vec<DepthLevel> = ask_qty
            .iter()
            .enumerate()
            .map(|(i, &q)| {
                #[allow(clippy::cast_precision_loss)]
                let price = 100.05 + 0.05 * i as f64;
                DepthLevel::new(Px::new(price), q, 2)
            })
            .collect();
        Snapshot::new(
            1333,
            ExchangeSegment::NseEq,
            SideDepth::from_levels(Side::Bid, &bids),
            SideDepth::from_levels(Side::Ask, &asks),
            9,
            Ts::from_nanos(1),
        )
    }

    #[test]
    fn test_bid_heavy_book_signals_buy() {
        let snap = book(&[2000; 5], &[800; 5]);
        let result = DepthAnalyzer::default().analyze(&snap, &[]);

        // (10000 - 4000) / 14000
        assert!((result.imbalance - 0.428_571).abs() < 1e-5);
        // bids 0.6 + 0.1, asks 0.24 + 0.1
        assert!((result.liquidity_score - 0.52).abs() < 1e-9);
        assert_eq!(result.signal, Signal::Buy);
        assert!(result.confidence > 0.3);
        assert!((result.confidence - 0.465_143).abs() < 1e-5);
        assert!(result.demand_zone.is_none());
        assert!(result.supply_zone.is_none());
        // Fallbacks: strongest ask (first of equals) and best bid - 2 spreads
        assert_eq!(result.target_level, Some(Px::new(100.05)));
        assert_eq!(result.stop_level, Some(Px::new(99.90)));
        assert_eq!(result.snapshot_sequence, 9);
        assert!(!result.reasons.is_empty());
    }

    #[test]
    fn test_ask_heavy_book_signals_sell() {
        let snap = book(&[800; 5], &[2000; 5]);
        let result = DepthAnalyzer::default().analyze(&snap, &[]);
        assert_eq!(result.signal, Signal::Sell);
        assert_eq!(result.target_level, Some(Px::new(100.0)));
        assert_eq!(result.stop_level, Some(Px::new(100.15)));
    }

    #[test]
    fn test_balanced_book_holds_even_with_zones() {
        let mut bids = [100_u32; 20];
        bids[1] = 5000;
        let snap = book(&bids, &[345; 20]);
        let result = DepthAnalyzer::default().analyze(&snap, &[]);

        assert!(result.demand_zone.is_some());
        assert!(result.imbalance.abs() < 0.3);
        assert_eq!(result.signal, Signal::Hold);
        assert_eq!(result.target_level, None);
        assert_eq!(result.stop_level, None);
    }

    #[test]
    fn test_opposing_zone_downgrades_to_hold() {
        let analyzer = DepthAnalyzer::default();
        let supply = Zone {
            side: Side::Ask,
            start_level: 1,
            end_level: 2,
            price_low: Px::new(100.1),
            price_high: Px::new(100.15),
            total_quantity: 5000,
        };
        let decision = analyzer.decide(0.6, 0.5, None, Some(supply));
        assert_eq!(decision.signal, Signal::Hold);
        assert!((decision.confidence - 0.46).abs() < 1e-9);

        let demand = Zone {
            side: Side::Bid,
            start_level: 0,
            end_level: 0,
            price_low: Px::new(100.0),
            price_high: Px::new(100.0),
            total_quantity: 9000,
        };
        let supported = analyzer.decide(0.6, 0.5, Some(demand), Some(supply));
        assert_eq!(supported.signal, Signal::Buy);

        // A far opposing zone does not count
        let far = Zone {
            start_level: 12,
            end_level: 13,
            ..supply
        };
        assert_eq!(analyzer.decide(0.6, 0.5, None, Some(far)).signal, Signal::Buy);
    }

    #[test]
    fn test_thin_book_holds() {
        let decision = DepthAnalyzer::default().decide(0.9, 0.01, None, None);
        assert_eq!(decision.signal, Signal::Hold);
    }

    #[test]
    fn test_time_horizon_bands() {
        let analyzer = DepthAnalyzer::default();
        assert_eq!(analyzer.time_horizon(0.0001, 0.0005), TimeHorizon::Scalp);
        assert_eq!(analyzer.time_horizon(0.002, 0.002), TimeHorizon::Intraday);
        assert_eq!(analyzer.time_horizon(0.01, 0.0), TimeHorizon::Swing);
        assert_eq!(analyzer.time_horizon(0.0001, 0.01), TimeHorizon::Swing);
    }

    #[test]
    fn test_empty_book_is_hold_with_zeroes() {
        let result = DepthAnalyzer::default().analyze(&book(&[], &[]), &[]);
        assert_eq!(result.signal, Signal::Hold);
        assert!(result.imbalance.abs() < f64::EPSILON);
        assert_eq!(result.optimal_order_size, 0);
        assert!(result.estimated_price_impact.abs() < f64::EPSILON);
        assert_eq!(result.mid, None);
    }

    #[test]
    fn test_signal_serializes_uppercase() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&Signal::Hold)?, "\"HOLD\"");
        assert_eq!(serde_json::to_string(&TimeHorizon::Scalp)?, "\"SCALP\"");
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_confidence_monotone(
            imb_a in 0.0_f64..=1.0,
            imb_b in 0.0_f64..=1.0,
            liq_a in 0.0_f64..=1.0,
            liq_b in 0.0_f64..=1.0,
            negative in any::<bool>(),
        ) {
            let analyzer = DepthAnalyzer::default();
            let (lo_imb, hi_imb) = if imb_a <= imb_b { (imb_a, imb_b) } else { (imb_b, imb_a) };
            let (lo_liq, hi_liq) = if liq_a <= liq_b { (liq_a, liq_b) } else { (liq_b, liq_a) };
            let sign = if negative { -1.0 } else { 1.0 };

            let low = analyzer.decide(sign * lo_imb, lo_liq, None, None);
            let high = analyzer.decide(sign * hi_imb, hi_liq, None, None);
            prop_assert!((0.0..=1.0).contains(&low.confidence));
            prop_assert!(high.confidence >= low.confidence);
        }

        #[test]
        fn prop_small_imbalance_always_holds(imb in -0.299_f64..0.299, liq in 0.0_f64..=1.0) {
            let decision = DepthAnalyzer::default().decide(imb, liq, None, None);
            prop_assert_eq!(decision.signal, Signal::Hold);
        }
    }
}
