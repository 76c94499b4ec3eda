//! Depth state and microstructure analysis for twenty-level books
//!
//! [`DepthStore`] keeps the latest snapshot and a bounded history per
//! subscribed instrument; [`DepthAnalyzer`] derives imbalance, liquidity,
//! impact, volatility, zones and a directional signal from them.

#![deny(clippy::all)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod analytics;
pub mod analyzer;
pub mod cache;
pub mod error;
pub mod history;
pub mod store;
pub mod zones;

pub use analytics::{DepthSummary, ImpactEstimate, ImpactPoint, LiquidityDistribution};
pub use analyzer::{AnalysisResult, AnalyzerConfig, DepthAnalyzer, Signal, SignalDecision, TimeHorizon};
pub use cache::AnalysisCache;
pub use error::DepthError;
pub use history::{HISTORY_CAPACITY, History};
pub use store::{DepthStore, Registration, StoreConfig};
pub use zones::{Zone, detect_zone};
