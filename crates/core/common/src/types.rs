//! Core scalar types for the depth feed: prices, timestamps, instruments

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Vendor security id of an instrument
pub type InstrumentId = u32;

/// Price type (stored as i64 ticks for determinism, 4 decimal places)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Px(i64); // Internal: price in ticks (1 tick = 0.0001)

impl Px {
    /// Ticks per unit of price
    pub const SCALE: f64 = 10_000.0;

    /// Exclusive bound on prices that convert to ticks and back exactly
    pub const MAX_PRICE: f64 = 1e10;

    /// Checked conversion: `None` unless `value` is finite, non-negative
    /// and below [`Self::MAX_PRICE`]
    #[must_use]
    pub fn try_new(value: f64) -> Option<Self> {
        (value.is_finite() && (0.0..Self::MAX_PRICE).contains(&value)).then(|| Self::new(value))
    }

    /// Create a new Price from f64 (converts to ticks, saturating outside
    /// the `i64` range)
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(value: f64) -> Self {
        Self((value * Self::SCALE).round() as i64)
    }

    /// Get the price as f64
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / Self::SCALE
    }

    /// Get price as i64 ticks
    #[must_use]
    pub const fn as_i64(&self) -> i64 {
        self.0
    }

    /// Create from i64 ticks
    #[must_use]
    pub const fn from_i64(ticks: i64) -> Self {
        Self(ticks)
    }

    /// Check if price is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Absolute tick distance between two prices
    #[must_use]
    pub const fn distance(&self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0).saturating_abs())
    }

    /// Zero price
    pub const ZERO: Self = Self(0);
}

impl std::ops::Add for Px {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl std::ops::Sub for Px {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl fmt::Display for Px {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4}", self.as_f64())
    }
}

/// Timestamp in nanoseconds since UNIX epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ts(pub u64);

impl Ts {
    /// Get current timestamp
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0))
            .as_nanos() as u64;
        Self(nanos)
    }

    /// Create timestamp from nanoseconds
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Get timestamp as nanoseconds
    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.0
    }

    /// Get timestamp as milliseconds
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0 / 1_000_000
    }
}

impl fmt::Display for Ts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

/// Trading side
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Buy side (bid)
    Bid,
    /// Sell side (ask/offer)
    Ask,
}

impl Side {
    /// The other side of the book
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Bid => Self::Ask,
            Self::Ask => Self::Bid,
        }
    }
}

/// Exchange segment as carried on the depth feed
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExchangeSegment {
    /// NSE cash equity
    #[serde(rename = "NSE_EQ")]
    NseEq,
    /// NSE futures and options
    #[serde(rename = "NSE_FNO")]
    NseFno,
    /// NSE currency derivatives
    #[serde(rename = "NSE_CURR")]
    NseCurrency,
    /// BSE cash equity
    #[serde(rename = "BSE_EQ")]
    BseEq,
    /// BSE futures and options
    #[serde(rename = "BSE_FNO")]
    BseFno,
    /// BSE currency derivatives
    #[serde(rename = "BSE_CURR")]
    BseCurrency,
    /// MCX commodities
    #[serde(rename = "MCX_COMM")]
    McxComm,
    /// Indices
    #[serde(rename = "IDX_I")]
    IdxI,
}

/// Segment name or code that does not map to a known segment
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown exchange segment: {0}")]
pub struct UnknownSegment(pub String);

impl ExchangeSegment {
    /// Numeric code used in binary frame headers
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::NseEq => 1,
            Self::NseFno => 2,
            Self::NseCurrency => 3,
            Self::BseEq => 4,
            Self::BseFno => 5,
            Self::BseCurrency => 6,
            Self::McxComm => 7,
            Self::IdxI => 8,
        }
    }

    /// Segment for a binary header code
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::NseEq),
            2 => Some(Self::NseFno),
            3 => Some(Self::NseCurrency),
            4 => Some(Self::BseEq),
            5 => Some(Self::BseFno),
            6 => Some(Self::BseCurrency),
            7 => Some(Self::McxComm),
            8 => Some(Self::IdxI),
            _ => None,
        }
    }

    /// Name used in JSON control messages
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::NseEq => "NSE_EQ",
            Self::NseFno => "NSE_FNO",
            Self::NseCurrency => "NSE_CURR",
            Self::BseEq => "BSE_EQ",
            Self::BseFno => "BSE_FNO",
            Self::BseCurrency => "BSE_CURR",
            Self::McxComm => "MCX_COMM",
            Self::IdxI => "IDX_I",
        }
    }

    /// Only NSE cash and derivatives publish twenty-level depth
    #[must_use]
    pub const fn supports_twenty_depth(self) -> bool {
        matches!(self, Self::NseEq | Self::NseFno)
    }
}

impl fmt::Display for ExchangeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for ExchangeSegment {
    type Err = UnknownSegment;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NSE_EQ" => Ok(Self::NseEq),
            "NSE_FNO" => Ok(Self::NseFno),
            "NSE_CURR" => Ok(Self::NseCurrency),
            "BSE_EQ" => Ok(Self::BseEq),
            "BSE_FNO" => Ok(Self::BseFno),
            "BSE_CURR" => Ok(Self::BseCurrency),
            "MCX_COMM" => Ok(Self::McxComm),
            "IDX_I" => Ok(Self::IdxI),
            _ => Err(UnknownSegment(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_px_serde() -> Result<(), Box<dyn std::error::Error>> {
        let px = Px::new(1234.56);
        let encoded = bincode::serialize(&px)?;
        let decoded: Px = bincode::deserialize(&encoded)?;
        assert_eq!(px, decoded);
        Ok(())
    }

    #[test]
    fn test_px_f64_is_exact_for_ticks() {
        for ticks in [1_i64, 5, 12_345_678, 24_999_950_000, -7] {
            let px = Px::from_i64(ticks);
            assert_eq!(Px::new(px.as_f64()), px);
        }
    }

    #[test]
    fn test_px_arithmetic() {
        let a = Px::new(100.5);
        let b = Px::new(100.0);
        assert_eq!(a - b, Px::new(0.5));
        assert_eq!(b.distance(a), Px::new(0.5));
        assert_eq!(a + b, Px::new(200.5));
    }

    #[test]
    fn test_px_try_new_bounds() {
        assert_eq!(Px::try_new(1402.55), Some(Px::new(1402.55)));
        assert_eq!(Px::try_new(0.0), Some(Px::ZERO));
        assert_eq!(Px::try_new(-0.05), None);
        assert_eq!(Px::try_new(Px::MAX_PRICE), None);
        assert_eq!(Px::try_new(1e300), None);
        assert_eq!(Px::try_new(f64::NAN), None);

        assert_eq!(Px::try_new(2e10), None);

        // Every tick below the bound survives f64 and back
        for ticks in [99_999_999_999_999_i64, 99_999_999_999_998, 12_345_678_901_234] {
            let px = Px::from_i64(ticks);
            assert_eq!(Px::try_new(px.as_f64()), Some(px));
        }
    }

    #[test]
    fn test_px_arithmetic_saturates() {
        let hi = Px::from_i64(i64::MAX);
        let lo = Px::from_i64(i64::MIN);
        assert_eq!(hi + Px::from_i64(1), hi);
        assert_eq!(lo - Px::from_i64(1), lo);
        assert_eq!(lo.distance(hi), hi);
        assert_eq!(hi.distance(lo), hi);
    }

    #[test]
    fn test_ts_conversions() {
        let ts = Ts::from_nanos(1_234_567_890);
        assert_eq!(ts.as_nanos(), 1_234_567_890);
        assert_eq!(ts.as_millis(), 1_234);
    }

    #[test]
    fn test_segment_codes_round_trip() {
        for code in 1..=8 {
            let segment = ExchangeSegment::from_code(code);
            assert_eq!(segment.map(ExchangeSegment::code), Some(code));
        }
        assert_eq!(ExchangeSegment::from_code(0), None);
        assert_eq!(ExchangeSegment::from_code(9), None);
    }

    #[test]
    fn test_segment_names() -> Result<(), UnknownSegment> {
        assert_eq!("nse_fno".parse::<ExchangeSegment>()?, ExchangeSegment::NseFno);
        assert_eq!(ExchangeSegment::NseEq.to_string(), "NSE_EQ");
        assert!("NYSE".parse::<ExchangeSegment>().is_err());
        Ok(())
    }

    #[test]
    fn test_twenty_depth_segments() {
        assert!(ExchangeSegment::NseEq.supports_twenty_depth());
        assert!(ExchangeSegment::NseFno.supports_twenty_depth());
        assert!(!ExchangeSegment::BseEq.supports_twenty_depth());
        assert!(!ExchangeSegment::IdxI.supports_twenty_depth());
    }

    #[test]
    fn test_segment_json_name() -> Result<(), serde_json::Error> {
        let json = serde_json::to_string(&ExchangeSegment::NseFno)?;
        assert_eq!(json, "\"NSE_FNO\"");
        Ok(())
    }
}
