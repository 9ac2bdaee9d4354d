// =============================================================================
// Shared types used across the candle synchronization core
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// A single OHLCV candle, normalized across providers.
///
/// `time` is the bucket start in UTC seconds. Within one series it is strictly
/// increasing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

impl Candle {
    pub fn new(time: i64, open: f64, high: f64, low: f64, close: f64, volume: Option<f64>) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// True when every price field is a finite number.
    pub fn is_finite(&self) -> bool {
        self.open.is_finite() && self.high.is_finite() && self.low.is_finite() && self.close.is_finite()
    }
}

/// One point of a derived line series (moving average output).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinePoint {
    pub time: i64,
    pub value: f64,
}

// =============================================================================
// Timeframe
// =============================================================================

/// Candle bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 15] = [
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
        Self::Mo1,
    ];

    /// Canonical short label (`"1m"`, `"4h"`, `"1M"`...). This is also the
    /// Binance / BingX interval vocabulary.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    /// Nominal bucket width in seconds. Months are approximated as 30 days.
    pub fn seconds(&self) -> i64 {
        const MIN: i64 = 60;
        const HOUR: i64 = 60 * MIN;
        const DAY: i64 = 24 * HOUR;
        match self {
            Self::M1 => MIN,
            Self::M3 => 3 * MIN,
            Self::M5 => 5 * MIN,
            Self::M15 => 15 * MIN,
            Self::M30 => 30 * MIN,
            Self::H1 => HOUR,
            Self::H2 => 2 * HOUR,
            Self::H4 => 4 * HOUR,
            Self::H6 => 6 * HOUR,
            Self::H8 => 8 * HOUR,
            Self::H12 => 12 * HOUR,
            Self::D1 => DAY,
            Self::D3 => 3 * DAY,
            Self::W1 => 7 * DAY,
            Self::Mo1 => 30 * DAY,
        }
    }

    /// Floor `ts` (UTC seconds) to the start of its bucket.
    ///
    /// Weekly and monthly buckets are calendar-anchored by each provider, so the
    /// provider's own open time is kept unchanged for those.
    pub fn align(&self, ts: i64) -> i64 {
        match self {
            Self::W1 | Self::Mo1 => ts,
            _ => ts - ts.rem_euclid(self.seconds()),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = SyncError;

    /// Case-sensitive only where it matters: `"1M"` is a month, `"1m"` a minute.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(tf) = Self::ALL.iter().find(|tf| tf.as_str() == trimmed) {
            return Ok(*tf);
        }
        // Accept upper-case spellings of the unambiguous labels ("1H", "4H", "1D", "1W").
        let lower = trimmed.to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|tf| **tf != Self::Mo1 && !tf.as_str().ends_with('m') && tf.as_str() == lower)
            .copied()
            .ok_or_else(|| SyncError::UnsupportedTimeframe {
                provider: "any".to_string(),
                timeframe: trimmed.to_string(),
            })
    }
}

// =============================================================================
// Provider identity
// =============================================================================

/// Discriminant of the supported market-data providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Binance,
    BingX,
    Fmp,
    AlphaVantage,
    Oanda,
}

impl ProviderId {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::BingX => "bingx",
            Self::Fmp => "fmp",
            Self::AlphaVantage => "alphavantage",
            Self::Oanda => "oanda",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "bingx" => Ok(Self::BingX),
            "fmp" => Ok(Self::Fmp),
            "alphavantage" | "alpha_vantage" => Ok(Self::AlphaVantage),
            "oanda" => Ok(Self::Oanda),
            other => anyhow::bail!("unknown provider: {other}"),
        }
    }
}
