// =============================================================================
// Simple and Exponential Moving Averages over a candle series
// =============================================================================
//
// SMA_i = mean(close[i-p+1 ..= i])
//
// EMA is seeded with the SMA of the first `p` closes, then
//   k     = 2 / (p + 1)
//   EMA_i = (close_i - EMA_{i-1}) * k + EMA_{i-1}
//
// Both produce `max(0, n - p + 1)` points, the first one stamped with the
// time of candle `p - 1`.  The per-window helpers below are shared with the
// incremental path in `engine.rs` so both give bit-identical results.
// =============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Candle, LinePoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MovingAverageKind {
    #[serde(rename = "SMA", alias = "MA", alias = "sma")]
    Sma,
    #[serde(rename = "EMA", alias = "ema")]
    Ema,
}

impl fmt::Display for MovingAverageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sma => write!(f, "SMA"),
            Self::Ema => write!(f, "EMA"),
        }
    }
}

/// One configured moving average.  `color` is an opaque display hint passed
/// through to the renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovingAverageConfig {
    pub id: String,
    pub kind: MovingAverageKind,
    pub period: u32,
    #[serde(default = "default_visible")]
    pub visible: bool,
    #[serde(default)]
    pub color: String,
}

fn default_visible() -> bool {
    true
}

impl MovingAverageConfig {
    pub fn new(id: impl Into<String>, kind: MovingAverageKind, period: u32, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            period,
            visible: true,
            color: color.into(),
        }
    }
}

/// Full computation of `kind` with look-back `period`.
pub fn compute(kind: MovingAverageKind, candles: &[Candle], period: usize) -> Vec<LinePoint> {
    match kind {
        MovingAverageKind::Sma => sma(candles, period),
        MovingAverageKind::Ema => ema(candles, period),
    }
}

/// Returns an empty `Vec` when `period == 0` or the series is shorter than
/// `period`.
pub fn sma(candles: &[Candle], period: usize) -> Vec<LinePoint> {
    if period == 0 || candles.len() < period {
        return Vec::new();
    }
    (period - 1..candles.len())
        .map(|i| LinePoint {
            time: candles[i].time,
            value: window_mean(candles, i, period),
        })
        .collect()
}

pub fn ema(candles: &[Candle], period: usize) -> Vec<LinePoint> {
    if period == 0 || candles.len() < period {
        return Vec::new();
    }
    let k = smoothing(period);

    let mut result = Vec::with_capacity(candles.len() - period + 1);
    let mut prev = window_mean(candles, period - 1, period);
    result.push(LinePoint {
        time: candles[period - 1].time,
        value: prev,
    });
    for candle in &candles[period..] {
        prev = ema_step(prev, candle.close, k);
        result.push(LinePoint {
            time: candle.time,
            value: prev,
        });
    }
    result
}

/// Mean close of the `period` candles ending at index `end` (inclusive).
pub(crate) fn window_mean(candles: &[Candle], end: usize, period: usize) -> f64 {
    let start = end + 1 - period;
    candles[start..=end].iter().map(|c| c.close).sum::<f64>() / period as f64
}

pub(crate) fn smoothing(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

pub(crate) fn ema_step(prev: f64, close: f64, k: f64) -> f64 {
    (close - prev) * k + prev
}
