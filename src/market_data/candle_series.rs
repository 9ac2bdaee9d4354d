use serde::{Deserialize, Serialize};

use crate::types::Candle;

// ---------------------------------------------------------------------------
// Seed result
// ---------------------------------------------------------------------------

/// Normalized output of one historical fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedHistory {
    pub candles: Vec<Candle>,
    /// Fewer than two candles came back; indicators stay empty.
    pub thin: bool,
}

impl LoadedHistory {
    /// Deduplicate by time (last occurrence wins) and sort ascending.
    pub fn from_raw(raw: Vec<Candle>) -> Self {
        let candles = normalize_history(raw);
        let thin = candles.len() < 2;
        Self { candles, thin }
    }
}

/// Deduplicate by `time`, keeping the **last** occurrence, then sort ascending.
pub fn normalize_history(raw: Vec<Candle>) -> Vec<Candle> {
    let mut indexed: Vec<(usize, Candle)> = raw.into_iter().enumerate().collect();
    // Stable on time, later input index last, so the final entry of each run
    // is the one to keep.
    indexed.sort_by(|(ia, a), (ib, b)| a.time.cmp(&b.time).then(ia.cmp(ib)));

    let mut out: Vec<Candle> = Vec::with_capacity(indexed.len());
    for (_, candle) in indexed {
        match out.last_mut() {
            Some(last) if last.time == candle.time => *last = candle,
            _ => out.push(candle),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// What a single `merge` call did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    Appended,
    ReplacedLast,
    DiscardedStale,
}

impl std::fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Appended => write!(f, "appended"),
            Self::ReplacedLast => write!(f, "replaced_last"),
            Self::DiscardedStale => write!(f, "discarded_stale"),
        }
    }
}

// ---------------------------------------------------------------------------
// CandleSeries
// ---------------------------------------------------------------------------

/// Ordered candle series owned by one chart session.
///
/// Seeded once through [`CandleSeries::from_history`]; afterwards the only way
/// to change it is [`CandleSeries::merge`], which keeps `time` strictly
/// increasing.
#[derive(Debug, Clone, Default)]
pub struct CandleSeries {
    candles: Vec<Candle>,
    thin: bool,
}

impl CandleSeries {
    pub fn from_history(history: LoadedHistory) -> Self {
        Self {
            candles: history.candles,
            thin: history.thin,
        }
    }

    /// Fold one live candle into the series.
    ///
    /// * same time as the last candle: the last candle is replaced
    ///   (in-progress bucket update)
    /// * newer time, or empty series: appended
    /// * older time: dropped, series untouched
    pub fn merge(&mut self, incoming: Candle) -> MergeOutcome {
        match self.candles.last_mut() {
            None => {
                self.candles.push(incoming);
                MergeOutcome::Appended
            }
            Some(last) if incoming.time == last.time => {
                *last = incoming;
                MergeOutcome::ReplacedLast
            }
            Some(last) if incoming.time > last.time => {
                self.candles.push(incoming);
                MergeOutcome::Appended
            }
            Some(_) => MergeOutcome::DiscardedStale,
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Seeded from fewer than two candles.
    pub fn is_thin(&self) -> bool {
        self.thin
    }

    /// Close prices, oldest first.
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
