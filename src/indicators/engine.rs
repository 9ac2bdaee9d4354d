// =============================================================================
// Indicator Engine: per-session registry of moving-average lines
// =============================================================================
//
// Each registered config owns one line.  Lines are rebuilt in full when the
// candle series is replaced and extended in place after a live merge.  The
// incremental path reuses the window helpers from `moving_average`, so its
// output is bit-identical to a full recompute.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use super::moving_average::{self, ema_step, smoothing, window_mean, MovingAverageConfig, MovingAverageKind};
use crate::error::SyncError;
use crate::market_data::{CandleSeries, MergeOutcome};
use crate::types::{Candle, LinePoint};

/// A config together with its computed line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorLine {
    config: MovingAverageConfig,
    points: Vec<LinePoint>,
}

impl IndicatorLine {
    pub fn config(&self) -> &MovingAverageConfig {
        &self.config
    }

    pub fn points(&self) -> &[LinePoint] {
        &self.points
    }

    pub fn last_value(&self) -> Option<f64> {
        self.points.last().map(|p| p.value)
    }

    fn period(&self) -> usize {
        self.config.period as usize
    }

    fn recompute(&mut self, candles: &[Candle]) {
        self.points = moving_average::compute(self.config.kind, candles, self.period());
    }

    /// Points the line should hold for a series of `n` candles.
    fn expected_len(&self, n: usize) -> usize {
        (n + 1).saturating_sub(self.period())
    }

    fn extend_appended(&mut self, candles: &[Candle]) {
        let n = candles.len();
        let p = self.period();
        if n < p {
            self.points.clear();
            return;
        }
        if self.points.len() + 1 != self.expected_len(n) {
            self.recompute(candles);
            return;
        }
        let last = &candles[n - 1];
        let value = match (self.config.kind, self.points.last()) {
            (MovingAverageKind::Ema, Some(prev)) => ema_step(prev.value, last.close, smoothing(p)),
            // First point of either kind is the plain window mean.
            _ => window_mean(candles, n - 1, p),
        };
        self.points.push(LinePoint { time: last.time, value });
    }

    fn refresh_last(&mut self, candles: &[Candle]) {
        let n = candles.len();
        let p = self.period();
        if n < p {
            self.points.clear();
            return;
        }
        if self.points.len() != self.expected_len(n) {
            self.recompute(candles);
            return;
        }
        let last = &candles[n - 1];
        let len = self.points.len();
        let value = match self.config.kind {
            MovingAverageKind::Ema if len >= 2 => ema_step(self.points[len - 2].value, last.close, smoothing(p)),
            _ => window_mean(candles, n - 1, p),
        };
        self.points[len - 1] = LinePoint { time: last.time, value };
    }
}

/// Partial change to an existing config; `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MovingAverageUpdate {
    pub kind: Option<MovingAverageKind>,
    pub period: Option<u32>,
    pub visible: Option<bool>,
    pub color: Option<String>,
}

// ---------------------------------------------------------------------------
// IndicatorEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct IndicatorEngine {
    lines: Vec<IndicatorLine>,
}

impl IndicatorEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every config in order, stopping at the first invalid one.
    pub fn with_configs(configs: &[MovingAverageConfig], series: &CandleSeries) -> Result<Self, SyncError> {
        let mut engine = Self::new();
        for config in configs {
            engine.add(config.clone(), series)?;
        }
        Ok(engine)
    }

    fn validate(&self, config: &MovingAverageConfig) -> Result<(), SyncError> {
        if config.id.trim().is_empty() {
            return Err(SyncError::InvalidIndicator("id must not be empty".into()));
        }
        if config.period == 0 {
            return Err(SyncError::InvalidIndicator(format!("{}: period must be at least 1", config.id)));
        }
        if self.position(&config.id).is_some() {
            return Err(SyncError::InvalidIndicator(format!("duplicate id '{}'", config.id)));
        }
        Ok(())
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.lines.iter().position(|l| l.config.id == id)
    }

    fn unknown(id: &str) -> SyncError {
        SyncError::InvalidIndicator(format!("no indicator with id '{id}'"))
    }

    /// Register a new moving average and compute it over `series`.
    pub fn add(&mut self, config: MovingAverageConfig, series: &CandleSeries) -> Result<(), SyncError> {
        self.validate(&config)?;
        let mut line = IndicatorLine {
            config,
            points: Vec::new(),
        };
        line.recompute(series.candles());
        debug!(id = %line.config.id, kind = %line.config.kind, period = line.config.period, points = line.points.len(), "indicator added");
        self.lines.push(line);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<MovingAverageConfig, SyncError> {
        let idx = self.position(id).ok_or_else(|| Self::unknown(id))?;
        let line = self.lines.remove(idx);
        debug!(id, "indicator removed");
        Ok(line.config)
    }

    /// Apply a partial update.  Only a change of `kind` or `period` triggers a
    /// recompute, and only of this line.
    pub fn update(&mut self, id: &str, update: MovingAverageUpdate, series: &CandleSeries) -> Result<(), SyncError> {
        if update.period == Some(0) {
            return Err(SyncError::InvalidIndicator(format!("{id}: period must be at least 1")));
        }
        let idx = self.position(id).ok_or_else(|| Self::unknown(id))?;
        let line = &mut self.lines[idx];

        let mut structural = false;
        if let Some(kind) = update.kind.filter(|k| *k != line.config.kind) {
            line.config.kind = kind;
            structural = true;
        }
        if let Some(period) = update.period.filter(|p| *p != line.config.period) {
            line.config.period = period;
            structural = true;
        }
        if let Some(visible) = update.visible {
            line.config.visible = visible;
        }
        if let Some(color) = update.color {
            line.config.color = color;
        }

        if structural {
            line.recompute(series.candles());
            debug!(id, kind = %line.config.kind, period = line.config.period, "indicator recomputed after update");
        }
        Ok(())
    }

    /// Full rebuild of every line (after a seed).
    pub fn recompute_all(&mut self, series: &CandleSeries) {
        for line in &mut self.lines {
            line.recompute(series.candles());
        }
    }

    /// Bring every line in step with `series` after one merge.
    pub fn apply_merge(&mut self, series: &CandleSeries, outcome: MergeOutcome) {
        let candles = series.candles();
        match outcome {
            MergeOutcome::Appended => self.lines.iter_mut().for_each(|l| l.extend_appended(candles)),
            MergeOutcome::ReplacedLast => self.lines.iter_mut().for_each(|l| l.refresh_last(candles)),
            MergeOutcome::DiscardedStale => {}
        }
    }

    pub fn line(&self, id: &str) -> Option<&IndicatorLine> {
        self.lines.iter().find(|l| l.config.id == id)
    }

    pub fn visible_lines(&self) -> impl Iterator<Item = &IndicatorLine> {
        self.lines.iter().filter(|l| l.config.visible)
    }

    pub fn configs(&self) -> Vec<MovingAverageConfig> {
        self.lines.iter().map(|l| l.config.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
