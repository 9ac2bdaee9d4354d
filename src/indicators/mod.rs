// =============================================================================
// Indicators Module
// =============================================================================
//
// Moving averages derived from the merged candle series.  The math lives in
// `moving_average` as pure functions; `engine` keeps one line per configured
// average and keeps it in step with live merges.

pub mod engine;
pub mod moving_average;

pub use engine::{IndicatorEngine, IndicatorLine, MovingAverageUpdate};
pub use moving_average::{MovingAverageConfig, MovingAverageKind};
