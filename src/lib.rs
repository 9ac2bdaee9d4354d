// =============================================================================
// candle-sync: data synchronization core for live price charts
// =============================================================================
//
// Fetches historical candles from one of several market-data providers,
// attaches to the provider's live feed, merges ticks into an ordered series
// and keeps moving-average lines in step with it.

pub mod error;
pub mod indicators;
pub mod market_data;
pub mod providers;
pub mod runtime_config;
pub mod session;
pub mod types;

pub use error::SyncError;
pub use session::{ChartService, ChartSnapshot, LoadState, LoadTicket};
pub use types::{Candle, LinePoint, ProviderId, Timeframe};
