// =============================================================================
// Error kinds surfaced by the synchronization core
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// Errors produced by adapters, the loader, the live channel and the
/// indicator registry.
///
/// Values are `Clone` so a failure can be stored in session state
/// (`LoadState::Failed`, `ConnectionState::last_error`) and also handed back to
/// the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SyncError {
    #[error("symbol '{symbol}' is not supported by {provider}")]
    UnsupportedSymbol { provider: String, symbol: String },

    #[error("timeframe '{timeframe}' is not supported by {provider}")]
    UnsupportedTimeframe { provider: String, timeframe: String },

    #[error("request timed out after {secs}s")]
    FetchTimeout { secs: u64 },

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("failed to decode live frame: {0}")]
    DecodeFailure(String),

    #[error("invalid indicator: {0}")]
    InvalidIndicator(String),

    #[error("load superseded by a newer chart request")]
    Superseded,
}

impl SyncError {
    /// Whether the error was raised before any network activity (bad input).
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedSymbol { .. } | Self::UnsupportedTimeframe { .. } | Self::InvalidIndicator(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::TransportError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::TransportError(err.to_string())
    }
}
