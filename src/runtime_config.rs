// =============================================================================
// Runtime Configuration: synchronization settings
// =============================================================================
//
// Everything tunable about fetching, streaming and indicator defaults lives
// here and is handed to `ChartService::new` explicitly.  All fields carry a
// serde default so a partial (or empty) JSON file is always loadable.
//
// Credentials never appear here: when a provider needs a key, the proxy at
// `proxy_url` injects it.
//
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::indicators::{MovingAverageConfig, MovingAverageKind};
use crate::market_data::BackoffPolicy;
use crate::providers::{alpha_vantage, binance, bingx, fmp, oanda};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_history_limit() -> u32 {
    500
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_pending_tick_capacity() -> usize {
    1_024
}

fn default_moving_averages() -> Vec<MovingAverageConfig> {
    vec![
        MovingAverageConfig::new("ema12", MovingAverageKind::Ema, 12, "#34D399"),
        MovingAverageConfig::new("ema20", MovingAverageKind::Ema, 20, "#F472B6"),
        MovingAverageConfig::new("sma50", MovingAverageKind::Sma, 50, "#CBD5E1"),
        MovingAverageConfig::new("sma200", MovingAverageKind::Sma, 200, "#FF0000"),
    ]
}

fn default_binance_rest() -> String {
    binance::DEFAULT_REST_URL.to_string()
}

fn default_binance_ws() -> String {
    binance::DEFAULT_WS_URL.to_string()
}

fn default_bingx_rest() -> String {
    bingx::DEFAULT_REST_URL.to_string()
}

fn default_bingx_ws() -> String {
    bingx::DEFAULT_WS_URL.to_string()
}

fn default_fmp_rest() -> String {
    fmp::DEFAULT_REST_URL.to_string()
}

fn default_alphavantage_rest() -> String {
    alpha_vantage::DEFAULT_REST_URL.to_string()
}

fn default_oanda_rest() -> String {
    oanda::DEFAULT_REST_URL.to_string()
}

// =============================================================================
// ProviderEndpoints
// =============================================================================

/// Base URLs per provider.  Overridable for testnets, practice accounts and
/// local fakes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoints {
    #[serde(default = "default_binance_rest")]
    pub binance_rest: String,
    #[serde(default = "default_binance_ws")]
    pub binance_ws: String,
    #[serde(default = "default_bingx_rest")]
    pub bingx_rest: String,
    #[serde(default = "default_bingx_ws")]
    pub bingx_ws: String,
    #[serde(default = "default_fmp_rest")]
    pub fmp_rest: String,
    #[serde(default = "default_alphavantage_rest")]
    pub alphavantage_rest: String,
    #[serde(default = "default_oanda_rest")]
    pub oanda_rest: String,
}

impl Default for ProviderEndpoints {
    fn default() -> Self {
        Self {
            binance_rest: default_binance_rest(),
            binance_ws: default_binance_ws(),
            bingx_rest: default_bingx_rest(),
            bingx_ws: default_bingx_ws(),
            fmp_rest: default_fmp_rest(),
            alphavantage_rest: default_alphavantage_rest(),
            oanda_rest: default_oanda_rest(),
        }
    }
}

// =============================================================================
// SyncConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    // --- Network ------------------------------------------------------------

    /// Forwarding proxy; requests become `GET {proxy_url}?url=<target>`.
    #[serde(default)]
    pub proxy_url: Option<String>,

    /// Candles requested for the initial seed.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    // --- Live channel -------------------------------------------------------

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Consecutive failed attempts before the channel gives up.  Unlimited
    /// when absent.
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Re-fetch period for providers without a push feed.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Live ticks held while the seed is still loading (newest kept).
    #[serde(default = "default_pending_tick_capacity")]
    pub pending_tick_capacity: usize,

    // --- Indicators ---------------------------------------------------------

    /// Moving averages installed on every new session.
    #[serde(default = "default_moving_averages")]
    pub moving_averages: Vec<MovingAverageConfig>,

    // --- Providers ----------------------------------------------------------

    #[serde(default)]
    pub provider_overrides: ProviderEndpoints,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            history_limit: default_history_limit(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_retries: None,
            poll_interval_secs: default_poll_interval_secs(),
            pending_tick_capacity: default_pending_tick_capacity(),
            moving_averages: default_moving_averages(),
            provider_overrides: ProviderEndpoints::default(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sync config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse sync config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid sync config in {}", path.display()))?;

        info!(
            path = %path.display(),
            proxy = config.proxy_url.is_some(),
            history_limit = config.history_limit,
            moving_averages = config.moving_averages.len(),
            "sync config loaded"
        );

        Ok(config)
    }

    /// Reject values that would make the loader or the backoff loop misbehave.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.history_limit > 0, "history_limit must be at least 1");
        anyhow::ensure!(self.fetch_timeout_secs > 0, "fetch_timeout_secs must be positive");
        anyhow::ensure!(self.connect_timeout_secs > 0, "connect_timeout_secs must be positive");
        anyhow::ensure!(self.poll_interval_secs > 0, "poll_interval_secs must be positive");
        anyhow::ensure!(self.backoff_base_ms > 0, "backoff_base_ms must be positive");
        anyhow::ensure!(
            self.backoff_cap_ms >= self.backoff_base_ms,
            "backoff_cap_ms ({}) is below backoff_base_ms ({})",
            self.backoff_cap_ms,
            self.backoff_base_ms
        );
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff_base_ms),
            cap: Duration::from_millis(self.backoff_cap_ms),
            max_retries: self.max_retries,
        }
    }
}
