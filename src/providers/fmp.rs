// =============================================================================
// Financial Modeling Prep adapter (stocks, crypto, forex; REST only)
// =============================================================================

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::{candle_from_fields, compact_symbol, parse_timestamp, unsupported_symbol, ChannelDescriptor, RequestDescriptor};
use crate::error::SyncError;
use crate::types::{Candle, ProviderId, Timeframe};

pub const DEFAULT_REST_URL: &str = "https://financialmodelingprep.com/api/v3";

/// Rows requested per poll; only the newest bucket matters.
const POLL_LIMIT: u32 = 2;

/// FMP chart interval for a timeframe, if it has one.
pub fn interval(timeframe: Timeframe) -> Option<&'static str> {
    match timeframe {
        Timeframe::M1 => Some("1min"),
        Timeframe::M5 => Some("5min"),
        Timeframe::M15 => Some("15min"),
        Timeframe::M30 => Some("30min"),
        Timeframe::H1 => Some("1hour"),
        Timeframe::H4 => Some("4hour"),
        Timeframe::D1 => Some("daily"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct FmpAdapter {
    rest_url: String,
    poll_every: Duration,
}

impl FmpAdapter {
    pub fn new(rest_url: &str, poll_every: Duration) -> Self {
        Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            poll_every,
        }
    }

    pub fn format_symbol(&self, raw: &str) -> Result<String, SyncError> {
        let symbol = compact_symbol(raw);
        if symbol.is_empty() {
            return Err(unsupported_symbol(ProviderId::Fmp, raw));
        }
        Ok(symbol)
    }

    /// Daily history lives under a different path than intraday charts.
    /// Callers have already checked the timeframe; an unmapped one falls
    /// back to daily.
    pub fn historical_endpoint(&self, symbol: &str, timeframe: Timeframe, limit: u32) -> RequestDescriptor {
        match interval(timeframe) {
            Some("daily") | None => RequestDescriptor::get(format!(
                "{}/historical-price-full/{}?timeseries={}",
                self.rest_url, symbol, limit
            )),
            Some(iv) => RequestDescriptor::get(format!(
                "{}/historical-chart/{}/{}?limit={}",
                self.rest_url, iv, symbol, limit
            )),
        }
    }

    pub fn live_channel(&self, symbol: &str, timeframe: Timeframe) -> ChannelDescriptor {
        ChannelDescriptor::Poll {
            request: self.historical_endpoint(symbol, timeframe, POLL_LIMIT),
            every: self.poll_every,
        }
    }

    /// Rows are newest-first objects with a `date` string.  Intraday charts are
    /// a bare array; daily history nests them under `historical`.
    pub fn parse_rows(&self, body: &str, timeframe: Timeframe) -> Result<Vec<Candle>, SyncError> {
        let root: Value = serde_json::from_str(body)
            .map_err(|e| SyncError::MalformedResponse(format!("fmp body is not JSON: {e}")))?;

        if let Some(msg) = error_envelope(&root) {
            return Err(SyncError::MalformedResponse(format!("fmp: {msg}")));
        }
        let rows = root
            .as_array()
            .or_else(|| root["historical"].as_array())
            .ok_or_else(|| SyncError::MalformedResponse("fmp response has no price rows".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(time) = row["date"].as_str().and_then(parse_timestamp) else {
                warn!(row = %row, "fmp row without a usable date");
                continue;
            };
            match candle_from_fields(time, timeframe, &row["open"], &row["high"], &row["low"], &row["close"], &row["volume"]) {
                Some(c) => candles.push(c),
                None => warn!(row = %row, "skipping fmp row with bad prices"),
            }
        }
        Ok(candles)
    }
}

pub(crate) fn error_envelope(root: &Value) -> Option<String> {
    root["Error Message"].as_str().map(str::to_string)
}
