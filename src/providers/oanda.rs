// =============================================================================
// OANDA v20 adapter (forex; REST only)
// =============================================================================

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::{candle_from_fields, parse_timestamp, unsupported_symbol, ChannelDescriptor, RequestDescriptor};
use crate::error::SyncError;
use crate::types::{Candle, ProviderId, Timeframe};

pub const DEFAULT_REST_URL: &str = "https://api-fxpractice.oanda.com";

/// Hard upper bound on `count` accepted by the candles endpoint.
const MAX_COUNT: u32 = 5000;
const POLL_COUNT: u32 = 2;

pub fn granularity(timeframe: Timeframe) -> Option<&'static str> {
    match timeframe {
        Timeframe::M1 => Some("M1"),
        Timeframe::M5 => Some("M5"),
        Timeframe::M15 => Some("M15"),
        Timeframe::M30 => Some("M30"),
        Timeframe::H1 => Some("H1"),
        Timeframe::H2 => Some("H2"),
        Timeframe::H4 => Some("H4"),
        Timeframe::H6 => Some("H6"),
        Timeframe::H8 => Some("H8"),
        Timeframe::H12 => Some("H12"),
        Timeframe::D1 => Some("D"),
        Timeframe::W1 => Some("W"),
        Timeframe::Mo1 => Some("M"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct OandaAdapter {
    rest_url: String,
    poll_every: Duration,
}

impl OandaAdapter {
    pub fn new(rest_url: &str, poll_every: Duration) -> Self {
        Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            poll_every,
        }
    }

    /// Instruments are `BASE_QUOTE`: `EUR/USD`, `eur-usd`, `EURUSD` and
    /// `EUR_USD` all map to `EUR_USD`.  A compact input is only accepted when
    /// it is exactly six letters.
    pub fn format_symbol(&self, raw: &str) -> Result<String, SyncError> {
        let parts: Vec<String> = raw
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|p| !p.is_empty())
            .map(|p| p.to_ascii_uppercase())
            .collect();

        match parts.as_slice() {
            [base, quote] => Ok(format!("{base}_{quote}")),
            [pair] if pair.len() == 6 && pair.chars().all(|c| c.is_ascii_alphabetic()) => {
                Ok(format!("{}_{}", &pair[..3], &pair[3..]))
            }
            _ => Err(unsupported_symbol(ProviderId::Oanda, raw)),
        }
    }

    pub fn historical_endpoint(&self, symbol: &str, timeframe: Timeframe, limit: u32) -> RequestDescriptor {
        RequestDescriptor::get(format!(
            "{}/v3/instruments/{}/candles?granularity={}&count={}&price=M",
            self.rest_url,
            symbol,
            granularity(timeframe).unwrap_or("D"),
            limit.clamp(1, MAX_COUNT)
        ))
    }

    pub fn live_channel(&self, symbol: &str, timeframe: Timeframe) -> ChannelDescriptor {
        ChannelDescriptor::Poll {
            request: self.historical_endpoint(symbol, timeframe, POLL_COUNT),
            every: self.poll_every,
        }
    }

    /// `{"candles":[{"time":"RFC3339","mid":{"o":"..","h":"..","l":"..","c":".."},"volume":n}]}`
    pub fn parse_rows(&self, body: &str, timeframe: Timeframe) -> Result<Vec<Candle>, SyncError> {
        let root: Value = serde_json::from_str(body)
            .map_err(|e| SyncError::MalformedResponse(format!("oanda body is not JSON: {e}")))?;
        if let Some(msg) = error_envelope(&root) {
            return Err(SyncError::MalformedResponse(format!("oanda: {msg}")));
        }
        let rows = root["candles"]
            .as_array()
            .ok_or_else(|| SyncError::MalformedResponse("oanda response has no candles array".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(time) = row["time"].as_str().and_then(parse_timestamp) else {
                warn!(row = %row, "oanda candle without a usable time");
                continue;
            };
            let mid = &row["mid"];
            match candle_from_fields(time, timeframe, &mid["o"], &mid["h"], &mid["l"], &mid["c"], &row["volume"]) {
                Some(c) => candles.push(c),
                None => warn!(row = %row, "skipping oanda candle with bad prices"),
            }
        }
        Ok(candles)
    }
}

pub(crate) fn error_envelope(root: &Value) -> Option<String> {
    root["errorMessage"].as_str().map(str::to_string)
}
