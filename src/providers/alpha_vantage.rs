// =============================================================================
// Alpha Vantage adapter (equities; REST only)
// =============================================================================

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::{candle_from_fields, compact_symbol, parse_timestamp, unsupported_symbol, ChannelDescriptor, RequestDescriptor};
use crate::error::SyncError;
use crate::types::{Candle, ProviderId, Timeframe};

pub const DEFAULT_REST_URL: &str = "https://www.alphavantage.co";

/// Above this many rows the `full` output size is needed.
const COMPACT_ROWS: u32 = 100;

pub fn interval(timeframe: Timeframe) -> Option<&'static str> {
    match timeframe {
        Timeframe::M1 => Some("1min"),
        Timeframe::M5 => Some("5min"),
        Timeframe::M15 => Some("15min"),
        Timeframe::M30 => Some("30min"),
        Timeframe::H1 => Some("60min"),
        Timeframe::D1 => Some("daily"),
        Timeframe::W1 => Some("weekly"),
        Timeframe::Mo1 => Some("monthly"),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct AlphaVantageAdapter {
    rest_url: String,
    poll_every: Duration,
}

impl AlphaVantageAdapter {
    pub fn new(rest_url: &str, poll_every: Duration) -> Self {
        Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            poll_every,
        }
    }

    pub fn format_symbol(&self, raw: &str) -> Result<String, SyncError> {
        let symbol = compact_symbol(raw);
        if symbol.is_empty() {
            return Err(unsupported_symbol(ProviderId::AlphaVantage, raw));
        }
        Ok(symbol)
    }

    pub fn historical_endpoint(&self, symbol: &str, timeframe: Timeframe, limit: u32) -> RequestDescriptor {
        let outputsize = if limit > COMPACT_ROWS { "full" } else { "compact" };
        let url = match interval(timeframe).unwrap_or("daily") {
            iv @ ("daily" | "weekly" | "monthly") => format!(
                "{}/query?function=TIME_SERIES_{}&symbol={}&outputsize={}",
                self.rest_url,
                iv.to_ascii_uppercase(),
                symbol,
                outputsize
            ),
            iv => format!(
                "{}/query?function=TIME_SERIES_INTRADAY&symbol={}&interval={}&outputsize={}",
                self.rest_url, symbol, iv, outputsize
            ),
        };
        RequestDescriptor::get(url)
    }

    pub fn live_channel(&self, symbol: &str, timeframe: Timeframe) -> ChannelDescriptor {
        ChannelDescriptor::Poll {
            request: self.historical_endpoint(symbol, timeframe, COMPACT_ROWS),
            every: self.poll_every,
        }
    }

    /// The payload is an object whose `"Time Series (...)"` member maps
    /// timestamps to `{"1. open": "..", ..., "5. volume": ".."}`.
    pub fn parse_rows(&self, body: &str, timeframe: Timeframe) -> Result<Vec<Candle>, SyncError> {
        let root: Value = serde_json::from_str(body)
            .map_err(|e| SyncError::MalformedResponse(format!("alphavantage body is not JSON: {e}")))?;
        let obj = root
            .as_object()
            .ok_or_else(|| SyncError::MalformedResponse("alphavantage response is not an object".into()))?;

        if let Some(msg) = error_envelope(&root) {
            return Err(SyncError::MalformedResponse(format!("alphavantage: {msg}")));
        }

        let series = obj
            .iter()
            .find(|(k, _)| k.contains("Time Series"))
            .and_then(|(_, v)| v.as_object())
            .ok_or_else(|| SyncError::MalformedResponse("no time series in alphavantage response".into()))?;

        let mut candles = Vec::with_capacity(series.len());
        for (stamp, values) in series {
            let Some(time) = parse_timestamp(stamp) else {
                warn!(stamp = %stamp, "alphavantage row with unparseable timestamp");
                continue;
            };
            match candle_from_fields(
                time,
                timeframe,
                &values["1. open"],
                &values["2. high"],
                &values["3. low"],
                &values["4. close"],
                &values["5. volume"],
            ) {
                Some(c) => candles.push(c),
                None => warn!(stamp = %stamp, "skipping alphavantage row with bad prices"),
            }
        }
        Ok(candles)
    }
}

/// Rate-limit and key problems come back as 200 with one of these members.
pub(crate) fn error_envelope(root: &Value) -> Option<String> {
    ["Error Message", "Note", "Information"]
        .into_iter()
        .find_map(|key| root.get(key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> AlphaVantageAdapter {
        AlphaVantageAdapter::new(DEFAULT_REST_URL, Duration::from_secs(60))
    }

    #[test]
    fn endpoint_functions() {
        let a = adapter();
        assert_eq!(
            a.historical_endpoint("IBM", Timeframe::M5, 500).url,
            "https://www.alphavantage.co/query?function=TIME_SERIES_INTRADAY&symbol=IBM&interval=5min&outputsize=full"
        );
        assert_eq!(
            a.historical_endpoint("IBM", Timeframe::W1, 50).url,
            "https://www.alphavantage.co/query?function=TIME_SERIES_WEEKLY&symbol=IBM&outputsize=compact"
        );
    }

    #[test]
    fn parse_time_series_object() {
        let body = r#"{
            "Meta Data": {"1. Information": "Intraday (5min)"},
            "Time Series (5min)": {
                "1970-01-01 00:10:00": {"1. open": "3", "2. high": "4", "3. low": "2", "4. close": "3.5", "5. volume": "10"},
                "1970-01-01 00:05:00": {"1. open": "1", "2. high": "2", "3. low": "1", "4. close": "1.5", "5. volume": "5"},
                "1970-01-01 00:15:00": {"1. open": "x", "2. high": "4", "3. low": "2", "4. close": "3.5"}
            }
        }"#;
        let mut candles = adapter().parse_rows(body, Timeframe::M5).unwrap();
        candles.sort_by_key(|c| c.time);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 300);
        assert_eq!(candles[1].close, 3.5);
        assert_eq!(candles[1].volume, Some(10.0));
    }

    #[test]
    fn parse_surfaces_api_messages() {
        let a = adapter();
        assert!(a.parse_rows(r#"{"Error Message":"Invalid API call."}"#, Timeframe::D1).is_err());
        assert!(a.parse_rows(r#"{"Note":"Thank you for using Alpha Vantage!"}"#, Timeframe::D1).is_err());
    }
}
