// =============================================================================
// Provider Adapters
// =============================================================================
//
// One adapter per market-data provider, unified behind the `ProviderAdapter`
// enum.  Adapters are pure: they describe requests and channels and translate
// wire payloads into normalized `Candle`s, but never perform I/O themselves.
// Nothing outside this module branches on provider identity.

pub mod alpha_vantage;
pub mod binance;
pub mod bingx;
pub mod fmp;
pub mod oanda;

use std::io::Read;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::SyncError;
use crate::runtime_config::ProviderEndpoints;
use crate::types::{Candle, ProviderId, Timeframe};

pub use alpha_vantage::AlphaVantageAdapter;
pub use binance::BinanceAdapter;
pub use bingx::BingXAdapter;
pub use fmp::FmpAdapter;
pub use oanda::OandaAdapter;

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// A single HTTP GET against a provider, before proxy routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDescriptor {
    pub url: String,
}

impl RequestDescriptor {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// How live updates are obtained for a (symbol, timeframe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelDescriptor {
    /// Push feed.  `subscribe` is sent once right after the socket opens.
    WebSocket {
        url: String,
        subscribe: Option<String>,
    },
    /// Fixed-interval re-fetch of a REST endpoint.
    Poll {
        request: RequestDescriptor,
        every: Duration,
    },
}

/// Raw payload as received from a live transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveFrame {
    Text(String),
    Binary(Vec<u8>),
}

// ---------------------------------------------------------------------------
// ProviderAdapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ProviderAdapter {
    Binance(BinanceAdapter),
    BingX(BingXAdapter),
    Fmp(FmpAdapter),
    AlphaVantage(AlphaVantageAdapter),
    Oanda(OandaAdapter),
}

impl ProviderAdapter {
    /// Build the adapter for `id`, using the configured base URLs.
    /// `poll_every` is the re-fetch period for providers without a push feed.
    pub fn new(id: ProviderId, endpoints: &ProviderEndpoints, poll_every: Duration) -> Self {
        match id {
            ProviderId::Binance => Self::Binance(BinanceAdapter::new(
                &endpoints.binance_rest,
                &endpoints.binance_ws,
            )),
            ProviderId::BingX => {
                Self::BingX(BingXAdapter::new(&endpoints.bingx_rest, &endpoints.bingx_ws))
            }
            ProviderId::Fmp => Self::Fmp(FmpAdapter::new(&endpoints.fmp_rest, poll_every)),
            ProviderId::AlphaVantage => Self::AlphaVantage(AlphaVantageAdapter::new(
                &endpoints.alphavantage_rest,
                poll_every,
            )),
            ProviderId::Oanda => Self::Oanda(OandaAdapter::new(&endpoints.oanda_rest, poll_every)),
        }
    }

    pub fn id(&self) -> ProviderId {
        match self {
            Self::Binance(_) => ProviderId::Binance,
            Self::BingX(_) => ProviderId::BingX,
            Self::Fmp(_) => ProviderId::Fmp,
            Self::AlphaVantage(_) => ProviderId::AlphaVantage,
            Self::Oanda(_) => ProviderId::Oanda,
        }
    }

    /// Produce the exact identifier the provider expects.
    pub fn format_symbol(&self, raw: &str) -> Result<String, SyncError> {
        match self {
            Self::Binance(a) => a.format_symbol(raw),
            Self::BingX(a) => a.format_symbol(raw),
            Self::Fmp(a) => a.format_symbol(raw),
            Self::AlphaVantage(a) => a.format_symbol(raw),
            Self::Oanda(a) => a.format_symbol(raw),
        }
    }

    /// Fail early when the provider has no equivalent for `timeframe`.
    pub fn check_timeframe(&self, timeframe: Timeframe) -> Result<(), SyncError> {
        let supported = match self {
            Self::Binance(_) | Self::BingX(_) => true,
            Self::Fmp(_) => fmp::interval(timeframe).is_some(),
            Self::AlphaVantage(_) => alpha_vantage::interval(timeframe).is_some(),
            Self::Oanda(_) => oanda::granularity(timeframe).is_some(),
        };
        if supported {
            Ok(())
        } else {
            Err(SyncError::UnsupportedTimeframe {
                provider: self.id().to_string(),
                timeframe: timeframe.to_string(),
            })
        }
    }

    /// `symbol` must already be formatted by [`format_symbol`](Self::format_symbol).
    pub fn historical_endpoint(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<RequestDescriptor, SyncError> {
        self.check_timeframe(timeframe)?;
        Ok(match self {
            Self::Binance(a) => a.historical_endpoint(symbol, timeframe, limit),
            Self::BingX(a) => a.historical_endpoint(symbol, timeframe, limit),
            Self::Fmp(a) => a.historical_endpoint(symbol, timeframe, limit),
            Self::AlphaVantage(a) => a.historical_endpoint(symbol, timeframe, limit),
            Self::Oanda(a) => a.historical_endpoint(symbol, timeframe, limit),
        })
    }

    /// Reject a body that is the provider's own error report, which several
    /// providers send with HTTP 200.  Messages about the symbol become
    /// `UnsupportedSymbol`; any other report is `MalformedResponse`.  Bodies
    /// that are not a recognized error object pass.
    pub fn check_envelope(&self, symbol: &str, body: &str) -> Result<(), SyncError> {
        let Ok(root) = serde_json::from_str::<Value>(body) else {
            return Ok(());
        };
        let reported = match self {
            Self::Binance(_) => binance::error_envelope(&root),
            Self::BingX(_) => bingx::error_envelope(&root),
            Self::Fmp(_) => fmp::error_envelope(&root),
            Self::AlphaVantage(_) => alpha_vantage::error_envelope(&root),
            Self::Oanda(_) => oanda::error_envelope(&root),
        };
        let Some(message) = reported else {
            return Ok(());
        };

        warn!(provider = %self.id(), symbol, message = %message, "provider reported an error");
        let lower = message.to_ascii_lowercase();
        // Alpha Vantage answers an unknown ticker with a bare "Invalid API call".
        if lower.contains("symbol") || lower.contains("invalid api call") {
            return Err(unsupported_symbol(self.id(), symbol));
        }
        Err(SyncError::MalformedResponse(format!("{}: {message}", self.id())))
    }

    /// Translate a historical response body into candles.
    ///
    /// Never fails: a payload of the wrong shape is logged and yields an empty
    /// vector, and malformed rows are skipped individually.  Output is in
    /// provider order; dedup and sorting are the loader's job.
    pub fn parse_historical(&self, body: &str, timeframe: Timeframe) -> Vec<Candle> {
        let parsed = match self {
            Self::Binance(a) => a.parse_rows(body, timeframe),
            Self::BingX(a) => a.parse_rows(body, timeframe),
            Self::Fmp(a) => a.parse_rows(body, timeframe),
            Self::AlphaVantage(a) => a.parse_rows(body, timeframe),
            Self::Oanda(a) => a.parse_rows(body, timeframe),
        };
        match parsed {
            Ok(candles) => candles,
            Err(e) => {
                warn!(provider = %self.id(), error = %e, "unusable historical payload");
                Vec::new()
            }
        }
    }

    pub fn live_channel(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<ChannelDescriptor, SyncError> {
        self.check_timeframe(timeframe)?;
        Ok(match self {
            Self::Binance(a) => a.live_channel(symbol, timeframe),
            Self::BingX(a) => a.live_channel(symbol, timeframe),
            Self::Fmp(a) => a.live_channel(symbol, timeframe),
            Self::AlphaVantage(a) => a.live_channel(symbol, timeframe),
            Self::Oanda(a) => a.live_channel(symbol, timeframe),
        })
    }

    /// Turn a raw frame into text.  Binary frames are gzip-inflated; only
    /// providers that send compressed frames accept them.
    pub fn frame_text(&self, frame: LiveFrame) -> Result<String, SyncError> {
        match frame {
            LiveFrame::Text(text) => Ok(text),
            LiveFrame::Binary(bytes) => match self {
                Self::BingX(_) => gunzip_to_string(&bytes),
                _ => String::from_utf8(bytes)
                    .map_err(|e| SyncError::DecodeFailure(format!("binary frame is not UTF-8: {e}"))),
            },
        }
    }

    /// Provider-level heartbeat answer, if `text` is one.
    pub fn heartbeat_reply(&self, text: &str) -> Option<String> {
        match self {
            Self::BingX(a) => a.heartbeat_reply(text),
            _ => None,
        }
    }

    /// `Ok(None)` for control frames, `Ok(Some)` for a kline, `Err` when the
    /// frame cannot be parsed.
    pub fn decode_live_message(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        text: &str,
    ) -> Result<Option<Candle>, SyncError> {
        match self {
            Self::Binance(a) => a.decode_live_message(timeframe, text),
            Self::BingX(a) => a.decode_live_message(symbol, timeframe, text),
            Self::Fmp(a) => latest_of(a.parse_rows(text, timeframe)),
            Self::AlphaVantage(a) => latest_of(a.parse_rows(text, timeframe)),
            Self::Oanda(a) => latest_of(a.parse_rows(text, timeframe)),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// A polled body becomes the most recent candle it contains.
fn latest_of(rows: Result<Vec<Candle>, SyncError>) -> Result<Option<Candle>, SyncError> {
    let rows = rows.map_err(|e| SyncError::DecodeFailure(e.to_string()))?;
    Ok(rows.into_iter().max_by_key(|c| c.time))
}

fn gunzip_to_string(bytes: &[u8]) -> Result<String, SyncError> {
    let mut out = String::new();
    GzDecoder::new(bytes)
        .read_to_string(&mut out)
        .map_err(|e| SyncError::DecodeFailure(format!("gzip inflate failed: {e}")))?;
    Ok(out)
}

/// Providers send numbers either as JSON numbers or as strings.
pub(crate) fn parse_number(val: &serde_json::Value) -> Option<f64> {
    let n = match val {
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok()?,
        serde_json::Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Like [`parse_number`], for fields that may be absent (volume).
pub(crate) fn parse_optional_number(val: &serde_json::Value) -> Option<f64> {
    if val.is_null() {
        None
    } else {
        parse_number(val)
    }
}

/// Parse the date formats used by REST providers into UTC seconds.
///
/// Accepts RFC 3339 (`2024-01-02T15:30:00.000000000Z`), `YYYY-MM-DD HH:MM:SS`,
/// `YYYY-MM-DD HH:MM` and plain `YYYY-MM-DD`.  Zone-less values are read as UTC.
///
/// FMP and Alpha Vantage intraday stamps are exchange-local (US/Eastern), so
/// their candles land 4 to 5 hours early on the UTC axis.  Ordering and
/// merging are unaffected: the shift only moves by an hour at a DST change.
pub(crate) fn parse_timestamp(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp())
}

/// Uppercase and drop everything that is not ASCII alphanumeric.
pub(crate) fn compact_symbol(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

pub(crate) fn unsupported_symbol(provider: ProviderId, raw: &str) -> SyncError {
    SyncError::UnsupportedSymbol {
        provider: provider.to_string(),
        symbol: raw.to_string(),
    }
}

/// Build a candle from loosely typed fields, rejecting non-finite prices.
pub(crate) fn candle_from_fields(
    time_secs: i64,
    timeframe: Timeframe,
    open: &serde_json::Value,
    high: &serde_json::Value,
    low: &serde_json::Value,
    close: &serde_json::Value,
    volume: &serde_json::Value,
) -> Option<Candle> {
    Some(Candle::new(
        timeframe.align(time_secs),
        parse_number(open)?,
        parse_number(high)?,
        parse_number(low)?,
        parse_number(close)?,
        parse_optional_number(volume),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;

    use super::*;

    fn adapter(id: ProviderId) -> ProviderAdapter {
        ProviderAdapter::new(id, &ProviderEndpoints::default(), Duration::from_secs(30))
    }

    fn gzip(text: &str) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(text.as_bytes()).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn parse_number_accepts_strings_and_numbers() {
        assert_eq!(parse_number(&json!("42.5")), Some(42.5));
        assert_eq!(parse_number(&json!(7)), Some(7.0));
        assert_eq!(parse_number(&json!("abc")), None);
        assert_eq!(parse_number(&json!(null)), None);
        assert_eq!(parse_number(&json!("NaN")), None);
    }

    #[test]
    fn parse_timestamp_formats() {
        assert_eq!(parse_timestamp("1970-01-02"), Some(86_400));
        assert_eq!(parse_timestamp("1970-01-01 01:00:00"), Some(3_600));
        assert_eq!(parse_timestamp("1970-01-01 00:05"), Some(300));
        assert_eq!(parse_timestamp("1970-01-01T00:01:00.000000000Z"), Some(60));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn unsupported_timeframes_are_rejected_per_provider() {
        assert!(adapter(ProviderId::Binance).check_timeframe(Timeframe::M3).is_ok());
        assert!(matches!(
            adapter(ProviderId::Fmp).check_timeframe(Timeframe::M3),
            Err(SyncError::UnsupportedTimeframe { .. })
        ));
        assert!(matches!(
            adapter(ProviderId::AlphaVantage).historical_endpoint("IBM", Timeframe::H4, 10),
            Err(SyncError::UnsupportedTimeframe { .. })
        ));
    }

    #[test]
    fn frame_text_inflates_bingx_binary() {
        let bingx = adapter(ProviderId::BingX);
        let text = bingx.frame_text(LiveFrame::Binary(gzip("Ping"))).unwrap();
        assert_eq!(text, "Ping");
        assert_eq!(bingx.heartbeat_reply(&text).as_deref(), Some("Pong"));
    }

    #[test]
    fn frame_text_rejects_corrupt_gzip() {
        let bingx = adapter(ProviderId::BingX);
        let err = bingx.frame_text(LiveFrame::Binary(vec![0x1f, 0x8b, 0, 1, 2])).unwrap_err();
        assert!(matches!(err, SyncError::DecodeFailure(_)));
    }

    #[test]
    fn parse_historical_swallows_wrong_shape() {
        for id in [
            ProviderId::Binance,
            ProviderId::BingX,
            ProviderId::Fmp,
            ProviderId::AlphaVantage,
            ProviderId::Oanda,
        ] {
            assert!(adapter(id).parse_historical("{\"unexpected\":true}", Timeframe::D1).is_empty());
            assert!(adapter(id).parse_historical("not json", Timeframe::D1).is_empty());
        }
    }

    #[test]
    fn poll_providers_decode_latest_candle_from_body() {
        let fmp = adapter(ProviderId::Fmp);
        let body = json!([
            {"date": "1970-01-01 00:10:00", "open": 3, "high": 4, "low": 2, "close": 3.5, "volume": 10},
            {"date": "1970-01-01 00:05:00", "open": 1, "high": 2, "low": 1, "close": 1.5, "volume": 5}
        ])
        .to_string();
        let candle = fmp
            .decode_live_message("AAPL", Timeframe::M5, &body)
            .unwrap()
            .unwrap();
        assert_eq!(candle.time, 600);
        assert_eq!(candle.close, 3.5);

        let err = fmp.decode_live_message("AAPL", Timeframe::M5, "garbage").unwrap_err();
        assert!(matches!(err, SyncError::DecodeFailure(_)));
    }

    #[test]
    fn error_envelopes_are_recognized_per_provider() {
        let binance = adapter(ProviderId::Binance);
        let err = binance
            .check_envelope("BTCUSDX", r#"{"code":-1121,"msg":"Invalid symbol."}"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedSymbol { .. }));
        assert!(binance.check_envelope("BTCUSDT", r#"[[0,"1","1","1","1","1"]]"#).is_ok());
        // Unrecognized shapes are left to parse_historical.
        assert!(binance.check_envelope("BTCUSDT", r#"{"code":-1121}"#).is_ok());

        let oanda = adapter(ProviderId::Oanda);
        let err = oanda
            .check_envelope("EUR_USD", r#"{"errorMessage":"Insufficient authorization to perform request."}"#)
            .unwrap_err();
        assert_eq!(
            err,
            SyncError::MalformedResponse("oanda: Insufficient authorization to perform request.".into())
        );

        let bingx = adapter(ProviderId::BingX);
        assert!(bingx.check_envelope("BTC-USDT", r#"{"code":0,"msg":"","data":[]}"#).is_ok());
        let fmp = adapter(ProviderId::Fmp);
        assert!(fmp.check_envelope("AAPL", r#"{"Error Message":"Invalid API KEY."}"#).is_err());
    }
}
