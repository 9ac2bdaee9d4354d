// =============================================================================
// Binance USDⓈ-M futures adapter
// =============================================================================

use serde_json::Value;
use tracing::warn;

use super::{candle_from_fields, compact_symbol, unsupported_symbol, ChannelDescriptor, RequestDescriptor};
use crate::error::SyncError;
use crate::types::{Candle, ProviderId, Timeframe};

pub const DEFAULT_REST_URL: &str = "https://fapi.binance.com";
pub const DEFAULT_WS_URL: &str = "wss://fstream.binance.com/ws";

#[derive(Debug, Clone)]
pub struct BinanceAdapter {
    rest_url: String,
    ws_url: String,
}

impl BinanceAdapter {
    pub fn new(rest_url: &str, ws_url: &str) -> Self {
        Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.trim_end_matches('/').to_string(),
        }
    }

    /// `btc/usdt`, `BTC-USDT` and `btcusdt` all become `BTCUSDT`.
    pub fn format_symbol(&self, raw: &str) -> Result<String, SyncError> {
        let symbol = compact_symbol(raw);
        if symbol.is_empty() {
            return Err(unsupported_symbol(ProviderId::Binance, raw));
        }
        Ok(symbol)
    }

    pub fn historical_endpoint(&self, symbol: &str, timeframe: Timeframe, limit: u32) -> RequestDescriptor {
        RequestDescriptor::get(format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.rest_url,
            symbol,
            timeframe.as_str(),
            limit
        ))
    }

    pub fn live_channel(&self, symbol: &str, timeframe: Timeframe) -> ChannelDescriptor {
        ChannelDescriptor::WebSocket {
            url: format!(
                "{}/{}@kline_{}",
                self.ws_url,
                symbol.to_lowercase(),
                timeframe.as_str()
            ),
            subscribe: None,
        }
    }

    /// Klines come back as an array of arrays:
    /// `[openTimeMs, "open", "high", "low", "close", "volume", closeTimeMs, ...]`.
    pub fn parse_rows(&self, body: &str, timeframe: Timeframe) -> Result<Vec<Candle>, SyncError> {
        let root: Value = serde_json::from_str(body)
            .map_err(|e| SyncError::MalformedResponse(format!("klines body is not JSON: {e}")))?;
        if let Some(msg) = error_envelope(&root) {
            return Err(SyncError::MalformedResponse(format!("binance: {msg}")));
        }
        let rows = root
            .as_array()
            .ok_or_else(|| SyncError::MalformedResponse("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for entry in rows {
            let Some(arr) = entry.as_array().filter(|a| a.len() >= 6) else {
                warn!(entry = %entry, "skipping malformed binance kline row");
                continue;
            };
            let Some(open_time_ms) = arr[0].as_i64() else {
                warn!(entry = %entry, "binance kline row without open time");
                continue;
            };
            match candle_from_fields(
                open_time_ms / 1000,
                timeframe,
                &arr[1],
                &arr[2],
                &arr[3],
                &arr[4],
                &arr[5],
            ) {
                Some(c) => candles.push(c),
                None => warn!(entry = %entry, "skipping binance kline row with bad prices"),
            }
        }
        Ok(candles)
    }

    /// Decode a kline event.  Accepts both the raw stream shape
    /// `{"e":"kline","k":{...}}` and the combined-stream envelope
    /// `{"stream":"...","data":{"e":"kline",...}}`.
    pub fn decode_live_message(&self, timeframe: Timeframe, text: &str) -> Result<Option<Candle>, SyncError> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::DecodeFailure(format!("binance frame is not JSON: {e}")))?;
        let event = if root.get("stream").is_some() { &root["data"] } else { &root };

        if event["e"].as_str() != Some("kline") {
            // Subscription acks ({"result":null,"id":1}) and other event types.
            return Ok(None);
        }

        let k = &event["k"];
        let open_time_ms = k["t"]
            .as_i64()
            .ok_or_else(|| SyncError::DecodeFailure("missing field k.t".into()))?;
        candle_from_fields(open_time_ms / 1000, timeframe, &k["o"], &k["h"], &k["l"], &k["c"], &k["v"])
            .map(Some)
            .ok_or_else(|| SyncError::DecodeFailure("kline has non-numeric prices".into()))
    }
}

/// `{"code":-1121,"msg":"Invalid symbol."}`; normally sent with a 4xx, but a
/// forwarding proxy may relay it as 200.
pub(crate) fn error_envelope(root: &Value) -> Option<String> {
    let code = root["code"].as_i64()?;
    let msg = root["msg"].as_str()?;
    Some(format!("error {code}: {msg}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new(DEFAULT_REST_URL, DEFAULT_WS_URL)
    }

    #[test]
    fn format_symbol_strips_separators() {
        let a = adapter();
        assert_eq!(a.format_symbol("btc/usdt").unwrap(), "BTCUSDT");
        assert_eq!(a.format_symbol("ETH-USDT").unwrap(), "ETHUSDT");
        assert!(matches!(
            a.format_symbol(" / "),
            Err(SyncError::UnsupportedSymbol { .. })
        ));
    }

    #[test]
    fn endpoints_use_futures_hosts() {
        let a = adapter();
        assert_eq!(
            a.historical_endpoint("BTCUSDT", Timeframe::H1, 500).url,
            "https://fapi.binance.com/fapi/v1/klines?symbol=BTCUSDT&interval=1h&limit=500"
        );
        assert_eq!(
            a.live_channel("BTCUSDT", Timeframe::M1),
            ChannelDescriptor::WebSocket {
                url: "wss://fstream.binance.com/ws/btcusdt@kline_1m".into(),
                subscribe: None,
            }
        );
    }

    #[test]
    fn parse_rows_converts_ms_and_skips_bad_rows() {
        let body = r#"[
            [1700000000000, "100.0", "110.0", "90.0", "105.0", "12.5", 1700000059999, "0", 10, "0", "0", "0"],
            [1700000060000, "oops", "110.0", "90.0", "105.0", "12.5"],
            ["x"],
            [1700000120000, "105.0", "106.0", "104.0", "105.5", "3.0"]
        ]"#;
        let candles = adapter().parse_rows(body, Timeframe::M1).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time, 1_699_999_980); // aligned to the minute
        assert_eq!(candles[0].close, 105.0);
        assert_eq!(candles[0].volume, Some(12.5));
        assert_eq!(candles[1].time, 1_700_000_100);
    }

    #[test]
    fn decode_kline_event() {
        let text = r#"{"e":"kline","E":1,"s":"BTCUSDT","k":{"t":1699999980000,"T":1700000039999,"i":"1m","o":"1.0","h":"2.0","l":"0.5","c":"1.5","v":"100","x":false}}"#;
        let candle = adapter().decode_live_message(Timeframe::M1, text).unwrap().unwrap();
        assert_eq!(candle.time, 1_699_999_980);
        assert_eq!(candle.high, 2.0);
        assert_eq!(candle.volume, Some(100.0));
    }

    #[test]
    fn decode_combined_envelope_and_control_frames() {
        let a = adapter();
        let wrapped = r#"{"stream":"btcusdt@kline_1m","data":{"e":"kline","k":{"t":60000,"o":"1","h":"1","l":"1","c":"1","v":"1"}}}"#;
        assert_eq!(a.decode_live_message(Timeframe::M1, wrapped).unwrap().unwrap().time, 60);
        assert_eq!(a.decode_live_message(Timeframe::M1, r#"{"result":null,"id":1}"#).unwrap(), None);
        assert!(matches!(
            a.decode_live_message(Timeframe::M1, "{{"),
            Err(SyncError::DecodeFailure(_))
        ));
        assert!(matches!(
            a.decode_live_message(Timeframe::M1, r#"{"e":"kline","k":{"o":"1"}}"#),
            Err(SyncError::DecodeFailure(_))
        ));
    }
}
