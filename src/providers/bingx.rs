// =============================================================================
// BingX perpetual swap adapter
// =============================================================================
//
// History comes from the swap v2 REST API.  The live feed is a single shared
// socket where each stream is requested with a `sub` message; every frame the
// server sends is gzip-compressed, including its `Ping` heartbeat.

use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use super::{candle_from_fields, unsupported_symbol, ChannelDescriptor, RequestDescriptor};
use crate::error::SyncError;
use crate::types::{Candle, ProviderId, Timeframe};

pub const DEFAULT_REST_URL: &str = "https://open-api.bingx.com";
pub const DEFAULT_WS_URL: &str = "wss://open-api-swap.bingx.com/swap-market";

/// Quote assets recognised when a compact symbol has to be split.
const QUOTE_ASSETS: &[&str] = &["USDT", "USDC", "BUSD", "USD", "BTC", "ETH"];

#[derive(Debug, Clone)]
pub struct BingXAdapter {
    rest_url: String,
    ws_url: String,
}

impl BingXAdapter {
    pub fn new(rest_url: &str, ws_url: &str) -> Self {
        Self {
            rest_url: rest_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.to_string(),
        }
    }

    /// BingX wants `BASE-QUOTE`.  An explicit separator in the input is
    /// honoured; otherwise the quote is recognised by suffix.
    pub fn format_symbol(&self, raw: &str) -> Result<String, SyncError> {
        let parts: Vec<String> = raw
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|p| !p.is_empty())
            .map(|p| p.to_ascii_uppercase())
            .collect();

        match parts.as_slice() {
            [base, quote] => Ok(format!("{base}-{quote}")),
            [compact] => QUOTE_ASSETS
                .iter()
                .find(|q| compact.len() > q.len() && compact.ends_with(*q))
                .map(|q| format!("{}-{}", &compact[..compact.len() - q.len()], q))
                .ok_or_else(|| unsupported_symbol(ProviderId::BingX, raw)),
            _ => Err(unsupported_symbol(ProviderId::BingX, raw)),
        }
    }

    pub fn historical_endpoint(&self, symbol: &str, timeframe: Timeframe, limit: u32) -> RequestDescriptor {
        RequestDescriptor::get(format!(
            "{}/openApi/swap/v2/quote/klines?symbol={}&interval={}&limit={}",
            self.rest_url,
            symbol,
            timeframe.as_str(),
            limit
        ))
    }

    pub fn live_channel(&self, symbol: &str, timeframe: Timeframe) -> ChannelDescriptor {
        let subscribe = json!({
            "id": Uuid::new_v4().to_string(),
            "reqType": "sub",
            "dataType": data_type(symbol, timeframe),
        });
        ChannelDescriptor::WebSocket {
            url: self.ws_url.clone(),
            subscribe: Some(subscribe.to_string()),
        }
    }

    /// `{"code":0,"msg":"","data":[{"open":"..","close":"..","high":"..","low":"..","volume":"..","time":ms}]}`
    pub fn parse_rows(&self, body: &str, timeframe: Timeframe) -> Result<Vec<Candle>, SyncError> {
        let root: Value = serde_json::from_str(body)
            .map_err(|e| SyncError::MalformedResponse(format!("klines body is not JSON: {e}")))?;

        if let Some(msg) = error_envelope(&root) {
            return Err(SyncError::MalformedResponse(format!("bingx: {msg}")));
        }
        let rows = root["data"]
            .as_array()
            .ok_or_else(|| SyncError::MalformedResponse("bingx response has no data array".into()))?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(time_ms) = row["time"].as_i64() else {
                warn!(row = %row, "bingx kline row without time");
                continue;
            };
            match candle_from_fields(
                time_ms / 1000,
                timeframe,
                &row["open"],
                &row["high"],
                &row["low"],
                &row["close"],
                &row["volume"],
            ) {
                Some(c) => candles.push(c),
                None => warn!(row = %row, "skipping bingx kline row with bad prices"),
            }
        }
        Ok(candles)
    }

    /// The server heartbeat is either the bare string `Ping` or a JSON object
    /// with a `ping` key; both are echoed back with `ping` turned into `pong`.
    pub fn heartbeat_reply(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed == "Ping" {
            return Some("Pong".to_string());
        }
        if trimmed.starts_with('{') && trimmed.contains("\"ping\"") {
            return Some(trimmed.replacen("\"ping\"", "\"pong\"", 1));
        }
        None
    }

    /// Kline pushes look like
    /// `{"code":0,"dataType":"BTC-USDT@kline_1m","data":[{"T":ms,"o":"..","h":"..","l":"..","c":"..","v":".."}]}`.
    pub fn decode_live_message(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        text: &str,
    ) -> Result<Option<Candle>, SyncError> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::DecodeFailure(format!("bingx frame is not JSON: {e}")))?;

        let expected = data_type(symbol, timeframe);
        if root["dataType"].as_str() != Some(expected.as_str()) {
            // Subscription acks carry an empty dataType; other streams are ignored.
            return Ok(None);
        }
        let Some(kline) = root["data"].as_array().and_then(|rows| rows.first()) else {
            return Ok(None);
        };

        let time_ms = kline["T"]
            .as_i64()
            .ok_or_else(|| SyncError::DecodeFailure("missing field data[0].T".into()))?;
        candle_from_fields(
            time_ms / 1000,
            timeframe,
            &kline["o"],
            &kline["h"],
            &kline["l"],
            &kline["c"],
            &kline["v"],
        )
        .map(Some)
        .ok_or_else(|| SyncError::DecodeFailure("bingx kline has non-numeric prices".into()))
    }
}

fn data_type(symbol: &str, timeframe: Timeframe) -> String {
    format!("{}@kline_{}", symbol, timeframe.as_str())
}

/// Any nonzero `code` is an API error, whatever the HTTP status was.
pub(crate) fn error_envelope(root: &Value) -> Option<String> {
    let code = root["code"].as_i64().filter(|c| *c != 0)?;
    Some(format!("error {code}: {}", root["msg"].as_str().unwrap_or("")))
}
