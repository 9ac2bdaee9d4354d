// =============================================================================
// Historical Loader: one bounded REST fetch per chart seed
// =============================================================================

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info, instrument};

use super::candle_series::LoadedHistory;
use crate::error::SyncError;
use crate::providers::{ProviderAdapter, RequestDescriptor};
use crate::runtime_config::SyncConfig;
use crate::types::Timeframe;

/// Issues provider REST requests, optionally through the forwarding proxy.
///
/// The same instance also serves the poll transport, so every REST call in the
/// crate shares one connection pool and one timeout policy.
#[derive(Debug, Clone)]
pub struct HistoricalLoader {
    client: Client,
    proxy_url: Option<String>,
    timeout: Duration,
}

impl HistoricalLoader {
    pub fn new(proxy_url: Option<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = Client::builder()
            .user_agent(concat!("candle-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::TransportError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            proxy_url: proxy_url.filter(|p| !p.trim().is_empty()),
            timeout,
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self, SyncError> {
        Self::new(config.proxy_url.clone(), config.fetch_timeout())
    }

    /// GET `request` and return the body text.
    ///
    /// * elapsed `timeout` -> `FetchTimeout`
    /// * connection failure or non-2xx status -> `TransportError`
    pub async fn fetch_body(&self, request: &RequestDescriptor) -> Result<String, SyncError> {
        let builder = match &self.proxy_url {
            Some(proxy) => self.client.get(proxy).query(&[("url", request.url.as_str())]),
            None => self.client.get(&request.url),
        };

        let exchange = async {
            let resp = builder.send().await?;
            let status = resp.status();
            if !status.is_success() {
                let snippet: String = resp.text().await.unwrap_or_default().chars().take(200).collect();
                return Err(SyncError::TransportError(format!("HTTP {status}: {snippet}")));
            }
            Ok(resp.text().await?)
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::FetchTimeout {
                secs: self.timeout.as_secs().max(1),
            }),
        }
    }

    /// Fetch, parse and normalize one page of history.  Never retries and
    /// never touches an existing series.
    ///
    /// An error object the provider sent with a 2xx status fails the load; any
    /// other unrecognized shape is an empty, thin history.
    #[instrument(skip(self, adapter), fields(provider = %adapter.id()), name = "history::load")]
    pub async fn load(
        &self,
        adapter: &ProviderAdapter,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
    ) -> Result<LoadedHistory, SyncError> {
        let request = adapter.historical_endpoint(symbol, timeframe, limit)?;
        debug!(url = %request.url, proxied = self.proxy_url.is_some(), "fetching history");

        let body = self.fetch_body(&request).await?;
        serde_json::from_str::<serde::de::IgnoredAny>(&body)
            .map_err(|e| SyncError::MalformedResponse(format!("history body is not JSON: {e}")))?;
        adapter.check_envelope(symbol, &body)?;

        let history = LoadedHistory::from_raw(adapter.parse_historical(&body, timeframe));
        info!(
            candles = history.candles.len(),
            thin = history.thin,
            first = history.candles.first().map(|c| c.time),
            last = history.candles.last().map(|c| c.time),
            "history loaded"
        );
        Ok(history)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::*;
    use crate::runtime_config::ProviderEndpoints;
    use crate::types::ProviderId;

    const KLINES: &str = r#"[
        [120000, "3", "3", "3", "3", "1"],
        [0, "1", "1", "1", "1", "1"],
        [60000, "2", "2", "2", "2", "1"],
        [120000, "4", "4", "4", "4", "1"]
    ]"#;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn binance_at(base: &str) -> ProviderAdapter {
        let endpoints = ProviderEndpoints {
            binance_rest: base.to_string(),
            ..ProviderEndpoints::default()
        };
        ProviderAdapter::new(ProviderId::Binance, &endpoints, Duration::from_secs(30))
    }

    fn loader(proxy: Option<String>, timeout_ms: u64) -> HistoricalLoader {
        HistoricalLoader::new(proxy, Duration::from_millis(timeout_ms)).unwrap()
    }

    #[tokio::test]
    async fn load_dedupes_keeping_last_and_sorts() {
        let base = serve(Router::new().route("/fapi/v1/klines", get(|| async { KLINES }))).await;
        let history = loader(None, 2_000)
            .load(&binance_at(&base), "BTCUSDT", Timeframe::M1, 500)
            .await
            .unwrap();

        let times: Vec<i64> = history.candles.iter().map(|c| c.time).collect();
        assert_eq!(times, vec![0, 60, 120]);
        assert_eq!(history.candles[2].close, 4.0);
        assert!(!history.thin);
    }

    #[tokio::test]
    async fn load_goes_through_proxy_with_encoded_target() {
        let router = Router::new().route(
            "/proxy",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                match params.get("url") {
                    Some(url) if url.contains("/fapi/v1/klines?symbol=BTCUSDT&interval=1m&limit=2") => {
                        (StatusCode::OK, r#"[[60000,"5","6","4","5.5","10"]]"#.to_string())
                    }
                    other => (StatusCode::BAD_REQUEST, format!("unexpected target {other:?}")),
                }
            }),
        );
        let base = serve(router).await;
        let history = loader(Some(format!("{base}/proxy")), 2_000)
            .load(&binance_at("https://fapi.binance.com"), "BTCUSDT", Timeframe::M1, 2)
            .await
            .unwrap();

        assert_eq!(history.candles.len(), 1);
        assert!(history.thin);
        assert_eq!(history.candles[0].close, 5.5);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let router = Router::new().route(
            "/fapi/v1/klines",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "[]"
            }),
        );
        let base = serve(router).await;
        let err = loader(None, 200)
            .load(&binance_at(&base), "BTCUSDT", Timeframe::M1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::FetchTimeout { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn non_success_status_is_transport_error() {
        let router = Router::new().route(
            "/fapi/v1/klines",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = serve(router).await;
        let err = loader(None, 2_000)
            .load(&binance_at(&base), "BTCUSDT", Timeframe::M1, 10)
            .await
            .unwrap_err();
        match err {
            SyncError::TransportError(msg) => assert!(msg.contains("500")),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_body_is_malformed() {
        let base = serve(Router::new().route("/fapi/v1/klines", get(|| async { "<html>maintenance</html>" }))).await;
        let err = loader(None, 2_000)
            .load(&binance_at(&base), "BTCUSDT", Timeframe::M1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn wrong_shape_is_empty_thin_success() {
        let base = serve(Router::new().route("/fapi/v1/klines", get(|| async { r#"{"code":-1121}"# }))).await;
        let history = loader(None, 2_000)
            .load(&binance_at(&base), "BTCUSDT", Timeframe::M1, 10)
            .await
            .unwrap();
        assert!(history.candles.is_empty());
        assert!(history.thin);
    }

    fn adapter_at(id: ProviderId, endpoints: ProviderEndpoints) -> ProviderAdapter {
        ProviderAdapter::new(id, &endpoints, Duration::from_secs(30))
    }

    #[tokio::test]
    async fn alphavantage_error_report_fails_the_load() {
        let router = Router::new().route(
            "/query",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                match params.get("symbol").map(String::as_str) {
                    Some("NOPE") => r#"{"Error Message":"Invalid API call. Please retry or visit the documentation (https://www.alphavantage.co/documentation/) for TIME_SERIES_DAILY."}"#,
                    _ => r#"{"Note":"Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."}"#,
                }
            }),
        );
        let base = serve(router).await;
        let av = adapter_at(
            ProviderId::AlphaVantage,
            ProviderEndpoints {
                alphavantage_rest: base,
                ..ProviderEndpoints::default()
            },
        );

        let err = loader(None, 2_000).load(&av, "NOPE", Timeframe::D1, 100).await.unwrap_err();
        assert_eq!(
            err,
            SyncError::UnsupportedSymbol {
                provider: "alphavantage".into(),
                symbol: "NOPE".into()
            }
        );

        let err = loader(None, 2_000).load(&av, "IBM", Timeframe::D1, 100).await.unwrap_err();
        match err {
            SyncError::MalformedResponse(msg) => assert!(msg.contains("call frequency"), "{msg}"),
            other => panic!("expected malformed response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn bingx_error_code_fails_the_load() {
        let router = Router::new().route(
            "/openApi/swap/v2/quote/klines",
            get(|| async { r#"{"code":109400,"msg":"symbol not exist","data":null}"# }),
        );
        let base = serve(router).await;
        let bingx = adapter_at(
            ProviderId::BingX,
            ProviderEndpoints {
                bingx_rest: base,
                ..ProviderEndpoints::default()
            },
        );

        let err = loader(None, 2_000)
            .load(&bingx, "FOO-USDT", Timeframe::M1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedSymbol { ref symbol, .. } if symbol == "FOO-USDT"), "{err:?}");
    }

    #[tokio::test]
    async fn refused_connection_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = loader(None, 2_000)
            .load(&binance_at(&format!("http://{addr}")), "BTCUSDT", Timeframe::M1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransportError(_)));
    }
}
