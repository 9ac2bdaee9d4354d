// =============================================================================
// Chart Session: one (provider, symbol, timeframe) feed and its derived state
// =============================================================================
//
// `ChartSession` holds everything a renderer reads: the merged candle series,
// indicator lines, connection state and load state.  It is shared as
// `Arc<RwLock<ChartSession>>`; the history task and the live channel both
// mutate it only under the write lock, so seed application and live merges
// are serialized.
//
// Every `open` bumps the session generation.  Background tasks carry the
// generation they were started for and their results are discarded once it
// is no longer current, which is how an identity switch cancels in-flight
// work without waiting for it.
// =============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::indicators::{IndicatorEngine, IndicatorLine, MovingAverageConfig, MovingAverageUpdate};
use crate::market_data::{
    CandleSeries, ConnectionState, HistoricalLoader, LiveConnector, LiveSink, LiveStreamManager, LoadedHistory,
    MergeOutcome, NetworkConnector,
};
use crate::providers::ProviderAdapter;
use crate::runtime_config::SyncConfig;
use crate::types::{Candle, ProviderId, Timeframe};

// =============================================================================
// Session value types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionIdentity {
    pub provider: ProviderId,
    /// Provider-formatted symbol (`BTC-USDT`, `EUR_USD`, ...).
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.provider, self.symbol, self.timeframe)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LoadState {
    Idle,
    Loading,
    Ready { thin: bool },
    Failed { error: SyncError },
}

/// Most recent price and volume, the "latest chart info" shown next to a chart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatestInfo {
    pub time: i64,
    pub price: f64,
    pub volume: Option<f64>,
}

impl From<&Candle> for LatestInfo {
    fn from(c: &Candle) -> Self {
        Self {
            time: c.time,
            price: c.close,
            volume: c.volume,
        }
    }
}

/// Result of a completed seed, as reported through a [`LoadTicket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub generation: u64,
    pub candles: usize,
    pub thin: bool,
}

/// Resolves once the history fetch for one `open` has been applied (or
/// rejected).
#[derive(Debug)]
pub struct LoadTicket {
    generation: u64,
    rx: oneshot::Receiver<Result<LoadSummary, SyncError>>,
}

impl LoadTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn wait(self) -> Result<LoadSummary, SyncError> {
        self.rx.await.unwrap_or(Err(SyncError::Superseded))
    }
}

// =============================================================================
// ChartSession
// =============================================================================

pub struct ChartSession {
    identity: Option<SessionIdentity>,
    generation: u64,
    series: CandleSeries,
    /// Live ticks that arrived before the seed (newest kept).
    pending: VecDeque<Candle>,
    pending_capacity: usize,
    indicators: IndicatorEngine,
    connection: ConnectionState,
    load: LoadState,
    latest: Option<LatestInfo>,
}

impl ChartSession {
    pub fn new(indicators: IndicatorEngine, pending_capacity: usize) -> Self {
        Self {
            identity: None,
            generation: 0,
            series: CandleSeries::default(),
            pending: VecDeque::new(),
            pending_capacity,
            indicators,
            connection: ConnectionState::new(),
            load: LoadState::Idle,
            latest: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn identity(&self) -> Option<&SessionIdentity> {
        self.identity.as_ref()
    }

    pub fn series(&self) -> &CandleSeries {
        &self.series
    }

    pub fn indicators(&self) -> &IndicatorEngine {
        &self.indicators
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.connection
    }

    /// Drop all per-identity state and start a new generation.  Indicator
    /// configs survive; their lines are emptied with the series.
    pub fn begin(&mut self, identity: SessionIdentity) -> u64 {
        self.generation += 1;
        self.identity = Some(identity);
        self.reset(LoadState::Loading);
        self.generation
    }

    /// Detach from any identity.  Late results of the old generation are
    /// ignored from here on.
    pub fn close(&mut self) {
        self.generation += 1;
        self.identity = None;
        self.reset(LoadState::Idle);
        self.connection.close();
    }

    fn reset(&mut self, load: LoadState) {
        self.series = CandleSeries::default();
        self.pending.clear();
        self.connection = ConnectionState::new();
        self.load = load;
        self.latest = None;
        self.indicators.recompute_all(&self.series);
    }

    fn is_current(&self, generation: u64, what: &str) -> bool {
        if generation != self.generation {
            debug!(generation, current = self.generation, what, "discarding result of superseded session");
            return false;
        }
        true
    }

    /// Install the history fetched for `generation`, then replay any ticks
    /// that were buffered while it loaded.  Returns `false` when superseded.
    pub fn apply_seed(&mut self, generation: u64, result: Result<LoadedHistory, SyncError>) -> bool {
        if !self.is_current(generation, "seed") {
            return false;
        }
        match result {
            Ok(history) => {
                let thin = history.thin;
                self.series = CandleSeries::from_history(history);
                self.indicators.recompute_all(&self.series);
                self.latest = self.series.last().map(LatestInfo::from);

                let buffered: Vec<Candle> = self.pending.drain(..).collect();
                let replayed = buffered.len();
                for candle in buffered {
                    self.merge(candle);
                }
                self.load = LoadState::Ready { thin };
                debug!(generation, candles = self.series.len(), replayed, "seed applied");
            }
            Err(error) => {
                self.pending.clear();
                self.load = LoadState::Failed { error };
            }
        }
        true
    }

    /// Merge one live candle.  Before the seed lands it is buffered instead;
    /// after a failed load it is dropped.  Returns `true` if state changed.
    pub fn apply_live(&mut self, generation: u64, candle: Candle) -> bool {
        if !self.is_current(generation, "live candle") {
            return false;
        }
        match self.load {
            LoadState::Loading => {
                if self.pending_capacity == 0 {
                    return false;
                }
                if self.pending.len() == self.pending_capacity {
                    self.pending.pop_front();
                }
                self.pending.push_back(candle);
                true
            }
            LoadState::Ready { .. } => self.merge(candle) != MergeOutcome::DiscardedStale,
            LoadState::Idle | LoadState::Failed { .. } => false,
        }
    }

    pub fn apply_connection(&mut self, generation: u64, state: ConnectionState) -> bool {
        if !self.is_current(generation, "connection state") {
            return false;
        }
        self.connection = state;
        true
    }

    fn merge(&mut self, candle: Candle) -> MergeOutcome {
        let outcome = self.series.merge(candle);
        self.indicators.apply_merge(&self.series, outcome);
        if outcome != MergeOutcome::DiscardedStale {
            self.latest = Some(LatestInfo::from(&candle));
        } else {
            debug!(time = candle.time, "stale tick discarded");
        }
        outcome
    }

    pub fn snapshot(&self, version: u64) -> ChartSnapshot {
        ChartSnapshot {
            identity: self.identity.clone(),
            generation: self.generation,
            candles: self.series.candles().to_vec(),
            lines: self.indicators.visible_lines().cloned().collect(),
            connection: self.connection.clone(),
            load: self.load.clone(),
            latest: self.latest,
            version,
        }
    }
}

/// Read-only copy of a session handed to the rendering layer.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub identity: Option<SessionIdentity>,
    pub generation: u64,
    pub candles: Vec<Candle>,
    pub lines: Vec<IndicatorLine>,
    pub connection: ConnectionState,
    pub load: LoadState,
    pub latest: Option<LatestInfo>,
    pub version: u64,
}

// =============================================================================
// Live sink bound to one generation
// =============================================================================

struct SessionSink {
    session: Arc<RwLock<ChartSession>>,
    version: Arc<AtomicU64>,
    generation: u64,
}

impl LiveSink for SessionSink {
    fn on_candle(&self, candle: Candle) {
        if self.session.write().apply_live(self.generation, candle) {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_state(&self, state: &ConnectionState) {
        if self.session.write().apply_connection(self.generation, state.clone()) {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// =============================================================================
// ChartService
// =============================================================================

struct ActiveFeed {
    stop: Arc<watch::Sender<bool>>,
    stream: JoinHandle<ConnectionState>,
}

/// Owns the single chart session and the background tasks that feed it.
pub struct ChartService {
    config: SyncConfig,
    loader: HistoricalLoader,
    connector: Arc<dyn LiveConnector>,
    session: Arc<RwLock<ChartSession>>,
    /// Bumped after every mutation so readers can skip unchanged snapshots.
    version: Arc<AtomicU64>,
    active: Mutex<Option<ActiveFeed>>,
}

impl ChartService {
    /// Service wired to the real network transports.
    pub fn new(config: SyncConfig) -> Result<Self, SyncError> {
        let loader = HistoricalLoader::from_config(&config)?;
        let connector = Arc::new(NetworkConnector::new(loader.clone(), config.connect_timeout()));
        Self::with_connector(config, loader, connector)
    }

    pub fn with_connector(
        config: SyncConfig,
        loader: HistoricalLoader,
        connector: Arc<dyn LiveConnector>,
    ) -> Result<Self, SyncError> {
        let indicators = IndicatorEngine::with_configs(&config.moving_averages, &CandleSeries::default())?;
        let session = ChartSession::new(indicators, config.pending_tick_capacity);
        Ok(Self {
            config,
            loader,
            connector,
            session: Arc::new(RwLock::new(session)),
            version: Arc::new(AtomicU64::new(1)),
            active: Mutex::new(None),
        })
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Switch the chart to (provider, symbol, timeframe).
    ///
    /// Symbol and timeframe problems are returned here, before anything is
    /// spawned or the current session is touched.  Otherwise the previous
    /// feed is stopped, a new generation begins and the history fetch and live
    /// channel start concurrently.  Must be called within a tokio runtime.
    pub fn open(&self, provider: ProviderId, raw_symbol: &str, timeframe: Timeframe) -> Result<LoadTicket, SyncError> {
        let adapter = ProviderAdapter::new(provider, &self.config.provider_overrides, self.config.poll_interval());
        let symbol = adapter.format_symbol(raw_symbol)?;
        let channel = adapter.live_channel(&symbol, timeframe)?;

        self.stop_active();

        let identity = SessionIdentity {
            provider,
            symbol: symbol.clone(),
            timeframe,
        };
        info!(session = %identity, "opening chart session");
        let generation = self.session.write().begin(identity);
        self.bump();

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);

        let manager = LiveStreamManager::new(
            adapter.clone(),
            symbol.clone(),
            timeframe,
            channel,
            self.config.backoff_policy(),
            self.connector.clone(),
        );
        let sink = Arc::new(SessionSink {
            session: self.session.clone(),
            version: self.version.clone(),
            generation,
        });
        let stream = tokio::spawn(manager.run(sink, stop_rx));

        let (ticket_tx, ticket_rx) = oneshot::channel();
        let loader = self.loader.clone();
        let session = self.session.clone();
        let version = self.version.clone();
        let limit = self.config.history_limit;
        let stream_stop = stop_tx.clone();
        tokio::spawn(async move {
            let result = loader.load(&adapter, &symbol, timeframe, limit).await;
            let applied = session.write().apply_seed(generation, result.clone());
            if !applied {
                let _ = ticket_tx.send(Err(SyncError::Superseded));
                return;
            }
            version.fetch_add(1, Ordering::SeqCst);

            let outcome = match result {
                Ok(history) => {
                    let candles = session.read().series().len();
                    Ok(LoadSummary {
                        generation,
                        candles,
                        thin: history.thin,
                    })
                }
                Err(e) => {
                    error!(generation, provider = %adapter.id(), symbol = %symbol, error = %e, "history load failed; stopping live channel");
                    let _ = stream_stop.send(true);
                    Err(e)
                }
            };
            let _ = ticket_tx.send(outcome);
        });

        *self.active.lock() = Some(ActiveFeed { stop: stop_tx, stream });
        Ok(LoadTicket {
            generation,
            rx: ticket_rx,
        })
    }

    fn stop_active(&self) -> Option<JoinHandle<ConnectionState>> {
        let feed = self.active.lock().take()?;
        let _ = feed.stop.send(true);
        Some(feed.stream)
    }

    /// Stop the live channel and detach from the current identity.
    pub async fn close(&self) {
        let stream = self.stop_active();
        self.session.write().close();
        self.bump();
        if let Some(handle) = stream {
            match handle.await {
                Ok(state) => info!(frames = state.frames_received, dropped = state.dropped_frames, "live channel finished"),
                Err(e) => warn!(error = %e, "live channel task ended abnormally"),
            }
        }
    }

    pub fn snapshot(&self) -> ChartSnapshot {
        let version = self.version();
        self.session.read().snapshot(version)
    }

    // --- Indicator registry ---------------------------------------------------

    pub fn add_moving_average(&self, config: MovingAverageConfig) -> Result<(), SyncError> {
        {
            let mut guard = self.session.write();
            let session = &mut *guard;
            session.indicators.add(config, &session.series)?;
        }
        self.bump();
        Ok(())
    }

    pub fn remove_moving_average(&self, id: &str) -> Result<MovingAverageConfig, SyncError> {
        let removed = self.session.write().indicators.remove(id)?;
        self.bump();
        Ok(removed)
    }

    pub fn update_moving_average(&self, id: &str, update: MovingAverageUpdate) -> Result<(), SyncError> {
        {
            let mut guard = self.session.write();
            let session = &mut *guard;
            session.indicators.update(id, update, &session.series)?;
        }
        self.bump();
        Ok(())
    }

    pub fn moving_averages(&self) -> Vec<MovingAverageConfig> {
        self.session.read().indicators.configs()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::*;
    use crate::indicators::MovingAverageKind;
    use crate::market_data::{LiveConnection, StreamPhase};
    use crate::providers::{ChannelDescriptor, LiveFrame};
    use crate::runtime_config::ProviderEndpoints;

    fn candle(time: i64, close: f64) -> Candle {
        Candle::new(time, close, close, close, close, Some(1.0))
    }

    fn identity(symbol: &str) -> SessionIdentity {
        SessionIdentity {
            provider: ProviderId::Binance,
            symbol: symbol.into(),
            timeframe: Timeframe::M1,
        }
    }

    fn sma2_session(pending_capacity: usize) -> ChartSession {
        let configs = [MovingAverageConfig::new("sma2", MovingAverageKind::Sma, 2, "#fff")];
        ChartSession::new(
            IndicatorEngine::with_configs(&configs, &CandleSeries::default()).unwrap(),
            pending_capacity,
        )
    }

    // --- ChartSession (pure) -------------------------------------------------

    #[test]
    fn merge_scenario_through_session() {
        let mut session = sma2_session(16);
        let gen = session.begin(identity("BTCUSDT"));
        let seed = LoadedHistory::from_raw(vec![candle(0, 10.0), candle(60, 12.0), candle(120, 11.0)]);
        assert!(session.apply_seed(gen, Ok(seed)));

        assert!(session.apply_live(gen, candle(120, 13.0)));
        assert_eq!(session.series().last().unwrap().close, 13.0);
        assert!(session.apply_live(gen, candle(180, 15.0)));
        assert_eq!(session.series().len(), 4);
        assert!(!session.apply_live(gen, candle(60, 99.0)));
        assert_eq!(session.series().len(), 4);

        let sma: Vec<f64> = session.indicators().line("sma2").unwrap().points().iter().map(|p| p.value).collect();
        assert_eq!(sma, vec![11.0, 12.5, 14.0]);
        let snap = session.snapshot(7);
        assert_eq!(snap.latest.unwrap().price, 15.0);
        assert_eq!(snap.version, 7);
    }

    #[test]
    fn ticks_before_seed_are_buffered_and_replayed() {
        let mut session = sma2_session(2);
        let gen = session.begin(identity("BTCUSDT"));
        assert!(session.apply_live(gen, candle(0, 1.0))); // evicted by capacity
        assert!(session.apply_live(gen, candle(60, 5.0))); // older than seed tail, discarded on replay
        assert!(session.apply_live(gen, candle(180, 8.0)));
        assert!(session.series().is_empty());

        let seed = LoadedHistory::from_raw(vec![candle(0, 10.0), candle(60, 12.0), candle(120, 11.0)]);
        assert!(session.apply_seed(gen, Ok(seed)));
        let times: Vec<i64> = session.series().candles().iter().map(|c| c.time).collect();
        assert_eq!(times, vec![0, 60, 120, 180]);
        assert_eq!(session.series().candles()[1].close, 12.0);
        assert_eq!(session.load_state(), &LoadState::Ready { thin: false });
    }

    #[test]
    fn stale_generation_results_are_dropped() {
        let mut session = sma2_session(16);
        let old = session.begin(identity("BTCUSDT"));
        let new = session.begin(identity("ETHUSDT"));
        assert_ne!(old, new);

        let seed = LoadedHistory::from_raw(vec![candle(0, 1.0), candle(60, 2.0)]);
        assert!(!session.apply_seed(old, Ok(seed)));
        assert!(!session.apply_live(old, candle(120, 3.0)));
        assert!(!session.apply_connection(old, ConnectionState::new()));
        assert!(session.series().is_empty());
        assert_eq!(session.load_state(), &LoadState::Loading);
        assert_eq!(session.identity().unwrap().symbol, "ETHUSDT");
    }

    #[test]
    fn failed_seed_surfaces_error_and_drops_ticks() {
        let mut session = sma2_session(16);
        let gen = session.begin(identity("BTCUSDT"));
        session.apply_live(gen, candle(0, 1.0));
        assert!(session.apply_seed(gen, Err(SyncError::FetchTimeout { secs: 10 })));
        assert_eq!(
            session.load_state(),
            &LoadState::Failed {
                error: SyncError::FetchTimeout { secs: 10 }
            }
        );
        assert!(!session.apply_live(gen, candle(60, 2.0)));
        assert!(session.series().is_empty());
    }

    // --- ChartService (tasks) -----------------------------------------------

    /// Connections never produce frames; `open` counts live ones.
    struct IdleConnector {
        open: Arc<AtomicUsize>,
    }

    struct IdleConnection {
        open: Arc<AtomicUsize>,
    }

    impl Drop for IdleConnection {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LiveConnector for IdleConnector {
        async fn connect(&self, _channel: &ChannelDescriptor, _reconnect: bool) -> Result<Box<dyn LiveConnection>, SyncError> {
            self.open.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(IdleConnection { open: self.open.clone() }))
        }
    }

    #[async_trait]
    impl LiveConnection for IdleConnection {
        async fn next_frame(&mut self) -> Result<Option<LiveFrame>, SyncError> {
            std::future::pending().await
        }

        async fn send_text(&mut self, _text: String) -> Result<(), SyncError> {
            Ok(())
        }
    }

    /// History server: `SLOWUSDT` answers after 300 ms, `DOWNUSDT` fails, any
    /// other symbol answers immediately.
    async fn history_server() -> String {
        let router = Router::new().route(
            "/fapi/v1/klines",
            get(|Query(params): Query<std::collections::HashMap<String, String>>| async move {
                let symbol = params.get("symbol").cloned().unwrap_or_default();
                match symbol.as_str() {
                    "SLOWUSDT" => {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        (StatusCode::OK, r#"[[0,"1","1","1","1","1"]]"#.to_string())
                    }
                    "DOWNUSDT" => (StatusCode::BAD_GATEWAY, "upstream down".to_string()),
                    _ => (
                        StatusCode::OK,
                        r#"[[0,"10","10","10","10","1"],[60000,"12","12","12","12","1"],[120000,"11","11","11","11","1"]]"#
                            .to_string(),
                    ),
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        format!("http://{addr}")
    }

    fn service(base: &str, open: Arc<AtomicUsize>) -> ChartService {
        let config = SyncConfig {
            provider_overrides: ProviderEndpoints {
                binance_rest: base.to_string(),
                ..ProviderEndpoints::default()
            },
            fetch_timeout_secs: 2,
            ..SyncConfig::default()
        };
        let loader = HistoricalLoader::from_config(&config).unwrap();
        ChartService::with_connector(config, loader, Arc::new(IdleConnector { open })).unwrap()
    }

    #[tokio::test]
    async fn open_seeds_series_and_streams() {
        let open = Arc::new(AtomicUsize::new(0));
        let svc = service(&history_server().await, open.clone());

        let summary = svc.open(ProviderId::Binance, "btc/usdt", Timeframe::M1).unwrap().wait().await.unwrap();
        assert_eq!(summary.candles, 3);
        assert!(!summary.thin);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = svc.snapshot();
        assert_eq!(snap.identity.as_ref().unwrap().symbol, "BTCUSDT");
        assert_eq!(snap.candles.len(), 3);
        assert_eq!(snap.connection.phase, StreamPhase::Streaming);
        assert_eq!(snap.lines.len(), 4); // default averages, all empty on 3 candles
        assert!(snap.lines.iter().all(|l| l.points().is_empty()));
        assert_eq!(open.load(Ordering::SeqCst), 1);

        svc.close().await;
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(svc.snapshot().identity.is_none());
    }

    #[tokio::test]
    async fn identity_change_cancels_previous_session() {
        let open = Arc::new(AtomicUsize::new(0));
        let svc = service(&history_server().await, open.clone());

        let slow = svc.open(ProviderId::Binance, "SLOWUSDT", Timeframe::M1).unwrap();
        let fast = svc.open(ProviderId::Binance, "ETHUSDT", Timeframe::M1).unwrap();
        assert!(fast.generation() > slow.generation());

        assert_eq!(fast.wait().await.unwrap().candles, 3);
        assert_eq!(slow.wait().await, Err(SyncError::Superseded));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = svc.snapshot();
        assert_eq!(snap.identity.as_ref().unwrap().symbol, "ETHUSDT");
        assert_eq!(snap.candles.len(), 3);
        assert_eq!(snap.candles[2].close, 11.0);
        // Only the new session's channel is still connected.
        assert_eq!(open.load(Ordering::SeqCst), 1);
        svc.close().await;
    }

    #[tokio::test]
    async fn failed_load_stops_live_channel() {
        let open = Arc::new(AtomicUsize::new(0));
        let svc = service(&history_server().await, open.clone());

        let err = svc
            .open(ProviderId::Binance, "DOWNUSDT", Timeframe::M1)
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::TransportError(_)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = svc.snapshot();
        assert!(matches!(snap.load, LoadState::Failed { .. }));
        assert_eq!(snap.connection.phase, StreamPhase::Closed);
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn bad_input_is_rejected_before_anything_starts() {
        let open = Arc::new(AtomicUsize::new(0));
        let svc = service("http://127.0.0.1:1", open.clone());
        let before = svc.snapshot().generation;

        let err = svc.open(ProviderId::Oanda, "AAPL", Timeframe::H1).unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedSymbol { .. }));
        let err = svc.open(ProviderId::Fmp, "AAPL", Timeframe::M3).unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedTimeframe { .. }));

        assert_eq!(svc.snapshot().generation, before);
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn moving_average_registry_through_service() {
        let open = Arc::new(AtomicUsize::new(0));
        let svc = service(&history_server().await, open);
        svc.open(ProviderId::Binance, "BTCUSDT", Timeframe::M1).unwrap().wait().await.unwrap();

        let v0 = svc.version();
        svc.add_moving_average(MovingAverageConfig::new("sma2", MovingAverageKind::Sma, 2, "#abc"))
            .unwrap();
        assert!(svc.version() > v0);
        let snap = svc.snapshot();
        let line = snap.lines.iter().find(|l| l.config().id == "sma2").unwrap();
        assert_eq!(line.points().len(), 2);

        svc.update_moving_average(
            "sma2",
            MovingAverageUpdate {
                visible: Some(false),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(svc.snapshot().lines.iter().all(|l| l.config().id != "sma2"));

        assert!(svc.add_moving_average(MovingAverageConfig::new("sma2", MovingAverageKind::Ema, 3, "")).is_err());
        assert_eq!(svc.remove_moving_average("sma2").unwrap().period, 2);
        assert_eq!(svc.moving_averages().len(), 4);
        svc.close().await;
    }
}
