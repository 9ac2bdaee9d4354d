// =============================================================================
// candle-sync: headless chart feed runner
// =============================================================================
//
// Opens one chart session (provider, symbol, timeframe taken from the
// environment), keeps it synchronized and logs a summary every few seconds.
// Ctrl+C closes the live channel and exits.
// =============================================================================

use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candle_sync::runtime_config::SyncConfig;
use candle_sync::{ChartService, LoadState, ProviderId, Timeframe};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("CANDLE_SYNC_CONFIG").unwrap_or_else(|_| "candle_sync.json".into());
    let mut config = SyncConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(path = %config_path, error = %e, "Failed to load config, using defaults");
        SyncConfig::default()
    });

    if let Ok(proxy) = std::env::var("CANDLE_SYNC_PROXY") {
        config.proxy_url = Some(proxy).filter(|p| !p.trim().is_empty());
    }

    let provider: ProviderId = std::env::var("CANDLE_SYNC_PROVIDER")
        .unwrap_or_else(|_| "binance".into())
        .parse()?;
    let symbol = std::env::var("CANDLE_SYNC_SYMBOL").unwrap_or_else(|_| "BTCUSDT".into());
    let timeframe: Timeframe = std::env::var("CANDLE_SYNC_TIMEFRAME")
        .unwrap_or_else(|_| "1m".into())
        .parse()
        .context("invalid CANDLE_SYNC_TIMEFRAME")?;

    info!(
        provider = %provider,
        symbol = %symbol,
        timeframe = %timeframe,
        proxied = config.proxy_url.is_some(),
        "candle-sync starting"
    );

    // ── 2. Open the session ──────────────────────────────────────────────
    let service = ChartService::new(config).context("failed to build chart service")?;
    let ticket = service
        .open(provider, &symbol, timeframe)
        .with_context(|| format!("cannot open {provider} {symbol} {timeframe}"))?;

    tokio::spawn(async move {
        match ticket.wait().await {
            Ok(summary) => info!(candles = summary.candles, thin = summary.thin, "chart seeded"),
            Err(e) => error!(error = %e, "chart seed failed"),
        }
    });

    // ── 3. Periodic summary until Ctrl+C ─────────────────────────────────
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    let mut last_version = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {
                let version = service.version();
                if version == last_version {
                    continue;
                }
                last_version = version;

                let snap = service.snapshot();
                let load = match &snap.load {
                    LoadState::Ready { thin } => format!("ready(thin={thin})"),
                    LoadState::Failed { error } => format!("failed({error})"),
                    other => format!("{other:?}").to_lowercase(),
                };
                info!(
                    load = %load,
                    candles = snap.candles.len(),
                    last_close = snap.latest.map(|l| l.price),
                    phase = %snap.connection.phase,
                    retries = snap.connection.retry_count,
                    dropped = snap.connection.dropped_frames,
                    lines = snap.lines.len(),
                    "chart state"
                );
            }
        }
    }

    warn!("Shutdown signal received, closing live channel");
    service.close().await;
    info!("candle-sync shut down complete.");
    Ok(())
}
