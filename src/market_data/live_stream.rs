// =============================================================================
// Live Stream Manager: connection state machine with exponential backoff
// =============================================================================
//
//   Idle ──start──▶ Connecting ──ok──▶ Streaming ──frame──▶ Streaming
//                      │  ▲                │
//                 error│  │delay elapsed   │closed / error
//                      ▼  │                ▼
//                     Backoff ◀────────────┘
//
//   any ──stop──▶ Closed   (terminal; later transitions are ignored)
//
// One manager drives one channel for one session generation and is never
// restarted once Closed.
// =============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::transport::{LiveConnection, LiveConnector};
use crate::error::SyncError;
use crate::providers::{ChannelDescriptor, LiveFrame, ProviderAdapter};
use crate::types::{Candle, Timeframe};

// ---------------------------------------------------------------------------
// Backoff policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Consecutive failures tolerated before giving up; `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^(retry - 1)`, capped.  `retry` counts from 1.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum StreamPhase {
    Idle,
    Connecting,
    Streaming,
    Backoff {
        #[serde(rename = "delay_ms", serialize_with = "serialize_millis")]
        delay: Duration,
    },
    Closed,
}

fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl fmt::Display for StreamPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Streaming => write!(f, "streaming"),
            Self::Backoff { delay } => write!(f, "backoff({}ms)", delay.as_millis()),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Observable state of one live channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionState {
    pub phase: StreamPhase,
    /// Consecutive failed attempts since the last successful connect.
    pub retry_count: u32,
    pub last_error: Option<SyncError>,
    pub frames_received: u64,
    /// Frames that could not be inflated or decoded.
    pub dropped_frames: u64,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            phase: StreamPhase::Idle,
            retry_count: 0,
            last_error: None,
            frames_received: 0,
            dropped_frames: 0,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.phase == StreamPhase::Closed
    }

    fn ignored(&self, event: &str) -> bool {
        if self.is_closed() {
            debug!(event, "transition ignored: channel closed");
            return true;
        }
        false
    }

    /// Idle → Connecting.
    pub fn start(&mut self) {
        if self.ignored("start") {
            return;
        }
        if self.phase == StreamPhase::Idle {
            self.phase = StreamPhase::Connecting;
        }
    }

    /// Connecting → Streaming; resets the retry counter.
    pub fn on_connected(&mut self) {
        if self.ignored("connected") {
            return;
        }
        self.phase = StreamPhase::Streaming;
        self.retry_count = 0;
    }

    /// Connecting/Streaming → Backoff, or → Closed once `max_retries` is
    /// exceeded.  Returns the delay to wait before the next attempt.
    pub fn on_failure(&mut self, err: SyncError, policy: &BackoffPolicy) -> Option<Duration> {
        if self.ignored("failure") {
            return None;
        }
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(err);

        if policy.max_retries.is_some_and(|max| self.retry_count > max) {
            self.phase = StreamPhase::Closed;
            return None;
        }
        let delay = policy.delay_for(self.retry_count);
        self.phase = StreamPhase::Backoff { delay };
        Some(delay)
    }

    /// Backoff → Connecting.
    pub fn on_backoff_elapsed(&mut self) {
        if self.ignored("backoff elapsed") {
            return;
        }
        if matches!(self.phase, StreamPhase::Backoff { .. }) {
            self.phase = StreamPhase::Connecting;
        }
    }

    pub fn on_frame(&mut self) {
        if !self.ignored("frame") {
            self.frames_received += 1;
        }
    }

    pub fn on_dropped_frame(&mut self) {
        if !self.ignored("dropped frame") {
            self.dropped_frames += 1;
        }
    }

    /// any → Closed.
    pub fn close(&mut self) {
        self.phase = StreamPhase::Closed;
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Receives what the channel produces.  Implementations must not block.
pub trait LiveSink: Send + Sync {
    fn on_candle(&self, candle: Candle);
    fn on_state(&self, state: &ConnectionState);
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

enum Exit {
    Stopped,
    Failed(SyncError),
}

pub struct LiveStreamManager {
    adapter: ProviderAdapter,
    symbol: String,
    timeframe: Timeframe,
    channel: ChannelDescriptor,
    policy: BackoffPolicy,
    connector: Arc<dyn LiveConnector>,
    state: ConnectionState,
}

impl LiveStreamManager {
    pub fn new(
        adapter: ProviderAdapter,
        symbol: impl Into<String>,
        timeframe: Timeframe,
        channel: ChannelDescriptor,
        policy: BackoffPolicy,
        connector: Arc<dyn LiveConnector>,
    ) -> Self {
        Self {
            adapter,
            symbol: symbol.into(),
            timeframe,
            channel,
            policy,
            connector,
            state: ConnectionState::new(),
        }
    }

    /// Drive the channel until `stop` flips to `true` (or its sender is
    /// dropped), or until `max_retries` is exhausted.  Returns the final state,
    /// which is always `Closed`.
    pub async fn run(mut self, sink: Arc<dyn LiveSink>, mut stop: watch::Receiver<bool>) -> ConnectionState {
        let provider = self.adapter.id();
        let mut attempts: u32 = 0;
        self.state.start();
        sink.on_state(&self.state);
        info!(provider = %provider, symbol = %self.symbol, timeframe = %self.timeframe, "live channel starting");

        loop {
            let reconnect = attempts > 0;
            attempts = attempts.saturating_add(1);
            let attempt = tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop) => Exit::Stopped,
                connected = self.connector.connect(&self.channel, reconnect) => match connected {
                    Ok(conn) => {
                        self.state.on_connected();
                        sink.on_state(&self.state);
                        info!(provider = %provider, symbol = %self.symbol, "live channel streaming");
                        self.stream(conn, sink.as_ref(), &mut stop).await
                    }
                    Err(e) => Exit::Failed(e),
                },
            };

            let err = match attempt {
                Exit::Stopped => break,
                Exit::Failed(err) => err,
            };

            let Some(delay) = self.state.on_failure(err.clone(), &self.policy) else {
                error!(provider = %provider, symbol = %self.symbol, retries = self.state.retry_count, error = %err, "live channel giving up");
                sink.on_state(&self.state);
                return self.state;
            };
            sink.on_state(&self.state);
            warn!(
                provider = %provider,
                symbol = %self.symbol,
                retry = self.state.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "live channel backing off"
            );

            tokio::select! {
                biased;
                _ = wait_for_stop(&mut stop) => break,
                _ = tokio::time::sleep(delay) => {}
            }
            self.state.on_backoff_elapsed();
            sink.on_state(&self.state);
        }

        self.state.close();
        sink.on_state(&self.state);
        info!(provider = %provider, symbol = %self.symbol, "live channel closed");
        self.state
    }

    async fn stream(
        &mut self,
        mut conn: Box<dyn LiveConnection>,
        sink: &dyn LiveSink,
        stop: &mut watch::Receiver<bool>,
    ) -> Exit {
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_for_stop(stop) => return Exit::Stopped,
                next = conn.next_frame() => next,
            };
            match next {
                Ok(Some(frame)) => {
                    if let Err(e) = self.handle_frame(conn.as_mut(), frame, sink).await {
                        return Exit::Failed(e);
                    }
                }
                Ok(None) => return Exit::Failed(SyncError::TransportError("connection closed by peer".into())),
                Err(e) => return Exit::Failed(e),
            }
        }
    }

    /// Only a failed heartbeat write is fatal; bad frames are counted and
    /// skipped.
    async fn handle_frame(
        &mut self,
        conn: &mut dyn LiveConnection,
        frame: LiveFrame,
        sink: &dyn LiveSink,
    ) -> Result<(), SyncError> {
        self.state.on_frame();

        let text = match self.adapter.frame_text(frame) {
            Ok(text) => text,
            Err(e) => {
                self.state.on_dropped_frame();
                warn!(provider = %self.adapter.id(), error = %e, dropped = self.state.dropped_frames, "dropping undecodable frame");
                sink.on_state(&self.state);
                return Ok(());
            }
        };

        if let Some(reply) = self.adapter.heartbeat_reply(&text) {
            debug!(provider = %self.adapter.id(), "answering heartbeat");
            return conn.send_text(reply).await;
        }

        match self.adapter.decode_live_message(&self.symbol, self.timeframe, &text) {
            Ok(Some(candle)) => {
                debug!(time = candle.time, close = candle.close, "live candle");
                sink.on_candle(candle);
            }
            Ok(None) => debug!("control frame"),
            Err(e) => {
                self.state.on_dropped_frame();
                warn!(provider = %self.adapter.id(), error = %e, dropped = self.state.dropped_frames, "dropping undecodable frame");
            }
        }
        sink.on_state(&self.state);
        Ok(())
    }
}

/// Resolves once the stop flag is set or its sender is gone.
async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
