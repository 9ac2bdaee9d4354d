// =============================================================================
// Live transports: WebSocket push feeds and fixed-interval REST polling
// =============================================================================
//
// The stream manager only sees the `LiveConnector` / `LiveConnection` seam;
// the concrete transports below open sockets or timers for a
// `ChannelDescriptor`.  Tests substitute scripted connectors.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::history::HistoricalLoader;
use crate::error::SyncError;
use crate::providers::{ChannelDescriptor, LiveFrame, RequestDescriptor};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Opens a transport for a channel.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// `reconnect` is set for every attempt after the first one of a channel.
    async fn connect(&self, channel: &ChannelDescriptor, reconnect: bool) -> Result<Box<dyn LiveConnection>, SyncError>;
}

/// An established transport.
#[async_trait]
pub trait LiveConnection: Send {
    /// Next payload.  `Ok(None)` means the peer closed the transport.
    async fn next_frame(&mut self) -> Result<Option<LiveFrame>, SyncError>;

    /// Write a text message (subscriptions, heartbeat replies).
    async fn send_text(&mut self, text: String) -> Result<(), SyncError>;
}

// ---------------------------------------------------------------------------
// Default connector
// ---------------------------------------------------------------------------

/// Connector used outside of tests.
#[derive(Debug, Clone)]
pub struct NetworkConnector {
    loader: HistoricalLoader,
    connect_timeout: Duration,
}

impl NetworkConnector {
    pub fn new(loader: HistoricalLoader, connect_timeout: Duration) -> Self {
        Self {
            loader,
            connect_timeout,
        }
    }
}

#[async_trait]
impl LiveConnector for NetworkConnector {
    async fn connect(&self, channel: &ChannelDescriptor, reconnect: bool) -> Result<Box<dyn LiveConnection>, SyncError> {
        match channel {
            ChannelDescriptor::WebSocket { url, subscribe } => {
                let mut conn = WsConnection::open(url, self.connect_timeout).await?;
                if let Some(msg) = subscribe {
                    debug!(url = %url, "sending subscription");
                    conn.send_text(msg.clone()).await?;
                }
                Ok(Box::new(conn))
            }
            ChannelDescriptor::Poll { request, every } => {
                info!(url = %request.url, every_secs = every.as_secs(), reconnect, "starting poll channel");
                Ok(Box::new(PollConnection::new(self.loader.clone(), request.clone(), *every, reconnect)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsConnection {
    pub async fn open(url: &str, connect_timeout: Duration) -> Result<Self, SyncError> {
        let (stream, _response) = tokio::time::timeout(connect_timeout, connect_async(url))
            .await
            .map_err(|_| SyncError::TransportError(format!("connect to {url} timed out after {connect_timeout:?}")))??;
        info!(url = %url, "websocket connected");
        Ok(Self { stream })
    }
}

#[async_trait]
impl LiveConnection for WsConnection {
    async fn next_frame(&mut self) -> Result<Option<LiveFrame>, SyncError> {
        while let Some(msg) = self.stream.next().await {
            match msg? {
                Message::Text(text) => return Ok(Some(LiveFrame::Text(text))),
                Message::Binary(bytes) => return Ok(Some(LiveFrame::Binary(bytes))),
                Message::Close(frame) => {
                    debug!(?frame, "websocket closed by peer");
                    return Ok(None);
                }
                // Protocol ping/pong is answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Ok(None)
    }

    async fn send_text(&mut self, text: String) -> Result<(), SyncError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// Re-issues one REST request every `every`; each response body is a frame.
///
/// A fresh channel waits one period before the first fetch, since the seed
/// just covered "now".  A reconnect fetches immediately so the gap after a
/// backoff is not stretched by another full period.
pub struct PollConnection {
    loader: HistoricalLoader,
    request: RequestDescriptor,
    ticker: Interval,
}

impl PollConnection {
    pub fn new(loader: HistoricalLoader, request: RequestDescriptor, every: Duration, immediate: bool) -> Self {
        let start = if immediate { Instant::now() } else { Instant::now() + every };
        let mut ticker = interval_at(start, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            loader,
            request,
            ticker,
        }
    }
}

#[async_trait]
impl LiveConnection for PollConnection {
    async fn next_frame(&mut self) -> Result<Option<LiveFrame>, SyncError> {
        self.ticker.tick().await;
        let body = self.loader.fetch_body(&self.request).await?;
        Ok(Some(LiveFrame::Text(body)))
    }

    async fn send_text(&mut self, _text: String) -> Result<(), SyncError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
