pub mod candle_series;
pub mod history;
pub mod live_stream;
pub mod transport;

pub use candle_series::{normalize_history, CandleSeries, LoadedHistory, MergeOutcome};
pub use history::HistoricalLoader;
pub use live_stream::{BackoffPolicy, ConnectionState, LiveSink, LiveStreamManager, StreamPhase};
pub use transport::{LiveConnection, LiveConnector, NetworkConnector};
