// mdhub/src/adapter.rs
// The data-source adapter contract.
//
// Adapters are pluggable integrations with external data vendors. They are
// fire-and-forget: a dispatch call returns immediately and the result (data,
// terminal error, connectivity change) arrives later on the event sink the
// broker installed. Adapter callbacks run on adapter-owned threads; the sink
// is the only legal hand-off into broker state.

use crate::base::Result;
use crate::data::{HistoricalDataRequest, OHLCBar, RealTimeDataRequest, RealTimeEvent};
use crossbeam_channel::Sender;

/// Events a historical data source raises toward its broker.
#[derive(Debug, Clone)]
pub enum HistoricalEvent {
  /// Bars arrived for a dispatched (sub-)request. An empty list is a valid
  /// no-data-found result, not an error.
  DataArrived {
    request: HistoricalDataRequest,
    bars: Vec<OHLCBar>,
  },
  /// The request terminally failed (after the adapter's own retry policy).
  RequestFailed {
    request: HistoricalDataRequest,
    message: String,
  },
  Connected { source: String },
  Disconnected { source: String },
}

/// Events a real-time data source raises toward its broker.
#[derive(Debug, Clone)]
pub enum LiveDataEvent {
  /// A tick or bar for an active stream.
  Data {
    stream_id: i64,
    event: RealTimeEvent,
  },
  /// The stream terminally failed; the broker tears down its registry entry.
  StreamFailed {
    stream_id: i64,
    message: String,
  },
  Connected { source: String },
  Disconnected { source: String },
}

/// A source of historical bars.
pub trait HistoricalDataSource: Send + Sync {
  fn name(&self) -> &str;
  fn is_connected(&self) -> bool;
  fn connect(&self) -> Result<()>;
  fn disconnect(&self);

  /// Install the broker's event sink. Called once at registration, before
  /// any dispatch.
  fn set_event_sink(&self, sink: Sender<HistoricalEvent>);

  /// Dispatch a request. Returns once the request is accepted; data or a
  /// terminal error arrives on the event sink.
  fn request_historical_data(&self, request: &HistoricalDataRequest) -> Result<()>;
}

/// A source of live ticks and bars.
pub trait RealTimeDataSource: Send + Sync {
  fn name(&self) -> &str;
  fn is_connected(&self) -> bool;
  fn connect(&self) -> Result<()>;
  fn disconnect(&self);

  fn set_event_sink(&self, sink: Sender<LiveDataEvent>);

  /// Start a live stream; returns the adapter-local stream ID used to
  /// correlate events and cancellation.
  fn subscribe(&self, request: &RealTimeDataRequest) -> Result<i64>;

  fn cancel(&self, stream_id: i64) -> Result<()>;
}
