// mdhub/src/adapter_sim.rs
// Simulated data source: an in-process adapter that serves deterministic
// synthetic bars and replays live data on a timer thread. Used by the
// server's sim profile and by the integration tests to exercise the broker
// paths (including failures) without a vendor connection.

use crate::adapter::{HistoricalDataSource, HistoricalEvent, LiveDataEvent, RealTimeDataSource};
use crate::base::{HubError, Result};
use crate::data::{BarFrequency, HistoricalDataRequest, OHLCBar, RealTimeDataRequest, RealTimeEvent};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

/// Deterministic synthetic bar for (instrument, frequency, bucket).
/// The same inputs always produce the same bar, so re-fetches and storage
/// re-reads line up exactly.
pub fn synth_bar(instrument_id: i64, frequency: BarFrequency, timestamp: DateTime<Utc>) -> OHLCBar {
  let step = step_seconds(frequency);
  let bucket = timestamp.timestamp() / step;
  let base_cents = 10_000 + (instrument_id % 50) * 100;
  let wiggle = (bucket.wrapping_mul(7919).wrapping_add(instrument_id.wrapping_mul(104_729))) % 200 - 100;
  let close = base_cents + wiggle;
  let mut bar = OHLCBar::new(
    timestamp,
    Decimal::new(close - 10, 2),
    Decimal::new(close + 25, 2),
    Decimal::new(close - 40, 2),
    Decimal::new(close, 2),
  );
  bar.volume = Some(1_000 + (bucket % 500));
  bar
}

fn step_seconds(frequency: BarFrequency) -> i64 {
  let secs = frequency.period().num_seconds();
  if secs <= 0 { 1 } else { secs }
}

/// Bars on the frequency grid covering `[start, end]`.
pub fn synth_series(
  instrument_id: i64,
  frequency: BarFrequency,
  start: DateTime<Utc>,
  end: DateTime<Utc>,
) -> Vec<OHLCBar> {
  let step = step_seconds(frequency);
  let mut ts_secs = start.timestamp();
  let rem = ts_secs.rem_euclid(step);
  if rem != 0 {
    ts_secs += step - rem; // first grid point at or after start
  }
  let mut bars = Vec::new();
  while ts_secs <= end.timestamp() {
    let ts = DateTime::<Utc>::from_timestamp(ts_secs, 0).unwrap_or(start);
    bars.push(synth_bar(instrument_id, frequency, ts));
    ts_secs += step;
  }
  bars
}

struct LiveStream {
  stop: Arc<AtomicBool>,
}

/// In-process simulated data source. Implements both adapter traits.
pub struct SimDataSource {
  name: String,
  connected: AtomicBool,
  hist_sink: Mutex<Option<Sender<HistoricalEvent>>>,
  live_sink: Mutex<Option<Sender<LiveDataEvent>>>,
  retry_policy: RetryPolicy,
  /// Next N historical requests hit a simulated pacing violation per
  /// attempt; retried per `retry_policy`.
  pacing_failures: AtomicU32,
  /// Next N historical requests fail terminally.
  scripted_errors: AtomicU32,
  next_stream_id: AtomicI64,
  live_streams: Mutex<HashMap<i64, LiveStream>>,
  /// Interval between emitted live bars.
  live_interval: std::time::Duration,
}

impl SimDataSource {
  pub fn new(name: &str) -> Arc<Self> {
    Self::with_retry_policy(name, RetryPolicy::default())
  }

  pub fn with_retry_policy(name: &str, retry_policy: RetryPolicy) -> Arc<Self> {
    Arc::new(SimDataSource {
      name: name.to_string(),
      connected: AtomicBool::new(true),
      hist_sink: Mutex::new(None),
      live_sink: Mutex::new(None),
      retry_policy,
      pacing_failures: AtomicU32::new(0),
      scripted_errors: AtomicU32::new(0),
      next_stream_id: AtomicI64::new(1),
      live_streams: Mutex::new(HashMap::new()),
      live_interval: std::time::Duration::from_millis(50),
    })
  }

  /// Make the next `count` historical requests fail terminally.
  pub fn script_errors(&self, count: u32) {
    self.scripted_errors.store(count, Ordering::SeqCst);
  }

  /// Make the next `count` request attempts hit a pacing violation.
  pub fn script_pacing_violations(&self, count: u32) {
    self.pacing_failures.store(count, Ordering::SeqCst);
  }

  /// Drop the connection, cancelling live streams and notifying both sinks.
  pub fn force_disconnect(&self) {
    self.connected.store(false, Ordering::SeqCst);
    let mut streams = self.live_streams.lock();
    for (_, stream) in streams.drain() {
      stream.stop.store(true, Ordering::SeqCst);
    }
    if let Some(sink) = self.hist_sink.lock().as_ref() {
      let _ = sink.send(HistoricalEvent::Disconnected { source: self.name.clone() });
    }
    if let Some(sink) = self.live_sink.lock().as_ref() {
      let _ = sink.send(LiveDataEvent::Disconnected { source: self.name.clone() });
    }
    info!("Sim source {} disconnected", self.name);
  }

  fn take_scripted_failure(counter: &AtomicU32) -> bool {
    counter
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
  }
}

impl HistoricalDataSource for SimDataSource {
  fn name(&self) -> &str {
    &self.name
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  fn connect(&self) -> Result<()> {
    if !self.connected.swap(true, Ordering::SeqCst) {
      info!("Sim source {} reconnected", self.name);
      if let Some(sink) = self.hist_sink.lock().as_ref() {
        let _ = sink.send(HistoricalEvent::Connected { source: self.name.clone() });
      }
      if let Some(sink) = self.live_sink.lock().as_ref() {
        let _ = sink.send(LiveDataEvent::Connected { source: self.name.clone() });
      }
    }
    Ok(())
  }

  fn disconnect(&self) {
    self.force_disconnect();
  }

  fn set_event_sink(&self, sink: Sender<HistoricalEvent>) {
    *self.hist_sink.lock() = Some(sink);
  }

  fn request_historical_data(&self, request: &HistoricalDataRequest) -> Result<()> {
    if !HistoricalDataSource::is_connected(self) {
      return Err(HubError::SourceDisconnected(self.name.clone()));
    }
    let sink = self
      .hist_sink
      .lock()
      .clone()
      .ok_or_else(|| HubError::InternalError(format!("sim source {} has no event sink", self.name)))?;
    let instrument_id = request
      .instrument
      .id
      .ok_or_else(|| HubError::InstrumentWithoutId(request.instrument.symbol.clone()))?;

    let scripted_error = Self::take_scripted_failure(&self.scripted_errors);
    let request = request.clone();
    let name = self.name.clone();
    let policy = self.retry_policy.clone();

    // Claim this request's pacing hits up front so the worker thread owns
    // no shared state.
    let mut pacing_hits = 0u32;
    while Self::take_scripted_failure(&self.pacing_failures) {
      pacing_hits += 1;
    }

    std::thread::Builder::new()
      .name(format!("sim-hist-{}", request.assigned_id))
      .spawn(move || {
        if scripted_error {
          debug!("Sim source {} failing request {} by script", name, request.assigned_id);
          let _ = sink.send(HistoricalEvent::RequestFailed {
            request,
            message: "scripted failure".to_string(),
          });
          return;
        }
        let mut attempt = 0u32;
        while attempt < pacing_hits {
          attempt += 1;
          match policy.next_delay(attempt) {
            Some(delay) => {
              debug!("Sim source {}: pacing violation on attempt {}, retrying in {:?}", name, attempt, delay);
              std::thread::sleep(delay);
            }
            None => {
              warn!("Sim source {}: pacing retries exhausted for {}", name, request.assigned_id);
              let _ = sink.send(HistoricalEvent::RequestFailed {
                request,
                message: "pacing violation: retry attempts exhausted".to_string(),
              });
              return;
            }
          }
        }
        let bars = synth_series(instrument_id, request.frequency, request.start_date, request.end_date);
        debug!(
          "Sim source {} serving {} bars for assigned ID {}",
          name, bars.len(), request.assigned_id
        );
        let _ = sink.send(HistoricalEvent::DataArrived { request, bars });
      })
      .map_err(|e| HubError::InternalError(format!("spawn sim worker: {}", e)))?;
    Ok(())
  }
}

impl RealTimeDataSource for SimDataSource {
  fn name(&self) -> &str {
    &self.name
  }

  fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  fn connect(&self) -> Result<()> {
    HistoricalDataSource::connect(self)
  }

  fn disconnect(&self) {
    self.force_disconnect();
  }

  fn set_event_sink(&self, sink: Sender<LiveDataEvent>) {
    *self.live_sink.lock() = Some(sink);
  }

  fn subscribe(&self, request: &RealTimeDataRequest) -> Result<i64> {
    if !RealTimeDataSource::is_connected(self) {
      return Err(HubError::SourceDisconnected(self.name.clone()));
    }
    let sink = self
      .live_sink
      .lock()
      .clone()
      .ok_or_else(|| HubError::InternalError(format!("sim source {} has no event sink", self.name)))?;
    let instrument_id = request
      .instrument
      .id
      .ok_or_else(|| HubError::InstrumentWithoutId(request.instrument.symbol.clone()))?;

    let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
    let stop = Arc::new(AtomicBool::new(false));
    self.live_streams.lock().insert(stream_id, LiveStream { stop: stop.clone() });

    let frequency = request.frequency;
    let interval = self.live_interval;
    let name = self.name.clone();
    std::thread::Builder::new()
      .name(format!("sim-live-{}", stream_id))
      .spawn(move || {
        debug!("Sim source {} starting live stream {}", name, stream_id);
        while !stop.load(Ordering::SeqCst) {
          std::thread::sleep(interval);
          if stop.load(Ordering::SeqCst) {
            break;
          }
          let now = Utc::now();
          let event = if frequency == BarFrequency::Tick {
            let bar = synth_bar(instrument_id, BarFrequency::OneSecond, now);
            RealTimeEvent::Tick {
              instrument_id,
              timestamp: now,
              price: bar.close,
              size: Some(1),
            }
          } else {
            RealTimeEvent::Bar {
              instrument_id,
              frequency,
              bar: synth_bar(instrument_id, frequency, now),
            }
          };
          if sink.send(LiveDataEvent::Data { stream_id, event }).is_err() {
            break;
          }
        }
        debug!("Sim source {} live stream {} stopped", name, stream_id);
      })
      .map_err(|e| HubError::InternalError(format!("spawn sim live worker: {}", e)))?;
    Ok(stream_id)
  }

  fn cancel(&self, stream_id: i64) -> Result<()> {
    match self.live_streams.lock().remove(&stream_id) {
      Some(stream) => {
        stream.stop.store(true, Ordering::SeqCst);
        Ok(())
      }
      None => Err(HubError::InternalError(format!("sim stream {} not found", stream_id))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::{Duration as ChronoDuration, TimeZone};

  #[test]
  fn synth_series_is_deterministic_and_on_grid() {
    let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2020, 1, 10, 0, 0, 0).unwrap();
    let a = synth_series(7, BarFrequency::OneDay, start, end);
    let b = synth_series(7, BarFrequency::OneDay, start, end);
    assert_eq!(a, b);
    assert_eq!(a.len(), 10);
    for pair in a.windows(2) {
      assert_eq!(pair[1].timestamp - pair[0].timestamp, ChronoDuration::days(1));
    }
  }

  #[test]
  fn synth_series_clips_to_range() {
    let start = Utc.with_ymd_and_hms(2020, 1, 1, 5, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2020, 1, 3, 5, 0, 0).unwrap();
    let bars = synth_series(7, BarFrequency::OneDay, start, end);
    // Grid days are midnight-aligned: Jan 2 and Jan 3 fall inside the range.
    assert_eq!(bars.len(), 2);
    assert!(bars.first().unwrap().timestamp >= start);
    assert!(bars.last().unwrap().timestamp <= end);
  }
}
