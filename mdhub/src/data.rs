// mdhub/src/data.rs
// Core market-data types: bar frequencies, OHLC bars, request/reply payloads.

use crate::instrument::Instrument;
use chrono::{DateTime, Duration, Utc};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bar bucket width, ordered from sub-minute ticks up to yearly.
///
/// The `i32` representation is the wire form (publish topics, cancel frames)
/// and the storage form; keep the discriminants stable.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
  Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[repr(i32)]
pub enum BarFrequency {
  Tick = 0,
  OneSecond = 1,
  FiveSeconds = 2,
  FifteenSeconds = 3,
  ThirtySeconds = 4,
  OneMinute = 5,
  FiveMinutes = 6,
  FifteenMinutes = 7,
  ThirtyMinutes = 8,
  OneHour = 9,
  OneDay = 10,
  OneWeek = 11,
  OneMonth = 12,
  OneQuarter = 13,
  OneYear = 14,
}

impl BarFrequency {
  /// Nominal period of one bar. `Tick` has no period; calendar frequencies
  /// use their nominal length (a month is 30 days), which is only ever used
  /// for the half-bar guard offset where the exact length does not matter.
  pub fn period(&self) -> Duration {
    match self {
      BarFrequency::Tick => Duration::zero(),
      BarFrequency::OneSecond => Duration::seconds(1),
      BarFrequency::FiveSeconds => Duration::seconds(5),
      BarFrequency::FifteenSeconds => Duration::seconds(15),
      BarFrequency::ThirtySeconds => Duration::seconds(30),
      BarFrequency::OneMinute => Duration::minutes(1),
      BarFrequency::FiveMinutes => Duration::minutes(5),
      BarFrequency::FifteenMinutes => Duration::minutes(15),
      BarFrequency::ThirtyMinutes => Duration::minutes(30),
      BarFrequency::OneHour => Duration::hours(1),
      BarFrequency::OneDay => Duration::days(1),
      BarFrequency::OneWeek => Duration::weeks(1),
      BarFrequency::OneMonth => Duration::days(30),
      BarFrequency::OneQuarter => Duration::days(91),
      BarFrequency::OneYear => Duration::days(365),
    }
  }

  /// Half a bar period: the guard offset applied at coverage edges so a
  /// sub-request does not re-fetch the bar already stored at the boundary.
  pub fn half_period(&self) -> Duration {
    self.period() / 2
  }
}

impl fmt::Display for BarFrequency {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      BarFrequency::Tick => "tick",
      BarFrequency::OneSecond => "1 sec",
      BarFrequency::FiveSeconds => "5 secs",
      BarFrequency::FifteenSeconds => "15 secs",
      BarFrequency::ThirtySeconds => "30 secs",
      BarFrequency::OneMinute => "1 min",
      BarFrequency::FiveMinutes => "5 mins",
      BarFrequency::FifteenMinutes => "15 mins",
      BarFrequency::ThirtyMinutes => "30 mins",
      BarFrequency::OneHour => "1 hour",
      BarFrequency::OneDay => "1 day",
      BarFrequency::OneWeek => "1 week",
      BarFrequency::OneMonth => "1 month",
      BarFrequency::OneQuarter => "1 quarter",
      BarFrequency::OneYear => "1 year",
    };
    write!(f, "{}", s)
  }
}

/// One OHLC record for a fixed time bucket.
///
/// Timestamps within a stored (instrument, frequency) series are strictly
/// increasing; storage enforces this with its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OHLCBar {
  pub timestamp: DateTime<Utc>,
  pub open: Decimal,
  pub high: Decimal,
  pub low: Decimal,
  pub close: Decimal,
  pub adj_open: Option<Decimal>,
  pub adj_high: Option<Decimal>,
  pub adj_low: Option<Decimal>,
  pub adj_close: Option<Decimal>,
  pub volume: Option<i64>,
  pub open_interest: Option<i64>,
  pub dividend: Option<Decimal>,
  pub split: Option<Decimal>,
}

impl OHLCBar {
  /// A bar with only the mandatory OHLC fields set.
  pub fn new(timestamp: DateTime<Utc>, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Self {
    OHLCBar {
      timestamp,
      open,
      high,
      low,
      close,
      adj_open: None,
      adj_high: None,
      adj_low: None,
      adj_close: None,
      volume: None,
      open_interest: None,
      dividend: None,
      split: None,
    }
  }
}

/// A client request for historical bars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalDataRequest {
  pub instrument: Instrument,
  pub frequency: BarFrequency,
  pub start_date: DateTime<Utc>,
  pub end_date: DateTime<Utc>,
  /// Skip local storage entirely; always hit the external source.
  pub force_fresh_data: bool,
  /// Never hit an external source; serve whatever storage has.
  pub local_storage_only: bool,
  /// Persist externally fetched bars before replying.
  pub save_to_storage: bool,
  /// Regular trading hours only. Passed through to the adapter.
  pub rth_only: bool,
  /// Client-assigned, unique per client session.
  pub request_id: i64,
  /// Broker-assigned correlation key. Zero until the broker accepts the
  /// request; set exactly once, never reused while in flight.
  pub assigned_id: i64,
}

impl HistoricalDataRequest {
  pub fn new(instrument: Instrument, frequency: BarFrequency, start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> Self {
    HistoricalDataRequest {
      instrument,
      frequency,
      start_date,
      end_date,
      force_fresh_data: false,
      local_storage_only: false,
      save_to_storage: true,
      rth_only: true,
      request_id: 0,
      assigned_id: 0,
    }
  }

  /// Derive a sub-request covering `[start, end]`, keeping the parent's
  /// instrument, frequency, and flags. The caller assigns the sub ID.
  pub fn sub_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
    let mut sub = self.clone();
    sub.start_date = start;
    sub.end_date = end;
    sub
  }
}

impl fmt::Display for HistoricalDataRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{} @ {} [{} .. {}]",
      self.instrument.symbol, self.frequency, self.start_date, self.end_date
    )
  }
}

/// A client request to start a live data stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealTimeDataRequest {
  pub instrument: Instrument,
  pub frequency: BarFrequency,
  pub rth_only: bool,
  /// Client-assigned, unique per client session.
  pub request_id: i64,
}

impl RealTimeDataRequest {
  pub fn new(instrument: Instrument, frequency: BarFrequency) -> Self {
    RealTimeDataRequest { instrument, frequency, rth_only: true, request_id: 0 }
  }
}

/// Coverage descriptor: the contiguous range local storage holds for one
/// (instrument, frequency) pair. Absence of an entry means zero coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDataInfo {
  pub instrument_id: i64,
  pub frequency: BarFrequency,
  pub earliest: DateTime<Utc>,
  pub latest: DateTime<Utc>,
}

/// A live data event published by the real-time broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RealTimeEvent {
  Tick {
    instrument_id: i64,
    timestamp: DateTime<Utc>,
    price: Decimal,
    size: Option<i64>,
  },
  Bar {
    instrument_id: i64,
    frequency: BarFrequency,
    bar: OHLCBar,
  },
}

impl RealTimeEvent {
  pub fn instrument_id(&self) -> i64 {
    match self {
      RealTimeEvent::Tick { instrument_id, .. } => *instrument_id,
      RealTimeEvent::Bar { instrument_id, .. } => *instrument_id,
    }
  }
}

/// The publish-socket topic for one live stream: `"{instrument_id}~{freq}"`.
pub fn stream_topic(instrument_id: i64, frequency: BarFrequency) -> Vec<u8> {
  format!("{}~{}", instrument_id, i32::from(frequency)).into_bytes()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frequency_ordering_is_coarseness() {
    assert!(BarFrequency::Tick < BarFrequency::OneMinute);
    assert!(BarFrequency::OneDay < BarFrequency::OneYear);
  }

  #[test]
  fn half_period_guard() {
    assert_eq!(BarFrequency::OneDay.half_period(), Duration::hours(12));
    assert_eq!(BarFrequency::Tick.half_period(), Duration::zero());
  }

  #[test]
  fn stream_topic_format() {
    assert_eq!(stream_topic(42, BarFrequency::OneDay), b"42~10".to_vec());
  }
}
