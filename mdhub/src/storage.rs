// mdhub/src/storage.rs
// Local bar storage: the durable store the historical broker reconciles
// external fetches against.
//
// One row per (instrument, frequency, timestamp); the primary key makes the
// upsert idempotent and keeps series free of duplicate timestamps. All
// access goes through a single connection behind a mutex; the broker's
// reconciliation path and direct dispatch path must not interleave reads
// and writes.

use crate::base::{HubError, Result};
use crate::data::{BarFrequency, OHLCBar, StoredDataInfo};
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use rusqlite::{params, Connection as DbConnection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;

/// What the historical broker needs from a bar store.
pub trait BarStorage: Send + Sync {
  fn is_connected(&self) -> bool;
  fn connect(&self) -> Result<()>;

  /// The [earliest, latest] range stored for (instrument, frequency), or
  /// `None` for zero coverage.
  fn coverage(&self, instrument_id: i64, frequency: BarFrequency)
    -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>>;

  /// Bars in `[start, end]`, ordered by timestamp ascending.
  fn read_bars(
    &self,
    instrument_id: i64,
    frequency: BarFrequency,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<Vec<OHLCBar>>;

  /// Idempotent upsert: an existing (instrument, frequency, timestamp) row
  /// has its non-key fields overwritten with the incoming values. Returns
  /// the number of bars written.
  fn upsert_bars(&self, instrument_id: i64, frequency: BarFrequency, bars: &[OHLCBar]) -> Result<usize>;

  /// Per-frequency coverage entries for one instrument.
  fn available_data(&self, instrument_id: i64) -> Result<Vec<StoredDataInfo>>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS bars (
  instrument_id  INTEGER NOT NULL,
  frequency      INTEGER NOT NULL,
  ts             INTEGER NOT NULL,
  open           TEXT NOT NULL,
  high           TEXT NOT NULL,
  low            TEXT NOT NULL,
  close          TEXT NOT NULL,
  adj_open       TEXT,
  adj_high       TEXT,
  adj_low        TEXT,
  adj_close      TEXT,
  volume         INTEGER,
  open_interest  INTEGER,
  dividend       TEXT,
  split          TEXT,
  PRIMARY KEY (instrument_id, frequency, ts)
);
";

/// SQLite-backed implementation of [`BarStorage`].
pub struct SqliteBarStorage {
  conn: Mutex<DbConnection>,
}

fn dec_opt_to_sql(d: &Option<Decimal>) -> Option<String> {
  d.as_ref().map(|v| v.to_string())
}

fn dec_from_sql(s: &str) -> Result<Decimal> {
  Decimal::from_str(s).map_err(|e| HubError::StorageError(format!("bad decimal '{}': {}", s, e)))
}

fn dec_opt_from_sql(s: Option<String>) -> Result<Option<Decimal>> {
  s.map(|v| dec_from_sql(&v)).transpose()
}

fn ts_to_sql(ts: DateTime<Utc>) -> i64 {
  ts.timestamp_millis()
}

fn ts_from_sql(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| HubError::StorageError(format!("bad timestamp {}", ms)))
}

impl SqliteBarStorage {
  pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
    let conn = DbConnection::open(path.as_ref())?;
    conn.execute_batch(SCHEMA)?;
    info!("Bar storage opened at {}", path.as_ref().display());
    Ok(SqliteBarStorage { conn: Mutex::new(conn) })
  }

  /// In-memory store; used by tests and the sim server profile.
  pub fn open_in_memory() -> Result<Self> {
    let conn = DbConnection::open_in_memory()?;
    conn.execute_batch(SCHEMA)?;
    Ok(SqliteBarStorage { conn: Mutex::new(conn) })
  }

}

const SELECT_COLS: &str =
  "ts, open, high, low, close, adj_open, adj_high, adj_low, adj_close, volume, open_interest, dividend, split";

struct RawBarRow {
  ts: i64,
  open: String,
  high: String,
  low: String,
  close: String,
  adj_open: Option<String>,
  adj_high: Option<String>,
  adj_low: Option<String>,
  adj_close: Option<String>,
  volume: Option<i64>,
  open_interest: Option<i64>,
  dividend: Option<String>,
  split: Option<String>,
}

impl RawBarRow {
  fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(RawBarRow {
      ts: row.get(0)?,
      open: row.get(1)?,
      high: row.get(2)?,
      low: row.get(3)?,
      close: row.get(4)?,
      adj_open: row.get(5)?,
      adj_high: row.get(6)?,
      adj_low: row.get(7)?,
      adj_close: row.get(8)?,
      volume: row.get(9)?,
      open_interest: row.get(10)?,
      dividend: row.get(11)?,
      split: row.get(12)?,
    })
  }

  fn into_bar(self) -> Result<OHLCBar> {
    Ok(OHLCBar {
      timestamp: ts_from_sql(self.ts)?,
      open: dec_from_sql(&self.open)?,
      high: dec_from_sql(&self.high)?,
      low: dec_from_sql(&self.low)?,
      close: dec_from_sql(&self.close)?,
      adj_open: dec_opt_from_sql(self.adj_open)?,
      adj_high: dec_opt_from_sql(self.adj_high)?,
      adj_low: dec_opt_from_sql(self.adj_low)?,
      adj_close: dec_opt_from_sql(self.adj_close)?,
      volume: self.volume,
      open_interest: self.open_interest,
      dividend: dec_opt_from_sql(self.dividend)?,
      split: dec_opt_from_sql(self.split)?,
    })
  }
}

impl BarStorage for SqliteBarStorage {
  fn is_connected(&self) -> bool {
    true
  }

  fn connect(&self) -> Result<()> {
    Ok(())
  }

  fn coverage(&self, instrument_id: i64, frequency: BarFrequency)
    -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare_cached(
      "SELECT MIN(ts), MAX(ts) FROM bars WHERE instrument_id = ?1 AND frequency = ?2",
    )?;
    let range: (Option<i64>, Option<i64>) = stmt.query_row(
      params![instrument_id, i32::from(frequency)],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    match range {
      (Some(earliest), Some(latest)) => Ok(Some((ts_from_sql(earliest)?, ts_from_sql(latest)?))),
      _ => Ok(None),
    }
  }

  fn read_bars(
    &self,
    instrument_id: i64,
    frequency: BarFrequency,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
  ) -> Result<Vec<OHLCBar>> {
    let conn = self.conn.lock();
    let sql = format!(
      "SELECT {} FROM bars WHERE instrument_id = ?1 AND frequency = ?2 AND ts >= ?3 AND ts <= ?4 ORDER BY ts ASC",
      SELECT_COLS
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(
      params![instrument_id, i32::from(frequency), ts_to_sql(start), ts_to_sql(end)],
      RawBarRow::from_row,
    )?;
    let mut bars = Vec::new();
    for row in rows {
      bars.push(row?.into_bar()?);
    }
    debug!(
      "Read {} bars for instrument {} @ {} in [{} .. {}]",
      bars.len(), instrument_id, frequency, start, end
    );
    Ok(bars)
  }

  fn upsert_bars(&self, instrument_id: i64, frequency: BarFrequency, bars: &[OHLCBar]) -> Result<usize> {
    if bars.is_empty() {
      return Ok(0);
    }
    let mut conn = self.conn.lock();
    let tx = conn.transaction()?;
    {
      let mut stmt = tx.prepare_cached(
        "INSERT INTO bars (instrument_id, frequency, ts, open, high, low, close,
                           adj_open, adj_high, adj_low, adj_close,
                           volume, open_interest, dividend, split)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(instrument_id, frequency, ts) DO UPDATE SET
           open = excluded.open, high = excluded.high, low = excluded.low,
           close = excluded.close, adj_open = excluded.adj_open,
           adj_high = excluded.adj_high, adj_low = excluded.adj_low,
           adj_close = excluded.adj_close, volume = excluded.volume,
           open_interest = excluded.open_interest, dividend = excluded.dividend,
           split = excluded.split",
      )?;
      for bar in bars {
        stmt.execute(params![
          instrument_id,
          i32::from(frequency),
          ts_to_sql(bar.timestamp),
          bar.open.to_string(),
          bar.high.to_string(),
          bar.low.to_string(),
          bar.close.to_string(),
          dec_opt_to_sql(&bar.adj_open),
          dec_opt_to_sql(&bar.adj_high),
          dec_opt_to_sql(&bar.adj_low),
          dec_opt_to_sql(&bar.adj_close),
          bar.volume,
          bar.open_interest,
          dec_opt_to_sql(&bar.dividend),
          dec_opt_to_sql(&bar.split),
        ])?;
      }
    }
    tx.commit()?;
    debug!("Upserted {} bars for instrument {} @ {}", bars.len(), instrument_id, frequency);
    Ok(bars.len())
  }

  fn available_data(&self, instrument_id: i64) -> Result<Vec<StoredDataInfo>> {
    let conn = self.conn.lock();
    let mut stmt = conn.prepare_cached(
      "SELECT frequency, MIN(ts), MAX(ts) FROM bars WHERE instrument_id = ?1
       GROUP BY frequency ORDER BY frequency ASC",
    )?;
    let rows = stmt.query_map(params![instrument_id], |row| {
      Ok((row.get::<_, i32>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
    })?;
    let mut infos = Vec::new();
    for row in rows {
      let (freq_raw, earliest, latest) = row?;
      let frequency = BarFrequency::try_from(freq_raw)
        .map_err(|_| HubError::StorageError(format!("unknown stored frequency {}", freq_raw)))?;
      infos.push(StoredDataInfo {
        instrument_id,
        frequency,
        earliest: ts_from_sql(earliest)?,
        latest: ts_from_sql(latest)?,
      });
    }
    Ok(infos)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn day_bar(day: u32, close_cents: i64) -> OHLCBar {
    let ts = Utc.with_ymd_and_hms(2020, 3, day, 0, 0, 0).unwrap();
    let mut bar = OHLCBar::new(
      ts,
      Decimal::new(close_cents - 10, 2),
      Decimal::new(close_cents + 20, 2),
      Decimal::new(close_cents - 30, 2),
      Decimal::new(close_cents, 2),
    );
    bar.volume = Some(1_000 + day as i64);
    bar
  }

  #[test]
  fn upsert_is_idempotent_and_overwrites_fields() {
    let storage = SqliteBarStorage::open_in_memory().unwrap();
    let bars = vec![day_bar(2, 10_000), day_bar(3, 10_100)];
    storage.upsert_bars(1, BarFrequency::OneDay, &bars).unwrap();

    // Re-write the same timestamps with a new close; series length unchanged,
    // non-key fields take the latest write.
    let mut rewritten = bars.clone();
    rewritten[0].close = Decimal::new(9_999, 2);
    rewritten[0].volume = Some(7);
    storage.upsert_bars(1, BarFrequency::OneDay, &rewritten).unwrap();

    let start = Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2020, 3, 31, 0, 0, 0).unwrap();
    let read = storage.read_bars(1, BarFrequency::OneDay, start, end).unwrap();
    assert_eq!(read.len(), 2);
    assert_eq!(read[0].close, Decimal::new(9_999, 2));
    assert_eq!(read[0].volume, Some(7));
    assert_eq!(read[1], bars[1]);
  }

  #[test]
  fn coverage_reports_min_max_and_absence() {
    let storage = SqliteBarStorage::open_in_memory().unwrap();
    assert!(storage.coverage(1, BarFrequency::OneDay).unwrap().is_none());

    storage
      .upsert_bars(1, BarFrequency::OneDay, &[day_bar(5, 100), day_bar(10, 200)])
      .unwrap();
    let (earliest, latest) = storage.coverage(1, BarFrequency::OneDay).unwrap().unwrap();
    assert_eq!(earliest, Utc.with_ymd_and_hms(2020, 3, 5, 0, 0, 0).unwrap());
    assert_eq!(latest, Utc.with_ymd_and_hms(2020, 3, 10, 0, 0, 0).unwrap());

    // Different frequency is separate coverage.
    assert!(storage.coverage(1, BarFrequency::OneHour).unwrap().is_none());
  }

  #[test]
  fn read_bars_is_ordered_and_range_inclusive() {
    let storage = SqliteBarStorage::open_in_memory().unwrap();
    // Insert out of order.
    storage
      .upsert_bars(2, BarFrequency::OneDay, &[day_bar(10, 300), day_bar(2, 100), day_bar(6, 200)])
      .unwrap();
    let start = Utc.with_ymd_and_hms(2020, 3, 2, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2020, 3, 6, 0, 0, 0).unwrap();
    let read = storage.read_bars(2, BarFrequency::OneDay, start, end).unwrap();
    assert_eq!(read.len(), 2);
    assert!(read[0].timestamp < read[1].timestamp);
    assert_eq!(read[1].timestamp, end);
  }

  #[test]
  fn available_data_lists_each_frequency() {
    let storage = SqliteBarStorage::open_in_memory().unwrap();
    storage.upsert_bars(3, BarFrequency::OneDay, &[day_bar(2, 100)]).unwrap();
    storage
      .upsert_bars(3, BarFrequency::OneHour, &[day_bar(2, 100), day_bar(3, 101)])
      .unwrap();
    storage.upsert_bars(4, BarFrequency::OneDay, &[day_bar(2, 100)]).unwrap();

    let infos = storage.available_data(3).unwrap();
    assert_eq!(infos.len(), 2);
    assert!(infos.iter().all(|i| i.instrument_id == 3));
    let daily = infos.iter().find(|i| i.frequency == BarFrequency::OneDay).unwrap();
    assert_eq!(daily.earliest, daily.latest);
    let hourly = infos.iter().find(|i| i.frequency == BarFrequency::OneHour).unwrap();
    assert_eq!(hourly.latest - hourly.earliest, Duration::days(1));
  }

  #[test]
  fn decimal_precision_survives_storage() {
    let storage = SqliteBarStorage::open_in_memory().unwrap();
    let ts = Utc.with_ymd_and_hms(2020, 3, 2, 0, 0, 0).unwrap();
    let mut bar = OHLCBar::new(
      ts,
      Decimal::from_str("123.456789").unwrap(),
      Decimal::from_str("124.000001").unwrap(),
      Decimal::from_str("122.9").unwrap(),
      Decimal::from_str("123.5").unwrap(),
    );
    bar.dividend = Some(Decimal::from_str("0.0375").unwrap());
    storage.upsert_bars(5, BarFrequency::OneDay, &[bar.clone()]).unwrap();
    let read = storage.read_bars(5, BarFrequency::OneDay, ts, ts).unwrap();
    assert_eq!(read, vec![bar]);
  }
}
