// mdhub/tests/hist_broker_tests.rs
// End-to-end historical broker scenarios over real sockets: routing,
// coverage reconciliation, reply assembly, and the failure paths.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use mdhub::adapter::HistoricalDataSource;
use mdhub::adapter_sim::{synth_series, SimDataSource};
use mdhub::client::HistClient;
use mdhub::data::{BarFrequency, HistoricalDataRequest};
use mdhub::hist_broker::{HistBrokerConfig, HistoricalDataBroker};
use mdhub::instrument::Instrument;
use mdhub::retry::RetryPolicy;
use mdhub::storage::{BarStorage, SqliteBarStorage};
use std::sync::Arc;
use std::time::Duration;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct Fixture {
  broker: HistoricalDataBroker,
  client: HistClient,
  storage: Arc<SqliteBarStorage>,
  source: Arc<SimDataSource>,
}

fn fixture() -> Result<Fixture> {
  let _ = env_logger::builder().is_test(true).try_init();
  let storage = Arc::new(SqliteBarStorage::open_in_memory()?);
  let source = SimDataSource::with_retry_policy("sim", RetryPolicy::fixed(Duration::from_millis(10), 3));
  let config = HistBrokerConfig {
    bind_address: "127.0.0.1:0".to_string(),
    reconnect_interval: Duration::from_millis(200),
    ..Default::default()
  };
  let broker = HistoricalDataBroker::start(
    config,
    storage.clone() as Arc<dyn BarStorage>,
    vec![source.clone() as Arc<dyn HistoricalDataSource>],
  )?;
  let client = HistClient::connect(&broker.local_addr().to_string())?;
  Ok(Fixture { broker, client, storage, source })
}

fn day(m: u32, d: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2020, m, d, 0, 0, 0).unwrap()
}

fn daily_request(instrument: Instrument, start: DateTime<Utc>, end: DateTime<Utc>) -> HistoricalDataRequest {
  HistoricalDataRequest::new(instrument, BarFrequency::OneDay, start, end)
}

#[test]
fn empty_storage_fetches_externally_persists_and_rereads() -> Result<()> {
  let fx = fixture()?;
  let instrument = Instrument::new(1, "ES", "sim");
  let request = daily_request(instrument, day(1, 1), day(12, 31));

  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let (_, bars) = reply.into_payload().unwrap();

  // The reply is the storage re-read of the full range, which for the sim
  // source is the deterministic daily series.
  let expected = synth_series(1, BarFrequency::OneDay, day(1, 1), day(12, 31));
  assert_eq!(bars, expected);
  assert_eq!(bars.len(), 366); // 2020 is a leap year

  // The fetch was persisted.
  let (earliest, latest) = fx.storage.coverage(1, BarFrequency::OneDay)?.unwrap();
  assert_eq!(earliest, day(1, 1));
  assert_eq!(latest, day(12, 31));
  Ok(())
}

#[test]
fn partial_coverage_backfills_and_forwardfills_then_replies_once() -> Result<()> {
  let fx = fixture()?;
  // Local coverage [Mar 1, Jun 1] inside a [Jan 1, Dec 31] request.
  let seeded = synth_series(2, BarFrequency::OneDay, day(3, 1), day(6, 1));
  fx.storage.upsert_bars(2, BarFrequency::OneDay, &seeded)?;

  let instrument = Instrument::new(2, "NQ", "sim");
  let request = daily_request(instrument, day(1, 1), day(12, 31));
  let request_id = fx.client.request_historical_data(request)?;

  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let (_, bars) = reply.into_payload().unwrap();

  // Back-fill + seed + forward-fill reassemble the complete series with no
  // duplicate at either coverage edge.
  let expected = synth_series(2, BarFrequency::OneDay, day(1, 1), day(12, 31));
  assert_eq!(bars, expected);

  // Exactly one reply: nothing further arrives and the broker's
  // bookkeeping has drained.
  assert!(fx.client.events().recv_timeout(Duration::from_millis(500)).is_err());
  assert_eq!(fx.broker.pending_count(), 0);
  Ok(())
}

#[test]
fn full_local_coverage_never_touches_the_adapter() -> Result<()> {
  let fx = fixture()?;
  let seeded = synth_series(3, BarFrequency::OneDay, day(1, 1), day(12, 31));
  fx.storage.upsert_bars(3, BarFrequency::OneDay, &seeded)?;

  // Any adapter dispatch would fail loudly.
  fx.source.script_errors(100);

  let instrument = Instrument::new(3, "CL", "sim");
  let request = daily_request(instrument, day(2, 1), day(11, 30));
  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let (_, bars) = reply.into_payload().unwrap();
  assert_eq!(bars, synth_series(3, BarFrequency::OneDay, day(2, 1), day(11, 30)));
  Ok(())
}

#[test]
fn local_storage_only_serves_empty_storage_as_empty_reply() -> Result<()> {
  let fx = fixture()?;
  let instrument = Instrument::new(4, "GC", "sim");
  let mut request = daily_request(instrument, day(1, 1), day(2, 1));
  request.local_storage_only = true;

  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let (_, bars) = reply.into_payload().unwrap();
  assert!(bars.is_empty());
  Ok(())
}

#[test]
fn no_persist_request_combines_in_memory_and_bypasses_storage() -> Result<()> {
  let fx = fixture()?;
  let seeded = synth_series(5, BarFrequency::OneDay, day(1, 1), day(6, 1));
  fx.storage.upsert_bars(5, BarFrequency::OneDay, &seeded)?;

  let instrument = Instrument::new(5, "ZB", "sim");
  let mut request = daily_request(instrument, day(1, 1), day(12, 31));
  request.save_to_storage = false;

  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let (_, bars) = reply.into_payload().unwrap();
  assert_eq!(bars, synth_series(5, BarFrequency::OneDay, day(1, 1), day(12, 31)));

  // The external tail was never written: coverage still ends at June 1.
  let (_, latest) = fx.storage.coverage(5, BarFrequency::OneDay)?.unwrap();
  assert_eq!(latest, day(6, 1));
  Ok(())
}

#[test]
fn adapter_failure_becomes_a_typed_error_reply() -> Result<()> {
  let fx = fixture()?;
  fx.source.script_errors(1);

  let instrument = Instrument::new(6, "SI", "sim");
  let mut request = daily_request(instrument, day(1, 1), day(2, 1));
  request.force_fresh_data = true;

  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(!reply.is_success());
  assert!(reply.errors().iter().any(|e| e.contains("scripted failure")), "errors: {:?}", reply.errors());
  assert_eq!(fx.broker.pending_count(), 0);
  Ok(())
}

#[test]
fn pacing_violations_are_retried_until_success() -> Result<()> {
  let fx = fixture()?;
  // Two pacing hits; the fixture policy allows three retries.
  fx.source.script_pacing_violations(2);

  let instrument = Instrument::new(7, "HG", "sim");
  let mut request = daily_request(instrument, day(1, 1), day(1, 31));
  request.force_fresh_data = true;
  request.save_to_storage = false;

  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  Ok(())
}

#[test]
fn unknown_source_and_missing_instrument_id_are_rejected() -> Result<()> {
  let fx = fixture()?;

  let unknown = Instrument::new(8, "??", "no-such-source");
  let request_id = fx.client.request_historical_data(daily_request(unknown, day(1, 1), day(2, 1)))?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(!reply.is_success());
  assert!(reply.errors().iter().any(|e| e.contains("Unknown data source")), "errors: {:?}", reply.errors());

  let unregistered = Instrument::unregistered("NEW", "sim");
  let request_id = fx.client.request_historical_data(daily_request(unregistered, day(1, 1), day(2, 1)))?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(!reply.is_success());
  assert!(reply.errors().iter().any(|e| e.contains("no ID")), "errors: {:?}", reply.errors());
  Ok(())
}

#[test]
fn disconnected_source_rejects_until_the_reconnect_timer_revives_it() -> Result<()> {
  let fx = fixture()?;
  fx.source.force_disconnect();

  let instrument = Instrument::new(9, "PL", "sim");
  let mut request = daily_request(instrument.clone(), day(1, 1), day(2, 1));
  request.force_fresh_data = true;
  let request_id = fx.client.request_historical_data(request.clone())?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(!reply.is_success());
  assert!(reply.errors().iter().any(|e| e.contains("disconnected")), "errors: {:?}", reply.errors());

  // The 200ms reconnect sweep flips the source back.
  let deadline = std::time::Instant::now() + Duration::from_secs(5);
  while !fx.source.is_connected() && std::time::Instant::now() < deadline {
    std::thread::sleep(Duration::from_millis(50));
  }
  assert!(fx.source.is_connected(), "reconnect timer never revived the source");

  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  Ok(())
}

#[test]
fn pushed_bars_are_stored_listed_and_served() -> Result<()> {
  let fx = fixture()?;
  let instrument = Instrument::new(10, "VX", "sim");
  let bars = synth_series(10, BarFrequency::OneHour, day(4, 1), day(4, 2));

  let ack = fx.client.push_and_wait(&instrument, BarFrequency::OneHour, &bars, REPLY_TIMEOUT);
  assert!(ack.is_success(), "errors: {:?}", ack.errors());

  let infos = fx.client.available_data(&instrument, REPLY_TIMEOUT);
  assert!(infos.is_success(), "errors: {:?}", infos.errors());
  let infos = infos.into_payload().unwrap();
  assert_eq!(infos.len(), 1);
  assert_eq!(infos[0].frequency, BarFrequency::OneHour);
  assert_eq!(infos[0].earliest, bars.first().unwrap().timestamp);
  assert_eq!(infos[0].latest, bars.last().unwrap().timestamp);

  let mut request = HistoricalDataRequest::new(instrument, BarFrequency::OneHour, day(4, 1), day(4, 2));
  request.local_storage_only = true;
  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let (_, served) = reply.into_payload().unwrap();
  assert_eq!(served, bars);
  Ok(())
}

#[test]
fn expired_instrument_with_final_coverage_stays_local() -> Result<()> {
  let fx = fixture()?;
  let expiration = day(6, 15);
  let seeded = synth_series(11, BarFrequency::OneDay, day(1, 1), expiration);
  fx.storage.upsert_bars(11, BarFrequency::OneDay, &seeded)?;

  // Adapter dispatch would fail; the expired shortcut must avoid it.
  fx.source.script_errors(100);

  let instrument = Instrument::futures(11, "ESM0", "sim", expiration);
  let request = daily_request(instrument, day(1, 1), day(12, 31));
  let request_id = fx.client.request_historical_data(request)?;
  let reply = fx.client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let (_, bars) = reply.into_payload().unwrap();
  assert_eq!(bars, seeded);
  Ok(())
}

#[test]
fn continuous_future_routes_to_the_dedicated_resolver() -> Result<()> {
  let _ = env_logger::builder().is_test(true).try_init();
  let storage = Arc::new(SqliteBarStorage::open_in_memory()?);
  let sim = SimDataSource::new("sim");
  let resolver = SimDataSource::new(mdhub::instrument::CONTINUOUS_FUTURES_SOURCE);
  // Only the resolver can serve; the plain source errors on any dispatch.
  sim.script_errors(100);
  let broker = HistoricalDataBroker::start(
    HistBrokerConfig::default(),
    storage as Arc<dyn BarStorage>,
    vec![
      sim as Arc<dyn HistoricalDataSource>,
      resolver as Arc<dyn HistoricalDataSource>,
    ],
  )?;
  let client = HistClient::connect(&broker.local_addr().to_string())?;

  let instrument = Instrument::continuous_future(12, "ES-CONT");
  let request = daily_request(instrument, day(1, 1), day(1, 31));
  let request_id = client.request_historical_data(request)?;
  let reply = client.wait_for_reply(request_id, REPLY_TIMEOUT);
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  Ok(())
}
