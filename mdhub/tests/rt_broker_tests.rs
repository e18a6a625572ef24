// mdhub/tests/rt_broker_tests.rs
// End-to-end real-time broker scenarios: heartbeat, subscription
// lifecycle, duplicate rejection, and topic-filtered fan-out.

use anyhow::Result;
use mdhub::adapter::RealTimeDataSource;
use mdhub::adapter_sim::SimDataSource;
use mdhub::client::RtClient;
use mdhub::data::{BarFrequency, RealTimeDataRequest, RealTimeEvent};
use mdhub::instrument::Instrument;
use mdhub::rt_broker::{RealTimeDataBroker, RtBrokerConfig};
use std::sync::Arc;
use std::time::Duration;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

struct Fixture {
  broker: RealTimeDataBroker,
  source: Arc<SimDataSource>,
}

fn fixture() -> Result<Fixture> {
  let _ = env_logger::builder().is_test(true).try_init();
  let source = SimDataSource::new("sim");
  let broker = RealTimeDataBroker::start(
    RtBrokerConfig {
      reconnect_interval: Duration::from_millis(200),
      ..Default::default()
    },
    vec![source.clone() as Arc<dyn RealTimeDataSource>],
  )?;
  Ok(Fixture { broker, source })
}

fn client(fx: &Fixture) -> Result<RtClient> {
  Ok(RtClient::connect(
    &fx.broker.request_addr().to_string(),
    &fx.broker.publish_addr().to_string(),
  )?)
}

#[test]
fn ping_answers_pong() -> Result<()> {
  let fx = fixture()?;
  let client = client(&fx)?;
  let latency = client.ping(REPLY_TIMEOUT)?;
  assert!(latency < REPLY_TIMEOUT);
  Ok(())
}

#[test]
fn subscribe_streams_bars_until_cancelled() -> Result<()> {
  let fx = fixture()?;
  let client = client(&fx)?;
  let instrument = Instrument::new(21, "ES", "sim");

  let reply = client.subscribe(
    RealTimeDataRequest::new(instrument.clone(), BarFrequency::OneSecond),
    REPLY_TIMEOUT,
  );
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  assert_eq!(reply.payload(), Some(&"ES".to_string()));
  assert_eq!(fx.broker.active_stream_count(), 1);

  // The sim adapter emits on a timer; at least one bar must fan out.
  let event = client.recv_event(EVENT_TIMEOUT)?;
  match event {
    RealTimeEvent::Bar { instrument_id, frequency, .. } => {
      assert_eq!(instrument_id, 21);
      assert_eq!(frequency, BarFrequency::OneSecond);
    }
    other => panic!("expected a bar event, got {:?}", other),
  }

  let cancel = client.cancel(&instrument, BarFrequency::OneSecond, REPLY_TIMEOUT);
  assert!(cancel.is_success(), "errors: {:?}", cancel.errors());
  assert_eq!(fx.broker.active_stream_count(), 0);
  Ok(())
}

#[test]
fn duplicate_subscription_is_rejected_and_registry_keeps_one_entry() -> Result<()> {
  let fx = fixture()?;
  let first = client(&fx)?;
  let second = client(&fx)?;
  let instrument = Instrument::new(22, "NQ", "sim");

  let reply = first.subscribe(
    RealTimeDataRequest::new(instrument.clone(), BarFrequency::FiveSeconds),
    REPLY_TIMEOUT,
  );
  assert!(reply.is_success(), "errors: {:?}", reply.errors());

  let duplicate = second.subscribe(
    RealTimeDataRequest::new(instrument, BarFrequency::FiveSeconds),
    REPLY_TIMEOUT,
  );
  assert!(!duplicate.is_success());
  assert!(
    duplicate.errors().iter().any(|e| e.contains("already active")),
    "errors: {:?}",
    duplicate.errors()
  );
  assert_eq!(fx.broker.active_stream_count(), 1);
  Ok(())
}

#[test]
fn cancel_of_unknown_stream_is_reported_not_fatal() -> Result<()> {
  let fx = fixture()?;
  let client = client(&fx)?;
  let instrument = Instrument::new(23, "CL", "sim");

  let cancel = client.cancel(&instrument, BarFrequency::OneMinute, REPLY_TIMEOUT);
  assert!(!cancel.is_success());
  assert!(
    cancel.errors().iter().any(|e| e.contains("No active real-time stream")),
    "errors: {:?}",
    cancel.errors()
  );

  // The broker is still serving.
  client.ping(REPLY_TIMEOUT)?;
  Ok(())
}

#[test]
fn unknown_and_disconnected_sources_are_rejected_with_reasons() -> Result<()> {
  let fx = fixture()?;
  let client = client(&fx)?;

  let unknown = Instrument::new(24, "??", "no-such-source");
  let reply = client.subscribe(RealTimeDataRequest::new(unknown, BarFrequency::OneSecond), REPLY_TIMEOUT);
  assert!(!reply.is_success());
  assert!(reply.errors().iter().any(|e| e.contains("Unknown data source")), "errors: {:?}", reply.errors());

  fx.source.force_disconnect();
  let instrument = Instrument::new(25, "GC", "sim");
  let reply = client.subscribe(RealTimeDataRequest::new(instrument, BarFrequency::OneSecond), REPLY_TIMEOUT);
  assert!(!reply.is_success());
  assert!(reply.errors().iter().any(|e| e.contains("disconnected")), "errors: {:?}", reply.errors());
  Ok(())
}

#[test]
fn topics_isolate_instruments_across_subscribers() -> Result<()> {
  let fx = fixture()?;
  let client_a = client(&fx)?;
  let client_b = client(&fx)?;
  let instrument_a = Instrument::new(26, "ES", "sim");
  let instrument_b = Instrument::new(27, "NQ", "sim");

  let reply = client_a.subscribe(
    RealTimeDataRequest::new(instrument_a, BarFrequency::OneSecond),
    REPLY_TIMEOUT,
  );
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let reply = client_b.subscribe(
    RealTimeDataRequest::new(instrument_b, BarFrequency::OneSecond),
    REPLY_TIMEOUT,
  );
  assert!(reply.is_success(), "errors: {:?}", reply.errors());

  // Each client only sees its own instrument on the shared publish socket.
  for _ in 0..5 {
    let event = client_a.recv_event(EVENT_TIMEOUT)?;
    assert_eq!(event.instrument_id(), 26);
  }
  for _ in 0..5 {
    let event = client_b.recv_event(EVENT_TIMEOUT)?;
    assert_eq!(event.instrument_id(), 27);
  }
  Ok(())
}

#[test]
fn resubscription_after_cancel_succeeds() -> Result<()> {
  let fx = fixture()?;
  let client = client(&fx)?;
  let instrument = Instrument::new(28, "SI", "sim");

  let reply = client.subscribe(
    RealTimeDataRequest::new(instrument.clone(), BarFrequency::OneSecond),
    REPLY_TIMEOUT,
  );
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  let cancel = client.cancel(&instrument, BarFrequency::OneSecond, REPLY_TIMEOUT);
  assert!(cancel.is_success(), "errors: {:?}", cancel.errors());

  let reply = client.subscribe(
    RealTimeDataRequest::new(instrument, BarFrequency::OneSecond),
    REPLY_TIMEOUT,
  );
  assert!(reply.is_success(), "errors: {:?}", reply.errors());
  assert_eq!(fx.broker.active_stream_count(), 1);
  Ok(())
}
