// mdhub/src/client.rs
// Client library: the counterpart state machines for both brokers.
//
// `HistClient` tracks its pending requests by client request ID and
// reassembles compressed replies on a reader thread; `RtClient` drives the
// subscribe/cancel/ping protocol and decodes the publish stream. Every
// reply surfaces as a `ClientResult` whose success flag must be checked
// before the payload is touched.

use crate::base::{HubError, Result};
use crate::data::{
  BarFrequency, HistoricalDataRequest, OHLCBar, RealTimeDataRequest, RealTimeEvent, StoredDataInfo,
};
use crate::instrument::Instrument;
use crate::transport::{DealerSocket, SubSocket};
use crate::wire;
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Success-or-errors wrapper around every broker reply.
#[derive(Debug, Clone)]
pub struct ClientResult<T> {
  payload: Option<T>,
  errors: Vec<String>,
}

impl<T> ClientResult<T> {
  pub fn ok(payload: T) -> Self {
    ClientResult { payload: Some(payload), errors: Vec::new() }
  }

  pub fn err(message: impl Into<String>) -> Self {
    ClientResult { payload: None, errors: vec![message.into()] }
  }

  pub fn is_success(&self) -> bool {
    self.payload.is_some() && self.errors.is_empty()
  }

  pub fn payload(&self) -> Option<&T> {
    self.payload.as_ref()
  }

  pub fn into_payload(self) -> Option<T> {
    self.payload
  }

  pub fn errors(&self) -> &[String] {
    &self.errors
  }
}

/// Decoded replies surfaced by the historical client's reader thread.
#[derive(Debug, Clone)]
pub enum HistClientEvent {
  DataReply { request: HistoricalDataRequest, bars: Vec<OHLCBar> },
  RequestError { request: HistoricalDataRequest, message: String },
  PushAck,
  AvailableData { instrument: Instrument, infos: Vec<StoredDataInfo> },
  GenericError { message: String },
}

/// Client for the historical data broker.
pub struct HistClient {
  socket: Arc<DealerSocket>,
  next_request_id: AtomicI64,
  pending: Arc<Mutex<HashMap<i64, HistoricalDataRequest>>>,
  events_rx: Receiver<HistClientEvent>,
  run: Arc<AtomicBool>,
  reader_thread: Option<thread::JoinHandle<()>>,
}

impl HistClient {
  pub fn connect(addr: &str) -> Result<Self> {
    let socket = Arc::new(DealerSocket::connect(addr)?);
    let pending = Arc::new(Mutex::new(HashMap::new()));
    let (events_tx, events_rx) = unbounded();
    let run = Arc::new(AtomicBool::new(true));

    let reader_socket = socket.clone();
    let reader_pending = pending.clone();
    let reader_run = run.clone();
    let reader_thread = thread::Builder::new()
      .name("hist-client-reader".to_string())
      .spawn(move || {
        while reader_run.load(Ordering::Relaxed) {
          let frames = match reader_socket.incoming().recv_timeout(Duration::from_millis(50)) {
            Ok(frames) => frames,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
          };
          let event = Self::decode_reply(&frames, &reader_pending);
          if events_tx.send(event).is_err() {
            break;
          }
        }
      })
      .map_err(|e| HubError::InternalError(format!("spawn client reader: {}", e)))?;

    Ok(HistClient {
      socket,
      next_request_id: AtomicI64::new(1),
      pending,
      events_rx,
      run,
      reader_thread: Some(reader_thread),
    })
  }

  fn decode_reply(frames: &[Vec<u8>], pending: &Mutex<HashMap<i64, HistoricalDataRequest>>) -> HistClientEvent {
    let tag = match wire::tag_of(frames) {
      Ok(tag) => tag,
      Err(e) => return HistClientEvent::GenericError { message: e.to_string() },
    };
    match tag {
      wire::MessageType::HistoricalReply => match wire::parse_hist_reply(frames) {
        Ok((request, bars)) => {
          if pending.lock().remove(&request.request_id).is_none() {
            warn!("Reply for request {} the client no longer tracks", request.request_id);
          }
          HistClientEvent::DataReply { request, bars }
        }
        Err(e) => HistClientEvent::GenericError { message: e.to_string() },
      },
      wire::MessageType::Error if frames.len() == 3 => match wire::parse_hist_error(frames) {
        Ok((request, message)) => {
          pending.lock().remove(&request.request_id);
          HistClientEvent::RequestError { request, message }
        }
        Err(e) => HistClientEvent::GenericError { message: e.to_string() },
      },
      wire::MessageType::Error => HistClientEvent::GenericError {
        message: wire::parse_error(frames).unwrap_or_else(|e| e.to_string()),
      },
      wire::MessageType::PushOk => HistClientEvent::PushAck,
      wire::MessageType::AvailableDataReply => match wire::parse_available_data_reply(frames) {
        Ok((instrument, infos)) => HistClientEvent::AvailableData { instrument, infos },
        Err(e) => HistClientEvent::GenericError { message: e.to_string() },
      },
      other => HistClientEvent::GenericError { message: format!("unexpected reply type {:?}", other) },
    }
  }

  /// Send a historical data request. Returns the client request ID the
  /// eventual reply will carry.
  pub fn request_historical_data(&self, mut request: HistoricalDataRequest) -> Result<i64> {
    if request.request_id == 0 {
      request.request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
    }
    let request_id = request.request_id;
    self.pending.lock().insert(request_id, request.clone());
    let frames = wire::hist_request_frames(&request)?;
    if let Err(e) = self.socket.send(&frames) {
      self.pending.lock().remove(&request_id);
      return Err(e);
    }
    debug!("Sent historical request {} ({})", request_id, request);
    Ok(request_id)
  }

  /// Push a bar batch into broker storage. The acknowledgement arrives as a
  /// `PushAck`/`GenericError` event.
  pub fn push_data(&self, instrument: &Instrument, frequency: BarFrequency, bars: &[OHLCBar]) -> Result<()> {
    let push = wire::DataPush { instrument: instrument.clone(), frequency };
    self.socket.send(&wire::push_frames(&push, bars)?)
  }

  /// Ask which (frequency, range) coverage the broker's storage holds.
  pub fn request_available_data(&self, instrument: &Instrument) -> Result<()> {
    self.socket.send(&wire::available_data_request_frames(instrument)?)
  }

  /// The decoded reply stream. Replies arrive in broker order; requests
  /// issued concurrently are disambiguated by `request_id`.
  pub fn events(&self) -> &Receiver<HistClientEvent> {
    &self.events_rx
  }

  /// Pending request count. Diagnostic.
  pub fn pending_count(&self) -> usize {
    self.pending.lock().len()
  }

  /// Block until the reply for `request_id` arrives. Events for other
  /// requests that arrive meanwhile are dropped with a warning, so this
  /// helper is only for one-request-at-a-time flows; concurrent callers
  /// should drain `events()` themselves.
  pub fn wait_for_reply(
    &self,
    request_id: i64,
    timeout: Duration,
  ) -> ClientResult<(HistoricalDataRequest, Vec<OHLCBar>)> {
    let deadline = Instant::now() + timeout;
    loop {
      let remaining = match deadline.checked_duration_since(Instant::now()) {
        Some(remaining) if !remaining.is_zero() => remaining,
        _ => return ClientResult::err(format!("timed out waiting for request {}", request_id)),
      };
      match self.events_rx.recv_timeout(remaining) {
        Ok(HistClientEvent::DataReply { request, bars }) if request.request_id == request_id => {
          return ClientResult::ok((request, bars));
        }
        Ok(HistClientEvent::RequestError { request, message }) if request.request_id == request_id => {
          return ClientResult::err(message);
        }
        Ok(HistClientEvent::GenericError { message }) => return ClientResult::err(message),
        Ok(other) => warn!("Dropping unrelated event while waiting: {:?}", other),
        Err(_) => return ClientResult::err(format!("timed out waiting for request {}", request_id)),
      }
    }
  }

  /// Push bars and block for the acknowledgement.
  pub fn push_and_wait(
    &self,
    instrument: &Instrument,
    frequency: BarFrequency,
    bars: &[OHLCBar],
    timeout: Duration,
  ) -> ClientResult<()> {
    if let Err(e) = self.push_data(instrument, frequency, bars) {
      return ClientResult::err(e.to_string());
    }
    match self.events_rx.recv_timeout(timeout) {
      Ok(HistClientEvent::PushAck) => ClientResult::ok(()),
      Ok(HistClientEvent::GenericError { message }) => ClientResult::err(message),
      Ok(other) => ClientResult::err(format!("unexpected reply to push: {:?}", other)),
      Err(_) => ClientResult::err("timed out waiting for push acknowledgement"),
    }
  }

  /// Fetch the coverage list and block for the reply.
  pub fn available_data(&self, instrument: &Instrument, timeout: Duration) -> ClientResult<Vec<StoredDataInfo>> {
    if let Err(e) = self.request_available_data(instrument) {
      return ClientResult::err(e.to_string());
    }
    match self.events_rx.recv_timeout(timeout) {
      Ok(HistClientEvent::AvailableData { infos, .. }) => ClientResult::ok(infos),
      Ok(HistClientEvent::GenericError { message }) => ClientResult::err(message),
      Ok(other) => ClientResult::err(format!("unexpected reply to available-data: {:?}", other)),
      Err(_) => ClientResult::err("timed out waiting for available-data reply"),
    }
  }

  pub fn disconnect(&mut self) {
    self.run.store(false, Ordering::Relaxed);
    if let Some(handle) = self.reader_thread.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for HistClient {
  fn drop(&mut self) {
    self.disconnect();
  }
}

/// Client for the real-time data broker: request operations plus the
/// decoded publish stream for subscribed topics.
pub struct RtClient {
  request_socket: DealerSocket,
  sub_socket: SubSocket,
  next_request_id: AtomicI64,
}

impl RtClient {
  pub fn connect(request_addr: &str, publish_addr: &str) -> Result<Self> {
    Ok(RtClient {
      request_socket: DealerSocket::connect(request_addr)?,
      sub_socket: SubSocket::connect(publish_addr)?,
      next_request_id: AtomicI64::new(1),
    })
  }

  /// Liveness probe: round-trip a ping and return the latency.
  pub fn ping(&self, timeout: Duration) -> Result<Duration> {
    let started = Instant::now();
    self.request_socket.send(&[wire::tag_frame(wire::MessageType::Ping)])?;
    let frames = self.request_socket.recv_timeout(timeout)?;
    match wire::tag_of(&frames)? {
      wire::MessageType::Pong => Ok(started.elapsed()),
      other => Err(HubError::ParseError(format!("expected Pong, got {:?}", other))),
    }
  }

  /// Subscribe to a live stream. The topic subscription is registered on
  /// the publish socket before the broker dispatches to the adapter, so no
  /// leading data is lost to the at-most-once fan-out.
  pub fn subscribe(&self, mut request: RealTimeDataRequest, timeout: Duration) -> ClientResult<String> {
    if request.request_id == 0 {
      request.request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
    }
    let instrument_id = match request.instrument.id {
      Some(id) => id,
      None => return ClientResult::err(HubError::InstrumentWithoutId(request.instrument.symbol).to_string()),
    };
    let topic = crate::data::stream_topic(instrument_id, request.frequency);
    if let Err(e) = self.sub_socket.subscribe(&topic) {
      return ClientResult::err(e.to_string());
    }
    let frames = match wire::subscribe_frames(&request) {
      Ok(frames) => frames,
      Err(e) => return ClientResult::err(e.to_string()),
    };
    if let Err(e) = self.request_socket.send(&frames) {
      return ClientResult::err(e.to_string());
    }
    match self.request_socket.recv_timeout(timeout) {
      Ok(reply) => match wire::tag_of(&reply) {
        Ok(wire::MessageType::SubscribeOk) => {
          let symbol = reply.get(1).map(|f| String::from_utf8_lossy(f).into_owned()).unwrap_or_default();
          ClientResult::ok(symbol)
        }
        Ok(wire::MessageType::Error) => {
          // Roll back the topic registration the failed stream would feed.
          let _ = self.sub_socket.unsubscribe(&topic);
          ClientResult::err(wire::parse_error(&reply).unwrap_or_else(|e| e.to_string()))
        }
        Ok(other) => ClientResult::err(format!("unexpected subscribe reply {:?}", other)),
        Err(e) => ClientResult::err(e.to_string()),
      },
      Err(e) => ClientResult::err(e.to_string()),
    }
  }

  /// Cancel a live stream and drop the topic subscription.
  pub fn cancel(&self, instrument: &Instrument, frequency: BarFrequency, timeout: Duration) -> ClientResult<String> {
    if let Some(id) = instrument.id {
      let _ = self.sub_socket.unsubscribe(&crate::data::stream_topic(id, frequency));
    }
    let frames = match wire::cancel_frames(instrument, frequency) {
      Ok(frames) => frames,
      Err(e) => return ClientResult::err(e.to_string()),
    };
    if let Err(e) = self.request_socket.send(&frames) {
      return ClientResult::err(e.to_string());
    }
    match self.request_socket.recv_timeout(timeout) {
      Ok(reply) => match wire::tag_of(&reply) {
        Ok(wire::MessageType::CancelOk) => {
          let symbol = reply.get(1).map(|f| String::from_utf8_lossy(f).into_owned()).unwrap_or_default();
          ClientResult::ok(symbol)
        }
        Ok(wire::MessageType::Error) => {
          ClientResult::err(wire::parse_error(&reply).unwrap_or_else(|e| e.to_string()))
        }
        Ok(other) => ClientResult::err(format!("unexpected cancel reply {:?}", other)),
        Err(e) => ClientResult::err(e.to_string()),
      },
      Err(e) => ClientResult::err(e.to_string()),
    }
  }

  /// Next decoded event from the publish stream.
  pub fn recv_event(&self, timeout: Duration) -> Result<RealTimeEvent> {
    let deadline = Instant::now() + timeout;
    loop {
      let remaining = deadline
        .checked_duration_since(Instant::now())
        .ok_or_else(|| HubError::Timeout("no live event".to_string()))?;
      let (_, payload) = self
        .sub_socket
        .incoming()
        .recv_timeout(remaining)
        .map_err(|_| HubError::Timeout("no live event".to_string()))?;
      match wire::parse_publish_payload(&payload) {
        Ok(event) => return Ok(event),
        Err(e) => {
          warn!("Skipping undecodable publish payload: {}", e);
          continue;
        }
      }
    }
  }
}
