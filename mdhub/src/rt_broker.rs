// mdhub/src/rt_broker.rs
// Real-time data broker: subscribe/cancel/ping on a request socket, live
// data fanned out on a publish socket under "{instrument_id}~{frequency}"
// topics. Filtering is the subscriber's job via topic matching; the broker
// never pushes to specific clients.
//
// The publish path runs on its own thread draining the adapter event
// channel, so a burst of request-socket traffic can never delay ticks.

use crate::adapter::{LiveDataEvent, RealTimeDataSource};
use crate::base::{HubError, Result};
use crate::data::{stream_topic, BarFrequency, RealTimeDataRequest, RealTimeEvent};
use crate::transport::{Frames, Identity, PubSocket, RouterSocket};
use crate::wire;
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct RtBrokerConfig {
  pub request_address: String,
  pub publish_address: String,
  pub reconnect_interval: Duration,
  pub poll_timeout: Duration,
}

impl Default for RtBrokerConfig {
  fn default() -> Self {
    Self {
      request_address: "127.0.0.1:0".to_string(),
      publish_address: "127.0.0.1:0".to_string(),
      reconnect_interval: Duration::from_secs(10),
      poll_timeout: Duration::from_millis(20),
    }
  }
}

struct ActiveStream {
  request: RealTimeDataRequest,
  source_name: String,
  /// Adapter-local stream ID, used for cancellation and event correlation.
  stream_id: i64,
}

struct RtInner {
  request_socket: RouterSocket,
  pub_socket: PubSocket,
  sources: HashMap<String, Arc<dyn RealTimeDataSource>>,
  /// At most one active stream per (instrument, frequency), system-wide.
  streams: Mutex<HashMap<(i64, BarFrequency), ActiveStream>>,
  /// Adapter stream ID -> registry key, for event correlation.
  stream_index: Mutex<HashMap<i64, (i64, BarFrequency)>>,
  run: AtomicBool,
}

/// The real-time data broker.
pub struct RealTimeDataBroker {
  inner: Arc<RtInner>,
  service_thread: Option<thread::JoinHandle<()>>,
  publisher_thread: Option<thread::JoinHandle<()>>,
  reconnect_thread: Option<thread::JoinHandle<()>>,
}

impl RealTimeDataBroker {
  pub fn start(config: RtBrokerConfig, sources: Vec<Arc<dyn RealTimeDataSource>>) -> Result<Self> {
    let request_socket = RouterSocket::bind(&config.request_address)?;
    let pub_socket = PubSocket::bind(&config.publish_address)?;
    let (events_tx, events_rx) = unbounded();

    let mut source_map = HashMap::new();
    for source in sources {
      source.set_event_sink(events_tx.clone());
      if source_map.insert(source.name().to_string(), source.clone()).is_some() {
        return Err(HubError::ConfigurationError(format!(
          "duplicate real-time data source '{}'", source.name()
        )));
      }
    }

    let inner = Arc::new(RtInner {
      request_socket,
      pub_socket,
      sources: source_map,
      streams: Mutex::new(HashMap::new()),
      stream_index: Mutex::new(HashMap::new()),
      run: AtomicBool::new(true),
    });
    info!(
      "Real-time broker: requests on {}, publishing on {}",
      inner.request_socket.local_addr(),
      inner.pub_socket.local_addr()
    );

    let service_inner = inner.clone();
    let poll = config.poll_timeout;
    let service_thread = thread::Builder::new()
      .name("rt-broker".to_string())
      .spawn(move || service_inner.service_loop(poll))
      .map_err(|e| HubError::InternalError(format!("spawn rt broker thread: {}", e)))?;

    let publisher_inner = inner.clone();
    let publisher_thread = thread::Builder::new()
      .name("rt-publisher".to_string())
      .spawn(move || publisher_inner.publisher_loop(events_rx, poll))
      .map_err(|e| HubError::InternalError(format!("spawn rt publisher thread: {}", e)))?;

    let reconnect_inner = inner.clone();
    let interval = config.reconnect_interval;
    let reconnect_thread = thread::Builder::new()
      .name("rt-reconnect".to_string())
      .spawn(move || reconnect_inner.reconnect_loop(interval))
      .map_err(|e| HubError::InternalError(format!("spawn rt reconnect thread: {}", e)))?;

    Ok(RealTimeDataBroker {
      inner,
      service_thread: Some(service_thread),
      publisher_thread: Some(publisher_thread),
      reconnect_thread: Some(reconnect_thread),
    })
  }

  pub fn request_addr(&self) -> SocketAddr {
    self.inner.request_socket.local_addr()
  }

  pub fn publish_addr(&self) -> SocketAddr {
    self.inner.pub_socket.local_addr()
  }

  /// Number of live streams currently being serviced. Diagnostic.
  pub fn active_stream_count(&self) -> usize {
    self.inner.streams.lock().len()
  }

  pub fn stop(&mut self) {
    self.inner.run.store(false, Ordering::SeqCst);
    for handle in [
      self.service_thread.take(),
      self.publisher_thread.take(),
      self.reconnect_thread.take(),
    ]
    .into_iter()
    .flatten()
    {
      let _ = handle.join();
    }
  }
}

impl Drop for RealTimeDataBroker {
  fn drop(&mut self) {
    self.stop();
  }
}

impl RtInner {
  fn service_loop(self: Arc<Self>, poll: Duration) {
    while self.run.load(Ordering::SeqCst) {
      match self.request_socket.incoming().recv_timeout(poll) {
        Ok((identity, frames)) => self.handle_request(identity, &frames),
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
      }
    }
    debug!("Real-time broker service loop exited");
  }

  fn publisher_loop(self: Arc<Self>, events_rx: Receiver<LiveDataEvent>, poll: Duration) {
    while self.run.load(Ordering::SeqCst) {
      match events_rx.recv_timeout(poll) {
        Ok(event) => self.handle_live_event(event),
        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
      }
    }
    debug!("Real-time publisher loop exited");
  }

  fn reconnect_loop(self: Arc<Self>, interval: Duration) {
    let slice = Duration::from_millis(100);
    let mut elapsed = Duration::ZERO;
    while self.run.load(Ordering::SeqCst) {
      thread::sleep(slice);
      elapsed += slice;
      if elapsed < interval {
        continue;
      }
      elapsed = Duration::ZERO;
      for (name, source) in &self.sources {
        if !source.is_connected() {
          debug!("Attempting reconnect of real-time source {}", name);
          if let Err(e) = source.connect() {
            warn!("Reconnect of real-time source {} failed: {}", name, e);
          }
        }
      }
    }
  }

  fn handle_request(&self, identity: Identity, frames: &Frames) {
    let tag = match wire::tag_of(frames) {
      Ok(tag) => tag,
      Err(e) => {
        warn!("Bad real-time request from {}: {}", identity, e);
        self.reply_error(identity, &e.to_string());
        return;
      }
    };
    match tag {
      wire::MessageType::Ping => {
        let _ = self.request_socket.send(identity, &[wire::tag_frame(wire::MessageType::Pong)]);
      }
      wire::MessageType::Subscribe => {
        match frames.get(1).map(|f| wire::decode::<RealTimeDataRequest>(f)) {
          Some(Ok(request)) => self.handle_subscribe(identity, request),
          _ => self.reply_error(identity, "malformed subscribe request"),
        }
      }
      wire::MessageType::Cancel => match wire::parse_cancel(frames) {
        Ok((instrument, frequency)) => self.handle_cancel(identity, instrument, frequency),
        Err(e) => self.reply_error(identity, &e.to_string()),
      },
      other => {
        warn!("Unexpected message type {:?} on real-time socket from {}", other, identity);
        self.reply_error(identity, &format!("unexpected message type {:?}", other));
      }
    }
  }

  /// Validation order: known source, source connected, no active stream for
  /// the pair, instrument registered. Each failure is a typed reason on the
  /// reply; the second subscriber to a live pair is rejected, not merged.
  fn handle_subscribe(&self, identity: Identity, request: RealTimeDataRequest) {
    let source_name = request.instrument.route_source().to_string();
    let source = match self.sources.get(&source_name) {
      Some(source) => source.clone(),
      None => {
        self.reply_error(identity, &HubError::UnknownDataSource(source_name).to_string());
        return;
      }
    };
    if !source.is_connected() {
      self.reply_error(identity, &HubError::SourceDisconnected(source_name).to_string());
      return;
    }
    let instrument_id = match request.instrument.id {
      Some(id) => id,
      None => {
        self.reply_error(
          identity,
          &HubError::InstrumentWithoutId(request.instrument.symbol.clone()).to_string(),
        );
        return;
      }
    };
    let key = (instrument_id, request.frequency);
    {
      let streams = self.streams.lock();
      if streams.contains_key(&key) {
        self.reply_error(
          identity,
          &HubError::StreamAlreadyActive(
            request.instrument.symbol.clone(),
            request.frequency.to_string(),
          )
          .to_string(),
        );
        return;
      }
    }
    let stream_id = match source.subscribe(&request) {
      Ok(stream_id) => stream_id,
      Err(e) => {
        self.reply_error(identity, &e.to_string());
        return;
      }
    };
    let symbol = request.instrument.symbol.clone();
    info!(
      "Live stream started: {} @ {} via {} (stream {})",
      symbol, request.frequency, source_name, stream_id
    );
    self.streams.lock().insert(key, ActiveStream { request, source_name, stream_id });
    self.stream_index.lock().insert(stream_id, key);
    let _ = self.request_socket.send(identity, &wire::subscribe_ok_frames(&symbol));
  }

  fn handle_cancel(&self, identity: Identity, instrument: crate::instrument::Instrument, frequency: BarFrequency) {
    let instrument_id = match instrument.id {
      Some(id) => id,
      None => {
        self.reply_error(identity, &HubError::InstrumentWithoutId(instrument.symbol).to_string());
        return;
      }
    };
    let key = (instrument_id, frequency);
    let removed = self.streams.lock().remove(&key);
    match removed {
      Some(stream) => {
        self.stream_index.lock().remove(&stream.stream_id);
        if let Some(source) = self.sources.get(&stream.source_name) {
          if let Err(e) = source.cancel(stream.stream_id) {
            warn!("Adapter cancel of stream {} failed: {}", stream.stream_id, e);
          }
        }
        info!("Live stream cancelled: {} @ {}", instrument.symbol, frequency);
        let _ = self
          .request_socket
          .send(identity, &wire::cancel_ok_frames(&stream.request.instrument.symbol, frequency));
      }
      None => {
        // Reported, not fatal.
        self.reply_error(
          identity,
          &HubError::StreamNotFound(instrument.symbol.clone(), frequency.to_string()).to_string(),
        );
      }
    }
  }

  fn handle_live_event(&self, event: LiveDataEvent) {
    match event {
      LiveDataEvent::Data { stream_id, event } => {
        // A cancelled stream's straggler events hit a purged index: no-op.
        if !self.stream_index.lock().contains_key(&stream_id) {
          debug!("Dropping event for inactive stream {}", stream_id);
          return;
        }
        self.publish(&event);
      }
      LiveDataEvent::StreamFailed { stream_id, message } => {
        warn!("Live stream {} failed: {}", stream_id, message);
        if let Some(key) = self.stream_index.lock().remove(&stream_id) {
          self.streams.lock().remove(&key);
        }
      }
      LiveDataEvent::Connected { source } => info!("Real-time source {} connected", source),
      LiveDataEvent::Disconnected { source } => {
        // Their adapter-side streams are dead; purge so resubscription is
        // possible once the source comes back.
        warn!("Real-time source {} disconnected; purging its streams", source);
        let mut streams = self.streams.lock();
        let mut index = self.stream_index.lock();
        streams.retain(|_, stream| {
          let keep = stream.source_name != source;
          if !keep {
            index.remove(&stream.stream_id);
          }
          keep
        });
      }
    }
  }

  fn publish(&self, event: &RealTimeEvent) {
    let topic = match event {
      RealTimeEvent::Tick { instrument_id, .. } => stream_topic(*instrument_id, BarFrequency::Tick),
      RealTimeEvent::Bar { instrument_id, frequency, .. } => stream_topic(*instrument_id, *frequency),
    };
    match wire::publish_payload(event) {
      Ok(payload) => self.pub_socket.publish(&topic, &payload),
      Err(e) => warn!("Failed to encode publish payload: {}", e),
    }
  }

  fn reply_error(&self, identity: Identity, message: &str) {
    if let Err(e) = self.request_socket.send(identity, &wire::error_frames(message)) {
      debug!("Dropped real-time error reply to {}: {}", identity, e);
    }
  }
}
