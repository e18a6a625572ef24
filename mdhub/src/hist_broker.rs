// mdhub/src/hist_broker.rs
// Historical data broker: accepts client requests on a router socket,
// decides the minimal set of fetches (local storage, external source, or a
// split across both), tracks in-flight sub-requests, and assembles exactly
// one compressed reply per accepted request.
//
// All mutation funnels through the service thread: socket messages, adapter
// events, and the outbound delivery queue are drained from one select loop.
// Adapter callbacks only ever touch broker state through the event channel.

use crate::adapter::{HistoricalDataSource, HistoricalEvent};
use crate::base::{HubError, Result};
use crate::data::{HistoricalDataRequest, OHLCBar};
use crate::storage::BarStorage;
use crate::transport::{Frames, Identity, RouterSocket};
use crate::wire;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct HistBrokerConfig {
  /// Address the request socket binds; bind failure is fatal at startup.
  pub bind_address: String,
  /// Interval between reconnect sweeps over disconnected backends.
  pub reconnect_interval: Duration,
  /// Service-loop select timeout.
  pub poll_timeout: Duration,
}

impl Default for HistBrokerConfig {
  fn default() -> Self {
    Self {
      bind_address: "127.0.0.1:0".to_string(),
      reconnect_interval: Duration::from_secs(10),
      poll_timeout: Duration::from_millis(20),
    }
  }
}

/// Where an accepted request stands. One entry per assigned ID; the entry
/// (with its client identity) exists from acceptance until the reply is
/// handed to the socket, so a second reply for the same ID is impossible.
#[derive(Debug)]
enum FillState {
  /// Served from local storage; the reply is already on the delivery queue.
  AwaitingStorage,
  /// One external dispatch covers the whole outstanding range. When
  /// `combine_local_prefix` is set the reply is local bars strictly before
  /// the external result, then the external bars (the no-persist path).
  AwaitingExternal { combine_local_prefix: bool },
  /// Split into gap-filling sub-requests; `remaining` holds the sub IDs
  /// still in flight.
  AwaitingSubRequests { remaining: HashSet<i64> },
}

struct PendingRequest {
  request: HistoricalDataRequest,
  identity: Identity,
  state: FillState,
}

/// What the reconciliation paths queue for the delivery loop.
enum Delivery {
  Bars { assigned_id: i64, bars: Vec<OHLCBar> },
  Error { assigned_id: i64, message: String },
}

/// Routing decision for an accepted request, given local coverage.
/// Pure so the decision tree is testable without sockets or storage.
#[derive(Debug, Clone, PartialEq)]
enum RoutePlan {
  LocalOnly,
  ExternalWhole,
  /// No-persist forward gap: fetch only `[fetch_start, end]` externally and
  /// prepend the local prefix in memory when the bars arrive.
  ExternalTail { fetch_start: DateTime<Utc> },
  Split {
    back: Option<(DateTime<Utc>, DateTime<Utc>)>,
    forward: Option<(DateTime<Utc>, DateTime<Utc>)>,
  },
}

fn plan_route(
  request: &HistoricalDataRequest,
  coverage: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> RoutePlan {
  if request.force_fresh_data {
    return RoutePlan::ExternalWhole;
  }
  if request.local_storage_only {
    return RoutePlan::LocalOnly;
  }
  let (earliest, latest) = match coverage {
    None => return RoutePlan::ExternalWhole,
    Some(range) => range,
  };
  if earliest <= request.start_date && latest >= request.end_date {
    return RoutePlan::LocalOnly;
  }
  // Expired instrument: once coverage reaches the expiration there is
  // nothing newer to fetch, so stale-looking coverage is complete.
  if let Some(expiration) = request.instrument.expiration_date {
    let period = request.frequency.period();
    if expiration <= request.end_date && latest + period >= expiration {
      return RoutePlan::LocalOnly;
    }
  }
  let half = request.frequency.half_period();
  let need_back = request.start_date < earliest;
  let need_forward = request.end_date > latest;
  if request.save_to_storage {
    // The half-bar guard keeps a sub-request from re-fetching the bar
    // already sitting at the coverage edge.
    RoutePlan::Split {
      back: need_back.then(|| (request.start_date, earliest - half)),
      forward: need_forward.then(|| (latest + half, request.end_date)),
    }
  } else if need_forward && !need_back {
    // Without persistence there is no single store to re-read, so only the
    // append-at-the-end gap can be reconciled in memory; the local prefix
    // is prepended when the external bars arrive.
    RoutePlan::ExternalTail { fetch_start: latest + half }
  } else {
    // A back-fill without persistence cannot be stitched after the local
    // data; serve the whole range fresh instead.
    RoutePlan::ExternalWhole
  }
}

struct Inner {
  socket: RouterSocket,
  storage: Arc<dyn BarStorage>,
  sources: HashMap<String, Arc<dyn HistoricalDataSource>>,
  pending: Mutex<HashMap<i64, PendingRequest>>,
  /// Sub-request ID -> parent assigned ID.
  sub_owner: Mutex<HashMap<i64, i64>>,
  delivery_tx: Sender<Delivery>,
  next_assigned_id: AtomicI64,
  run: AtomicBool,
}

/// The historical data broker. `start` binds the socket and spawns the
/// service and reconnect threads; `stop` joins them.
pub struct HistoricalDataBroker {
  inner: Arc<Inner>,
  service_thread: Option<thread::JoinHandle<()>>,
  reconnect_thread: Option<thread::JoinHandle<()>>,
}

impl HistoricalDataBroker {
  pub fn start(
    config: HistBrokerConfig,
    storage: Arc<dyn BarStorage>,
    sources: Vec<Arc<dyn HistoricalDataSource>>,
  ) -> Result<Self> {
    let socket = RouterSocket::bind(&config.bind_address)?;
    let (events_tx, events_rx) = unbounded();
    let (delivery_tx, delivery_rx) = unbounded();

    let mut source_map = HashMap::new();
    for source in sources {
      source.set_event_sink(events_tx.clone());
      if source_map.insert(source.name().to_string(), source.clone()).is_some() {
        return Err(HubError::ConfigurationError(format!(
          "duplicate historical data source '{}'", source.name()
        )));
      }
    }

    let inner = Arc::new(Inner {
      socket,
      storage,
      sources: source_map,
      pending: Mutex::new(HashMap::new()),
      sub_owner: Mutex::new(HashMap::new()),
      delivery_tx,
      next_assigned_id: AtomicI64::new(1),
      run: AtomicBool::new(true),
    });
    info!(
      "Historical data broker listening on {} with {} source(s)",
      inner.socket.local_addr(),
      inner.sources.len()
    );

    let service_inner = inner.clone();
    let poll = config.poll_timeout;
    let service_thread = thread::Builder::new()
      .name("hist-broker".to_string())
      .spawn(move || service_inner.service_loop(events_rx, delivery_rx, poll))
      .map_err(|e| HubError::InternalError(format!("spawn broker thread: {}", e)))?;

    let reconnect_inner = inner.clone();
    let interval = config.reconnect_interval;
    let reconnect_thread = thread::Builder::new()
      .name("hist-reconnect".to_string())
      .spawn(move || reconnect_inner.reconnect_loop(interval))
      .map_err(|e| HubError::InternalError(format!("spawn reconnect thread: {}", e)))?;

    Ok(HistoricalDataBroker {
      inner,
      service_thread: Some(service_thread),
      reconnect_thread: Some(reconnect_thread),
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.inner.socket.local_addr()
  }

  /// Number of requests currently in flight. Diagnostic.
  pub fn pending_count(&self) -> usize {
    self.inner.pending.lock().len()
  }

  pub fn stop(&mut self) {
    self.inner.run.store(false, Ordering::SeqCst);
    if let Some(handle) = self.service_thread.take() {
      let _ = handle.join();
    }
    if let Some(handle) = self.reconnect_thread.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for HistoricalDataBroker {
  fn drop(&mut self) {
    self.stop();
  }
}

impl Inner {
  fn service_loop(
    self: Arc<Self>,
    events_rx: Receiver<HistoricalEvent>,
    delivery_rx: Receiver<Delivery>,
    poll: Duration,
  ) {
    while self.run.load(Ordering::SeqCst) {
      crossbeam_channel::select! {
        recv(self.socket.incoming()) -> msg => match msg {
          Ok((identity, frames)) => self.handle_socket_message(identity, &frames),
          Err(_) => break,
        },
        recv(events_rx) -> event => match event {
          Ok(event) => self.handle_adapter_event(event),
          Err(_) => break,
        },
        recv(delivery_rx) -> item => match item {
          Ok(item) => self.deliver(item),
          Err(_) => break,
        },
        default(poll) => {}
      }
    }
    debug!("Historical broker service loop exited");
  }

  fn reconnect_loop(self: Arc<Self>, interval: Duration) {
    // Sleep in short slices so stop() is not held up by the full interval.
    let slice = Duration::from_millis(100);
    let mut elapsed = Duration::ZERO;
    while self.run.load(Ordering::SeqCst) {
      thread::sleep(slice);
      elapsed += slice;
      if elapsed < interval {
        continue;
      }
      elapsed = Duration::ZERO;
      if !self.storage.is_connected() {
        if let Err(e) = self.storage.connect() {
          warn!("Storage reconnect failed: {}", e);
        }
      }
      for (name, source) in &self.sources {
        if !source.is_connected() {
          debug!("Attempting reconnect of source {}", name);
          if let Err(e) = source.connect() {
            warn!("Reconnect of source {} failed: {}", name, e);
          }
        }
      }
    }
  }

  // --- Inbound socket messages ---

  fn handle_socket_message(&self, identity: Identity, frames: &Frames) {
    let tag = match wire::tag_of(frames) {
      Ok(tag) => tag,
      Err(e) => {
        warn!("Bad message from identity {}: {}", identity, e);
        self.send_generic_error(identity, &e.to_string());
        return;
      }
    };
    match tag {
      wire::MessageType::HistoricalRequest => {
        match frames.get(1).map(|f| wire::decode::<HistoricalDataRequest>(f)) {
          Some(Ok(request)) => self.accept_request(identity, request),
          Some(Err(e)) => self.send_generic_error(identity, &format!("malformed historical request: {}", e)),
          None => self.send_generic_error(identity, "historical request missing payload frame"),
        }
      }
      wire::MessageType::HistoricalPush => self.handle_push(identity, frames),
      wire::MessageType::AvailableDataRequest => self.handle_available_data(identity, frames),
      other => {
        warn!("Unexpected message type {:?} on historical socket from {}", other, identity);
        self.send_generic_error(identity, &format!("unexpected message type {:?}", other));
      }
    }
  }

  fn handle_push(&self, identity: Identity, frames: &Frames) {
    match wire::parse_push(frames) {
      Ok((push, bars)) => {
        let instrument_id = match push.instrument.id {
          Some(id) => id,
          None => {
            self.send_generic_error(identity, &HubError::InstrumentWithoutId(push.instrument.symbol).to_string());
            return;
          }
        };
        match self.storage.upsert_bars(instrument_id, push.frequency, &bars) {
          Ok(count) => {
            debug!("Stored {} pushed bars for {} @ {}", count, push.instrument.symbol, push.frequency);
            let _ = self.socket.send(identity, &[wire::tag_frame(wire::MessageType::PushOk)]);
          }
          Err(e) => {
            error!(
              "Push store failed for {} @ {}: {}",
              push.instrument.symbol, push.frequency, e
            );
            self.send_generic_error(identity, &e.to_string());
          }
        }
      }
      Err(e) => self.send_generic_error(identity, &e.to_string()),
    }
  }

  fn handle_available_data(&self, identity: Identity, frames: &Frames) {
    let instrument = match frames.get(1).map(|f| wire::decode::<crate::instrument::Instrument>(f)) {
      Some(Ok(instrument)) => instrument,
      _ => {
        self.send_generic_error(identity, "malformed available-data request");
        return;
      }
    };
    let instrument_id = match instrument.id {
      Some(id) => id,
      None => {
        self.send_generic_error(identity, &HubError::InstrumentWithoutId(instrument.symbol.clone()).to_string());
        return;
      }
    };
    match self.storage.available_data(instrument_id) {
      Ok(infos) => match wire::available_data_reply_frames(&instrument, &infos) {
        Ok(reply) => {
          if let Err(e) = self.socket.send(identity, &reply) {
            debug!("Dropped available-data reply to {}: {}", identity, e);
          }
        }
        Err(e) => self.send_generic_error(identity, &e.to_string()),
      },
      Err(e) => self.send_generic_error(identity, &e.to_string()),
    }
  }

  // --- Request acceptance & routing ---

  fn accept_request(&self, identity: Identity, mut request: HistoricalDataRequest) {
    if request.end_date <= request.start_date {
      self.send_request_error(identity, &request, "end date must be after start date");
      return;
    }
    let instrument_id = match request.instrument.id {
      Some(id) => id,
      None => {
        // A missing ID cannot key storage lookups; reject, never drop.
        self.send_request_error(
          identity,
          &request,
          &HubError::InstrumentWithoutId(request.instrument.symbol.clone()).to_string(),
        );
        return;
      }
    };
    request.assigned_id = self.next_assigned_id.fetch_add(1, Ordering::SeqCst);
    debug!("Accepted {} as assigned ID {}", request, request.assigned_id);

    let coverage = if request.force_fresh_data || request.local_storage_only {
      None // not consulted by the plan
    } else {
      match self.storage.coverage(instrument_id, request.frequency) {
        Ok(coverage) => coverage,
        Err(e) => {
          error!("Coverage lookup failed for {}: {}", request, e);
          self.send_request_error(identity, &request, &e.to_string());
          return;
        }
      }
    };

    match plan_route(&request, coverage) {
      RoutePlan::LocalOnly => self.dispatch_local(identity, request, instrument_id),
      RoutePlan::ExternalWhole => self.dispatch_external(
        identity,
        request,
        FillState::AwaitingExternal { combine_local_prefix: false },
        None,
      ),
      RoutePlan::ExternalTail { fetch_start } => {
        let fetch_end = request.end_date;
        self.dispatch_external(
          identity,
          request,
          FillState::AwaitingExternal { combine_local_prefix: true },
          Some((fetch_start, fetch_end)),
        )
      }
      RoutePlan::Split { back, forward } => self.dispatch_split(identity, request, back, forward),
    }
  }

  /// Storage-only path: the read happens here on the service thread and the
  /// result goes straight onto the delivery queue.
  fn dispatch_local(&self, identity: Identity, request: HistoricalDataRequest, instrument_id: i64) {
    let assigned_id = request.assigned_id;
    let read = self.storage.read_bars(instrument_id, request.frequency, request.start_date, request.end_date);
    self.pending.lock().insert(assigned_id, PendingRequest {
      request,
      identity,
      state: FillState::AwaitingStorage,
    });
    match read {
      Ok(bars) => self.queue_delivery(Delivery::Bars { assigned_id, bars }),
      Err(e) => self.queue_delivery(Delivery::Error { assigned_id, message: e.to_string() }),
    }
  }

  fn source_for(&self, request: &HistoricalDataRequest) -> Result<Arc<dyn HistoricalDataSource>> {
    let name = request.instrument.route_source();
    let source = self
      .sources
      .get(name)
      .cloned()
      .ok_or_else(|| HubError::UnknownDataSource(name.to_string()))?;
    if !source.is_connected() {
      return Err(HubError::SourceDisconnected(name.to_string()));
    }
    Ok(source)
  }

  fn dispatch_external(
    &self,
    identity: Identity,
    request: HistoricalDataRequest,
    state: FillState,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
  ) {
    let source = match self.source_for(&request) {
      Ok(source) => source,
      Err(e) => {
        self.send_request_error(identity, &request, &e.to_string());
        return;
      }
    };
    let assigned_id = request.assigned_id;
    let outbound = match range {
      Some((start, end)) => request.sub_range(start, end),
      None => request.clone(),
    };
    // Bookkeeping goes in before dispatch so an arrival cannot race it.
    self.pending.lock().insert(assigned_id, PendingRequest { request, identity, state });
    if let Err(e) = source.request_historical_data(&outbound) {
      let removed = self.pending.lock().remove(&assigned_id);
      if let Some(entry) = removed {
        self.send_request_error(identity, &entry.request, &e.to_string());
      }
    }
  }

  fn dispatch_split(
    &self,
    identity: Identity,
    request: HistoricalDataRequest,
    back: Option<(DateTime<Utc>, DateTime<Utc>)>,
    forward: Option<(DateTime<Utc>, DateTime<Utc>)>,
  ) {
    let source = match self.source_for(&request) {
      Ok(source) => source,
      Err(e) => {
        self.send_request_error(identity, &request, &e.to_string());
        return;
      }
    };
    let assigned_id = request.assigned_id;
    let original = request.clone();
    let mut subs = Vec::new();
    for (start, end) in back.into_iter().chain(forward) {
      let mut sub = request.sub_range(start, end);
      sub.assigned_id = self.next_assigned_id.fetch_add(1, Ordering::SeqCst);
      subs.push(sub);
    }
    if subs.is_empty() {
      // Partial coverage with nothing to fetch means the plan was wrong.
      self.send_request_error(identity, &request, "internal routing error: empty split");
      return;
    }
    debug!(
      "Request {} split into {} sub-request(s): {:?}",
      assigned_id,
      subs.len(),
      subs.iter().map(|s| (s.assigned_id, s.start_date, s.end_date)).collect::<Vec<_>>()
    );
    let remaining: HashSet<i64> = subs.iter().map(|s| s.assigned_id).collect();
    {
      let mut owners = self.sub_owner.lock();
      for sub in &subs {
        owners.insert(sub.assigned_id, assigned_id);
      }
    }
    self.pending.lock().insert(assigned_id, PendingRequest {
      request,
      identity,
      state: FillState::AwaitingSubRequests { remaining },
    });
    for sub in &subs {
      if let Err(e) = source.request_historical_data(sub) {
        warn!("Sub-request {} dispatch failed: {}", sub.assigned_id, e);
        self.purge(assigned_id);
        self.send_request_error(identity, &original, &e.to_string());
        return;
      }
    }
  }

  // --- Adapter events ---

  fn handle_adapter_event(&self, event: HistoricalEvent) {
    match event {
      HistoricalEvent::DataArrived { request, bars } => self.on_external_data_arrived(request, bars),
      HistoricalEvent::RequestFailed { request, message } => {
        let arrived_id = request.assigned_id;
        let parent_id = self.sub_owner.lock().get(&arrived_id).copied().unwrap_or(arrived_id);
        warn!("External request {} (parent {}) failed: {}", arrived_id, parent_id, message);
        self.remove_sub_entries(parent_id);
        self.queue_delivery(Delivery::Error { assigned_id: parent_id, message });
      }
      HistoricalEvent::Connected { source } => info!("Historical source {} connected", source),
      HistoricalEvent::Disconnected { source } => {
        warn!("Historical source {} disconnected; reconnect timer will retry", source)
      }
    }
  }

  fn on_external_data_arrived(&self, arrived: HistoricalDataRequest, bars: Vec<OHLCBar>) {
    let arrived_id = arrived.assigned_id;
    let parent_id = self.sub_owner.lock().remove(&arrived_id);
    match parent_id {
      Some(parent_id) => self.on_sub_request_arrived(parent_id, arrived_id, bars),
      None => self.on_standalone_arrived(arrived_id, bars),
    }
  }

  fn on_sub_request_arrived(&self, parent_id: i64, sub_id: i64, bars: Vec<OHLCBar>) {
    // Split requests only exist on the persist path; write first, then
    // re-read once the set drains so the reply comes from storage alone.
    let (request, instrument_id, done) = {
      let mut pending = self.pending.lock();
      let entry = match pending.get_mut(&parent_id) {
        Some(entry) => entry,
        None => {
          // Client vanished or an earlier error purged the request.
          warn!("Sub-request {} completed for unknown assigned ID {}", sub_id, parent_id);
          return;
        }
      };
      let done = match &mut entry.state {
        FillState::AwaitingSubRequests { remaining } => {
          remaining.remove(&sub_id);
          remaining.is_empty()
        }
        other => {
          warn!("Sub-request {} arrived but request {} is in state {:?}", sub_id, parent_id, other);
          return;
        }
      };
      let instrument_id = match entry.request.instrument.id {
        Some(id) => id,
        None => {
          // Cannot happen past acceptance; defends the unwrap-free invariant.
          error!("Pending request {} lost its instrument ID", parent_id);
          return;
        }
      };
      (entry.request.clone(), instrument_id, done)
    };

    if let Err(e) = self.storage.upsert_bars(instrument_id, request.frequency, &bars) {
      error!("Storing sub-request {} bars failed: {}", sub_id, e);
      self.remove_sub_entries(parent_id);
      self.queue_delivery(Delivery::Error { assigned_id: parent_id, message: e.to_string() });
      return;
    }
    if !done {
      debug!("Sub-request {} stored; request {} still waiting", sub_id, parent_id);
      return;
    }
    // All gaps filled: re-read the original range from the single source of
    // truth rather than concatenating heterogeneous fetches.
    match self.storage.read_bars(instrument_id, request.frequency, request.start_date, request.end_date) {
      Ok(all) => self.queue_delivery(Delivery::Bars { assigned_id: parent_id, bars: all }),
      Err(e) => self.queue_delivery(Delivery::Error { assigned_id: parent_id, message: e.to_string() }),
    }
  }

  fn on_standalone_arrived(&self, assigned_id: i64, bars: Vec<OHLCBar>) {
    let (request, combine) = {
      let pending = self.pending.lock();
      match pending.get(&assigned_id) {
        Some(entry) => {
          let combine = matches!(entry.state, FillState::AwaitingExternal { combine_local_prefix: true });
          (entry.request.clone(), combine)
        }
        None => {
          warn!("External data arrived for unknown assigned ID {}; dropping", assigned_id);
          return;
        }
      }
    };
    let instrument_id = match request.instrument.id {
      Some(id) => id,
      None => {
        error!("Pending request {} lost its instrument ID", assigned_id);
        return;
      }
    };

    if request.save_to_storage {
      if let Err(e) = self.storage.upsert_bars(instrument_id, request.frequency, &bars) {
        error!("Storing bars for request {} failed: {}", assigned_id, e);
        self.queue_delivery(Delivery::Error { assigned_id, message: e.to_string() });
        return;
      }
      match self.storage.read_bars(instrument_id, request.frequency, request.start_date, request.end_date) {
        Ok(all) => self.queue_delivery(Delivery::Bars { assigned_id, bars: all }),
        Err(e) => self.queue_delivery(Delivery::Error { assigned_id, message: e.to_string() }),
      }
      return;
    }

    // No-persist path: combine in memory, bypassing storage writes.
    let combined = if combine {
      match bars.first() {
        Some(first) => {
          match self.storage.read_bars(instrument_id, request.frequency, request.start_date, request.end_date) {
            Ok(local) => {
              let mut combined: Vec<OHLCBar> =
                local.into_iter().filter(|b| b.timestamp < first.timestamp).collect();
              combined.extend(bars);
              combined
            }
            Err(e) => {
              self.queue_delivery(Delivery::Error { assigned_id, message: e.to_string() });
              return;
            }
          }
        }
        // Empty external result: whatever storage has for the range is the
        // whole answer.
        None => match self.storage.read_bars(instrument_id, request.frequency, request.start_date, request.end_date) {
          Ok(local) => local,
          Err(e) => {
            self.queue_delivery(Delivery::Error { assigned_id, message: e.to_string() });
            return;
          }
        },
      }
    } else {
      bars
    };
    self.queue_delivery(Delivery::Bars { assigned_id, bars: combined });
  }

  // --- Delivery ---

  fn queue_delivery(&self, item: Delivery) {
    if self.delivery_tx.send(item).is_err() {
      warn!("Delivery queue closed; broker stopping");
    }
  }

  /// Exactly-once reply: the pending entry is removed before the send, so a
  /// straggler for the same ID finds nothing and is dropped with a warning.
  fn deliver(&self, item: Delivery) {
    let (assigned_id, payload) = match item {
      Delivery::Bars { assigned_id, bars } => (assigned_id, Ok(bars)),
      Delivery::Error { assigned_id, message } => (assigned_id, Err(message)),
    };
    let entry = match self.pending.lock().remove(&assigned_id) {
      Some(entry) => entry,
      None => {
        warn!("Reply queued for unknown assigned ID {}; dropped", assigned_id);
        return;
      }
    };
    let frames = match payload {
      Ok(bars) => {
        debug!("Replying to request {} with {} bars", assigned_id, bars.len());
        match wire::hist_reply_frames(&entry.request, &bars) {
          Ok(frames) => frames,
          Err(e) => {
            error!("Failed to encode reply for {}: {}", assigned_id, e);
            match wire::hist_error_frames(&entry.request, &e.to_string()) {
              Ok(frames) => frames,
              Err(_) => return,
            }
          }
        }
      }
      Err(message) => match wire::hist_error_frames(&entry.request, &message) {
        Ok(frames) => frames,
        Err(e) => {
          error!("Failed to encode error reply for {}: {}", assigned_id, e);
          return;
        }
      },
    };
    if let Err(e) = self.socket.send(entry.identity, &frames) {
      // Client went away before the reply: dropped, not fatal.
      debug!("Dropped reply for request {}: {}", assigned_id, e);
    }
  }

  fn send_request_error(&self, identity: Identity, request: &HistoricalDataRequest, message: &str) {
    warn!("Request {} rejected: {}", request, message);
    match wire::hist_error_frames(request, message) {
      Ok(frames) => {
        if let Err(e) = self.socket.send(identity, &frames) {
          debug!("Dropped error reply to {}: {}", identity, e);
        }
      }
      Err(e) => error!("Failed to encode error reply: {}", e),
    }
  }

  fn send_generic_error(&self, identity: Identity, message: &str) {
    if let Err(e) = self.socket.send(identity, &wire::error_frames(message)) {
      debug!("Dropped error reply to {}: {}", identity, e);
    }
  }

  /// Remove every sub-request entry owned by `parent_id`.
  fn remove_sub_entries(&self, parent_id: i64) {
    self.sub_owner.lock().retain(|_, owner| *owner != parent_id);
  }

  /// Purge all bookkeeping for an assigned ID (on dispatch failure).
  fn purge(&self, assigned_id: i64) {
    self.pending.lock().remove(&assigned_id);
    self.remove_sub_entries(assigned_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::data::{BarFrequency, HistoricalDataRequest};
  use crate::instrument::Instrument;
  use chrono::{Duration as ChronoDuration, TimeZone};

  fn request(start_day: u32, end_day: u32) -> HistoricalDataRequest {
    let instrument = Instrument::new(1, "ES", "sim");
    HistoricalDataRequest::new(
      instrument,
      BarFrequency::OneDay,
      Utc.with_ymd_and_hms(2020, 1, start_day, 0, 0, 0).unwrap(),
      Utc.with_ymd_and_hms(2020, 12, end_day, 0, 0, 0).unwrap(),
    )
  }

  fn cov(sm: u32, sd: u32, em: u32, ed: u32) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    Some((
      Utc.with_ymd_and_hms(2020, sm, sd, 0, 0, 0).unwrap(),
      Utc.with_ymd_and_hms(2020, em, ed, 0, 0, 0).unwrap(),
    ))
  }

  #[test]
  fn no_coverage_goes_external_whole() {
    let plan = plan_route(&request(1, 31), None);
    assert_eq!(plan, RoutePlan::ExternalWhole);
  }

  #[test]
  fn full_coverage_stays_local() {
    let req = request(2, 30);
    let plan = plan_route(&req, cov(1, 1, 12, 31));
    assert_eq!(plan, RoutePlan::LocalOnly);
  }

  #[test]
  fn partial_coverage_splits_both_ways_with_guard_offsets() {
    let req = request(1, 31);
    let plan = plan_route(&req, cov(3, 1, 6, 1));
    let half = ChronoDuration::hours(12);
    match plan {
      RoutePlan::Split { back: Some((bs, be)), forward: Some((fs, fe)) } => {
        assert_eq!(bs, req.start_date);
        assert_eq!(be, Utc.with_ymd_and_hms(2020, 3, 1, 0, 0, 0).unwrap() - half);
        assert_eq!(fs, Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap() + half);
        assert_eq!(fe, req.end_date);
      }
      other => panic!("expected two-way split, got {:?}", other),
    }
  }

  #[test]
  fn forward_only_gap_splits_forward_only() {
    let req = request(1, 31);
    // Coverage reaches back before the request start.
    let plan = plan_route(&req, cov(1, 1, 6, 1));
    match plan {
      RoutePlan::Split { back: None, forward: Some(_) } => {}
      other => panic!("expected forward-only split, got {:?}", other),
    }
  }

  #[test]
  fn force_fresh_skips_storage() {
    let mut req = request(1, 31);
    req.force_fresh_data = true;
    let plan = plan_route(&req, cov(1, 1, 12, 31));
    assert_eq!(plan, RoutePlan::ExternalWhole);
  }

  #[test]
  fn local_only_never_goes_external() {
    let mut req = request(1, 31);
    req.local_storage_only = true;
    assert_eq!(plan_route(&req, None), RoutePlan::LocalOnly);
  }

  #[test]
  fn expired_instrument_treats_stale_coverage_as_final() {
    let mut req = request(1, 31);
    req.instrument.expiration_date = Some(Utc.with_ymd_and_hms(2020, 6, 15, 0, 0, 0).unwrap());
    // Coverage ends at expiration; nothing newer exists to fetch.
    let plan = plan_route(&req, cov(1, 1, 6, 15));
    assert_eq!(plan, RoutePlan::LocalOnly);
  }

  #[test]
  fn unexpired_partial_coverage_still_splits() {
    let mut req = request(1, 31);
    req.instrument.expiration_date = Some(Utc.with_ymd_and_hms(2021, 6, 15, 0, 0, 0).unwrap());
    let plan = plan_route(&req, cov(1, 1, 6, 1));
    assert!(matches!(plan, RoutePlan::Split { .. }));
  }

  #[test]
  fn no_persist_forward_gap_combines_in_memory() {
    let mut req = request(1, 31);
    req.save_to_storage = false;
    let plan = plan_route(&req, cov(1, 1, 6, 1));
    assert_eq!(plan, RoutePlan::ExternalTail {
      fetch_start: Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap() + ChronoDuration::hours(12),
    });
  }

  #[test]
  fn no_persist_back_gap_serves_whole_range_fresh() {
    let mut req = request(1, 31);
    req.save_to_storage = false;
    let plan = plan_route(&req, cov(3, 1, 12, 31));
    assert_eq!(plan, RoutePlan::ExternalWhole);
  }
}
