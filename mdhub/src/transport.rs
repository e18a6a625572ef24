// mdhub/src/transport.rs
// Framed TCP sockets for the broker transports.
//
// Four socket roles, mirroring the request/reply and fan-out patterns the
// brokers need:
//   RouterSocket  - server side of request/reply; inbound messages surface
//                   as (identity, frames), replies are addressed by identity.
//   DealerSocket  - client side of request/reply; one connection.
//   PubSocket     - server side of fan-out; subscribers register topic
//                   prefixes, publish writes to every matching connection.
//   SubSocket     - client side of fan-out.
//
// Framing: a message is [u32 BE frame count] then, per frame, [u32 BE frame
// length][bytes]. Identities are per-connection counters, never reused while
// the socket lives. Reader threads poll with short read timeouts and exit on
// a stop flag or EOF.

use crate::base::{HubError, Result};
use byteorder::{BigEndian, ByteOrder};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Opaque per-connection identity a reply is routed by.
pub type Identity = u64;
pub type Frames = Vec<Vec<u8>>;

const READ_POLL: Duration = Duration::from_millis(50);
/// Upper bound on a single message; anything larger is a corrupt stream.
const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

fn configure_stream(stream: &TcpStream) -> std::io::Result<()> {
  // Accepted sockets may inherit the listener's non-blocking mode; the
  // reader loops rely on blocking reads with a short timeout.
  stream.set_nonblocking(false)?;
  stream.set_nodelay(true)?;
  let sock = socket2::SockRef::from(stream);
  let keepalive = socket2::TcpKeepalive::new().with_time(Duration::from_secs(30));
  sock.set_tcp_keepalive(&keepalive)?;
  stream.set_read_timeout(Some(READ_POLL))
}

/// Read exactly `buf.len()` bytes, looping over short read timeouts so the
/// stop flag stays responsive. Partial reads are never abandoned; the frame
/// stream cannot lose sync.
fn read_exact_interruptible(stream: &mut TcpStream, buf: &mut [u8], stop: &AtomicBool) -> std::io::Result<bool> {
  let mut bytes_read = 0;
  while bytes_read < buf.len() {
    if stop.load(Ordering::Relaxed) && bytes_read == 0 {
      return Ok(false);
    }
    match stream.read(&mut buf[bytes_read..]) {
      Ok(0) => return Err(std::io::Error::new(ErrorKind::UnexpectedEof, "connection closed")),
      Ok(n) => bytes_read += n,
      Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
        if stop.load(Ordering::Relaxed) {
          // Mid-message stop abandons the frame; the connection is going
          // away anyway.
          return if bytes_read == 0 {
            Ok(false)
          } else {
            Err(std::io::Error::new(ErrorKind::Interrupted, "stopped mid-read"))
          };
        }
        continue;
      }
      Err(e) => return Err(e),
    }
  }
  Ok(true)
}

/// Read one framed message. `Ok(None)` means the stop flag was raised while
/// idle between messages.
fn read_message(stream: &mut TcpStream, stop: &AtomicBool) -> std::io::Result<Option<Frames>> {
  let mut count_buf = [0u8; 4];
  if !read_exact_interruptible(stream, &mut count_buf, stop)? {
    return Ok(None);
  }
  let count = BigEndian::read_u32(&count_buf) as usize;
  if count == 0 || count > 1024 {
    return Err(std::io::Error::new(ErrorKind::InvalidData, format!("bad frame count {}", count)));
  }
  let mut frames = Vec::with_capacity(count);
  for _ in 0..count {
    let mut len_buf = [0u8; 4];
    if !read_exact_interruptible(stream, &mut len_buf, stop)? {
      return Err(std::io::Error::new(ErrorKind::Interrupted, "stopped mid-message"));
    }
    let len = BigEndian::read_u32(&len_buf) as usize;
    if len > MAX_FRAME_BYTES {
      return Err(std::io::Error::new(ErrorKind::InvalidData, format!("frame of {} bytes", len)));
    }
    let mut frame = vec![0u8; len];
    if !read_exact_interruptible(stream, &mut frame, stop)? {
      return Err(std::io::Error::new(ErrorKind::Interrupted, "stopped mid-message"));
    }
    frames.push(frame);
  }
  Ok(Some(frames))
}

fn write_message(stream: &mut TcpStream, frames: &[Vec<u8>]) -> std::io::Result<()> {
  let mut buf = Vec::with_capacity(8 + frames.iter().map(|f| f.len() + 4).sum::<usize>());
  let mut header = [0u8; 4];
  BigEndian::write_u32(&mut header, frames.len() as u32);
  buf.extend_from_slice(&header);
  for frame in frames {
    BigEndian::write_u32(&mut header, frame.len() as u32);
    buf.extend_from_slice(&header);
    buf.extend_from_slice(frame);
  }
  stream.write_all(&buf)?;
  stream.flush()
}

// --- Router ---

struct RouterShared {
  writers: Mutex<HashMap<Identity, TcpStream>>,
  inbound_tx: Sender<(Identity, Frames)>,
  stop: AtomicBool,
  next_identity: AtomicU64,
}

/// Server side of the request/reply pattern.
pub struct RouterSocket {
  local_addr: SocketAddr,
  shared: Arc<RouterShared>,
  inbound_rx: Receiver<(Identity, Frames)>,
  accept_thread: Option<thread::JoinHandle<()>>,
}

impl RouterSocket {
  pub fn bind(addr: &str) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .map_err(|e| HubError::BindFailed(addr.to_string(), e.to_string()))?;
    let local_addr = listener
      .local_addr()
      .map_err(|e| HubError::BindFailed(addr.to_string(), e.to_string()))?;
    listener
      .set_nonblocking(true)
      .map_err(|e| HubError::SocketError(e.to_string()))?;

    let (inbound_tx, inbound_rx) = unbounded();
    let shared = Arc::new(RouterShared {
      writers: Mutex::new(HashMap::new()),
      inbound_tx,
      stop: AtomicBool::new(false),
      next_identity: AtomicU64::new(1),
    });

    let accept_shared = shared.clone();
    let accept_thread = thread::Builder::new()
      .name(format!("router-accept-{}", local_addr.port()))
      .spawn(move || Self::accept_loop(listener, accept_shared))
      .map_err(|e| HubError::InternalError(format!("spawn accept thread: {}", e)))?;

    info!("Router socket listening on {}", local_addr);
    Ok(RouterSocket { local_addr, shared, inbound_rx, accept_thread: Some(accept_thread) })
  }

  fn accept_loop(listener: TcpListener, shared: Arc<RouterShared>) {
    let mut readers = Vec::new();
    while !shared.stop.load(Ordering::Relaxed) {
      match listener.accept() {
        Ok((stream, peer)) => {
          if let Err(e) = configure_stream(&stream) {
            warn!("Failed to configure accepted connection from {}: {}", peer, e);
            continue;
          }
          let identity = shared.next_identity.fetch_add(1, Ordering::Relaxed);
          debug!("Router connection from {} assigned identity {}", peer, identity);
          match stream.try_clone() {
            Ok(writer) => {
              shared.writers.lock().insert(identity, writer);
            }
            Err(e) => {
              warn!("Failed to clone connection from {}: {}", peer, e);
              continue;
            }
          }
          let conn_shared = shared.clone();
          let handle = thread::Builder::new()
            .name(format!("router-conn-{}", identity))
            .spawn(move || Self::reader_loop(stream, identity, conn_shared));
          match handle {
            Ok(h) => readers.push(h),
            Err(e) => warn!("Failed to spawn reader for identity {}: {}", identity, e),
          }
        }
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
          thread::sleep(Duration::from_millis(10));
        }
        Err(e) => {
          warn!("Router accept error: {}", e);
          thread::sleep(Duration::from_millis(100));
        }
      }
    }
    for handle in readers {
      let _ = handle.join();
    }
  }

  fn reader_loop(mut stream: TcpStream, identity: Identity, shared: Arc<RouterShared>) {
    loop {
      match read_message(&mut stream, &shared.stop) {
        Ok(Some(frames)) => {
          trace!("Router identity {} sent {} frames", identity, frames.len());
          if shared.inbound_tx.send((identity, frames)).is_err() {
            break;
          }
        }
        Ok(None) => break, // stop flag
        Err(ref e) if e.kind() == ErrorKind::Interrupted => break,
        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
          debug!("Router identity {} disconnected", identity);
          break;
        }
        Err(e) => {
          warn!("Router identity {} read error: {}", identity, e);
          break;
        }
      }
    }
    shared.writers.lock().remove(&identity);
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Channel of inbound (identity, frames) messages; selectable.
  pub fn incoming(&self) -> &Receiver<(Identity, Frames)> {
    &self.inbound_rx
  }

  /// Send a reply to the connection behind `identity`. Fails with
  /// `UnknownIdentity` if the client has disconnected.
  pub fn send(&self, identity: Identity, frames: &[Vec<u8>]) -> Result<()> {
    let mut writers = self.shared.writers.lock();
    let stream = writers.get_mut(&identity).ok_or(HubError::UnknownIdentity(identity))?;
    if let Err(e) = write_message(stream, frames) {
      writers.remove(&identity);
      return Err(HubError::SocketError(format!("send to identity {}: {}", identity, e)));
    }
    Ok(())
  }

  pub fn stop(&mut self) {
    self.shared.stop.store(true, Ordering::Relaxed);
    if let Some(handle) = self.accept_thread.take() {
      let _ = handle.join();
    }
    self.shared.writers.lock().clear();
  }
}

impl Drop for RouterSocket {
  fn drop(&mut self) {
    self.stop();
  }
}

// --- Dealer ---

/// Client side of the request/reply pattern: one connection, framed
/// messages in both directions.
pub struct DealerSocket {
  writer: Mutex<TcpStream>,
  inbound_rx: Receiver<Frames>,
  stop: Arc<AtomicBool>,
  reader_thread: Option<thread::JoinHandle<()>>,
}

impl DealerSocket {
  pub fn connect(addr: &str) -> Result<Self> {
    let stream = TcpStream::connect(addr)
      .map_err(|e| HubError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    configure_stream(&stream).map_err(|e| HubError::SocketError(e.to_string()))?;
    let writer = stream.try_clone().map_err(|e| HubError::SocketError(e.to_string()))?;

    let (inbound_tx, inbound_rx) = unbounded();
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();
    let mut reader_stream = stream;
    let reader_thread = thread::Builder::new()
      .name("dealer-reader".to_string())
      .spawn(move || loop {
        match read_message(&mut reader_stream, &reader_stop) {
          Ok(Some(frames)) => {
            if inbound_tx.send(frames).is_err() {
              break;
            }
          }
          Ok(None) => break,
          Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
            debug!("Dealer connection closed by peer");
            break;
          }
          Err(e) => {
            warn!("Dealer read error: {}", e);
            break;
          }
        }
      })
      .map_err(|e| HubError::InternalError(format!("spawn dealer reader: {}", e)))?;

    Ok(DealerSocket {
      writer: Mutex::new(writer),
      inbound_rx,
      stop,
      reader_thread: Some(reader_thread),
    })
  }

  pub fn send(&self, frames: &[Vec<u8>]) -> Result<()> {
    let mut writer = self.writer.lock();
    write_message(&mut writer, frames).map_err(|e| HubError::SocketError(e.to_string()))
  }

  pub fn incoming(&self) -> &Receiver<Frames> {
    &self.inbound_rx
  }

  /// Blocking receive with timeout; the synchronous request/reply helper.
  pub fn recv_timeout(&self, timeout: Duration) -> Result<Frames> {
    self
      .inbound_rx
      .recv_timeout(timeout)
      .map_err(|_| HubError::Timeout(format!("no reply within {:?}", timeout)))
  }

  pub fn stop(&mut self) {
    self.stop.store(true, Ordering::Relaxed);
    if let Some(handle) = self.reader_thread.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for DealerSocket {
  fn drop(&mut self) {
    self.stop();
  }
}

// --- Pub ---

/// Subscribe control byte (then topic bytes) on the pub connection.
const SUB_CONTROL_SUBSCRIBE: u8 = 0x01;
const SUB_CONTROL_UNSUBSCRIBE: u8 = 0x00;

struct Subscriber {
  writer: TcpStream,
  topics: Arc<Mutex<HashSet<Vec<u8>>>>,
}

struct PubShared {
  subscribers: Mutex<HashMap<Identity, Subscriber>>,
  stop: AtomicBool,
  next_identity: AtomicU64,
}

/// Server side of the fan-out pattern. Subscribers register topic prefixes;
/// `publish` writes to every connection with a matching prefix. No replay:
/// data published before a subscription arrives is lost.
pub struct PubSocket {
  local_addr: SocketAddr,
  shared: Arc<PubShared>,
  accept_thread: Option<thread::JoinHandle<()>>,
}

impl PubSocket {
  pub fn bind(addr: &str) -> Result<Self> {
    let listener = TcpListener::bind(addr)
      .map_err(|e| HubError::BindFailed(addr.to_string(), e.to_string()))?;
    let local_addr = listener
      .local_addr()
      .map_err(|e| HubError::BindFailed(addr.to_string(), e.to_string()))?;
    listener
      .set_nonblocking(true)
      .map_err(|e| HubError::SocketError(e.to_string()))?;

    let shared = Arc::new(PubShared {
      subscribers: Mutex::new(HashMap::new()),
      stop: AtomicBool::new(false),
      next_identity: AtomicU64::new(1),
    });
    let accept_shared = shared.clone();
    let accept_thread = thread::Builder::new()
      .name(format!("pub-accept-{}", local_addr.port()))
      .spawn(move || Self::accept_loop(listener, accept_shared))
      .map_err(|e| HubError::InternalError(format!("spawn pub accept thread: {}", e)))?;

    info!("Publish socket listening on {}", local_addr);
    Ok(PubSocket { local_addr, shared, accept_thread: Some(accept_thread) })
  }

  fn accept_loop(listener: TcpListener, shared: Arc<PubShared>) {
    let mut readers = Vec::new();
    while !shared.stop.load(Ordering::Relaxed) {
      match listener.accept() {
        Ok((stream, peer)) => {
          if let Err(e) = configure_stream(&stream) {
            warn!("Failed to configure subscriber from {}: {}", peer, e);
            continue;
          }
          let identity = shared.next_identity.fetch_add(1, Ordering::Relaxed);
          let topics = Arc::new(Mutex::new(HashSet::new()));
          match stream.try_clone() {
            Ok(writer) => {
              shared.subscribers.lock().insert(identity, Subscriber { writer, topics: topics.clone() });
            }
            Err(e) => {
              warn!("Failed to clone subscriber from {}: {}", peer, e);
              continue;
            }
          }
          debug!("Subscriber {} connected from {}", identity, peer);
          let conn_shared = shared.clone();
          let handle = thread::Builder::new()
            .name(format!("pub-conn-{}", identity))
            .spawn(move || Self::reader_loop(stream, identity, topics, conn_shared));
          match handle {
            Ok(h) => readers.push(h),
            Err(e) => warn!("Failed to spawn subscriber reader {}: {}", identity, e),
          }
        }
        Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
          thread::sleep(Duration::from_millis(10));
        }
        Err(e) => {
          warn!("Pub accept error: {}", e);
          thread::sleep(Duration::from_millis(100));
        }
      }
    }
    for handle in readers {
      let _ = handle.join();
    }
  }

  /// Subscribers only ever send control messages: a single frame of
  /// [control byte][topic bytes].
  fn reader_loop(mut stream: TcpStream, identity: Identity, topics: Arc<Mutex<HashSet<Vec<u8>>>>, shared: Arc<PubShared>) {
    loop {
      match read_message(&mut stream, &shared.stop) {
        Ok(Some(frames)) => {
          let frame = match frames.first() {
            Some(f) if !f.is_empty() => f,
            _ => {
              warn!("Subscriber {} sent empty control message", identity);
              continue;
            }
          };
          let topic = frame[1..].to_vec();
          match frame[0] {
            SUB_CONTROL_SUBSCRIBE => {
              trace!("Subscriber {} subscribed to {:?}", identity, String::from_utf8_lossy(&topic));
              topics.lock().insert(topic);
            }
            SUB_CONTROL_UNSUBSCRIBE => {
              trace!("Subscriber {} unsubscribed from {:?}", identity, String::from_utf8_lossy(&topic));
              topics.lock().remove(&topic);
            }
            other => warn!("Subscriber {} sent unknown control byte {}", identity, other),
          }
        }
        Ok(None) => break,
        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => {
          debug!("Subscriber {} disconnected", identity);
          break;
        }
        Err(e) => {
          warn!("Subscriber {} read error: {}", identity, e);
          break;
        }
      }
    }
    shared.subscribers.lock().remove(&identity);
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Publish `[topic][payload]` to every subscriber whose registered topic
  /// is a prefix of `topic`. Dead subscribers are pruned on write failure.
  pub fn publish(&self, topic: &[u8], payload: &[u8]) {
    let frames = vec![topic.to_vec(), payload.to_vec()];
    let mut dead = Vec::new();
    let mut subscribers = self.shared.subscribers.lock();
    for (identity, sub) in subscribers.iter_mut() {
      let matched = sub.topics.lock().iter().any(|t| topic.starts_with(t));
      if !matched {
        continue;
      }
      if let Err(e) = write_message(&mut sub.writer, &frames) {
        debug!("Dropping subscriber {}: {}", identity, e);
        dead.push(*identity);
      }
    }
    for identity in dead {
      subscribers.remove(&identity);
    }
  }

  pub fn subscriber_count(&self) -> usize {
    self.shared.subscribers.lock().len()
  }

  pub fn stop(&mut self) {
    self.shared.stop.store(true, Ordering::Relaxed);
    if let Some(handle) = self.accept_thread.take() {
      let _ = handle.join();
    }
    self.shared.subscribers.lock().clear();
  }
}

impl Drop for PubSocket {
  fn drop(&mut self) {
    self.stop();
  }
}

// --- Sub ---

/// Client side of the fan-out pattern.
pub struct SubSocket {
  writer: Mutex<TcpStream>,
  inbound_rx: Receiver<(Vec<u8>, Vec<u8>)>,
  stop: Arc<AtomicBool>,
  reader_thread: Option<thread::JoinHandle<()>>,
}

impl SubSocket {
  pub fn connect(addr: &str) -> Result<Self> {
    let stream = TcpStream::connect(addr)
      .map_err(|e| HubError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    configure_stream(&stream).map_err(|e| HubError::SocketError(e.to_string()))?;
    let writer = stream.try_clone().map_err(|e| HubError::SocketError(e.to_string()))?;

    let (inbound_tx, inbound_rx) = unbounded();
    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = stop.clone();
    let mut reader_stream = stream;
    let reader_thread = thread::Builder::new()
      .name("sub-reader".to_string())
      .spawn(move || loop {
        match read_message(&mut reader_stream, &reader_stop) {
          Ok(Some(frames)) => {
            if frames.len() != 2 {
              warn!("Subscriber received {}-frame message, expected 2", frames.len());
              continue;
            }
            let mut it = frames.into_iter();
            let topic = it.next().unwrap_or_default();
            let payload = it.next().unwrap_or_default();
            if inbound_tx.send((topic, payload)).is_err() {
              break;
            }
          }
          Ok(None) => break,
          Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => break,
          Err(e) => {
            warn!("Sub read error: {}", e);
            break;
          }
        }
      })
      .map_err(|e| HubError::InternalError(format!("spawn sub reader: {}", e)))?;

    Ok(SubSocket {
      writer: Mutex::new(writer),
      inbound_rx,
      stop,
      reader_thread: Some(reader_thread),
    })
  }

  pub fn subscribe(&self, topic: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(topic.len() + 1);
    frame.push(SUB_CONTROL_SUBSCRIBE);
    frame.extend_from_slice(topic);
    let mut writer = self.writer.lock();
    write_message(&mut writer, &[frame]).map_err(|e| HubError::SocketError(e.to_string()))
  }

  pub fn unsubscribe(&self, topic: &[u8]) -> Result<()> {
    let mut frame = Vec::with_capacity(topic.len() + 1);
    frame.push(SUB_CONTROL_UNSUBSCRIBE);
    frame.extend_from_slice(topic);
    let mut writer = self.writer.lock();
    write_message(&mut writer, &[frame]).map_err(|e| HubError::SocketError(e.to_string()))
  }

  /// Channel of (topic, payload) messages for subscribed topics.
  pub fn incoming(&self) -> &Receiver<(Vec<u8>, Vec<u8>)> {
    &self.inbound_rx
  }

  pub fn stop(&mut self) {
    self.stop.store(true, Ordering::Relaxed);
    if let Some(handle) = self.reader_thread.take() {
      let _ = handle.join();
    }
  }
}

impl Drop for SubSocket {
  fn drop(&mut self) {
    self.stop();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn router_dealer_round_trip() {
    let mut router = RouterSocket::bind("127.0.0.1:0").unwrap();
    let addr = router.local_addr().to_string();
    let dealer = DealerSocket::connect(&addr).unwrap();

    dealer.send(&[b"hello".to_vec(), b"world".to_vec()]).unwrap();
    let (identity, frames) = router
      .incoming()
      .recv_timeout(Duration::from_secs(5))
      .expect("router should receive the message");
    assert_eq!(frames, vec![b"hello".to_vec(), b"world".to_vec()]);

    router.send(identity, &[b"reply".to_vec()]).unwrap();
    let reply = dealer.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reply, vec![b"reply".to_vec()]);
    router.stop();
  }

  #[test]
  fn pub_sub_prefix_filtering() {
    let mut pubsock = PubSocket::bind("127.0.0.1:0").unwrap();
    let addr = pubsock.local_addr().to_string();
    let sub = SubSocket::connect(&addr).unwrap();
    sub.subscribe(b"42~").unwrap();

    // Subscription is processed asynchronously by the reader thread.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
      pubsock.publish(b"42~10", b"match");
      pubsock.publish(b"99~10", b"no match");
      match sub.incoming().recv_timeout(Duration::from_millis(100)) {
        Ok((topic, payload)) => {
          assert_eq!(topic, b"42~10".to_vec());
          assert_eq!(payload, b"match".to_vec());
          break;
        }
        Err(_) if std::time::Instant::now() < deadline => continue,
        Err(e) => panic!("no publish delivered: {}", e),
      }
    }
    // Drain the queue; only the matching topic may ever arrive.
    while let Ok((topic, _)) = sub.incoming().recv_timeout(Duration::from_millis(200)) {
      assert_eq!(topic, b"42~10".to_vec());
    }
    pubsock.stop();
  }
}
