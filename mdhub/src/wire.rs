// mdhub/src/wire.rs
// Wire codec: typed message tags, bincode payloads, zlib-compressed bar
// lists with an explicit uncompressed-length frame.
//
// Every multi-frame message starts with a one-byte tag frame. Tags are a
// closed enum validated at the decode boundary; an unknown byte is a
// ParseError, never a panic. Bar lists are the only compressed payloads and
// always travel as two frames: the exact uncompressed byte length as a
// 4-byte little-endian integer, then the zlib stream. Decompression
// allocates exactly the declared length up front.

use crate::base::{HubError, Result};
use crate::data::{
  BarFrequency, HistoricalDataRequest, OHLCBar, RealTimeDataRequest, RealTimeEvent, StoredDataInfo,
};
use crate::instrument::Instrument;
use byteorder::{ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Message type tags. One byte on the wire, first frame of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
  // Historical request socket, client -> broker
  HistoricalRequest = 1,
  HistoricalPush = 2,
  AvailableDataRequest = 3,
  // Historical request socket, broker -> client
  HistoricalReply = 4,
  PushOk = 5,
  AvailableDataReply = 6,
  // Real-time request socket
  Ping = 7,
  Pong = 8,
  Subscribe = 9,
  SubscribeOk = 10,
  Cancel = 11,
  CancelOk = 12,
  // Either socket, broker -> client
  Error = 13,
}

/// Header accompanying a pushed bar batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPush {
  pub instrument: Instrument,
  pub frequency: BarFrequency,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
  bincode::serialize(value).map_err(|e| HubError::ParseError(format!("serialize: {}", e)))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
  bincode::deserialize(bytes).map_err(|e| HubError::ParseError(format!("deserialize: {}", e)))
}

pub fn tag_of(frames: &[Vec<u8>]) -> Result<MessageType> {
  let first = frames
    .first()
    .filter(|f| f.len() == 1)
    .ok_or_else(|| HubError::ParseError("missing message tag frame".to_string()))?;
  MessageType::try_from(first[0])
    .map_err(|_| HubError::ParseError(format!("unknown message tag {}", first[0])))
}

pub fn tag_frame(tag: MessageType) -> Vec<u8> {
  vec![u8::from(tag)]
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>> {
  let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
  encoder
    .write_all(data)
    .map_err(|e| HubError::CompressionError(format!("deflate: {}", e)))?;
  encoder
    .finish()
    .map_err(|e| HubError::CompressionError(format!("deflate finish: {}", e)))
}

/// Inflate `data` into exactly `uncompressed_len` bytes. A stream that
/// inflates to any other size is corrupt.
pub fn decompress(data: &[u8], uncompressed_len: usize) -> Result<Vec<u8>> {
  let mut out = vec![0u8; uncompressed_len];
  let mut decoder = ZlibDecoder::new(data);
  decoder
    .read_exact(&mut out)
    .map_err(|e| HubError::CompressionError(format!("inflate: {}", e)))?;
  let mut excess = [0u8; 1];
  match decoder.read(&mut excess) {
    Ok(0) => Ok(out),
    Ok(_) => Err(HubError::CompressionError(format!(
      "payload longer than declared {} bytes", uncompressed_len
    ))),
    Err(e) => Err(HubError::CompressionError(format!("inflate tail: {}", e))),
  }
}

pub fn u32_le_frame(n: u32) -> Vec<u8> {
  let mut buf = [0u8; 4];
  LittleEndian::write_u32(&mut buf, n);
  buf.to_vec()
}

pub fn parse_u32_le(frame: &[u8]) -> Result<u32> {
  if frame.len() != 4 {
    return Err(HubError::ParseError(format!("expected 4-byte length frame, got {}", frame.len())));
  }
  Ok(LittleEndian::read_u32(frame))
}

/// Serialize and compress a bar list into its two wire frames:
/// `[u32-LE uncompressed length][zlib payload]`.
pub fn bar_payload_frames(bars: &[OHLCBar]) -> Result<(Vec<u8>, Vec<u8>)> {
  let raw = encode(&bars.to_vec())?;
  let compressed = compress(&raw)?;
  Ok((u32_le_frame(raw.len() as u32), compressed))
}

pub fn parse_bar_payload(len_frame: &[u8], payload: &[u8]) -> Result<Vec<OHLCBar>> {
  let len = parse_u32_le(len_frame)? as usize;
  let raw = decompress(payload, len)?;
  decode(&raw)
}

// --- Historical request socket messages ---

pub fn hist_request_frames(request: &HistoricalDataRequest) -> Result<Vec<Vec<u8>>> {
  Ok(vec![tag_frame(MessageType::HistoricalRequest), encode(request)?])
}

pub fn hist_reply_frames(request: &HistoricalDataRequest, bars: &[OHLCBar]) -> Result<Vec<Vec<u8>>> {
  let (len_frame, payload) = bar_payload_frames(bars)?;
  Ok(vec![tag_frame(MessageType::HistoricalReply), encode(request)?, len_frame, payload])
}

pub fn parse_hist_reply(frames: &[Vec<u8>]) -> Result<(HistoricalDataRequest, Vec<OHLCBar>)> {
  if frames.len() != 4 {
    return Err(HubError::ParseError(format!("historical reply needs 4 frames, got {}", frames.len())));
  }
  let request: HistoricalDataRequest = decode(&frames[1])?;
  let bars = parse_bar_payload(&frames[2], &frames[3])?;
  Ok((request, bars))
}

pub fn push_frames(push: &DataPush, bars: &[OHLCBar]) -> Result<Vec<Vec<u8>>> {
  let (len_frame, payload) = bar_payload_frames(bars)?;
  Ok(vec![tag_frame(MessageType::HistoricalPush), encode(push)?, len_frame, payload])
}

pub fn parse_push(frames: &[Vec<u8>]) -> Result<(DataPush, Vec<OHLCBar>)> {
  if frames.len() != 4 {
    return Err(HubError::ParseError(format!("push needs 4 frames, got {}", frames.len())));
  }
  let push: DataPush = decode(&frames[1])?;
  let bars = parse_bar_payload(&frames[2], &frames[3])?;
  Ok((push, bars))
}

pub fn available_data_request_frames(instrument: &Instrument) -> Result<Vec<Vec<u8>>> {
  Ok(vec![tag_frame(MessageType::AvailableDataRequest), encode(instrument)?])
}

/// `[tag][instrument][u32-LE entry count][bincode Vec<StoredDataInfo>]`.
pub fn available_data_reply_frames(instrument: &Instrument, infos: &[StoredDataInfo]) -> Result<Vec<Vec<u8>>> {
  Ok(vec![
    tag_frame(MessageType::AvailableDataReply),
    encode(instrument)?,
    u32_le_frame(infos.len() as u32),
    encode(&infos.to_vec())?,
  ])
}

pub fn parse_available_data_reply(frames: &[Vec<u8>]) -> Result<(Instrument, Vec<StoredDataInfo>)> {
  if frames.len() != 4 {
    return Err(HubError::ParseError(format!("available-data reply needs 4 frames, got {}", frames.len())));
  }
  let instrument: Instrument = decode(&frames[1])?;
  let count = parse_u32_le(&frames[2])? as usize;
  let infos: Vec<StoredDataInfo> = decode(&frames[3])?;
  if infos.len() != count {
    return Err(HubError::ParseError(format!(
      "available-data reply declared {} entries but carried {}", count, infos.len()
    )));
  }
  Ok((instrument, infos))
}

pub fn error_frames(message: &str) -> Vec<Vec<u8>> {
  vec![tag_frame(MessageType::Error), message.as_bytes().to_vec()]
}

/// Error reply carrying the originating request so the client can correlate
/// it: `[Error][bincode request][utf8 message]`.
pub fn hist_error_frames(request: &HistoricalDataRequest, message: &str) -> Result<Vec<Vec<u8>>> {
  Ok(vec![
    tag_frame(MessageType::Error),
    encode(request)?,
    message.as_bytes().to_vec(),
  ])
}

pub fn parse_hist_error(frames: &[Vec<u8>]) -> Result<(HistoricalDataRequest, String)> {
  if frames.len() != 3 {
    return Err(HubError::ParseError(format!("request error needs 3 frames, got {}", frames.len())));
  }
  let request: HistoricalDataRequest = decode(&frames[1])?;
  Ok((request, String::from_utf8_lossy(&frames[2]).into_owned()))
}

pub fn parse_error(frames: &[Vec<u8>]) -> Result<String> {
  let body = frames
    .get(1)
    .ok_or_else(|| HubError::ParseError("error reply missing message frame".to_string()))?;
  Ok(String::from_utf8_lossy(body).into_owned())
}

// --- Real-time request socket messages ---

pub fn subscribe_frames(request: &RealTimeDataRequest) -> Result<Vec<Vec<u8>>> {
  Ok(vec![tag_frame(MessageType::Subscribe), encode(request)?])
}

pub fn subscribe_ok_frames(symbol: &str) -> Vec<Vec<u8>> {
  vec![tag_frame(MessageType::SubscribeOk), symbol.as_bytes().to_vec()]
}

pub fn cancel_frames(instrument: &Instrument, frequency: BarFrequency) -> Result<Vec<Vec<u8>>> {
  let mut freq = [0u8; 4];
  LittleEndian::write_i32(&mut freq, i32::from(frequency));
  Ok(vec![tag_frame(MessageType::Cancel), encode(instrument)?, freq.to_vec()])
}

pub fn parse_cancel(frames: &[Vec<u8>]) -> Result<(Instrument, BarFrequency)> {
  if frames.len() != 3 {
    return Err(HubError::ParseError(format!("cancel needs 3 frames, got {}", frames.len())));
  }
  let instrument: Instrument = decode(&frames[1])?;
  if frames[2].len() != 4 {
    return Err(HubError::ParseError("cancel frequency frame must be 4 bytes".to_string()));
  }
  let raw = LittleEndian::read_i32(&frames[2]);
  let frequency = BarFrequency::try_from(raw)
    .map_err(|_| HubError::ParseError(format!("unknown frequency {}", raw)))?;
  Ok((instrument, frequency))
}

pub fn cancel_ok_frames(symbol: &str, frequency: BarFrequency) -> Vec<Vec<u8>> {
  let mut freq = [0u8; 4];
  LittleEndian::write_i32(&mut freq, i32::from(frequency));
  vec![tag_frame(MessageType::CancelOk), symbol.as_bytes().to_vec(), freq.to_vec()]
}

// --- Publish socket payloads ---

pub fn publish_payload(event: &RealTimeEvent) -> Result<Vec<u8>> {
  encode(event)
}

pub fn parse_publish_payload(payload: &[u8]) -> Result<RealTimeEvent> {
  decode(payload)
}
