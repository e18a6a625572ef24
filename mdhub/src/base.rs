// mdhub/src/base.rs
// Base types and error definitions for the market data hub.

use thiserror::Error;

/// Errors that can occur anywhere in the hub.
#[derive(Error, Debug, Clone)]
pub enum HubError {
  #[error("Configuration error: {0}")]
  ConfigurationError(String),

  #[error("Bind failed on {0}: {1}")]
  BindFailed(String, String),

  #[error("Connection failed: {0}")]
  ConnectionFailed(String),

  #[error("Not connected: {0}")]
  NotConnected(String),

  #[error("Already running: {0}")]
  AlreadyRunning(String),

  #[error("Socket error: {0}")]
  SocketError(String),

  #[error("Message parse error: {0}")]
  ParseError(String),

  #[error("Compression error: {0}")]
  CompressionError(String),

  #[error("Request timeout: {0}")]
  Timeout(String),

  #[error("Duplicate request ID: {0}")]
  DuplicateRequestId(i64),

  #[error("Unknown request ID: {0}")]
  UnknownRequestId(i64),

  #[error("Unknown client identity: {0}")]
  UnknownIdentity(u64),

  #[error("Unknown data source: {0}")]
  UnknownDataSource(String),

  #[error("Data source disconnected: {0}")]
  SourceDisconnected(String),

  #[error("Instrument has no ID assigned: {0}")]
  InstrumentWithoutId(String),

  #[error("Real-time stream already active for {0} @ {1}")]
  StreamAlreadyActive(String, String),

  #[error("No active real-time stream for {0} @ {1}")]
  StreamNotFound(String, String),

  #[error("Adapter error from {source_name}: {message}")]
  AdapterError { source_name: String, message: String },

  #[error("Storage error: {0}")]
  StorageError(String),

  #[error("Invalid parameter: {0}")]
  InvalidParameter(String),

  #[error("Internal error: {0}")]
  InternalError(String),
}

pub type Result<T> = std::result::Result<T, HubError>;

impl From<rusqlite::Error> for HubError {
  fn from(e: rusqlite::Error) -> Self {
    HubError::StorageError(e.to_string())
  }
}

impl From<std::io::Error> for HubError {
  fn from(e: std::io::Error) -> Self {
    HubError::SocketError(e.to_string())
  }
}
