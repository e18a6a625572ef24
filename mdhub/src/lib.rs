// mdhub/src/lib.rs
// Main entry point for the market data hub library.

//! # mdhub: market data distribution hub
//!
//! Two brokers over a framed TCP transport:
//!
//! - The **historical data broker** serves bar requests by reconciling local
//!   SQLite coverage against pluggable external data sources, splitting a
//!   request into gap-filling sub-requests when coverage is partial and
//!   re-assembling one compressed reply per request.
//! - The **real-time data broker** multiplexes live subscriptions from many
//!   sources onto a publish socket, fanned out under
//!   `"{instrument_id}~{frequency}"` topics.
//!
//! The [`client`] module carries the counterpart state machines; the
//! [`adapter_sim`] module ships a deterministic in-process data source for
//! tests and the sim server profile.

mod base;

pub mod adapter;
pub mod adapter_sim;
pub mod client;
pub mod data;
pub mod hist_broker;
pub mod instrument;
pub mod retry;
pub mod rt_broker;
pub mod storage;
pub mod transport;
pub mod wire;

pub use base::{HubError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
