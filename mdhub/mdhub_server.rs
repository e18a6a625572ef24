// mdhub/mdhub_server.rs
// Server binary: binds both brokers, wires up storage and the configured
// data sources, and runs until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use mdhub::adapter::{HistoricalDataSource, RealTimeDataSource};
use mdhub::adapter_sim::SimDataSource;
use mdhub::hist_broker::{HistBrokerConfig, HistoricalDataBroker};
use mdhub::instrument::CONTINUOUS_FUTURES_SOURCE;
use mdhub::rt_broker::{RealTimeDataBroker, RtBrokerConfig};
use mdhub::storage::SqliteBarStorage;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "mdhub_server", version, about = "Market data distribution hub")]
struct Args {
  /// Historical request socket bind address.
  #[arg(long, default_value = "127.0.0.1:5555")]
  hist_bind: String,

  /// Real-time request socket bind address.
  #[arg(long, default_value = "127.0.0.1:5556")]
  rt_bind: String,

  /// Real-time publish socket bind address.
  #[arg(long, default_value = "127.0.0.1:5557")]
  pub_bind: String,

  /// SQLite bar storage path. ":memory:" keeps storage in-process.
  #[arg(long, default_value = "mdhub.db")]
  storage: String,

  /// Seconds between reconnect sweeps over disconnected backends.
  #[arg(long, default_value_t = 10)]
  reconnect_secs: u64,

  /// Names of the simulated data sources to register.
  #[arg(long, default_value = "sim")]
  sources: Vec<String>,
}

fn main() -> Result<()> {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  let args = Args::parse();

  let storage: Arc<SqliteBarStorage> = Arc::new(if args.storage == ":memory:" {
    SqliteBarStorage::open_in_memory().context("open in-memory storage")?
  } else {
    SqliteBarStorage::open(&args.storage).context("open bar storage")?
  });

  // The sim profile: every configured source name plus the continuous
  // futures resolver is a SimDataSource. Real vendor adapters register the
  // same way.
  let mut hist_sources: Vec<Arc<dyn HistoricalDataSource>> = Vec::new();
  let mut rt_sources: Vec<Arc<dyn RealTimeDataSource>> = Vec::new();
  let resolver_name = CONTINUOUS_FUTURES_SOURCE.to_string();
  for name in args.sources.iter().chain(std::iter::once(&resolver_name)) {
    let source = SimDataSource::new(name);
    hist_sources.push(source.clone());
    rt_sources.push(source);
  }

  let reconnect_interval = Duration::from_secs(args.reconnect_secs);
  let hist_config = HistBrokerConfig {
    bind_address: args.hist_bind.clone(),
    reconnect_interval,
    ..Default::default()
  };
  let rt_config = RtBrokerConfig {
    request_address: args.rt_bind.clone(),
    publish_address: args.pub_bind.clone(),
    reconnect_interval,
    ..Default::default()
  };

  let mut hist_broker = HistoricalDataBroker::start(hist_config, storage, hist_sources)
    .context("start historical broker")?;
  let mut rt_broker = RealTimeDataBroker::start(rt_config, rt_sources).context("start real-time broker")?;

  info!(
    "mdhub {} up: historical on {}, real-time on {}, publishing on {}",
    mdhub::VERSION,
    hist_broker.local_addr(),
    rt_broker.request_addr(),
    rt_broker.publish_addr()
  );

  info!("Press Enter (or close stdin) to shut down");
  let mut buf = String::new();
  let _ = std::io::stdin().read_line(&mut buf);

  info!("Shutting down");
  hist_broker.stop();
  rt_broker.stop();
  Ok(())
}
