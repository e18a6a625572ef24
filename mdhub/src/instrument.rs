// mdhub/src/instrument.rs
// Instrument metadata used to key storage lookups and route requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name under which the continuous-futures resolver registers itself with the
/// historical broker. Requests for synthetic continuous futures are routed
/// here regardless of the instrument's configured data source.
pub const CONTINUOUS_FUTURES_SOURCE: &str = "ContinuousFutures";

/// A tradable instrument, as known to the metadata store.
///
/// Only the fields the brokers need travel over the wire; the full
/// exchange/session metadata lives behind the admin API and is out of scope
/// here. `id` is the storage key; an instrument without one cannot be
/// served and requests for it are answered with a typed error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
  /// Metadata-store primary key. `None` for instruments not yet registered.
  pub id: Option<i64>,
  pub symbol: String,
  /// Name of the data source configured for this instrument.
  pub datasource: String,
  /// Synthetic continuous future: routed to the dedicated resolver.
  pub is_continuous_future: bool,
  /// Expiration, for derivatives. Coverage past expiration is final.
  pub expiration_date: Option<DateTime<Utc>>,
}

impl Instrument {
  pub fn new(id: i64, symbol: &str, datasource: &str) -> Self {
    Instrument {
      id: Some(id),
      symbol: symbol.to_string(),
      datasource: datasource.to_string(),
      is_continuous_future: false,
      expiration_date: None,
    }
  }

  /// An instrument that has not been assigned a metadata-store ID yet.
  pub fn unregistered(symbol: &str, datasource: &str) -> Self {
    Instrument {
      id: None,
      symbol: symbol.to_string(),
      datasource: datasource.to_string(),
      is_continuous_future: false,
      expiration_date: None,
    }
  }

  pub fn futures(id: i64, symbol: &str, datasource: &str, expiration: DateTime<Utc>) -> Self {
    Instrument {
      id: Some(id),
      symbol: symbol.to_string(),
      datasource: datasource.to_string(),
      is_continuous_future: false,
      expiration_date: Some(expiration),
    }
  }

  pub fn continuous_future(id: i64, symbol: &str) -> Self {
    Instrument {
      id: Some(id),
      symbol: symbol.to_string(),
      datasource: CONTINUOUS_FUTURES_SOURCE.to_string(),
      is_continuous_future: true,
      expiration_date: None,
    }
  }

  /// The data-source name requests for this instrument are dispatched to.
  pub fn route_source(&self) -> &str {
    if self.is_continuous_future {
      CONTINUOUS_FUTURES_SOURCE
    } else {
      &self.datasource
    }
  }

  /// True if the instrument has expired as of `now`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    matches!(self.expiration_date, Some(exp) if exp <= now)
  }
}

impl fmt::Display for Instrument {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self.id {
      Some(id) => write!(f, "{} (#{}, {})", self.symbol, id, self.datasource),
      None => write!(f, "{} (unregistered, {})", self.symbol, self.datasource),
    }
  }
}
