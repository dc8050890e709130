#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@

//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod budget;
mod clock;
mod config;
mod conn;
mod err;
mod limiter;
mod listener;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use budget::{Limit, RateBudget, Reservation, TokenBucket};
pub use clock::{Clock, SystemClock};
pub use config::{LimiterConfig, LimiterConfigBuilder, LimiterConfigBuilderError};
pub use conn::{for_each_chunk, LimitedConn};
pub use err::{Error, LimitKind};
pub use limiter::Limiter;
pub use listener::{Acceptor, LimitedListener};

/// A Result as returned by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Largest number of bytes moved by a single paced read or write.
///
/// Also the burst size of every budget: a connection never gets more than
/// this many bytes ahead of its rate.
pub const CHUNK_SIZE: usize = 1024;
