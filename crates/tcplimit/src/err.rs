//! Declare an error type for the tcplimit crate.

use std::fmt;
use std::sync::Arc;

use crate::Limit;

/// An error originating from the tcplimit crate.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A setter was given a negative (or NaN) rate.
    ///
    /// Nothing was changed.
    #[error("invalid limit: {0}")]
    InvalidLimit(Limit),

    /// A chunk of I/O can never be admitted under the current budgets.
    ///
    /// Either it is larger than the burst, or the rate is zero and the bucket
    /// holds too few tokens.  No bytes were transferred.
    #[error("unfulfillable reservation of {requested} bytes")]
    UnfulfillableReservation {
        /// How many bytes were asked for.
        requested: usize,
    },

    /// One of the limits could not be set.
    #[error("could not set {kind} limit")]
    SetLimit {
        /// Which limit it was.
        kind: LimitKind,
        /// Why it failed.
        #[source]
        source: Arc<Error>,
    },
}

/// Which of a limiter's two limits an error refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum LimitKind {
    /// The limit shared by every connection.
    Global,
    /// The per-connection limit.
    Local,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Global => write!(f, "global"),
            LimitKind::Local => write!(f, "local"),
        }
    }
}

impl Error {
    /// Return the tcplimit error carried by `err`, if any.
    ///
    /// Pacing errors reach readers and writers wrapped in a
    /// [`std::io::Error`]; this digs them out again.
    pub fn from_io(err: &std::io::Error) -> Option<&Error> {
        err.get_ref().and_then(|e| e.downcast_ref::<Error>())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> std::io::Error {
        std::io::Error::other(err)
    }
}

/// Return `Ok(())` if `limit` may be installed, and
/// [`Error::InvalidLimit`] otherwise.
pub(crate) fn check_limit(limit: Limit) -> crate::Result<()> {
    if limit.is_valid() {
        Ok(())
    } else {
        Err(Error::InvalidLimit(limit))
    }
}
