//! Token-bucket rate budgets, and the reservations they hand out.
//!
//! A budget accrues "tokens" (here: bytes) at some [`Limit`], up to a fixed
//! burst.  Callers ask for tokens with [`RateBudget::reserve`], and get back a
//! [`Reservation`] telling them how long to wait before acting.  A reservation
//! that turns out not to be needed can be handed back with
//! [`RateBudget::cancel`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::{Error, Result};

/// A rate, in tokens (bytes) per second.
///
/// [`Limit::INF`] means "no limit at all"; a zero limit lets nothing new
/// through.  Negative and NaN rates can be represented, but every setter in
/// this crate rejects them with [`Error::InvalidLimit`].
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(into = "LimitRepr", try_from = "LimitRepr")]
pub struct Limit(f64);

impl Limit {
    /// No limit.
    pub const INF: Limit = Limit(f64::INFINITY);

    /// Allow nothing.
    pub const ZERO: Limit = Limit(0.0);

    /// Construct a limit of `bytes_per_sec`.
    pub const fn new(bytes_per_sec: f64) -> Self {
        Limit(bytes_per_sec)
    }

    /// Return this limit as a number of bytes per second.
    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Return true if this limit can be installed: a non-negative number,
    /// possibly infinite.
    pub fn is_valid(self) -> bool {
        self.0 >= 0.0
    }

    /// Return true if this is [`Limit::INF`].
    pub fn is_inf(self) -> bool {
        self.0 == f64::INFINITY
    }

    /// Return true if this limit never replenishes anything.
    pub fn is_zero(self) -> bool {
        self.0 == 0.0
    }

    /// Return how long it takes to accrue `tokens` at this rate.
    ///
    /// Saturates at [`Duration::MAX`], which is also what a zero rate yields.
    fn duration_from_tokens(self, tokens: f64) -> Duration {
        if self.0 <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(tokens / self.0).unwrap_or(Duration::MAX)
    }

    /// Return how many tokens accrue over `duration` at this rate.
    fn tokens_from_duration(self, duration: Duration) -> f64 {
        if self.0 <= 0.0 {
            return 0.0;
        }
        duration.as_secs_f64() * self.0
    }
}

impl Default for Limit {
    fn default() -> Self {
        Limit::INF
    }
}

impl From<f64> for Limit {
    fn from(bytes_per_sec: f64) -> Self {
        Limit(bytes_per_sec)
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_inf() {
            write!(f, "unlimited")
        } else {
            write!(f, "{} B/s", self.0)
        }
    }
}

/// Keyword used for [`Limit::INF`] in configuration files.
const UNLIMITED: &str = "unlimited";

/// On-disk form of a [`Limit`]: either a number, or the keyword `"unlimited"`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum LimitRepr {
    /// A finite number of bytes per second.
    Rate(f64),
    /// A keyword; only [`UNLIMITED`] is recognized.
    Keyword(String),
}

impl From<Limit> for LimitRepr {
    fn from(limit: Limit) -> Self {
        if limit.is_inf() {
            LimitRepr::Keyword(UNLIMITED.into())
        } else {
            LimitRepr::Rate(limit.0)
        }
    }
}

impl TryFrom<LimitRepr> for Limit {
    type Error = String;

    fn try_from(repr: LimitRepr) -> std::result::Result<Self, String> {
        let limit = match repr {
            LimitRepr::Rate(r) => Limit(r),
            LimitRepr::Keyword(k) if k == UNLIMITED => Limit::INF,
            LimitRepr::Keyword(k) => {
                return Err(format!("expected a rate or {:?}, got {:?}", UNLIMITED, k))
            }
        };
        if !limit.is_valid() {
            return Err(format!("invalid limit: {}", limit));
        }
        Ok(limit)
    }
}

/// A provisional grant of tokens from a [`RateBudget`].
///
/// The tokens are already debited when the reservation is made.  Act on it
/// after [`delay_from`](Reservation::delay_from) has elapsed, or give it back
/// with [`RateBudget::cancel`].
#[derive(Debug)]
#[must_use = "an unused reservation should be cancelled"]
pub struct Reservation {
    /// How many tokens were reserved.
    tokens: usize,
    /// When the reserved tokens become available.
    time_to_act: Instant,
    /// The budget's rate at the time of reservation.
    rate: Limit,
}

impl Reservation {
    /// Construct a reservation of `tokens`, usable at `time_to_act`, granted
    /// by a budget running at `rate`.
    pub fn new(tokens: usize, time_to_act: Instant, rate: Limit) -> Self {
        Reservation {
            tokens,
            time_to_act,
            rate,
        }
    }

    /// Return how many tokens this reservation holds.
    pub fn tokens(&self) -> usize {
        self.tokens
    }

    /// Return the instant at which the reserved tokens become available.
    pub fn time_to_act(&self) -> Instant {
        self.time_to_act
    }

    /// Return how long the caller must wait, as of `now`, before acting.
    ///
    /// Zero if the tokens are already available.
    pub fn delay_from(&self, now: Instant) -> Duration {
        self.time_to_act.saturating_duration_since(now)
    }
}

/// A token-bucket capacity that can be reserved against.
///
/// Implementations must be safe to share between many connections: the
/// global budget of a [`Limiter`](crate::Limiter) is used by all of them at
/// once.
pub trait RateBudget: Send + Sync + 'static {
    /// Construct a new budget accruing at `rate`, holding at most `burst`
    /// tokens.
    fn with_rate(rate: Limit, burst: usize) -> Self
    where
        Self: Sized;

    /// Reserve `n` tokens as of `now`.
    ///
    /// Fails with [`Error::UnfulfillableReservation`] if the budget can never
    /// hold `n` tokens.
    fn reserve(&self, n: usize, now: Instant) -> Result<Reservation>;

    /// Give back an unused `reservation`, as of `now`.
    fn cancel(&self, reservation: Reservation, now: Instant);

    /// Change the accrual rate, as of `now`.
    fn set_rate(&self, rate: Limit, now: Instant);

    /// Return the current accrual rate.
    fn rate(&self) -> Limit;

    /// Return the largest number of tokens this budget can hold.
    fn burst(&self) -> usize;
}

/// Mutable state of a [`TokenBucket`].
#[derive(Debug)]
struct BucketState {
    /// Accrual rate.
    rate: Limit,
    /// Capacity of the bucket.
    burst: usize,
    /// Token level as of `last`.  Negative while reservations are queued.
    tokens: f64,
    /// When `tokens` was last settled.  `None` until the first update.
    last: Option<Instant>,
    /// Latest time-to-act of any reservation (past or future).
    last_event: Option<Instant>,
}

impl BucketState {
    /// Return the token level the bucket would have at `now`.
    fn advance(&self, now: Instant) -> f64 {
        if self.rate.is_inf() {
            return self.burst as f64;
        }
        // A clock that goes backwards accrues nothing.
        let elapsed = self
            .last
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        let tokens = self.tokens + self.rate.tokens_from_duration(elapsed);
        tokens.min(self.burst as f64)
    }

    /// Settle the token level as of `now`.
    fn settle(&mut self, now: Instant) {
        self.tokens = self.advance(now);
        self.last = Some(now);
    }
}

/// A mutex-protected token bucket, with reservation semantics.
///
/// Starts full, except when created with a zero rate: such a bucket has
/// nothing banked and will never admit anything until its rate is raised.
#[derive(Debug)]
pub struct TokenBucket {
    /// The bucket itself.
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket accruing at `rate`, holding at most `burst` tokens.
    pub fn new(rate: Limit, burst: usize) -> Self {
        let tokens = if rate.is_zero() { 0.0 } else { burst as f64 };
        TokenBucket {
            state: Mutex::new(BucketState {
                rate,
                burst,
                tokens,
                last: None,
                last_event: None,
            }),
        }
    }

    /// Return the number of tokens that would be available at `now`.
    ///
    /// Negative when reservations are waiting on future tokens.
    pub fn available(&self, now: Instant) -> f64 {
        self.lock().advance(now)
    }

    /// Lock the bucket state.
    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().expect("poisoned lock")
    }
}

impl RateBudget for TokenBucket {
    fn with_rate(rate: Limit, burst: usize) -> Self {
        TokenBucket::new(rate, burst)
    }

    fn reserve(&self, n: usize, now: Instant) -> Result<Reservation> {
        let mut state = self.lock();
        let unfulfillable = Error::UnfulfillableReservation { requested: n };

        if n > state.burst {
            debug!(requested = n, burst = state.burst, "reservation exceeds burst");
            return Err(unfulfillable);
        }
        if state.rate.is_inf() {
            return Ok(Reservation::new(n, now, state.rate));
        }

        let tokens = state.advance(now) - n as f64;
        let wait = if tokens < 0.0 {
            if state.rate.is_zero() {
                debug!(requested = n, "zero rate and nothing banked");
                return Err(unfulfillable);
            }
            state.rate.duration_from_tokens(-tokens)
        } else {
            Duration::ZERO
        };
        let time_to_act = now.checked_add(wait).ok_or(unfulfillable)?;

        state.tokens = tokens;
        state.last = Some(now);
        state.last_event = Some(time_to_act);
        Ok(Reservation::new(n, time_to_act, state.rate))
    }

    fn cancel(&self, reservation: Reservation, now: Instant) {
        let mut state = self.lock();

        if reservation.rate.is_inf() || reservation.tokens == 0 || reservation.time_to_act < now {
            return;
        }

        // Reservations made after this one were promised some of its
        // tokens; those can't come back.
        let promised_later = state
            .last_event
            .map(|ev| ev.saturating_duration_since(reservation.time_to_act))
            .unwrap_or_default();
        let restore =
            reservation.tokens as f64 - reservation.rate.tokens_from_duration(promised_later);
        if restore <= 0.0 {
            return;
        }

        let tokens = (state.advance(now) + restore).min(state.burst as f64);
        state.tokens = tokens;
        state.last = Some(now);

        if state.last_event == Some(reservation.time_to_act) {
            let prev_event = reservation
                .time_to_act
                .checked_sub(reservation.rate.duration_from_tokens(reservation.tokens as f64));
            if let Some(prev_event) = prev_event.filter(|prev| *prev >= now) {
                state.last_event = Some(prev_event);
            }
        }
    }

    fn set_rate(&self, rate: Limit, now: Instant) {
        let mut state = self.lock();
        state.settle(now);
        state.rate = rate;
    }

    fn rate(&self) -> Limit {
        self.lock().rate
    }

    fn burst(&self) -> usize {
        self.lock().burst
    }
}
