//! The [`Limiter`]: one global budget, and a registry of live connections.

use slotmap::SlotMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

use crate::err::check_limit;
use crate::{
    Clock, Limit, LimitedConn, LimiterConfig, RateBudget, Result, SystemClock, TokenBucket,
    CHUNK_SIZE,
};

slotmap::new_key_type! {
    /// Index of a live connection in a limiter's registry.
    pub(crate) struct ConnKey;
}

/// Bookkeeping shared between a limiter and the connections it wrapped.
struct Registry<B> {
    /// Rate given to every connection's local budget.
    local_limit: Limit,
    /// Local budget of every connection that is still open.
    conns: SlotMap<ConnKey, Arc<B>>,
}

/// Shape the bandwidth of connections at two levels at once.
///
/// * The **global** limit caps the aggregate rate of every connection
///   wrapped by this limiter.  It is one shared budget, so it takes
///   precedence whenever it is the tighter constraint.
/// * The **local** limit caps each connection on its own.  Changing it
///   changes it for every live connection.
///
/// Both limits can be changed at runtime.  Cloning a `Limiter` yields
/// another handle to the same limits.
pub struct Limiter<C: Clock = SystemClock, B: RateBudget = TokenBucket> {
    /// The shared state.
    inner: Arc<Inner<C, B>>,
}

/// Shared state of a [`Limiter`].
struct Inner<C, B> {
    /// Budget shared by every connection.
    global: Arc<B>,
    /// Source of time for limit changes and for the connections.
    clock: C,
    /// Live connections and the local limit.
    ///
    /// Held only for bookkeeping, never across I/O or sleeping.
    registry: Arc<Mutex<Registry<B>>>,
}

impl<C: Clock, B: RateBudget> Clone for Limiter<C, B> {
    fn clone(&self) -> Self {
        Limiter {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Limiter {
    /// Create a limiter on the system clock, with limits from `config`.
    pub fn new(config: &LimiterConfig) -> Self {
        Limiter::with_clock(config, SystemClock)
    }
}

impl Default for Limiter {
    fn default() -> Self {
        Limiter::new(&LimiterConfig::default())
    }
}

impl<C: Clock, B: RateBudget> Limiter<C, B> {
    /// Create a limiter on `clock`, with limits from `config`.
    pub fn with_clock(config: &LimiterConfig, clock: C) -> Self {
        let registry = Registry {
            local_limit: config.local_limit(),
            conns: SlotMap::with_key(),
        };
        Limiter {
            inner: Arc::new(Inner {
                global: Arc::new(B::with_rate(config.global_limit(), CHUNK_SIZE)),
                clock,
                registry: Arc::new(Mutex::new(registry)),
            }),
        }
    }

    /// Wrap `io` into a connection paced by this limiter.
    ///
    /// The connection starts at the current local limit, and follows every
    /// later change of it until it is closed or dropped.
    pub fn limit_conn<T>(&self, io: T) -> LimitedConn<T, C, B> {
        let (local, key, n_conns) = {
            let mut registry = self.lock();
            let local = Arc::new(B::with_rate(registry.local_limit, CHUNK_SIZE));
            let key = registry.conns.insert(Arc::clone(&local));
            (local, key, registry.conns.len())
        };
        debug!(n_conns, "registered connection");

        LimitedConn::new(
            io,
            Arc::clone(&self.inner.global),
            local,
            self.inner.clock.clone(),
            Some(Deregister {
                registry: Arc::downgrade(&self.inner.registry),
                key,
            }),
        )
    }

    /// Set the aggregate limit for all connections, in bytes per second.
    ///
    /// Takes effect from each connection's next read or write.  Fails with
    /// [`Error::InvalidLimit`](crate::Error::InvalidLimit) on a negative
    /// limit.
    pub fn set_global_limit(&self, limit: Limit) -> Result<()> {
        check_limit(limit)?;
        self.inner.global.set_rate(limit, self.inner.clock.now());
        debug!(%limit, "global limit changed");
        Ok(())
    }

    /// Return the current global limit.
    pub fn global_limit(&self) -> Limit {
        self.inner.global.rate()
    }

    /// Set the per-connection limit, in bytes per second.
    ///
    /// Every live connection has the new limit by the time this returns, as
    /// does every connection wrapped afterwards.  The global limit still
    /// applies on top of it.  Fails with
    /// [`Error::InvalidLimit`](crate::Error::InvalidLimit) on a negative
    /// limit.
    pub fn set_local_limit(&self, limit: Limit) -> Result<()> {
        check_limit(limit)?;
        let now = self.inner.clock.now();
        let n_conns = {
            let mut registry = self.lock();
            registry.local_limit = limit;
            for local in registry.conns.values() {
                local.set_rate(limit, now);
            }
            registry.conns.len()
        };
        debug!(%limit, n_conns, "local limit changed");
        Ok(())
    }

    /// Return the current per-connection limit.
    pub fn local_limit(&self) -> Limit {
        self.lock().local_limit
    }

    /// Apply both limits from `config`.
    ///
    /// Both are checked before either is applied.
    pub fn reconfigure(&self, config: &LimiterConfig) -> Result<()> {
        check_limit(config.global_limit())?;
        check_limit(config.local_limit())?;
        self.set_global_limit(config.global_limit())?;
        self.set_local_limit(config.local_limit())
    }

    /// Return the number of live connections.
    pub fn n_conns(&self) -> usize {
        self.lock().conns.len()
    }

    /// Lock the registry.
    fn lock(&self) -> MutexGuard<'_, Registry<B>> {
        self.inner.registry.lock().expect("poisoned lock")
    }
}

/// Handle that removes a connection from its limiter's registry.
///
/// Holds the registry weakly: connections may outlive their limiter.
pub(crate) struct Deregister<B> {
    /// The registry to remove from.
    registry: Weak<Mutex<Registry<B>>>,
    /// Our entry in it.
    key: ConnKey,
}

impl<B> Deregister<B> {
    /// Remove the connection from the registry.
    pub(crate) fn deregister(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let n_conns = {
            let mut registry = registry.lock().expect("poisoned lock");
            registry.conns.remove(self.key);
            registry.conns.len()
        };
        debug!(n_conns, "deregistered connection");
    }
}
