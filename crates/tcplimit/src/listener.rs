//! A listener whose accepted connections are all shaped by one [`Limiter`].

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use std::io::Result as IoResult;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt as _};
use tracing::debug;

use crate::err::check_limit;
use crate::{
    Clock, Error, Limit, LimitKind, LimitedConn, Limiter, RateBudget, Result, SystemClock,
    TokenBucket,
};

/// Something that accepts incoming byte streams.
#[async_trait]
pub trait Acceptor: Send + Sync {
    /// The type of the streams this acceptor yields.
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    /// Wait for the next incoming stream, and return it along with the
    /// address of its peer.
    async fn accept(&self) -> IoResult<(Self::Stream, SocketAddr)>;

    /// Return the local address this acceptor is bound to.
    fn local_addr(&self) -> IoResult<SocketAddr>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = Compat<TcpStream>;

    async fn accept(&self) -> IoResult<(Self::Stream, SocketAddr)> {
        let (stream, addr) = TcpListener::accept(self).await?;
        Ok((stream.compat(), addr))
    }

    fn local_addr(&self) -> IoResult<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Wraps an [`Acceptor`] so that every stream it yields is rate limited.
///
/// All accepted connections share the limiter's global budget, and each
/// gets its own local budget.
pub struct LimitedListener<L, C: Clock = SystemClock, B: RateBudget = TokenBucket> {
    /// The underlying acceptor.
    inner: L,
    /// Shapes every accepted connection.
    limiter: Limiter<C, B>,
}

impl<L: Acceptor> LimitedListener<L> {
    /// Wrap `inner`, with both limits unbounded until set.
    pub fn new(inner: L) -> Self {
        LimitedListener::with_limiter(inner, Limiter::default())
    }
}

impl<L: Acceptor, C: Clock, B: RateBudget> LimitedListener<L, C, B> {
    /// Wrap `inner`, shaping its connections with `limiter`.
    ///
    /// The limiter may be shared with other listeners, in which case
    /// the global limit covers all of them.
    pub fn with_limiter(inner: L, limiter: Limiter<C, B>) -> Self {
        LimitedListener { inner, limiter }
    }

    /// Wait for the next incoming connection, and return it rate limited.
    pub async fn accept(&self) -> IoResult<(LimitedConn<L::Stream, C, B>, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        debug!(peer = %addr, "accepted connection");
        Ok((self.limiter.limit_conn(stream), addr))
    }

    /// Set the global and the per-connection limit, in bytes per second.
    ///
    /// Both are checked before either is applied: on error nothing changed,
    /// and the error says which of the two was rejected.
    pub fn set_limits(&self, global: Limit, local: Limit) -> Result<()> {
        check_limit(global).map_err(failed(LimitKind::Global))?;
        check_limit(local).map_err(failed(LimitKind::Local))?;
        self.limiter
            .set_global_limit(global)
            .map_err(failed(LimitKind::Global))?;
        self.limiter
            .set_local_limit(local)
            .map_err(failed(LimitKind::Local))
    }

    /// Return the limiter shaping this listener's connections.
    pub fn limiter(&self) -> &Limiter<C, B> {
        &self.limiter
    }

    /// Return the local address of the underlying acceptor.
    pub fn local_addr(&self) -> IoResult<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Return a function that wraps an error into [`Error::SetLimit`] for `kind`.
fn failed(kind: LimitKind) -> impl FnOnce(Error) -> Error {
    move |e| Error::SetLimit {
        kind,
        source: Arc::new(e),
    }
}
