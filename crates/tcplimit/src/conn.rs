//! Bandwidth-limited connections.
//!
//! Every read and every write first reserves capacity from two budgets:
//! the global one is asked first, then the connection's own.  The caller
//! waits for whichever of the two answers is later, and only then touches
//! the raw stream.  Since the larger delay wins, the global limit takes
//! precedence exactly when it is the tighter one.

use futures::io::{AsyncRead, AsyncWrite};
use futures::{ready, Future};
use pin_project::{pin_project, pinned_drop};
use std::io::Result as IoResult;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, trace};

use crate::err::check_limit;
use crate::limiter::Deregister;
use crate::{Clock, Limit, RateBudget, Result, SystemClock, TokenBucket, CHUNK_SIZE};

/// A stream whose reads and writes are paced by a global and a local budget.
///
/// Returned by [`Limiter::limit_conn`](crate::Limiter::limit_conn).  Reads
/// transfer at most [`CHUNK_SIZE`] bytes at a time; writes are split into
/// chunks of at most that size, admitted one after the other.
///
/// Closing or dropping the connection removes it from its limiter.
#[pin_project(PinnedDrop, project = LimitedConnProj)]
pub struct LimitedConn<T, C: Clock = SystemClock, B: RateBudget = TokenBucket> {
    /// The raw stream.
    #[pin]
    inner: T,
    /// Where permission to transfer comes from.
    budgets: Budgets<C, B>,
    /// Pacing state of the read side.
    reading: Pacer<C::SleepFuture>,
    /// Pacing state of the write side.
    writing: Pacer<C::SleepFuture>,
    /// Removes us from the limiter on close; `None` once that is done.
    deregister: Option<Deregister<B>>,
}

/// The two budgets a connection draws from.
struct Budgets<C, B> {
    /// Budget shared with every other connection of the limiter.
    global: Arc<B>,
    /// Budget of this connection alone.
    ///
    /// The limiter keeps another reference, to change its rate.
    local: Arc<B>,
    /// Source of time.
    clock: C,
}

impl<C: Clock, B: RateBudget> Budgets<C, B> {
    /// Reserve `size` bytes from both budgets, and return how long to wait
    /// before transferring them.
    ///
    /// On failure nothing stays reserved.
    fn reserve(&self, size: usize) -> Result<Duration> {
        let now = self.clock.now();

        let global = self.global.reserve(size, now)?;
        let local = match self.local.reserve(size, now) {
            Ok(local) => local,
            Err(e) => {
                self.global.cancel(global, now);
                return Err(e);
            }
        };

        Ok(global.delay_from(now).max(local.delay_from(now)))
    }
}

/// Pacing state for one direction of a connection.
///
/// An admission survives `Poll::Pending`, whether from the pacing sleep or
/// from the raw stream, so that a re-poll resumes instead of reserving again.
struct Pacer<F> {
    /// The wait we are in, if any.
    sleep: Option<Pin<Box<F>>>,
    /// Bytes admitted but not yet transferred.
    admitted: Option<usize>,
}

impl<F> Default for Pacer<F> {
    fn default() -> Self {
        Pacer {
            sleep: None,
            admitted: None,
        }
    }
}

impl<F: Future<Output = ()>> Pacer<F> {
    /// Wait until `size` bytes are admitted, and return how many may be
    /// transferred.
    ///
    /// If an earlier admission is still outstanding, it is returned instead
    /// of making a new one.
    fn poll_admit<C, B>(
        &mut self,
        cx: &mut Context<'_>,
        budgets: &Budgets<C, B>,
        size: usize,
    ) -> Poll<IoResult<usize>>
    where
        C: Clock<SleepFuture = F>,
        B: RateBudget,
    {
        loop {
            if let Some(sleep) = self.sleep.as_mut() {
                let () = ready!(sleep.as_mut().poll(cx));
                self.sleep = None;
            }
            if let Some(admitted) = self.admitted {
                return Poll::Ready(Ok(admitted));
            }

            let delay = match budgets.reserve(size) {
                Ok(delay) => delay,
                Err(e) => {
                    debug!(size, "cannot admit: {}", e);
                    return Poll::Ready(Err(e.into()));
                }
            };
            self.admitted = Some(size);
            if !delay.is_zero() {
                trace!(size, ?delay, "pacing");
                self.sleep = Some(Box::pin(budgets.clock.sleep(delay)));
            }
        }
    }

    /// Note that the admitted bytes have been transferred.
    fn done(&mut self) {
        self.admitted = None;
    }
}

impl<T, C: Clock, B: RateBudget> LimitedConn<T, C, B> {
    /// Wrap `inner`, drawing from `global` and `local`.
    pub(crate) fn new(
        inner: T,
        global: Arc<B>,
        local: Arc<B>,
        clock: C,
        deregister: Option<Deregister<B>>,
    ) -> Self {
        LimitedConn {
            inner,
            budgets: Budgets {
                global,
                local,
                clock,
            },
            reading: Pacer::default(),
            writing: Pacer::default(),
            deregister,
        }
    }

    /// Set this connection's own limit, in bytes per second.
    ///
    /// [`Limit::INF`] disables local limiting; [`Limit::ZERO`] stops the
    /// connection once its banked bytes are spent, making reads and writes
    /// fail with [`Error::UnfulfillableReservation`](crate::Error::UnfulfillableReservation).
    ///
    /// Fails with [`Error::InvalidLimit`](crate::Error::InvalidLimit) on a
    /// negative limit.  The next change of the limiter's local limit
    /// overrides this.
    pub fn set_limit(&self, limit: Limit) -> Result<()> {
        check_limit(limit)?;
        self.budgets
            .local
            .set_rate(limit, self.budgets.clock.now());
        Ok(())
    }

    /// Return this connection's own limit.
    pub fn limit(&self) -> Limit {
        self.budgets.local.rate()
    }

    /// Return a reference to the raw stream.
    ///
    /// Use this for socket options and timeouts; reading or writing through
    /// it bypasses the limits.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Return a mutable reference to the raw stream.
    pub fn inner_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Return a pinned reference to the raw stream.
    pub fn inner_pinned(self: Pin<&mut Self>) -> Pin<&mut T> {
        self.project().inner
    }
}

impl<T: AsyncRead, C: Clock, B: RateBudget> AsyncRead for LimitedConn<T, C, B> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let this = self.project();
        let want = buf.len().min(CHUNK_SIZE);

        let admitted = ready!(this.reading.poll_admit(cx, this.budgets, want))?;
        let n = admitted.min(buf.len());
        let result = ready!(this.inner.poll_read(cx, &mut buf[..n]));
        this.reading.done();
        Poll::Ready(result)
    }
}

impl<T: AsyncWrite, C: Clock, B: RateBudget> AsyncWrite for LimitedConn<T, C, B> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        let mut this = self.project();
        let mut written = 0;
        let mut last = Poll::Ready(Ok(0));

        for_each_chunk(buf, CHUNK_SIZE, |chunk| {
            last = poll_write_chunk(&mut this, cx, chunk);
            match last {
                Poll::Ready(Ok(n)) => {
                    written += n;
                    n == chunk.len()
                }
                _ => false,
            }
        });

        // Report what went out; a lasting error shows up on the next call.
        if written > 0 {
            Poll::Ready(Ok(written))
        } else {
            last
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        let this = self.project();
        if let Some(deregister) = this.deregister.take() {
            deregister.deregister();
        }
        this.inner.poll_close(cx)
    }
}

/// Admit and write a single chunk of at most [`CHUNK_SIZE`] bytes.
fn poll_write_chunk<T: AsyncWrite, C: Clock, B: RateBudget>(
    this: &mut LimitedConnProj<'_, T, C, B>,
    cx: &mut Context<'_>,
    chunk: &[u8],
) -> Poll<IoResult<usize>> {
    let admitted = ready!(this.writing.poll_admit(cx, &*this.budgets, chunk.len()))?;
    let n = admitted.min(chunk.len());
    let result = ready!(this.inner.as_mut().poll_write(cx, &chunk[..n]));
    this.writing.done();
    Poll::Ready(result)
}

#[pinned_drop]
impl<T, C: Clock, B: RateBudget> PinnedDrop for LimitedConn<T, C, B> {
    fn drop(self: Pin<&mut Self>) {
        if let Some(deregister) = self.project().deregister.take() {
            deregister.deregister();
        }
    }
}

/// Call `f` on consecutive pieces of `items`, each at most `size` long.
///
/// Stops early when `f` returns `false`.  A `size` of zero visits nothing.
pub fn for_each_chunk<T, F>(items: &[T], size: usize, mut f: F)
where
    F: FnMut(&[T]) -> bool,
{
    if size == 0 {
        return;
    }
    for chunk in items.chunks(size) {
        if !f(chunk) {
            return;
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    #![allow(clippy::float_cmp)]

    use super::*;
    use crate::mock::{BufferStream, MockClock, RecordingStream};
    use crate::{Error, Limiter, LimiterConfig};
    use assert_matches::assert_matches;
    use futures::executor::block_on;
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use std::io::ErrorKind;

    fn test_data(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 0xff) as u8).collect()
    }

    /// Wrap `io` with explicit budgets, outside of any limiter.
    fn wrap<T>(
        io: T,
        global: Arc<TokenBucket>,
        local: Limit,
        clock: &MockClock,
    ) -> LimitedConn<T, MockClock> {
        let local = Arc::new(TokenBucket::new(local, CHUNK_SIZE));
        LimitedConn::new(io, global, local, clock.clone(), None)
    }

    fn unlimited() -> Arc<TokenBucket> {
        Arc::new(TokenBucket::new(Limit::INF, CHUNK_SIZE))
    }

    fn pacing_error(e: &std::io::Error) -> &Error {
        Error::from_io(e).unwrap()
    }

    #[test]
    fn chunks() {
        let input = [1, 2, 3];
        for (size, expected) in [
            (0, vec![]),
            (1, vec![vec![1], vec![2], vec![3]]),
            (2, vec![vec![1, 2], vec![3]]),
            (3, vec![vec![1, 2, 3]]),
            (4, vec![vec![1, 2, 3]]),
        ] {
            let mut got: Vec<Vec<i32>> = vec![];
            for_each_chunk(&input, size, |p| {
                got.push(p.to_vec());
                true
            });
            assert_eq!(got, expected, "size {}", size);
        }
    }

    #[test]
    fn chunks_stop_early() {
        let mut seen = 0;
        for_each_chunk(&[0_u8; 10], 3, |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    #[test]
    fn unfulfillable_local_reservation() {
        let clock = MockClock::new();
        let stream = RecordingStream::new();
        let mut conn = wrap(stream.clone(), unlimited(), Limit::ZERO, &clock);

        let err = block_on(conn.write(&test_data(CHUNK_SIZE * 10))).unwrap_err();
        assert_matches!(
            pacing_error(&err),
            Error::UnfulfillableReservation { .. }
        );

        let mut buf = [0; CHUNK_SIZE];
        let err = block_on(conn.read(&mut buf)).unwrap_err();
        assert_matches!(
            pacing_error(&err),
            Error::UnfulfillableReservation { .. }
        );

        assert!(stream.writes().is_empty());
        assert_eq!(stream.reads(), 0);
    }

    #[test]
    fn global_reservation_refunded_when_local_fails() {
        let clock = MockClock::new();
        let global = Arc::new(TokenBucket::new(Limit::new(1.0), CHUNK_SIZE));
        let stream = RecordingStream::new();
        let mut conn = wrap(stream.clone(), Arc::clone(&global), Limit::ZERO, &clock);

        let err = block_on(conn.write(&[7; CHUNK_SIZE])).unwrap_err();
        assert_matches!(
            pacing_error(&err),
            Error::UnfulfillableReservation { .. }
        );
        assert_eq!(global.available(clock.now()), CHUNK_SIZE as f64);

        // With the local limit lifted, the whole burst is still there.
        conn.set_limit(Limit::INF).unwrap();
        assert_eq!(block_on(conn.write(&[7; CHUNK_SIZE])).unwrap(), CHUNK_SIZE);
        assert!(clock.slept().is_empty());
        assert_eq!(stream.writes(), vec![CHUNK_SIZE]);
    }

    #[test]
    fn read_write_consistency() {
        let clock = MockClock::stepping(Duration::from_secs(1));

        // Read everything out of a paced connection.
        let expected = test_data(CHUNK_SIZE * 10);
        let mut conn = wrap(
            BufferStream::new(expected.clone()),
            unlimited(),
            Limit::new(3.0),
            &clock,
        );
        let mut got = Vec::new();
        block_on(conn.read_to_end(&mut got)).unwrap();
        assert_eq!(got, expected);

        // Write everything into a paced connection.
        let sink = BufferStream::new(Vec::new());
        let mut conn = wrap(sink.clone(), unlimited(), Limit::new(3.0), &clock);
        block_on(futures::io::copy(
            futures::io::Cursor::new(expected.clone()),
            &mut conn,
        ))
        .unwrap();
        assert_eq!(sink.contents(), expected);
        assert!(!clock.slept().is_empty());
    }

    #[test]
    fn read_is_clipped_to_chunk() {
        let clock = MockClock::new();
        let mut conn = wrap(
            BufferStream::new(test_data(CHUNK_SIZE * 3)),
            unlimited(),
            Limit::INF,
            &clock,
        );
        let mut buf = vec![0; CHUNK_SIZE * 3];
        assert_eq!(block_on(conn.read(&mut buf)).unwrap(), CHUNK_SIZE);
        assert_eq!(block_on(conn.read(&mut buf[..10])).unwrap(), 10);
    }

    #[test]
    fn write_is_chunked() {
        let clock = MockClock::new();
        let stream = RecordingStream::new();
        let mut conn = wrap(stream.clone(), unlimited(), Limit::INF, &clock);

        let n = CHUNK_SIZE * 2 + 100;
        assert_eq!(block_on(conn.write(&test_data(n))).unwrap(), n);
        assert_eq!(stream.writes(), vec![CHUNK_SIZE, CHUNK_SIZE, 100]);
        assert_eq!(stream.contents(), test_data(n));
    }

    #[test]
    fn write_failure_midway() {
        let clock = MockClock::new();
        let stream = RecordingStream::new().fail_after(2);
        let mut conn = wrap(stream.clone(), unlimited(), Limit::INF, &clock);

        let data = test_data(CHUNK_SIZE * 3 + 5);
        assert_eq!(block_on(conn.write(&data)).unwrap(), CHUNK_SIZE * 2);

        // The raw error itself comes through untouched on the next call.
        let err = block_on(conn.write(&data[CHUNK_SIZE * 2..])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
        assert!(Error::from_io(&err).is_none());
        assert_eq!(stream.contents(), data[..CHUNK_SIZE * 2].to_vec());
    }

    /// Wrap `io` with an unlimited global budget and the given `local` one.
    fn wrap_local<T>(
        io: T,
        local: &Arc<TokenBucket>,
        clock: &MockClock,
    ) -> LimitedConn<T, MockClock> {
        LimitedConn::new(io, unlimited(), Arc::clone(local), clock.clone(), None)
    }

    #[test]
    fn pending_sleep_keeps_admission() {
        let clock = MockClock::yielding();
        let local = Arc::new(TokenBucket::new(Limit::new(1024.0), CHUNK_SIZE));
        let stream = RecordingStream::new();
        let mut conn = wrap_local(stream.clone(), &local, &clock);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let data = test_data(CHUNK_SIZE * 2);

        // The first chunk comes out of the burst; the second has to wait, so
        // only the first is reported.
        assert_matches!(
            Pin::new(&mut conn).poll_write(&mut cx, &data),
            Poll::Ready(Ok(n)) if n == CHUNK_SIZE
        );
        assert_eq!(clock.slept(), vec![Duration::from_secs(1)]);
        assert_eq!(local.available(clock.now()), 0.0);

        // Polling again finishes the wait without reserving a second time.
        assert_matches!(
            Pin::new(&mut conn).poll_write(&mut cx, &data[CHUNK_SIZE..]),
            Poll::Ready(Ok(n)) if n == CHUNK_SIZE
        );
        assert_eq!(clock.slept(), vec![Duration::from_secs(1)]);
        assert_eq!(local.available(clock.now()), 0.0);
        assert_eq!(stream.writes(), vec![CHUNK_SIZE, CHUNK_SIZE]);
        assert_eq!(stream.contents(), data);
    }

    #[test]
    fn write_all_with_pending_sleeps() {
        let clock = MockClock::yielding();
        let local = Arc::new(TokenBucket::new(Limit::new(1024.0), CHUNK_SIZE));
        let stream = RecordingStream::new();
        let mut conn = wrap_local(stream.clone(), &local, &clock);

        let data = test_data(CHUNK_SIZE * 4 + 10);
        block_on(conn.write_all(&data)).unwrap();
        assert_eq!(
            stream.writes(),
            vec![CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE, CHUNK_SIZE, 10]
        );
        // One sleep per delayed chunk: the tail waits for 10 bytes' worth.
        assert_eq!(
            clock.slept(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs_f64(10.0 / 1024.0),
            ]
        );
        assert!(local.available(clock.now()).abs() < 1e-6);
        assert_eq!(stream.contents(), data);
    }

    #[test]
    fn pending_stream_keeps_admission() {
        let clock = MockClock::new();
        let local = Arc::new(TokenBucket::new(Limit::new(1024.0), CHUNK_SIZE));
        let stream = RecordingStream::new().pending_first_write();
        let mut conn = wrap_local(stream.clone(), &local, &clock);
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let data = test_data(CHUNK_SIZE);

        assert!(Pin::new(&mut conn).poll_write(&mut cx, &data).is_pending());
        assert_eq!(local.available(clock.now()), 0.0);

        // A fresh write after the pending one reuses its admission.
        assert_eq!(block_on(conn.write(&data)).unwrap(), CHUNK_SIZE);
        assert_eq!(local.available(clock.now()), 0.0);
        assert!(clock.slept().is_empty());
        assert_eq!(stream.pending_writes(), 1);
        assert_eq!(stream.writes(), vec![CHUNK_SIZE]);
    }

    #[test]
    fn local_limit_stricter() {
        let clock = MockClock::new();
        let global = Arc::new(TokenBucket::new(Limit::new(1024.0), CHUNK_SIZE));
        let mut conn = wrap(RecordingStream::new(), global, Limit::new(512.0), &clock);

        block_on(conn.write_all(&[0; CHUNK_SIZE * 2])).unwrap();
        assert_eq!(clock.slept(), vec![Duration::from_secs(2)]);
    }

    #[test]
    fn global_limit_stricter() {
        let clock = MockClock::new();
        let global = Arc::new(TokenBucket::new(Limit::new(256.0), CHUNK_SIZE));
        let mut conn = wrap(RecordingStream::new(), global, Limit::new(1024.0), &clock);

        block_on(conn.write_all(&[0; CHUNK_SIZE * 2])).unwrap();
        assert_eq!(clock.slept(), vec![Duration::from_secs(4)]);
    }

    #[test]
    fn global_budget_is_shared() {
        let clock = MockClock::new();
        let limiter: Limiter<MockClock> = Limiter::with_clock(
            &LimiterConfig::builder()
                .global_limit(1024.0)
                .build()
                .unwrap(),
            clock.clone(),
        );
        let mut conns: Vec<_> = (0..4)
            .map(|_| limiter.limit_conn(RecordingStream::new()))
            .collect();
        for conn in &mut conns {
            block_on(conn.write_all(&[0; CHUNK_SIZE])).unwrap();
        }
        // The first chunk comes out of the burst; every later one waits for
        // a second's worth of tokens.
        assert_eq!(
            clock.slept(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
            ]
        );
    }

    #[test]
    fn set_limit() {
        let clock = MockClock::new();
        let conn = wrap(RecordingStream::new(), unlimited(), Limit::INF, &clock);
        for v in [0.0, 3.0, 1e6, f64::INFINITY] {
            conn.set_limit(Limit::new(v)).unwrap();
            assert_eq!(conn.limit(), Limit::new(v));
        }

        conn.set_limit(Limit::new(42.0)).unwrap();
        assert_matches!(
            conn.set_limit(Limit::new(-1.0)),
            Err(Error::InvalidLimit(_))
        );
        assert_eq!(conn.limit(), Limit::new(42.0));
    }

    #[test]
    fn empty_transfers() {
        let clock = MockClock::new();
        let mut conn = wrap(
            BufferStream::new(Vec::new()),
            unlimited(),
            Limit::ZERO,
            &clock,
        );
        assert_eq!(block_on(conn.write(&[])).unwrap(), 0);
        assert_eq!(block_on(conn.read(&mut [])).unwrap(), 0);
    }

    #[test]
    fn inner_access() {
        let clock = MockClock::new();
        let mut conn = wrap(RecordingStream::new(), unlimited(), Limit::INF, &clock);
        assert!(conn.inner().writes().is_empty());
        let _: &mut RecordingStream = conn.inner_mut();
    }
}
