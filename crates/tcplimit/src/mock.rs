//! Deterministic clocks and in-memory streams, for tests.
//!
//! The clock and the streams are cheap to clone, and clones share state: keep one
//! handle, give the other to a [`LimitedConn`](crate::LimitedConn), and
//! inspect what happened afterwards.

use futures::io::{AsyncRead, AsyncWrite};
use std::collections::VecDeque;
use std::future::Future;
use std::io::{ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use crate::Clock;

/// A clock that only moves when told to.
///
/// Every call to [`now`](Clock::now) returns the current mock time and then
/// moves it forward by a fixed step (possibly zero).  Sleeping moves the mock
/// time forward by the requested duration right away, and is recorded.  The
/// sleep future completes on its first poll, unless the clock was made with
/// [`yielding`](Self::yielding): then it returns `Pending` once (waking its
/// task) and completes on the next poll.
#[derive(Clone, Debug)]
pub struct MockClock {
    /// Shared state.
    state: Arc<Mutex<ClockState>>,
}

/// State of a [`MockClock`].
#[derive(Debug)]
struct ClockState {
    /// Current mock time.
    now: Instant,
    /// How far each call to `now` moves the time.
    step: Duration,
    /// Every sleep requested so far.
    slept: Vec<Duration>,
    /// Whether sleep futures return `Pending` once before completing.
    yielding: bool,
}

impl MockClock {
    /// Return a clock that only moves by sleeping or [`advance`](Self::advance).
    pub fn new() -> Self {
        MockClock::stepping(Duration::ZERO)
    }

    /// Return a clock that moves by `step` each time it is read.
    pub fn stepping(step: Duration) -> Self {
        MockClock {
            state: Arc::new(Mutex::new(ClockState {
                now: Instant::now(),
                step,
                slept: Vec::new(),
                yielding: false,
            })),
        }
    }

    /// Return a clock whose sleeps each return `Pending` once before
    /// completing.
    ///
    /// Like [`new`](Self::new), it moves only by sleeping or
    /// [`advance`](Self::advance).
    pub fn yielding() -> Self {
        let clock = MockClock::new();
        clock.lock().yielding = true;
        clock
    }

    /// Move the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        self.lock().now += d;
    }

    /// Return every sleep requested from this clock, in order.
    pub fn slept(&self) -> Vec<Duration> {
        self.lock().slept.clone()
    }

    /// Lock the state.
    fn lock(&self) -> MutexGuard<'_, ClockState> {
        self.state.lock().expect("poisoned lock")
    }
}

impl Default for MockClock {
    fn default() -> Self {
        MockClock::new()
    }
}

impl Clock for MockClock {
    type SleepFuture = MockSleep;

    fn now(&self) -> Instant {
        let mut state = self.lock();
        let now = state.now;
        let step = state.step;
        state.now += step;
        now
    }

    fn sleep(&self, duration: Duration) -> Self::SleepFuture {
        let mut state = self.lock();
        state.slept.push(duration);
        state.now += duration;
        MockSleep {
            pending: state.yielding,
        }
    }
}

/// Sleep future of a [`MockClock`].
#[derive(Debug)]
pub struct MockSleep {
    /// Return `Pending` on the next poll.
    pending: bool,
}

impl Future for MockSleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.pending {
            self.pending = false;
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }
}

/// A stream over one in-memory buffer: reads drain it from the front, writes
/// append to the back.
///
/// Reading an empty buffer reports end-of-stream.
#[derive(Clone, Debug, Default)]
pub struct BufferStream {
    /// The buffer.
    buf: Arc<Mutex<VecDeque<u8>>>,
}

impl BufferStream {
    /// Return a stream holding `data`.
    pub fn new(data: Vec<u8>) -> Self {
        BufferStream {
            buf: Arc::new(Mutex::new(data.into())),
        }
    }

    /// Return what is currently in the buffer.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().iter().copied().collect()
    }

    /// Lock the buffer.
    fn lock(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.buf.lock().expect("poisoned lock")
    }
}

impl AsyncRead for BufferStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        let mut data = self.lock();
        let n = buf.len().min(data.len());
        for (dst, src) in buf.iter_mut().zip(data.drain(..n)) {
            *dst = src;
        }
        Poll::Ready(Ok(n))
    }
}

impl AsyncWrite for BufferStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        self.lock().extend(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A stream that accepts every write and satisfies every read, until closed.
///
/// Reads leave the buffer untouched.  After close, reads report
/// end-of-stream and writes fail.
#[derive(Clone, Debug, Default)]
pub struct NoopStream {
    /// Set once closed.
    closed: Arc<AtomicBool>,
}

impl NoopStream {
    /// Return a new open stream.
    pub fn new() -> Self {
        NoopStream::default()
    }

    /// Return true if this stream (or a clone of it) was closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl AsyncRead for NoopStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        if self.is_closed() {
            Poll::Ready(Ok(0))
        } else {
            Poll::Ready(Ok(buf.len()))
        }
    }
}

impl AsyncWrite for NoopStream {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        if self.is_closed() {
            Poll::Ready(Err(ErrorKind::BrokenPipe.into()))
        } else {
            Poll::Ready(Ok(buf.len()))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        self.closed.store(true, Ordering::Release);
        Poll::Ready(Ok(()))
    }
}

/// A write-only stream that records every write call.
///
/// Optionally starts failing with [`ErrorKind::BrokenPipe`] after a given
/// number of write calls, or returns `Pending` from its first write call.
/// Reads always report end-of-stream.
#[derive(Clone, Debug, Default)]
pub struct RecordingStream {
    /// What was written, and how.
    record: Arc<Mutex<Record>>,
    /// Number of write calls that succeed before all others fail.
    fail_after: Option<usize>,
}

/// State of a [`RecordingStream`].
#[derive(Debug, Default)]
struct Record {
    /// Every byte written.
    data: Vec<u8>,
    /// Length of every successful write call.
    writes: Vec<usize>,
    /// Number of write calls, successful or not.
    write_calls: usize,
    /// Number of read calls.
    reads: usize,
    /// Return `Pending` (and wake the task) from the next write call.
    pend_next_write: bool,
    /// Number of write calls that returned `Pending`.
    pending_writes: usize,
}

impl RecordingStream {
    /// Return a stream on which every write succeeds.
    pub fn new() -> Self {
        RecordingStream::default()
    }

    /// Make every write call after the first `n` fail.
    #[must_use]
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Make the first write call return `Pending` and wake its task.
    ///
    /// The call after it proceeds normally.
    #[must_use]
    pub fn pending_first_write(self) -> Self {
        self.lock().pend_next_write = true;
        self
    }

    /// Return how many write calls returned `Pending`.
    pub fn pending_writes(&self) -> usize {
        self.lock().pending_writes
    }

    /// Return the length of every successful write call, in order.
    pub fn writes(&self) -> Vec<usize> {
        self.lock().writes.clone()
    }

    /// Return everything written.
    pub fn contents(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    /// Return how many times the stream was read from.
    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    /// Lock the record.
    fn lock(&self) -> MutexGuard<'_, Record> {
        self.record.lock().expect("poisoned lock")
    }
}

impl AsyncRead for RecordingStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut [u8],
    ) -> Poll<IoResult<usize>> {
        self.lock().reads += 1;
        Poll::Ready(Ok(0))
    }
}

impl AsyncWrite for RecordingStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<IoResult<usize>> {
        let mut record = self.lock();
        if record.pend_next_write {
            record.pend_next_write = false;
            record.pending_writes += 1;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        record.write_calls += 1;
        if self.fail_after.is_some_and(|n| record.write_calls > n) {
            return Poll::Ready(Err(ErrorKind::BrokenPipe.into()));
        }
        record.data.extend_from_slice(buf);
        record.writes.push(buf.len());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<IoResult<()>> {
        Poll::Ready(Ok(()))
    }
}
