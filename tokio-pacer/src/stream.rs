//! Rate-shaped reads for Tokio `AsyncRead` sources.
//!
//! [`ThrottledStream`] wraps any [`AsyncRead`] and bounds how many bytes each read may move by
//! the quota handed out by its active rate source (see [`crate::rate`]). Without a source it is a
//! plain pass-through. The usual read contract is kept: reads wait while nothing can be delivered,
//! end-of-stream is an `Ok(())` that fills nothing, and errors from the wrapped source come back
//! unchanged.
//!
//! ## Static configuration
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncReadExt};
//! use tokio::net::TcpStream;
//! use tokio_pacer::ThrottledStream;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:12345").await?;
//! let mut reader = ThrottledStream::new(stream);
//! reader.set_rate(32 * 1024, Duration::from_secs(1)); // 32 KiB/s
//!
//! let mut buf = vec![0u8; 4096];
//! let n = reader.read(&mut buf).await?; // returns as soon as some quota was spent
//! # let _ = n;
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - Each read loops until the caller's buffer is full. Every inner transfer is bounded by the
//!   remaining quota, the space left in the caller's buffer and the staging buffer capacity.
//! - When the quota runs out the source is polled. If it has nothing ready and the call already
//!   produced bytes, those bytes are returned right away instead of waiting for the next tick.
//! - Newly installed sources are only picked up when the quota is exhausted (or when the stream
//!   is unthrottled), so a transfer in progress finishes under the rate it started with.
//! - The first end-of-stream releases every [`Completion`] observer and drops the active source.
use std::{
    error::Error,
    fmt, io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, trace};

use crate::{
    completion::{Completion, Latch},
    config::PacerConfig,
    rate::{QuotaFeed, RateHandle, RateSource, Schedule},
};

/// Marker error for reads on a stream whose source was taken out with
/// [`ThrottledStream::take_inner`].
#[derive(Debug, Copy, Clone)]
pub struct DetachedError;

impl fmt::Display for DetachedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "throttled stream has no wrapped source")
    }
}

impl Error for DetachedError {}

/// How many more bytes the current quota period allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    /// No rate source is active.
    Unbounded,
    /// A rate source is active and this many bytes remain before it must be polled again.
    Remaining(u64),
}

impl Budget {
    #[inline]
    fn limit(self, cap: usize) -> usize {
        match self {
            Budget::Unbounded => cap,
            Budget::Remaining(n) => cap.min(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }

    #[inline]
    fn consume(&mut self, used: usize) {
        if let Budget::Remaining(n) = self {
            *n = n.saturating_sub(used as u64);
        }
    }

    #[inline]
    fn is_refill_point(self) -> bool {
        matches!(self, Budget::Unbounded | Budget::Remaining(0))
    }
}

/// A read-side throttler driven by a swappable quota feed.
///
/// Construct with [`ThrottledStream::new`] or [`IntoThrottled::throttled`](crate::IntoThrottled),
/// control the rate through [`handle`](Self::handle) from any task, and observe end-of-stream
/// with [`completion`](Self::completion).
#[pin_project]
pub struct ThrottledStream<T> {
    #[pin]
    inner: Option<T>,
    staging: Option<Box<[u8]>>,
    reached_end: bool,
    deferred: Option<io::Error>,
    budget: Budget,
    source: Option<RateSource>,
    handle: RateHandle,
    latch: Latch,
    config: PacerConfig,
}

impl<T> ThrottledStream<T> {
    /// Wrap `inner` with the default [`PacerConfig`]. No rate is installed yet.
    pub fn new(inner: T) -> Self {
        Self::build(inner, PacerConfig::default())
    }

    /// Wrap `inner` with a custom configuration.
    ///
    /// Returns `Err(InvalidInput)` if the configuration does not validate.
    pub fn with_config(inner: T, config: PacerConfig) -> io::Result<Self> {
        config.validate()?;
        Ok(Self::build(inner, config))
    }

    fn build(inner: T, config: PacerConfig) -> Self {
        Self {
            inner: Some(inner),
            staging: None,
            reached_end: false,
            deferred: None,
            budget: Budget::Unbounded,
            source: None,
            handle: RateHandle::new(&config),
            latch: Latch::new(),
            config,
        }
    }

    /// A control handle that can change this stream's rate from any task or thread.
    pub fn handle(&self) -> RateHandle {
        self.handle.clone()
    }

    /// Shorthand for [`RateHandle::set_rate`].
    pub fn set_rate(&self, count: u64, per: Duration) -> Option<Schedule> {
        self.handle.set_rate(count, per)
    }

    /// Shorthand for [`RateHandle::set_rate_source`].
    pub fn set_rate_source(&self, feed: impl Into<QuotaFeed>) {
        self.handle.set_rate_source(feed)
    }

    /// Shorthand for [`RateHandle::clear_rate`].
    pub fn clear_rate(&self) {
        self.handle.clear_rate()
    }

    /// An observer that resolves once this stream reaches end-of-stream.
    pub fn completion(&self) -> Completion {
        self.latch.subscribe()
    }

    pub fn config(&self) -> &PacerConfig {
        &self.config
    }

    /// Whether the wrapped source has reported end-of-stream.
    pub fn is_finished(&self) -> bool {
        self.reached_end
    }

    /// Quota left in the current period, as seen by the last read.
    pub fn budget(&self) -> Budget {
        self.budget
    }

    pub fn get_ref(&self) -> Option<&T> {
        self.inner.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.inner.as_mut()
    }

    /// Detach the wrapped source. Later reads fail with `UnexpectedEof`.
    pub fn take_inner(&mut self) -> Option<T>
    where
        T: Unpin,
    {
        self.inner.take()
    }

    pub fn into_inner(self) -> Option<T> {
        self.inner
    }
}

impl<T: AsyncRead> AsyncRead for ThrottledStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        let Some(mut inner) = this.inner.as_pin_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                DetachedError,
            )));
        };
        if let Some(err) = this.deferred.take() {
            return Poll::Ready(Err(err));
        }
        if *this.reached_end {
            return Poll::Ready(Ok(()));
        }

        this.handle.register(cx.waker());
        let start = buf.filled().len();

        while buf.remaining() > 0 {
            // 1. refill point: pick up whatever was installed since the last one
            if this.budget.is_refill_point()
                && let Some(install) = this.handle.take_pending()
            {
                *this.source = install.into_source(this.config.max_backlog());
                *this.budget = match this.source {
                    Some(_) => Budget::Remaining(0),
                    None => Budget::Unbounded,
                };
                trace!(throttled = this.source.is_some(), "rate source swapped");
            }

            // 2. out of quota: ask the source for more
            if *this.budget == Budget::Remaining(0)
                && let Some(source) = this.source.as_mut()
            {
                match source.poll_quota(cx) {
                    // nothing granted: yield so an always-ready feed cannot spin this poll
                    Poll::Ready(Some(0)) if buf.filled().len() > start => {
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready(Some(0)) => {
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }
                    Poll::Ready(Some(quota)) => *this.budget = Budget::Remaining(quota),
                    Poll::Ready(None) => {
                        debug!("quota feed ended, reads are no longer throttled");
                        *this.source = None;
                        *this.budget = Budget::Unbounded;
                        this.handle.mark_unthrottled();
                    }
                    Poll::Pending if buf.filled().len() > start => return Poll::Ready(Ok(())),
                    Poll::Pending => return Poll::Pending,
                }
            }

            // 3. bounded transfer through the staging buffer
            let size = this.config.buffer_size();
            let lim = this.budget.limit(buf.remaining().min(size));
            let staging = this
                .staging
                .get_or_insert_with(|| vec![0u8; size].into_boxed_slice());
            let mut chunk = ReadBuf::new(&mut staging[..lim]);

            match inner.as_mut().poll_read(cx, &mut chunk) {
                Poll::Ready(Ok(())) if chunk.filled().is_empty() => {
                    *this.reached_end = true;
                    *this.source = None;
                    this.latch.fire();
                    debug!(
                        delivered = buf.filled().len() - start,
                        "wrapped stream reached end-of-stream"
                    );
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Ok(())) => {
                    let n = chunk.filled().len();
                    buf.put_slice(chunk.filled());
                    this.budget.consume(n);
                }
                Poll::Ready(Err(err)) if buf.filled().len() > start => {
                    // hand out what we already have; the error surfaces on the next read
                    *this.deferred = Some(err);
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending if buf.filled().len() > start => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite> AsyncWrite for ThrottledStream<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.project().inner.as_pin_mut() {
            Some(inner) => inner.poll_write(cx, buf),
            None => Poll::Ready(Err(detached_write())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project().inner.as_pin_mut() {
            Some(inner) => inner.poll_flush(cx),
            None => Poll::Ready(Err(detached_write())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.project().inner.as_pin_mut() {
            Some(inner) => inner.poll_shutdown(cx),
            None => Poll::Ready(Err(detached_write())),
        }
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.as_ref().is_some_and(|w| w.is_write_vectored())
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<Result<usize, io::Error>> {
        match self.project().inner.as_pin_mut() {
            Some(inner) => inner.poll_write_vectored(cx, bufs),
            None => Poll::Ready(Err(detached_write())),
        }
    }
}

fn detached_write() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, DetachedError)
}

impl<T: fmt::Debug> fmt::Debug for ThrottledStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottledStream")
            .field("inner", &self.inner)
            .field("budget", &self.budget)
            .field("source", &self.source)
            .field("reached_end", &self.reached_end)
            .finish_non_exhaustive()
    }
}
