//! Throughput measurement for readers.
//!
//! [`MeteredReader`] wraps any `AsyncRead` and counts the bytes that pass through it. The counts
//! live in a cloneable [`Meter`], so another task (a status endpoint, a progress logger) can
//! watch a copy while it runs.
//!
//! ```
//! use tokio::io::AsyncReadExt;
//! use tokio_pacer::MeteredReader;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> std::io::Result<()> {
//! let mut reader = MeteredReader::new(&b"hello world"[..]);
//! let meter = reader.meter();
//!
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).await?;
//! assert_eq!(meter.total(), 11);
//! # Ok(()) }
//! ```
//!
//! Timing uses [`tokio::time::Instant`], so rates computed under a paused test clock are exact.
use std::{
    fmt, io,
    pin::Pin,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, ReadBuf},
    time::Instant,
};

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    first_byte: OnceLock<Instant>,
}

/// Shared view of the bytes counted by a [`MeteredReader`].
#[derive(Debug, Clone, Default)]
pub struct Meter {
    counters: Arc<Counters>,
}

impl Meter {
    /// Total bytes read so far.
    #[inline]
    pub fn total(&self) -> u64 {
        self.counters.total.load(Ordering::Acquire)
    }

    /// When the first non-empty read happened.
    #[inline]
    pub fn first_byte(&self) -> Option<Instant> {
        self.counters.first_byte.get().copied()
    }

    /// Time since the first byte, or `None` before any data arrived.
    pub fn elapsed(&self) -> Option<Duration> {
        self.first_byte().map(|start| start.elapsed())
    }

    /// Average bytes per second since the first byte.
    pub fn rate_bps(&self) -> Option<f64> {
        let elapsed = self.elapsed()?;
        // tiny intervals would blow the average up
        Some(self.total() as f64 / elapsed.as_secs_f64().max(1e-6))
    }

    fn record(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.counters.first_byte.get_or_init(Instant::now);
        self.counters.total.fetch_add(n, Ordering::AcqRel);
    }
}

/// Counts bytes flowing through an `AsyncRead`.
#[pin_project]
pub struct MeteredReader<T> {
    #[pin]
    inner: T,
    meter: Meter,
}

impl<T> MeteredReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            meter: Meter::default(),
        }
    }

    /// A handle onto this reader's counters.
    pub fn meter(&self) -> Meter {
        self.meter.clone()
    }

    #[inline]
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for MeteredReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeteredReader")
            .field("inner", &self.inner)
            .field("total", &self.meter.total())
            .finish()
    }
}

impl<T: AsyncRead> AsyncRead for MeteredReader<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();

        let res = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            this.meter.record((buf.filled().len() - before) as u64);
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{self, AsyncReadExt};

    use crate::stream::ThrottledStream;

    #[tokio::test(start_paused = true)]
    async fn counts_bytes_and_starts_on_first_nonzero_read() {
        let mut reader = MeteredReader::new(&b"hello world"[..]);
        let meter = reader.meter();
        assert!(meter.first_byte().is_none());

        let mut buf = vec![0u8; 11];
        reader.read_exact(&mut buf).await.unwrap();

        assert_eq!(buf, b"hello world");
        assert_eq!(meter.total(), 11);
        assert!(meter.first_byte().is_some());
    }

    #[tokio::test]
    async fn empty_reads_do_not_start_timer() {
        let mut reader = MeteredReader::new(io::empty());
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);

        let meter = reader.meter();
        assert_eq!(meter.total(), 0);
        assert!(meter.rate_bps().is_none());
        assert!(meter.elapsed().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn measures_throttled_rate() {
        let data = vec![1u8; 2000];
        let mut reader = ThrottledStream::new(MeteredReader::new(&data[..]));
        let meter = reader.get_ref().unwrap().meter();
        reader.set_rate(1000, Duration::from_secs(1));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(meter.total(), 2000);

        // First byte lands after one period, the rest take ~2s.
        let rate = meter.rate_bps().unwrap();
        assert!((900.0..=1100.0).contains(&rate), "rate {rate}");
    }
}
