//! Quota feeds that pace a [`ThrottledStream`](crate::ThrottledStream).
//!
//! A stream is paced by a *rate source*: a single-consumer feed of quota values, each one
//! granting the reader permission to move that many more bytes. Two kinds exist:
//!
//! - **Derived**: built from a target rate with [`RateHandle::set_rate`]. The rate is normalized
//!   into a fixed-cadence [`Schedule`] on the canonical tick (see [`Schedule::derive`]) and
//!   emitted by a timer owned by the stream itself.
//! - **Delegated**: any caller-supplied [`QuotaFeed`], installed with
//!   [`RateHandle::set_rate_source`]. Timing is then entirely external; the stream only consumes.
//!
//! ## Dynamic configuration
//! ```no_run
//! use std::time::Duration;
//! use tokio::io::{self, AsyncReadExt};
//! use tokio::net::TcpStream;
//! use tokio::sync::mpsc;
//! use tokio_pacer::ThrottledStream;
//!
//! # #[tokio::main]
//! # async fn main() -> io::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:12345").await?;
//! let mut reader = ThrottledStream::new(stream);
//! let rate = reader.handle();
//!
//! rate.set_rate(64 * 1024, Duration::from_secs(1)); // 64 KiB/s, smoothed on a 100µs tick
//!
//! let (tx, rx) = mpsc::channel(4);
//! rate.set_rate_source(rx);                          // hand timing to someone else
//! tokio::spawn(async move {
//!     let mut tick = tokio::time::interval(Duration::from_millis(10));
//!     loop {
//!         tick.tick().await;
//!         if tx.send(512).await.is_err() {
//!             break;
//!         }
//!     }
//! });
//!
//! let mut buf = Vec::new();
//! reader.read_to_end(&mut buf).await?;
//! # Ok(()) }
//! ```
//!
//! ## Under the hood
//! - Installs go through a single pending slot guarded by a mutex and published with an atomic
//!   flag. The reader picks them up only at refill points, so a transfer in flight always finishes
//!   under the quota it already holds. The last install wins.
//! - An [`AtomicWaker`] wakes a reader parked on the previous source, so replacing a silent feed
//!   never strands the reader.
//! - The derived emitter is a `Sleep` re-armed each period and owned by the stream. It is dropped
//!   with the source, on end-of-stream, or with the stream, so nothing keeps ticking after the
//!   reader is gone.
use std::{
    fmt,
    pin::Pin,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll, Waker, ready},
    time::Duration,
};

use futures::{
    FutureExt, Stream, StreamExt,
    stream::{self, BoxStream},
    task::AtomicWaker,
};
use tokio::{
    sync::mpsc,
    time::{Instant, Sleep, sleep_until},
};
use tracing::debug;

use crate::config::PacerConfig;

/// A fixed-cadence emission plan: `quota` units every `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    quota: u64,
    period: Duration,
}

impl Schedule {
    /// Normalize `count` units per `per` onto the canonical tick `window`.
    ///
    /// When at least one unit fits in each tick, the schedule emits the rounded per-tick share
    /// every `window`. Slower rates keep a quota of exactly one unit and stretch the period to
    /// `per / count` instead of emitting fractional units.
    ///
    /// Returns `None` when the rate is not finite and positive (`count == 0`, or a zero `per` or
    /// `window`).
    ///
    /// ```
    /// use std::time::Duration;
    /// use tokio_pacer::Schedule;
    ///
    /// let window = Duration::from_micros(100);
    /// let fast = Schedule::derive(10_000_000, Duration::from_secs(1), window).unwrap();
    /// assert_eq!((fast.quota(), fast.period()), (1000, window));
    ///
    /// let slow = Schedule::derive(1, Duration::from_secs(10), window).unwrap();
    /// assert_eq!((slow.quota(), slow.period()), (1, Duration::from_secs(10)));
    /// ```
    pub fn derive(count: u64, per: Duration, window: Duration) -> Option<Self> {
        if count == 0 || per.is_zero() || window.is_zero() {
            return None;
        }

        let ratio = per.as_nanos() as f64 / window.as_nanos() as f64;
        let per_tick = count as f64 / ratio;

        if per_tick >= 1.0 {
            return Some(Self {
                quota: per_tick.round() as u64,
                period: window,
            });
        }

        // window / per_tick == per / count; integer math keeps the stretched period exact.
        let nanos = per.as_nanos() / u128::from(count);
        let period = Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX));
        Some(Self {
            quota: 1,
            period: period.max(window),
        })
    }

    /// Units granted per emission.
    #[inline]
    pub fn quota(&self) -> u64 {
        self.quota
    }

    /// Time between emissions.
    #[inline]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Effective rate in units per second after normalization.
    pub fn per_second(&self) -> f64 {
        self.quota as f64 / self.period.as_secs_f64()
    }
}

/// A caller-driven feed of quota values.
///
/// Anything that implements `Stream<Item = u64> + Send` can be used, and Tokio's mpsc receivers
/// convert directly. A quota of `0` grants nothing. When the feed ends the stream falls back to
/// unthrottled reads.
pub struct QuotaFeed {
    inner: BoxStream<'static, u64>,
}

impl QuotaFeed {
    pub fn new<S>(feed: S) -> Self
    where
        S: Stream<Item = u64> + Send + 'static,
    {
        Self {
            inner: feed.boxed(),
        }
    }
}

impl From<mpsc::Receiver<u64>> for QuotaFeed {
    fn from(mut rx: mpsc::Receiver<u64>) -> Self {
        Self::new(stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}

impl From<mpsc::UnboundedReceiver<u64>> for QuotaFeed {
    fn from(mut rx: mpsc::UnboundedReceiver<u64>) -> Self {
        Self::new(stream::poll_fn(move |cx| rx.poll_recv(cx)))
    }
}

impl fmt::Debug for QuotaFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaFeed").finish_non_exhaustive()
    }
}

/// Timer-driven emitter for a derived [`Schedule`].
pub(crate) struct Ticker {
    schedule: Schedule,
    next: Instant,
    max_ticks: u64,
    sleep: Pin<Box<Sleep>>,
}

impl Ticker {
    /// Must be called from within a Tokio runtime.
    fn new(schedule: Schedule, installed_at: Instant, max_backlog: Duration) -> Self {
        let next = installed_at + schedule.period;
        let max_ticks = max_backlog.as_nanos() / schedule.period.as_nanos();

        Self {
            schedule,
            next,
            max_ticks: u64::try_from(max_ticks).unwrap_or(u64::MAX).max(1),
            sleep: Box::pin(sleep_until(next)),
        }
    }

    fn poll_quota(&mut self, cx: &mut Context<'_>) -> Poll<u64> {
        if Instant::now() < self.next {
            if self.sleep.deadline() != self.next {
                self.sleep.as_mut().reset(self.next);
            }
            ready!(self.sleep.poll_unpin(cx));
        }

        let period = self.schedule.period.as_nanos();
        let late = Instant::now().saturating_duration_since(self.next).as_nanos();
        let elapsed = 1 + late / period;

        // Skip every elapsed period, but only pay out up to the backlog allowance.
        let advance = u64::try_from(elapsed.saturating_mul(period)).unwrap_or(u64::MAX);
        self.next += Duration::from_nanos(advance);
        let ticks = u64::try_from(elapsed).unwrap_or(u64::MAX).min(self.max_ticks);

        Poll::Ready(self.schedule.quota.saturating_mul(ticks))
    }
}

impl fmt::Debug for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticker")
            .field("schedule", &self.schedule)
            .field("next", &self.next)
            .field("max_ticks", &self.max_ticks)
            .finish()
    }
}

/// The source a stream is currently consuming quota from.
#[derive(Debug)]
pub(crate) enum RateSource {
    Derived(Ticker),
    Delegated(QuotaFeed),
}

impl RateSource {
    /// `Ready(None)` means the feed has ended; derived sources never end.
    pub(crate) fn poll_quota(&mut self, cx: &mut Context<'_>) -> Poll<Option<u64>> {
        match self {
            RateSource::Derived(ticker) => ticker.poll_quota(cx).map(Some),
            RateSource::Delegated(feed) => feed.inner.poll_next_unpin(cx),
        }
    }
}

/// A pending change published by a [`RateHandle`].
pub(crate) enum Install {
    Unthrottled,
    Derived {
        schedule: Schedule,
        installed_at: Instant,
    },
    Delegated(QuotaFeed),
}

impl Install {
    /// Turn the pending change into a live source. Must run inside a Tokio runtime.
    pub(crate) fn into_source(self, max_backlog: Duration) -> Option<RateSource> {
        match self {
            Install::Unthrottled => None,
            Install::Derived {
                schedule,
                installed_at,
            } => Some(RateSource::Derived(Ticker::new(
                schedule,
                installed_at,
                max_backlog,
            ))),
            Install::Delegated(feed) => Some(RateSource::Delegated(feed)),
        }
    }
}

#[derive(Default)]
struct Slot {
    pending: Option<Install>,
    schedule: Option<Schedule>,
    throttled: bool,
}

struct Shared {
    window: Duration,
    slot: Mutex<Slot>,
    dirty: AtomicBool,
    waker: AtomicWaker,
}

/// Cheap, cloneable control handle for one stream's rate.
///
/// Every [`ThrottledStream`](crate::ThrottledStream) owns exactly one shared handle; clones
/// may be moved to other tasks or threads and used concurrently with reads.
#[derive(Clone)]
pub struct RateHandle {
    shared: Arc<Shared>,
}

impl RateHandle {
    pub(crate) fn new(config: &PacerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                window: config.window(),
                slot: Mutex::new(Slot::default()),
                dirty: AtomicBool::new(false),
                waker: AtomicWaker::new(),
            }),
        }
    }

    /// Limit the stream to `count` bytes per `per`, smoothed onto the canonical tick.
    ///
    /// Replaces whatever source was installed before. A `count` of `0` or a zero `per` removes
    /// the limit instead. Returns the normalized schedule that will be used.
    pub fn set_rate(&self, count: u64, per: Duration) -> Option<Schedule> {
        let Some(schedule) = Schedule::derive(count, per, self.shared.window) else {
            self.clear_rate();
            return None;
        };

        debug!(
            count,
            per = ?per,
            quota = schedule.quota(),
            period = ?schedule.period(),
            "installing derived rate"
        );
        self.install(
            Install::Derived {
                schedule,
                installed_at: Instant::now(),
            },
            Some(schedule),
        );
        Some(schedule)
    }

    /// Install a caller-driven quota feed. No timing logic is applied by the stream.
    pub fn set_rate_source(&self, feed: impl Into<QuotaFeed>) {
        debug!("installing delegated quota feed");
        self.install(Install::Delegated(feed.into()), None);
    }

    /// Remove any limit; subsequent reads are a pass-through.
    pub fn clear_rate(&self) {
        debug!("clearing rate limit");
        self.install(Install::Unthrottled, None);
    }

    /// The schedule requested by the latest [`set_rate`](Self::set_rate), if it is still the
    /// active request.
    pub fn schedule(&self) -> Option<Schedule> {
        self.lock().schedule
    }

    /// Whether the latest install left the stream throttled.
    pub fn is_throttled(&self) -> bool {
        self.lock().throttled
    }

    /// Whether both handles control the same stream.
    pub fn ptr_eq(&self, other: &RateHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn install(&self, install: Install, schedule: Option<Schedule>) {
        {
            let mut slot = self.lock();
            slot.throttled = !matches!(install, Install::Unthrottled);
            slot.schedule = schedule;
            slot.pending = Some(install);
        }
        self.shared.dirty.store(true, Ordering::Release);
        self.shared.waker.wake();
    }

    /// Register the reading task so a later install can wake it.
    pub(crate) fn register(&self, waker: &Waker) {
        self.shared.waker.register(waker);
    }

    /// Take the most recent install, if one arrived since the last call.
    pub(crate) fn take_pending(&self) -> Option<Install> {
        if !self.shared.dirty.swap(false, Ordering::AcqRel) {
            return None;
        }
        self.lock().pending.take()
    }

    /// Record that a delegated feed ran dry and the stream fell back to pass-through.
    pub(crate) fn mark_unthrottled(&self) {
        let mut slot = self.lock();
        if slot.pending.is_none() {
            slot.throttled = false;
            slot.schedule = None;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.shared
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.lock();
        f.debug_struct("RateHandle")
            .field("window", &self.shared.window)
            .field("schedule", &slot.schedule)
            .field("throttled", &slot.throttled)
            .finish()
    }
}
