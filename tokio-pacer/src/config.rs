//! Tuning knobs for [`ThrottledStream`](crate::ThrottledStream).
//!
//! The defaults match what most callers want: a **100µs** canonical tick, an **8 KiB** staging
//! buffer and a **1ms** backlog allowance. Tests usually shrink the buffer or stretch the window
//! to make timing assertions readable on a paused clock.
//!
//! ```
//! use std::time::Duration;
//! use tokio_pacer::PacerConfig;
//!
//! let config = PacerConfig::default()
//!     .with_window(Duration::from_millis(1))
//!     .with_buffer_size(1024);
//! assert!(config.validate().is_ok());
//! ```
use std::{error::Error, fmt, io, time::Duration};

/// Canonical tick used to smooth a derived rate into regular emissions.
pub const DEFAULT_WINDOW: Duration = Duration::from_micros(100);

/// Capacity of the staging buffer used for bounded reads from the wrapped source.
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// How much unclaimed schedule a derived source may hand out at once after the reader fell
/// behind. One millisecond lines up with the resolution of tokio's timer wheel.
pub const DEFAULT_MAX_BACKLOG: Duration = Duration::from_millis(1);

/// Error returned when a [`PacerConfig`] has a zero window or a zero-sized buffer.
#[derive(Debug, Copy, Clone)]
pub struct InvalidConfigError(&'static str);

impl fmt::Display for InvalidConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pacer config: {}", self.0)
    }
}

impl Error for InvalidConfigError {}

/// Cadence and buffering parameters for a throttled stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacerConfig {
    window: Duration,
    buffer_size: usize,
    max_backlog: Duration,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_backlog: DEFAULT_MAX_BACKLOG,
        }
    }
}

impl PacerConfig {
    /// Set the canonical tick `W`.
    #[must_use]
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the staging buffer capacity in bytes.
    #[must_use]
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set how far a late reader may catch up on missed emissions in a single grant.
    ///
    /// The allowance never drops below one emission period.
    #[must_use]
    pub fn with_max_backlog(mut self, max_backlog: Duration) -> Self {
        self.max_backlog = max_backlog;
        self
    }

    #[inline]
    pub fn window(&self) -> Duration {
        self.window
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub fn max_backlog(&self) -> Duration {
        self.max_backlog
    }

    /// Returns `Err(InvalidInput)` if the window or the buffer size is zero.
    pub fn validate(&self) -> io::Result<()> {
        if self.window.is_zero() {
            return Err(invalid(InvalidConfigError("window must be non-zero")));
        }
        if self.buffer_size == 0 {
            return Err(invalid(InvalidConfigError("buffer size must be non-zero")));
        }
        Ok(())
    }
}

fn invalid(err: InvalidConfigError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, err)
}
