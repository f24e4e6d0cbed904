//! Smooth, externally controllable throughput shaping for Tokio readers.
//!
//! `tokio-pacer` wraps any [`AsyncRead`](tokio::io::AsyncRead) in a [`ThrottledStream`] that
//! bounds how many bytes can be read per unit of time. The aim is a smooth flow, not admission
//! control: a rate such as "64 KiB per second" is normalized onto a short canonical tick (100µs by
//! default), so consumers like TCP windowing see a steady stream instead of bursts and long
//! pauses.
//!
//! Quota can come from two places:
//! - a **derived** rate, `count` per `duration`, installed with [`RateHandle::set_rate`];
//! - a **delegated** [`QuotaFeed`] (any `Stream<Item = u64>`, e.g. an mpsc receiver) installed
//!   with [`RateHandle::set_rate_source`], when timing policy lives elsewhere.
//!
//! Either can be swapped at any time from another task while reads are in flight.
//!
//! ```
//! use std::time::Duration;
//! use tokio::io::AsyncReadExt;
//! use tokio_pacer::ThrottledStream;
//!
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() -> std::io::Result<()> {
//! let data = vec![0u8; 200];
//! let mut reader = ThrottledStream::new(&data[..]);
//! let mut done = reader.completion();
//! reader.set_rate(100, Duration::from_secs(1));
//!
//! let start = tokio::time::Instant::now();
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).await?;
//! assert!(start.elapsed() >= Duration::from_secs(2));
//! done.wait().await.unwrap();
//! # Ok(()) }
//! ```
//!
//! ## Modules
//! - [`stream`]: the throttled reader and its read algorithm.
//! - [`rate`]: rate normalization, quota feeds and the control handle.
//! - [`completion`]: end-of-stream notification.
//! - [`config`]: cadence and buffer tuning.
//! - [`wrap`]: idempotent wrapping.
//! - [`meter`]: byte counting for reports and tests.
pub mod completion;
pub mod config;
pub mod meter;
pub mod rate;
pub mod stream;
pub mod wrap;

pub use completion::{AbandonedError, Completion};
pub use config::{InvalidConfigError, PacerConfig};
pub use meter::{Meter, MeteredReader};
pub use rate::{QuotaFeed, RateHandle, Schedule};
pub use stream::{Budget, DetachedError, ThrottledStream};
pub use wrap::{IntoThrottled, throttle};
