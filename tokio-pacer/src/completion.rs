//! End-of-stream notification for throttled streams.
//!
//! A [`Completion`] lets code that does not own the reader (a scheduler juggling several paced
//! streams, a progress reporter) learn when the wrapped source has been drained, without
//! polling. It fires exactly once, at the moment the stream first observes end-of-stream.
//!
//! ```
//! use tokio::io::AsyncReadExt;
//! use tokio_pacer::ThrottledStream;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> std::io::Result<()> {
//! let mut reader = ThrottledStream::new(&b"payload"[..]);
//! let mut done = reader.completion();
//!
//! let watcher = tokio::spawn(async move { done.wait().await });
//!
//! let mut out = Vec::new();
//! reader.read_to_end(&mut out).await?;
//! watcher.await.unwrap().unwrap();
//! # Ok(()) }
//! ```
use std::{error::Error, fmt};

use tokio::sync::watch;

/// Returned by [`Completion::wait`] when the stream was dropped before reaching end-of-stream.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AbandonedError;

impl fmt::Display for AbandonedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "throttled stream was dropped before end-of-stream")
    }
}

impl Error for AbandonedError {}

/// Firing side, owned by the stream.
#[derive(Debug)]
pub(crate) struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Release every current and future waiter. Later calls are no-ops.
    pub(crate) fn fire(&self) {
        self.tx.send_if_modified(|done| !std::mem::replace(done, true));
    }

    pub(crate) fn subscribe(&self) -> Completion {
        Completion {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cloneable observer of a stream's end-of-stream transition.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<bool>,
}

impl Completion {
    /// Wait until the stream reaches end-of-stream.
    ///
    /// Returns immediately if that already happened. Fails with [`AbandonedError`] if the
    /// stream is dropped first.
    pub async fn wait(&mut self) -> Result<(), AbandonedError> {
        self.rx
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| AbandonedError)
    }

    /// Non-blocking check.
    pub fn is_finished(&self) -> bool {
        *self.rx.borrow()
    }
}
