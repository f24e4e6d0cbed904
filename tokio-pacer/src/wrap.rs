//! Idempotent wrapping.
//!
//! [`IntoThrottled`] turns a reader into a [`ThrottledStream`], except when it already is one:
//! then the same instance comes back unchanged, with its rate, quota and completion state intact.
//! Wrapping twice never stacks two throttlers on top of each other.
//!
//! The trait is implemented for `ThrottledStream<T>` itself and for the common Tokio readers.
//! For anything else use [`ThrottledStream::new`] directly.
//!
//! ```
//! use std::time::Duration;
//! use tokio::io::{DuplexStream, duplex};
//! use tokio_pacer::{IntoThrottled, ThrottledStream};
//!
//! let (_w, r) = duplex(64);
//! let once = r.throttled();
//! once.set_rate(1024, Duration::from_secs(1));
//! let handle = once.handle();
//!
//! let twice: ThrottledStream<DuplexStream> = once.throttled();
//! assert!(twice.handle().ptr_eq(&handle));
//! ```
use tokio::{
    fs::File,
    io::{
        AsyncRead, BufReader, BufStream, DuplexStream, Empty, Repeat, SimplexStream, Stdin,
    },
    net::{TcpStream, tcp},
    process::{ChildStderr, ChildStdout},
};

use crate::stream::ThrottledStream;

/// Conversion into a throttled reader that never nests wrappers.
pub trait IntoThrottled {
    /// The reader that ends up being wrapped.
    type Inner;

    /// Wrap `self`, or return it unchanged if it is already a [`ThrottledStream`].
    #[must_use]
    fn throttled(self) -> ThrottledStream<Self::Inner>;
}

impl<T> IntoThrottled for ThrottledStream<T> {
    type Inner = T;

    fn throttled(self) -> ThrottledStream<T> {
        self
    }
}

/// Free-function form of [`IntoThrottled::throttled`].
#[must_use]
pub fn throttle<S: IntoThrottled>(stream: S) -> ThrottledStream<S::Inner> {
    stream.throttled()
}

macro_rules! fresh_wrap {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoThrottled for $ty {
                type Inner = $ty;

                fn throttled(self) -> ThrottledStream<$ty> {
                    ThrottledStream::new(self)
                }
            }
        )*
    };
}

fresh_wrap!(
    TcpStream,
    tcp::OwnedReadHalf,
    File,
    Stdin,
    ChildStdout,
    ChildStderr,
    DuplexStream,
    SimplexStream,
    Empty,
    Repeat,
);

#[cfg(unix)]
fresh_wrap!(
    tokio::net::UnixStream,
    tokio::net::unix::OwnedReadHalf,
    tokio::net::unix::pipe::Receiver,
);

impl<R: AsyncRead> IntoThrottled for BufReader<R> {
    type Inner = BufReader<R>;

    fn throttled(self) -> ThrottledStream<BufReader<R>> {
        ThrottledStream::new(self)
    }
}

impl<RW> IntoThrottled for BufStream<RW> {
    type Inner = BufStream<RW>;

    fn throttled(self) -> ThrottledStream<BufStream<RW>> {
        ThrottledStream::new(self)
    }
}

impl<'a> IntoThrottled for &'a [u8] {
    type Inner = &'a [u8];

    fn throttled(self) -> ThrottledStream<&'a [u8]> {
        ThrottledStream::new(self)
    }
}

impl<T: AsRef<[u8]> + Unpin> IntoThrottled for std::io::Cursor<T> {
    type Inner = std::io::Cursor<T>;

    fn throttled(self) -> ThrottledStream<std::io::Cursor<T>> {
        ThrottledStream::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, duplex};

    use crate::stream::Budget;

    #[test]
    fn wrapping_a_throttled_stream_returns_the_same_instance() {
        let (_w, r) = duplex(16);
        let once = r.throttled();
        let handle = once.handle();

        let twice = throttle(once);
        let thrice: ThrottledStream<DuplexStream> = twice.throttled();
        assert!(thrice.handle().ptr_eq(&handle));
    }

    #[test]
    fn wrapping_fresh_readers_gets_independent_state() {
        let (_w1, r1) = duplex(16);
        let (_w2, r2) = duplex(16);
        let a = r1.throttled();
        let b = r2.throttled();

        a.set_rate(10, Duration::from_secs(1));
        assert!(a.handle().is_throttled());
        assert!(!b.handle().is_throttled());
        assert!(!a.handle().ptr_eq(&b.handle()));
    }

    #[tokio::test(start_paused = true)]
    async fn rewrap_keeps_quota_and_rate_in_flight() {
        let data = [7u8; 16];
        let mut reader = (&data[..]).throttled();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        reader.set_rate_source(rx);
        tx.send(6).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4);

        let mut reader = reader.throttled();
        assert_eq!(reader.budget(), Budget::Remaining(2));
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cursor_and_buf_reader_wrap_fresh() {
        let mut reader = std::io::Cursor::new(b"hello".to_vec()).throttled();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello");

        let mut reader = BufReader::new(&b"world"[..]).throttled();
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "world");
        assert!(reader.is_finished());
    }
}
