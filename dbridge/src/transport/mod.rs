//! Byte transports carrying bridge traffic: TCP sockets and USB bulk endpoints.
//!
//! Implementors only provide single-shot `recv`/`send` primitives. The
//! provided [`Transport::read_exact`] and [`Transport::write_all`] accumulate
//! short reads and writes, retry interrupted calls, apply the per-call timeout,
//! and fail fast with [`Error::BrokenConnection`] once the transport is closed
//! from anywhere holding its [`Closer`].

#[cfg(test)]
pub(crate) mod mock;
mod tcp;
#[cfg(target_os = "linux")]
mod usb;

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::{Error, Result};

pub use tcp::TcpTransport;
#[cfg(target_os = "linux")]
pub use usb::UsbTransport;
#[cfg(target_os = "linux")]
pub(crate) use usb::{UsbLink, open_link};

/// Cloneable handle that closes a transport from another task.
///
/// Closing wakes any outstanding [`Transport::read_exact`] or
/// [`Transport::write_all`], which then return [`Error::BrokenConnection`].
#[derive(Debug, Clone, Default)]
pub struct Closer(Arc<CloserInner>);

/// Shared state behind a [`Closer`].
#[derive(Debug, Default)]
struct CloserInner {
    /// Set once; never cleared.
    closed: AtomicBool,
    /// Wakes waiters in [`Closer::wait`].
    notify: Notify,
}

impl Closer {
    /// Marks the transport closed and wakes pending I/O.
    pub fn close(&self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Resolves when the transport is closed.
    pub async fn wait(&self) {
        let notified = self.0.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// A full-duplex byte stream to a bridge server or device.
pub trait Transport: Send {
    /// Reads at most `buf.len()` bytes. `Ok(0)` means the peer hung up.
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Writes a prefix of `data`, returning how many bytes were accepted.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Releases the underlying socket or device handle. Idempotent.
    fn close(&mut self);

    /// Handle used to observe or trigger closing.
    fn closer(&self) -> &Closer;

    /// Timeout applied to each `read_exact`/`write_all` call.
    fn timeout(&self) -> Duration;

    /// Short human-readable peer description for logs and errors.
    fn describe(&self) -> String;

    /// Returns `true` once the transport has been closed.
    fn is_closed(&self) -> bool {
        self.closer().is_closed()
    }

    /// Reads exactly `n` bytes, or fails without returning a partial buffer.
    fn read_exact(&mut self, n: usize) -> impl Future<Output = Result<Vec<u8>>> + Send
    where
        Self: Sized,
    {
        async move {
            let guard = Guard::of(self);
            let mut buf = vec![0u8; n];
            guard.run(fill(self, &mut buf)).await?;
            Ok(buf)
        }
    }

    /// Writes all of `data`, retrying short and interrupted sends.
    fn write_all(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send
    where
        Self: Sized,
    {
        async move {
            let guard = Guard::of(self);
            guard.run(drain(self, data)).await
        }
    }

    /// Reads until the peer hangs up, returning everything received.
    ///
    /// Each individual read is bounded by [`timeout`](Self::timeout).
    fn read_to_end(&mut self) -> impl Future<Output = Result<Vec<u8>>> + Send
    where
        Self: Sized,
    {
        async move {
            let timeout = self.timeout();
            let mut out = Vec::new();
            let mut chunk = vec![0u8; 16 * 1024];
            loop {
                if self.is_closed() {
                    return Err(closed_error(&self.describe()));
                }
                match tokio::time::timeout(timeout, self.recv(&mut chunk)).await {
                    Err(_) => return Err(Error::Timeout(timeout)),
                    Ok(Ok(0)) => return Ok(out),
                    Ok(Ok(n)) => out.extend_from_slice(&chunk[..n]),
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    Ok(Err(e)) => return Err(map_io(e, &self.describe(), timeout)),
                }
            }
        }
    }

    /// Discards buffered bytes until a read of up to `packet` bytes idles for `window`.
    ///
    /// Returns the number of bytes discarded.
    fn flush_stale(
        &mut self,
        packet: usize,
        window: Duration,
    ) -> impl Future<Output = Result<usize>> + Send
    where
        Self: Sized,
    {
        async move {
            let mut scratch = vec![0u8; packet.max(1)];
            let mut dropped = 0;
            loop {
                match tokio::time::timeout(window, self.recv(&mut scratch)).await {
                    Err(_) => return Ok(dropped),
                    Ok(Ok(0)) => return Err(closed_error(&self.describe())),
                    Ok(Ok(n)) => dropped += n,
                    Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                    Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => return Ok(dropped),
                    Ok(Err(e)) => return Err(map_io(e, &self.describe(), window)),
                }
            }
        }
    }
}

/// Per-call bounds captured before an I/O call borrows the transport.
struct Guard {
    /// Close signal of the transport.
    closer: Closer,
    /// Timeout for the whole call.
    timeout: Duration,
    /// Peer description for errors.
    peer: String,
}

impl Guard {
    /// Captures the bounds of `t`.
    fn of<T: Transport>(t: &T) -> Self {
        Self {
            closer: t.closer().clone(),
            timeout: t.timeout(),
            peer: t.describe(),
        }
    }

    /// Runs one I/O call under the timeout, racing it against close.
    async fn run(&self, op: impl Future<Output = Result<()>>) -> Result<()> {
        if self.closer.is_closed() {
            return Err(closed_error(&self.peer));
        }
        tokio::select! {
            r = tokio::time::timeout(self.timeout, op) => {
                r.unwrap_or_else(|_| Err(Error::Timeout(self.timeout)))
            }
            () = self.closer.wait() => Err(closed_error(&self.peer)),
        }
    }
}

/// Accumulates reads until `buf` is full.
async fn fill<T: Transport>(t: &mut T, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match t.recv(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(Error::BrokenConnection(format!(
                    "{} hung up after {filled} of {} bytes",
                    t.describe(),
                    buf.len()
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(map_io(e, &t.describe(), t.timeout())),
        }
    }
    Ok(())
}

/// Repeats sends until all of `data` is accepted.
async fn drain<T: Transport>(t: &mut T, data: &[u8]) -> Result<()> {
    let mut sent = 0;
    while sent < data.len() {
        match t.send(&data[sent..]).await {
            Ok(0) => {
                return Err(Error::BrokenConnection(format!(
                    "{} accepted no bytes",
                    t.describe()
                )));
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(map_io(e, &t.describe(), t.timeout())),
        }
    }
    Ok(())
}

/// Error for I/O attempted on, or interrupted by, a closed transport.
fn closed_error(peer: &str) -> Error {
    Error::BrokenConnection(format!("{peer} is closed"))
}

/// Classifies an I/O error from a transport primitive.
pub(crate) fn map_io(e: io::Error, peer: &str, timeout: Duration) -> Error {
    use io::ErrorKind::{
        BrokenPipe, ConnectionAborted, ConnectionReset, NotConnected, TimedOut, UnexpectedEof,
        WouldBlock,
    };
    match e.kind() {
        TimedOut | WouldBlock => Error::Timeout(timeout),
        BrokenPipe | ConnectionAborted | ConnectionReset | NotConnected | UnexpectedEof => {
            Error::BrokenConnection(format!("{peer}: {e}"))
        }
        _ => Error::Io(e),
    }
}
