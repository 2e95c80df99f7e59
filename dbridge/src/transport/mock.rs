//! Scripted in-memory transport for unit tests.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::time::Duration;

use super::{Closer, Transport};

/// Serves a fixed byte script and records everything written.
#[derive(Debug)]
pub(crate) struct MockTransport {
    input: VecDeque<u8>,
    written: Vec<u8>,
    trickle: bool,
    hang_when_empty: bool,
    interrupts: usize,
    recv_calls: usize,
    timeout: Duration,
    closer: Closer,
}

impl MockTransport {
    /// Serves `script` then reports a hang-up.
    pub(crate) fn new(script: impl AsRef<[u8]>) -> Self {
        Self {
            input: script.as_ref().iter().copied().collect(),
            written: Vec::new(),
            trickle: false,
            hang_when_empty: false,
            interrupts: 0,
            recv_calls: 0,
            timeout: Duration::from_secs(5),
            closer: Closer::default(),
        }
    }

    /// Yields one byte per `recv` and accepts one byte per `send`.
    pub(crate) fn trickle(mut self) -> Self {
        self.trickle = true;
        self
    }

    /// Fails the first `n` calls with `Interrupted`.
    pub(crate) fn interrupt(mut self, n: usize) -> Self {
        self.interrupts = n;
        self
    }

    /// Never answers once the script is exhausted (and never answers at all if empty).
    pub(crate) fn hang(mut self) -> Self {
        self.hang_when_empty = true;
        self
    }

    /// Alias of [`hang`](Self::hang) reading better after a non-empty script.
    pub(crate) fn then_hang(self) -> Self {
        self.hang()
    }

    /// Sets the per-call timeout.
    pub(crate) fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Appends more bytes to serve.
    pub(crate) fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes);
    }

    /// Everything written so far.
    pub(crate) fn written(&self) -> &[u8] {
        &self.written
    }

    /// Number of `recv` calls made.
    pub(crate) fn recv_calls(&self) -> usize {
        self.recv_calls
    }

    /// Consumes a pending interrupt, if any.
    fn take_interrupt(&mut self) -> io::Result<()> {
        if self.interrupts > 0 {
            self.interrupts -= 1;
            return Err(io::Error::from(io::ErrorKind::Interrupted));
        }
        Ok(())
    }
}

impl Transport for MockTransport {
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            self.recv_calls += 1;
            self.take_interrupt()?;
            if self.input.is_empty() {
                if self.hang_when_empty {
                    std::future::pending::<()>().await;
                }
                return Ok(0);
            }
            let limit = if self.trickle { 1 } else { buf.len() };
            let n = limit.min(buf.len()).min(self.input.len());
            for (slot, byte) in buf.iter_mut().zip(self.input.drain(..n)) {
                *slot = byte;
            }
            Ok(n)
        }
    }

    fn send(&mut self, data: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            self.take_interrupt()?;
            let n = if self.trickle { data.len().min(1) } else { data.len() };
            self.written.extend_from_slice(&data[..n]);
            Ok(n)
        }
    }

    fn close(&mut self) {
        self.closer.close();
    }

    fn closer(&self) -> &Closer {
        &self.closer
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        "mock".to_owned()
    }
}
