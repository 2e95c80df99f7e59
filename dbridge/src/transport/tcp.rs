//! TCP transport to a bridge server.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::{Closer, Transport};
use crate::{Error, Result};

/// A connected stream socket to a bridge server.
#[derive(Debug)]
pub struct TcpTransport {
    /// `None` once closed.
    stream: Option<TcpStream>,
    /// Address as given to [`connect`](Self::connect).
    peer: String,
    /// Per-call read/write timeout.
    timeout: Duration,
    /// Close signal shared with outstanding I/O.
    closer: Closer,
}

impl TcpTransport {
    /// Connects to `address`, bounding the attempt by `connect_timeout`.
    ///
    /// A refused connection surfaces as [`Error::Io`] with
    /// [`io::ErrorKind::ConnectionRefused`].
    pub async fn connect(
        address: &str,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        tracing::debug!(%address, "connected");
        Ok(Self::from_stream(stream, address, io_timeout))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: TcpStream, peer: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
            timeout,
            closer: Closer::default(),
        }
    }

    /// Error for I/O on a closed socket.
    fn not_connected() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "socket closed")
    }
}

impl Transport for TcpTransport {
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            match self.stream.as_mut() {
                Some(s) => s.read(buf).await,
                None => Err(Self::not_connected()),
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            match self.stream.as_mut() {
                Some(s) => s.write(data).await,
                None => Err(Self::not_connected()),
            }
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!(peer = %self.peer, "closed");
        }
        self.closer.close();
    }

    fn closer(&self) -> &Closer {
        &self.closer
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        self.peer.clone()
    }
}
