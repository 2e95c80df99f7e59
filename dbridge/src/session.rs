//! Host session: one transport, strictly serialized requests.
//!
//! A session starts disconnected. [`Session::connect`] opens a TCP stream to
//! the bridge server, launching the server when the port refuses and
//! restarting it once when it reports an outdated version. Requests are
//! qualified with a host prefix until [`Session::switch_transport`] succeeds;
//! from then on the connection is addressed at the device and services go out
//! unprefixed.
//!
//! Fatal errors ([`Error::is_fatal`]) close the transport. `FAIL` replies and
//! timeouts leave the session usable.

use std::sync::Arc;
use std::time::Duration;

use dbridge_proto::codec::{self, Status};
use dbridge_proto::{Prefix, Selector};
use tokio::time::Instant;

use crate::config::Config;
use crate::launcher::{CommandLauncher, ServerLauncher};
use crate::transport::{TcpTransport, Transport};
use crate::{Error, Result};

/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum State {
    /// No transport.
    Disconnected,
    /// `connect` in progress.
    Connecting,
    /// Requests may be issued.
    Connected,
}

/// What follows an `OKAY` status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Reply {
    /// Nothing; the status is the whole answer.
    Status,
    /// A 4-hex-digit length and that many payload bytes.
    Payload,
}

/// A connection to the bridge server or, after a transport switch, a device.
#[derive(Debug)]
pub struct Session<T = TcpTransport> {
    /// Open transport; `None` while disconnected.
    transport: Option<T>,
    /// Lifecycle state.
    state: State,
    /// Device the connection was switched to.
    target: Option<Selector>,
    /// Address, timeouts and retry budget.
    config: Config,
    /// Starts the server on refused connections; TCP sessions only.
    launcher: Option<Arc<dyn ServerLauncher>>,
}

impl Session<TcpTransport> {
    /// Disconnected session launching the server with `config.server_command`.
    pub fn new(config: Config) -> Result<Self> {
        let launcher = CommandLauncher::new(&config.server_command)?;
        Ok(Self::with_launcher(config, Arc::new(launcher)))
    }

    /// Disconnected session using a custom server launcher.
    pub fn with_launcher(config: Config, launcher: Arc<dyn ServerLauncher>) -> Self {
        Self {
            transport: None,
            state: State::Disconnected,
            target: None,
            config,
            launcher: Some(launcher),
        }
    }

    /// Connects to the server, reusing a live connection.
    ///
    /// Refused connections launch the server, at most `connect_retries` times,
    /// before failing with [`Error::ServerUnreachable`]. With `check_version`
    /// set, a server older than `min_server_version` is killed and relaunched
    /// once; if it is still too old the result is [`Error::ServerOutdated`].
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let result = self.establish().await;
        if result.is_err() {
            self.disconnect();
        }
        result
    }

    /// Runs the connect sequence; leaves the session connected on success.
    async fn establish(&mut self) -> Result<()> {
        self.reopen().await?;
        if !self.config.check_version {
            return Ok(());
        }

        let required = self.config.min_server_version;
        let found = self.server_version().await?;
        if found < required {
            tracing::info!(found, required, "bridge server is outdated, restarting");
            self.reopen().await?;
            self.restart_server().await?;
            self.reopen().await?;
            let restarted = self.server_version().await?;
            if restarted < required {
                return Err(Error::ServerOutdated {
                    found: restarted,
                    required,
                });
            }
        }
        // The server closes host connections after a one-shot reply.
        self.reopen().await
    }

    /// Replaces the transport with a fresh stream.
    async fn reopen(&mut self) -> Result<()> {
        self.disconnect();
        self.state = State::Connecting;
        let transport = self.open_stream().await?;
        self.attach(transport);
        Ok(())
    }

    /// Opens a TCP stream, launching the server while the port refuses.
    async fn open_stream(&self) -> Result<TcpTransport> {
        let address = self.config.address();
        let mut attempts = 0;
        loop {
            let attempt = TcpTransport::connect(
                &address,
                self.config.connect_timeout,
                self.config.io_timeout,
            );
            match attempt.await {
                Ok(t) => return Ok(t),
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    if attempts >= self.config.connect_retries {
                        return Err(Error::ServerUnreachable { address, attempts });
                    }
                    attempts += 1;
                    tracing::debug!(%address, attempt = attempts, "connection refused");
                    self.start_server().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Runs the launcher on a blocking thread, then waits for the server to settle.
    async fn start_server(&self) -> Result<()> {
        let launcher = self
            .launcher
            .clone()
            .ok_or_else(|| Error::StartFailed("no server launcher configured".to_owned()))?;
        tokio::task::spawn_blocking(move || launcher.start_server())
            .await
            .map_err(|e| Error::StartFailed(e.to_string()))??;
        tokio::time::sleep(self.config.start_delay).await;
        Ok(())
    }

    /// Sends `host:kill`, waits for the port to close and starts a new server.
    async fn restart_server(&mut self) -> Result<()> {
        match self.command(&Prefix::Host, "kill").await {
            Ok(()) | Err(Error::BrokenConnection(_)) => {}
            Err(e) => return Err(e),
        }
        self.disconnect();
        self.wait_for_exit().await;
        self.start_server().await
    }

    /// Polls the server port until it refuses or `kill_wait` elapses.
    async fn wait_for_exit(&self) {
        const POLL: Duration = Duration::from_millis(50);
        let address = self.config.address();
        let deadline = Instant::now() + self.config.kill_wait;
        while Instant::now() < deadline {
            match TcpTransport::connect(&address, POLL, POLL).await {
                Ok(mut probe) => {
                    probe.close();
                    tokio::time::sleep(POLL).await;
                }
                Err(_) => return,
            }
        }
        tracing::warn!(%address, "killed server still accepting connections");
    }

    /// Asks the server for its protocol version.
    pub async fn server_version(&mut self) -> Result<u32> {
        let payload = self
            .request(&Prefix::Host, "version", Reply::Payload)
            .await?;
        let word = <[u8; 4]>::try_from(payload.as_slice()).map_err(|_| {
            Error::Protocol(dbridge_proto::Error::Malformed {
                what: "server version",
                line: String::from_utf8_lossy(&payload).into_owned(),
            })
        })?;
        let version = self.settle(codec::parse_length(word).map_err(Error::from))?;
        Ok(u32::try_from(version).unwrap_or(u32::MAX))
    }
}

impl<T: Transport> Session<T> {
    /// Connected session over an already open transport.
    pub const fn with_transport(transport: T, config: Config) -> Self {
        Self {
            transport: Some(transport),
            state: State::Connected,
            target: None,
            config,
            launcher: None,
        }
    }

    /// Installs `transport` as the connected transport.
    fn attach(&mut self, transport: T) {
        self.transport = Some(transport);
        self.state = State::Connected;
    }

    /// Closes the transport and forgets any transport switch.
    pub fn disconnect(&mut self) {
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
        self.state = State::Disconnected;
        self.target = None;
    }

    /// Lifecycle state.
    pub const fn state(&self) -> State {
        self.state
    }

    /// Returns `true` if requests may be issued.
    pub fn is_connected(&self) -> bool {
        self.state == State::Connected && self.transport.as_ref().is_some_and(|t| !t.is_closed())
    }

    /// Device the connection was switched to, if any.
    pub const fn target(&self) -> Option<&Selector> {
        self.target.as_ref()
    }

    /// Settings this session was built with.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// The underlying transport.
    pub const fn transport(&self) -> Option<&T> {
        self.transport.as_ref()
    }

    /// Wire form of `service`: prefixed while host-addressed, bare after a switch.
    pub fn qualify(&self, prefix: &Prefix, service: &str) -> String {
        if self.target.is_some() {
            service.to_owned()
        } else {
            prefix.qualify(service)
        }
    }

    /// Issues one request and reads its reply.
    ///
    /// `FAIL` surfaces as [`Error::RequestFailed`]. For [`Reply::Status`] the
    /// returned payload is empty.
    pub async fn request(
        &mut self,
        prefix: &Prefix,
        service: &str,
        reply: Reply,
    ) -> Result<Vec<u8>> {
        let wire = self.qualify(prefix, service);
        self.send_raw(&wire).await?;
        match reply {
            Reply::Status => Ok(Vec::new()),
            Reply::Payload => self.read_payload().await,
        }
    }

    /// Issues a request answered by a bare status.
    pub async fn command(&mut self, prefix: &Prefix, service: &str) -> Result<()> {
        self.request(prefix, service, Reply::Status).await.map(drop)
    }

    /// Issues a request answered by a text payload.
    pub async fn query(&mut self, prefix: &Prefix, service: &str) -> Result<String> {
        let payload = self.request(prefix, service, Reply::Payload).await?;
        Ok(String::from_utf8_lossy(&payload).into_owned())
    }

    /// Switches this connection to a device; later requests go out unprefixed.
    pub async fn switch_transport(&mut self, selector: Selector) -> Result<()> {
        if let Some(current) = &self.target {
            return Err(Error::RequestFailed {
                reason: format!("connection already switched to {current}"),
            });
        }
        self.send_raw(&selector.service()).await?;
        tracing::debug!(target = %selector, "switched transport");
        self.target = Some(selector);
        Ok(())
    }

    /// Opens a device service such as `sync:` or `shell:<cmd>`.
    ///
    /// After `OKAY` the stream belongs to the service; use the raw I/O methods.
    pub async fn open_service(&mut self, service: &str) -> Result<()> {
        if self.target.is_none() {
            return Err(Error::NotAddressed);
        }
        self.send_raw(service).await
    }

    /// Frames and writes `wire`, then reads the status word.
    async fn send_raw(&mut self, wire: &str) -> Result<()> {
        let frame = codec::encode(wire)?;
        tracing::debug!(service = wire, "request");
        self.write_all(&frame).await?;
        self.read_status().await
    }

    /// Reads an `OKAY`/`FAIL` status, decoding the reason of a `FAIL`.
    pub async fn read_status(&mut self) -> Result<()> {
        let bytes = self.read_exact(codec::WORD_LEN).await?;
        let parsed = word(&bytes, "status").and_then(|w| Status::parse(w).map_err(Error::from));
        let status = self.settle(parsed)?;
        match status {
            Status::Okay => Ok(()),
            Status::Fail => {
                let reason = self.read_payload().await?;
                Err(Error::RequestFailed {
                    reason: String::from_utf8_lossy(&reason).into_owned(),
                })
            }
        }
    }

    /// Reads a 4-hex-digit length and that many bytes.
    pub async fn read_payload(&mut self) -> Result<Vec<u8>> {
        let bytes = self.read_exact(codec::WORD_LEN).await?;
        let parsed =
            word(&bytes, "length").and_then(|w| codec::parse_length(w).map_err(Error::from));
        let len = self.settle(parsed)?;
        self.read_exact(len).await
    }

    /// Reads exactly `n` bytes from the transport.
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let r = self.live()?.read_exact(n).await;
        self.settle(r)
    }

    /// Writes all of `data` to the transport.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let r = self.live()?.write_all(data).await;
        self.settle(r)
    }

    /// Reads until the peer closes the stream, then disconnects.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let r = self.live()?.read_to_end().await;
        let out = self.settle(r)?;
        self.disconnect();
        Ok(out)
    }

    /// The transport, if connected.
    fn live(&mut self) -> Result<&mut T> {
        match (self.state, self.transport.as_mut()) {
            (State::Connected, Some(t)) => Ok(t),
            _ => Err(Error::BrokenConnection("session is not connected".to_owned())),
        }
    }

    /// Disconnects on fatal errors and passes the result through.
    fn settle<R>(&mut self, r: Result<R>) -> Result<R> {
        if let Err(e) = &r
            && e.is_fatal()
        {
            tracing::debug!(error = %e, "disconnecting after fatal error");
            self.disconnect();
        }
        r
    }
}

/// Converts a freshly read 4-byte buffer into a word.
fn word(bytes: &[u8], what: &'static str) -> Result<[u8; 4]> {
    <[u8; 4]>::try_from(bytes).map_err(|_| {
        Error::Protocol(dbridge_proto::Error::Truncated {
            what,
            need: codec::WORD_LEN,
            have: bytes.len(),
        })
    })
}
