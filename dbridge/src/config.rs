//! Client configuration: server address, launch command, timeouts.

use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use dbridge_proto::{DEFAULT_PORT, MIN_SERVER_VERSION};
use serde::{Deserialize, Serialize};

use crate::Result;

/// What to do when opening a USB port that already has a live handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ClaimPolicy {
    /// Close the stale handle and open anew (last open wins).
    #[default]
    Replace,
    /// Refuse with [`Error::DeviceBusy`](crate::Error::DeviceBusy).
    Exclusive,
}

/// Settings shared by sessions, the client façade and the device registry.
///
/// Durations are (de)serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct Config {
    /// Bridge server host.
    pub host: String,
    /// Bridge server TCP port.
    pub port: u16,
    /// Timeout of each TCP read or write call.
    #[serde(with = "millis")]
    pub io_timeout: Duration,
    /// Timeout of each TCP connect attempt.
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// How many times to launch the server when the port refuses connections.
    pub connect_retries: u32,
    /// Settle time after launching the server.
    #[serde(with = "millis")]
    pub start_delay: Duration,
    /// Longest wait for a killed server to release its port.
    #[serde(with = "millis")]
    pub kill_wait: Duration,
    /// Query `host:version` on connect and restart outdated servers.
    pub check_version: bool,
    /// Minimum accepted server version.
    pub min_server_version: u32,
    /// Program and arguments that start the server.
    pub server_command: Vec<String>,
    /// Timeout of each USB read or write call.
    #[serde(with = "millis")]
    pub usb_timeout: Duration,
    /// Per-read timeout while draining stale bytes after opening a device.
    #[serde(with = "millis")]
    pub flush_timeout: Duration,
    /// Behaviour when a USB port already has a live handle.
    pub claim: ClaimPolicy,
    /// Default device serial.
    pub serial: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: DEFAULT_PORT,
            io_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            connect_retries: 3,
            start_delay: Duration::from_secs(3),
            kill_wait: Duration::from_secs(2),
            check_version: true,
            min_server_version: MIN_SERVER_VERSION,
            server_command: vec!["adb".to_owned(), "start-server".to_owned()],
            usb_timeout: Duration::from_secs(1),
            flush_timeout: Duration::from_millis(10),
            claim: ClaimPolicy::Replace,
            serial: None,
        }
    }
}

impl Config {
    /// Loads a JSON config file; missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Default config with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Applies `ADB_SERVER_HOST`, `ANDROID_ADB_SERVER_PORT` and `ANDROID_SERIAL`.
    pub fn with_env(mut self) -> Self {
        if let Ok(host) = env::var("ADB_SERVER_HOST")
            && !host.is_empty()
        {
            self.host = host;
        }
        if let Some(port) = env::var("ANDROID_ADB_SERVER_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.port = port;
        }
        if let Ok(serial) = env::var("ANDROID_SERIAL")
            && !serial.is_empty()
        {
            self.serial = Some(serial);
        }
        self
    }

    /// Sets the server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the server port.
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the TCP read/write timeout.
    pub const fn io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the start-server retry budget.
    pub const fn connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    /// Sets the settle time after launching the server.
    pub const fn start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Enables or disables the version check on connect.
    pub const fn check_version(mut self, enable: bool) -> Self {
        self.check_version = enable;
        self
    }

    /// Sets the command used to launch the server.
    pub fn server_command(mut self, program: impl Into<String>, args: &[&str]) -> Self {
        self.server_command = std::iter::once(program.into())
            .chain(args.iter().map(|s| (*s).to_owned()))
            .collect();
        self
    }

    /// Sets the open-handle policy for USB ports.
    pub const fn claim(mut self, policy: ClaimPolicy) -> Self {
        self.claim = policy;
        self
    }

    /// Sets the default device serial.
    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Returns `host:port`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Serde adapter storing a [`Duration`] as milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes as integer milliseconds.
    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    /// Deserializes from integer milliseconds.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
