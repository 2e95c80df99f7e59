//! Error types for bridge client operations.

use std::time::Duration;

/// Alias for `Result<T, dbridge::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by transports, sessions, the registry and the sync service.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed status, length or sync bytes. Fatal to the session.
    #[error("protocol fault: {0}")]
    Protocol(dbridge_proto::Error),

    /// The server or device answered `FAIL`. The session stays usable.
    #[error("request failed: {reason}")]
    RequestFailed {
        /// Reason text sent with the `FAIL` status.
        reason: String,
    },

    /// The transport was closed, or the peer hung up, mid-I/O.
    #[error("broken connection: {0}")]
    BrokenConnection(String),

    /// No data within the configured window. The session stays usable.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The service string does not fit the length prefix.
    #[error("service is {0} bytes, limit is 65535")]
    ServiceTooLong(usize),

    /// No attached device satisfied the matcher.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A port path string is not `bus-port[.port...]`.
    #[error("invalid port path {0:?}")]
    InvalidPortPath(String),

    /// The device or port is held by another live handle.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// Starting the bridge server did not make it reachable.
    #[error("bridge server at {address} unreachable after {attempts} start attempts")]
    ServerUnreachable {
        /// Server address.
        address: String,
        /// Number of start-server attempts made.
        attempts: u32,
    },

    /// The server is still older than the minimum after one restart.
    #[error("bridge server version {found} is older than required {required}")]
    ServerOutdated {
        /// Version reported by the server.
        found: u32,
        /// Minimum accepted version.
        required: u32,
    },

    /// The external start-server collaborator failed.
    #[error("failed to start bridge server: {0}")]
    StartFailed(String),

    /// A device service was issued on a session not switched to a device.
    #[error("session is not addressed at a device")]
    NotAddressed,

    /// USB transfer or claim failure that is not a timeout or disconnect.
    #[error("usb: {0}")]
    Usb(String),

    /// Failure while transferring a specific file.
    #[error("{path}: {source}")]
    File {
        /// Local or remote path involved.
        path: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Failure while operating on a specific device.
    #[error("{device}: {source}")]
    Device {
        /// Serial or port path of the device.
        device: String,
        /// Underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Configuration file could not be parsed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps `self` with the file it concerns.
    pub fn with_file(self, path: impl Into<String>) -> Self {
        Self::File {
            path: path.into(),
            source: Box::new(self),
        }
    }

    /// Wraps `self` with the device it concerns.
    pub fn with_device(self, device: impl Into<String>) -> Self {
        Self::Device {
            device: device.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost error beneath any context wrappers.
    pub fn root(&self) -> &Self {
        match self {
            Self::File { source, .. } | Self::Device { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns `true` if the session must disconnect after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Self::Protocol(_) | Self::BrokenConnection(_) | Self::Io(_)
        )
    }
}

impl From<dbridge_proto::Error> for Error {
    fn from(e: dbridge_proto::Error) -> Self {
        match e {
            dbridge_proto::Error::ServiceTooLong(n) => Self::ServiceTooLong(n),
            other => Self::Protocol(other),
        }
    }
}
