//! Host service vocabulary and textual reply parsing.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Default TCP port of the bridge server.
pub const DEFAULT_PORT: u16 = 5037;

/// Oldest server version accepted without a restart (`0x1f`).
pub const MIN_SERVER_VERSION: u32 = 31;

/// Interface class, subclass and protocol of the bridge USB interface.
pub const BRIDGE_INTERFACE: (u8, u8, u8) = (0xff, 0x42, 0x01);

/// Host-side request prefix selecting which device a host verb targets.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Prefix {
    /// `host`: any single device, or the server itself.
    #[default]
    Host,
    /// `host-usb`: the single USB device.
    Usb,
    /// `host-local`: the single emulator.
    Local,
    /// `host-serial:<serial>`: a specific device.
    Serial(String),
}

impl Prefix {
    /// Joins the prefix and a service verb: `<prefix>:<service>`.
    pub fn qualify(&self, service: &str) -> String {
        format!("{self}:{service}")
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Usb => f.write_str("host-usb"),
            Self::Local => f.write_str("host-local"),
            Self::Serial(s) => write!(f, "host-serial:{s}"),
        }
    }
}

/// Target of a `host:transport*` switch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Selector {
    /// `transport-any`: the single device or emulator.
    #[default]
    Any,
    /// `transport-usb`: the single USB device.
    Usb,
    /// `transport-local`: the single emulator.
    Local,
    /// `transport:<serial>`: a specific device.
    Serial(String),
}

impl Selector {
    /// Returns the host service that performs this switch.
    pub fn service(&self) -> String {
        match self {
            Self::Any => "host:transport-any".to_owned(),
            Self::Usb => "host:transport-usb".to_owned(),
            Self::Local => "host:transport-local".to_owned(),
            Self::Serial(s) => format!("host:transport:{s}"),
        }
    }

    /// Returns the matching host prefix for device-scoped host verbs.
    pub fn prefix(&self) -> Prefix {
        match self {
            Self::Any => Prefix::Host,
            Self::Usb => Prefix::Usb,
            Self::Local => Prefix::Local,
            Self::Serial(s) => Prefix::Serial(s.clone()),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Usb => f.write_str("usb"),
            Self::Local => f.write_str("local"),
            Self::Serial(s) => f.write_str(s),
        }
    }
}

/// Connection state of an attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceState {
    /// Online and authorized.
    Device,
    /// Attached but not responding.
    Offline,
    /// Waiting for the user to accept the host key.
    Unauthorized,
    /// The host lacks permission to open the USB device.
    NoPermissions,
    /// Booted into recovery.
    Recovery,
    /// Booted into the bootloader.
    Bootloader,
    /// Any other state word reported by the server.
    Other(String),
}

impl FromStr for DeviceState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        Ok(match s {
            "device" => Self::Device,
            "offline" => Self::Offline,
            "unauthorized" => Self::Unauthorized,
            "recovery" => Self::Recovery,
            "bootloader" => Self::Bootloader,
            _ if s.starts_with("no permissions") || s == "no-permissions" => Self::NoPermissions,
            other => Self::Other(other.to_owned()),
        })
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Device => "device",
            Self::Offline => "offline",
            Self::Unauthorized => "unauthorized",
            Self::NoPermissions => "no-permissions",
            Self::Recovery => "recovery",
            Self::Bootloader => "bootloader",
            Self::Other(s) => s,
        })
    }
}

/// One line of a `host:devices` or `host:devices-l` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DeviceEntry {
    /// Device serial number.
    pub serial: String,
    /// Reported state.
    pub state: DeviceState,
    /// USB location (`usb:1-4.2`), long form only.
    pub usb: Option<String>,
    /// Product name, long form only.
    pub product: Option<String>,
    /// Model name, long form only.
    pub model: Option<String>,
    /// Device name, long form only.
    pub device: Option<String>,
    /// Server-assigned transport id, long form only.
    pub transport_id: Option<u64>,
}

/// Qualifier keys that end the state field of a long listing line.
const QUALIFIERS: &[&str] = &["usb:", "product:", "model:", "device:", "transport_id:"];

impl DeviceEntry {
    /// Parses one listing line in either short (`serial\tstate`) or long form.
    pub fn parse(line: &str) -> Result<Self> {
        let malformed = || Error::Malformed {
            what: "device line",
            line: line.to_owned(),
        };
        if let Some((serial, state)) = line.split_once('\t') {
            return Ok(Self::bare(serial.trim(), state.parse().unwrap_or(DeviceState::Offline)));
        }

        let mut words = line.split_whitespace();
        let serial = words.next().ok_or_else(malformed)?;
        let mut state_words = Vec::new();
        let mut entry = Self::bare(serial, DeviceState::Offline);
        for word in words {
            match QUALIFIERS.iter().find(|q| word.starts_with(*q)) {
                Some(key) => {
                    let value = word[key.len()..].to_owned();
                    match *key {
                        "usb:" => entry.usb = Some(value),
                        "product:" => entry.product = Some(value),
                        "model:" => entry.model = Some(value),
                        "device:" => entry.device = Some(value),
                        _ => entry.transport_id = Some(value.parse().map_err(|_| malformed())?),
                    }
                }
                None if entry.usb.is_none() && entry.product.is_none() => state_words.push(word),
                None => {}
            }
        }
        if state_words.is_empty() {
            return Err(malformed());
        }
        entry.state = state_words.join(" ").parse().unwrap_or(DeviceState::Offline);
        Ok(entry)
    }

    /// Parses a whole listing payload, skipping blank lines.
    pub fn parse_list(payload: &str) -> Result<Vec<Self>> {
        payload
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Entry with only serial and state.
    fn bare(serial: &str, state: DeviceState) -> Self {
        Self {
            serial: serial.to_owned(),
            state,
            usb: None,
            product: None,
            model: None,
            device: None,
            transport_id: None,
        }
    }
}

/// One line of a `list-forward` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ForwardEntry {
    /// Serial of the device owning the forward.
    pub serial: String,
    /// Host-side endpoint, e.g. `tcp:9000`.
    pub local: String,
    /// Device-side endpoint, e.g. `tcp:8000` or `jdwp:1234`.
    pub remote: String,
}

impl ForwardEntry {
    /// Parses a whole `list-forward` payload.
    pub fn parse_list(payload: &str) -> Result<Vec<Self>> {
        payload
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|line| {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(serial), Some(local), Some(remote)) => Ok(Self {
                        serial: serial.to_owned(),
                        local: local.to_owned(),
                        remote: remote.to_owned(),
                    }),
                    _ => Err(Error::Malformed {
                        what: "forward line",
                        line: line.to_owned(),
                    }),
                }
            })
            .collect()
    }
}

/// Builds a `forward` verb: `forward[:norebind]:<local>;<remote>`.
pub fn forward_service(local: &str, remote: &str, norebind: bool) -> String {
    if norebind {
        format!("forward:norebind:{local};{remote}")
    } else {
        format!("forward:{local};{remote}")
    }
}
