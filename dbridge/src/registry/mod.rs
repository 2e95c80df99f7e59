//! Device discovery: enumerate attached USB devices, match them and open one.
//!
//! Enumeration is a query-time snapshot. Each candidate pairs a device with the
//! interface setting the [`SettingMatcher`] accepted; a [`DeviceMatcher`] then
//! narrows the candidates by serial, port path or any predicate.

mod cache;

use std::fmt;
use std::str::FromStr;

use dbridge_proto::{BRIDGE_INTERFACE, DeviceEntry, DeviceState};

use crate::config::Config;
use crate::{Error, Result};

#[cfg(target_os = "linux")]
pub(crate) use cache::{HandleCache, Releasable};

#[cfg(target_os = "linux")]
use crate::transport::{Transport, UsbLink, UsbTransport, open_link};

/// Handles currently open on each USB port, process-wide.
#[cfg(target_os = "linux")]
pub(crate) static HANDLES: HandleCache<UsbLink> = HandleCache::new();

/// Physical USB location: bus number followed by the port chain.
///
/// Displays and parses in sysfs form, `1-4.2` for port 2 of the hub on port 4
/// of bus 1.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortPath(Vec<u8>);

impl PortPath {
    /// Builds a path from its bus and port numbers.
    pub fn new(parts: impl Into<Vec<u8>>) -> Self {
        Self(parts.into())
    }

    /// Bus and port numbers in order.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for PortPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some((bus, ports)) = self.0.split_first() else {
            return Ok(());
        };
        write!(f, "{bus}")?;
        for (i, port) in ports.iter().enumerate() {
            let sep = if i == 0 { '-' } else { '.' };
            write!(f, "{sep}{port}")?;
        }
        Ok(())
    }
}

impl FromStr for PortPath {
    type Err = Error;

    /// Accepts `1-4.2` as well as `1,4,2`, `1/4/2` and `1:4:2`.
    fn from_str(s: &str) -> Result<Self> {
        let parts = s
            .split(['-', '.', ',', '/', ':'])
            .map(|p| p.trim().parse::<u8>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| Error::InvalidPortPath(s.to_owned()))?;
        if parts.is_empty() {
            return Err(Error::InvalidPortPath(s.to_owned()));
        }
        Ok(Self(parts))
    }
}

/// USB interface class, subclass and protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceClass {
    /// Interface class code.
    pub class: u8,
    /// Interface subclass code.
    pub subclass: u8,
    /// Interface protocol code.
    pub protocol: u8,
}

impl InterfaceClass {
    /// The bridge's vendor-specific interface.
    pub const BRIDGE: Self = Self::new(BRIDGE_INTERFACE.0, BRIDGE_INTERFACE.1, BRIDGE_INTERFACE.2);

    /// Creates a class triple.
    pub const fn new(class: u8, subclass: u8, protocol: u8) -> Self {
        Self {
            class,
            subclass,
            protocol,
        }
    }
}

/// One interface alternate setting exposed by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceSetting {
    /// Interface number.
    pub number: u8,
    /// Alternate setting number.
    pub alt: u8,
    /// Class triple of the setting.
    pub class: InterfaceClass,
}

/// Snapshot of one attached device.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct DeviceDescriptor {
    /// Serial number; empty if the device reports none.
    pub serial: String,
    /// USB location, `None` for network-attached devices.
    pub port_path: Option<PortPath>,
    /// Connection state.
    pub state: DeviceState,
}

impl DeviceDescriptor {
    /// Name for logs and error context: the serial, else the port path.
    pub fn label(&self) -> String {
        match (&self.port_path, self.serial.is_empty()) {
            (Some(path), true) => path.to_string(),
            (Some(path), false) => format!("{}@{path}", self.serial),
            (None, _) => self.serial.clone(),
        }
    }
}

impl From<&DeviceEntry> for DeviceDescriptor {
    fn from(entry: &DeviceEntry) -> Self {
        Self {
            serial: entry.serial.clone(),
            port_path: entry.usb.as_deref().and_then(|u| u.parse().ok()),
            state: entry.state.clone(),
        }
    }
}

/// An attached USB device as reported by a [`DeviceSource`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct UsbDevice {
    /// Serial, port path and state.
    pub descriptor: DeviceDescriptor,
    /// Vendor id.
    pub vendor_id: u16,
    /// Product id.
    pub product_id: u16,
    /// Interface settings of the active configuration.
    pub settings: Vec<InterfaceSetting>,
    /// OS handle used to open the device.
    #[cfg(target_os = "linux")]
    info: Option<nusb::DeviceInfo>,
}

impl UsbDevice {
    /// Describes a device that cannot be opened, for tests and custom sources.
    pub fn new(
        serial: impl Into<String>,
        port_path: PortPath,
        settings: Vec<InterfaceSetting>,
    ) -> Self {
        Self {
            descriptor: DeviceDescriptor {
                serial: serial.into(),
                port_path: Some(port_path),
                state: DeviceState::Device,
            },
            vendor_id: 0,
            product_id: 0,
            settings,
            #[cfg(target_os = "linux")]
            info: None,
        }
    }

    /// Builds a device from an OS enumeration entry; `None` if it has no
    /// parseable sysfs port path (root hubs).
    #[cfg(target_os = "linux")]
    fn from_info(info: nusb::DeviceInfo) -> Option<Self> {
        let port_path = info.sysfs_path().file_name()?.to_str()?.parse().ok()?;
        let settings = info
            .interfaces()
            .map(|i| InterfaceSetting {
                number: i.interface_number(),
                alt: 0,
                class: InterfaceClass::new(i.class(), i.subclass(), i.protocol()),
            })
            .collect();
        Some(Self {
            descriptor: DeviceDescriptor {
                serial: info.serial_number().unwrap_or_default().to_owned(),
                port_path: Some(port_path),
                state: DeviceState::Device,
            },
            vendor_id: info.vendor_id(),
            product_id: info.product_id(),
            settings,
            info: Some(info),
        })
    }
}

/// Decides whether an interface setting speaks the bridge protocol.
pub trait SettingMatcher {
    /// Returns `true` to accept `setting`.
    fn matches(&self, setting: &InterfaceSetting) -> bool;
}

impl SettingMatcher for InterfaceClass {
    fn matches(&self, setting: &InterfaceSetting) -> bool {
        setting.class == *self
    }
}

impl<F: Fn(&InterfaceSetting) -> bool> SettingMatcher for F {
    fn matches(&self, setting: &InterfaceSetting) -> bool {
        self(setting)
    }
}

/// Decides whether a device is the one wanted.
pub trait DeviceMatcher {
    /// Returns `true` to accept `device`.
    fn matches(&self, device: &DeviceDescriptor) -> bool;

    /// Accepts only devices both matchers accept.
    fn and<M: DeviceMatcher>(self, other: M) -> And<Self, M>
    where
        Self: Sized,
    {
        And(self, other)
    }
}

impl<F: Fn(&DeviceDescriptor) -> bool> DeviceMatcher for F {
    fn matches(&self, device: &DeviceDescriptor) -> bool {
        self(device)
    }
}

/// Accepts every device.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyDevice;

impl DeviceMatcher for AnyDevice {
    fn matches(&self, _: &DeviceDescriptor) -> bool {
        true
    }
}

/// Accepts the device with this serial.
#[derive(Debug, Clone)]
pub struct BySerial(pub String);

impl DeviceMatcher for BySerial {
    fn matches(&self, device: &DeviceDescriptor) -> bool {
        device.serial == self.0
    }
}

/// Accepts the device at this port path.
#[derive(Debug, Clone)]
pub struct ByPortPath(pub PortPath);

impl DeviceMatcher for ByPortPath {
    fn matches(&self, device: &DeviceDescriptor) -> bool {
        device.port_path.as_ref() == Some(&self.0)
    }
}

/// Conjunction of two matchers.
#[derive(Debug, Clone)]
pub struct And<A, B>(A, B);

impl<A: DeviceMatcher, B: DeviceMatcher> DeviceMatcher for And<A, B> {
    fn matches(&self, device: &DeviceDescriptor) -> bool {
        self.0.matches(device) && self.1.matches(device)
    }
}

/// A device together with the interface setting that matched.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Candidate {
    /// The device.
    pub device: UsbDevice,
    /// First setting accepted by the setting matcher.
    pub setting: InterfaceSetting,
}

/// Where the registry gets its device list from.
pub trait DeviceSource {
    /// Lists attached devices in enumeration order.
    fn list(&self) -> Result<Vec<UsbDevice>>;
}

/// The host's USB buses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemUsb;

impl DeviceSource for SystemUsb {
    #[cfg(target_os = "linux")]
    fn list(&self) -> Result<Vec<UsbDevice>> {
        let devices = nusb::list_devices().map_err(|e| Error::Usb(e.to_string()))?;
        Ok(devices.filter_map(UsbDevice::from_info).collect())
    }

    #[cfg(not(target_os = "linux"))]
    fn list(&self) -> Result<Vec<UsbDevice>> {
        Err(Error::Usb("USB enumeration is only supported on Linux".to_owned()))
    }
}

impl DeviceSource for Vec<UsbDevice> {
    fn list(&self) -> Result<Vec<UsbDevice>> {
        Ok(self.clone())
    }
}

/// Enumerates, matches and opens USB devices.
#[derive(Debug)]
pub struct Registry<S = SystemUsb> {
    /// Device list provider.
    source: S,
    /// Timeouts and claim policy for opened transports.
    config: Config,
}

impl Registry {
    /// Registry over the host's USB buses.
    pub const fn new(config: Config) -> Self {
        Self::with_source(SystemUsb, config)
    }
}

impl<S: DeviceSource> Registry<S> {
    /// Registry over a custom device source.
    pub const fn with_source(source: S, config: Config) -> Self {
        Self { source, config }
    }

    /// Lazily yields every device exposing a setting `setting` accepts.
    pub fn enumerate<'a, M: SettingMatcher>(
        &self,
        setting: &'a M,
    ) -> Result<impl Iterator<Item = Candidate> + 'a> {
        let devices = self.source.list()?;
        Ok(devices.into_iter().filter_map(move |device| {
            let chosen = device.settings.iter().copied().find(|s| setting.matches(s))?;
            Some(Candidate {
                device,
                setting: chosen,
            })
        }))
    }

    /// Returns the first enumerated candidate `device` accepts.
    pub fn find_first(
        &self,
        setting: &impl SettingMatcher,
        device: &impl DeviceMatcher,
    ) -> Result<Candidate> {
        self.enumerate(setting)?
            .find(|c| device.matches(&c.device.descriptor))
            .ok_or_else(|| Error::DeviceNotFound("no attached device matched".to_owned()))
    }

    /// Finds a bridge interface, optionally restricted by port path and serial.
    pub fn find(&self, port_path: Option<&PortPath>, serial: Option<&str>) -> Result<Candidate> {
        let wanted = |d: &DeviceDescriptor| {
            port_path.is_none_or(|p| d.port_path.as_ref() == Some(p))
                && serial.is_none_or(|s| d.serial == s)
        };
        self.find_first(&InterfaceClass::BRIDGE, &wanted)
            .map_err(|e| match (port_path, serial) {
                (Some(p), _) => e.with_device(p.to_string()),
                (None, Some(s)) => e.with_device(s),
                (None, None) => e,
            })
    }

    /// Snapshots every device exposing a bridge interface.
    pub fn descriptors(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self
            .enumerate(&InterfaceClass::BRIDGE)?
            .map(|c| c.device.descriptor)
            .collect())
    }

    /// Returns `true` if a live handle is open on `port_path` in this process.
    #[cfg(target_os = "linux")]
    pub fn is_open(&self, port_path: &PortPath) -> bool {
        HANDLES.get(port_path).is_some()
    }

    /// Opens the candidate's interface and drains stale bytes from it.
    ///
    /// A live handle on the same port is closed first, or reported as
    /// [`Error::DeviceBusy`], depending on [`Config::claim`].
    #[cfg(target_os = "linux")]
    pub async fn open_and_prepare(&self, candidate: &Candidate) -> Result<UsbTransport> {
        let descriptor = &candidate.device.descriptor;
        let label = descriptor.label();
        let (Some(info), Some(path)) = (&candidate.device.info, &descriptor.port_path) else {
            return Err(Error::DeviceNotFound(format!("{label} cannot be opened")));
        };

        let link = HANDLES
            .claim(path, self.config.claim, || {
                open_link(info, &candidate.setting, path, label.clone())
            })
            .map_err(|e| e.with_device(label.clone()))?;
        let mut transport = UsbTransport::new(link, self.config.usb_timeout);
        let packet = transport.max_packet();
        let dropped = transport
            .flush_stale(packet, self.config.flush_timeout)
            .await
            .map_err(|e| e.with_device(label.clone()))?;
        if dropped > 0 {
            tracing::debug!(device = %label, dropped, "flushed stale bytes");
        }
        tracing::debug!(device = %label, "opened");
        Ok(transport)
    }

    /// Finds and opens the first device `device` accepts.
    #[cfg(target_os = "linux")]
    pub async fn open(
        &self,
        setting: &impl SettingMatcher,
        device: &impl DeviceMatcher,
    ) -> Result<UsbTransport> {
        let candidate = self.find_first(setting, device)?;
        self.open_and_prepare(&candidate).await
    }
}
