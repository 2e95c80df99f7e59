//! USB bulk transport bound to one claimed interface.

use std::fmt;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nusb::transfer::{Direction, EndpointType, RequestBuffer, TransferError};

use super::{Closer, Transport};
use crate::registry::{HANDLES, InterfaceSetting, PortPath, Releasable};
use crate::{Error, Result};

/// Open device state shared between a [`UsbTransport`] and the handle cache.
pub(crate) struct UsbLink {
    /// Physical location, the cache key.
    port_path: PortPath,
    /// Serial and path for logs.
    label: String,
    /// Claimed interface; `None` after release.
    interface: Mutex<Option<nusb::Interface>>,
    /// Bulk IN endpoint address.
    ep_in: u8,
    /// Bulk OUT endpoint address.
    ep_out: u8,
    /// Max packet size of the IN endpoint.
    max_packet: usize,
    /// Close signal for outstanding transfers.
    closer: Closer,
}

impl fmt::Debug for UsbLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbLink")
            .field("label", &self.label)
            .field("port_path", &self.port_path.to_string())
            .field("ep_in", &format_args!("{:#04x}", self.ep_in))
            .field("ep_out", &format_args!("{:#04x}", self.ep_out))
            .field("max_packet", &self.max_packet)
            .field("closed", &self.closer.is_closed())
            .finish_non_exhaustive()
    }
}

impl Releasable for UsbLink {
    fn release(&self) {
        let taken = self
            .interface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            tracing::debug!(device = %self.label, "released interface");
        }
        self.closer.close();
    }

    fn is_live(&self) -> bool {
        !self.closer.is_closed()
    }
}

/// Opens `info`, detaches any kernel driver and claims the interface of `setting`.
pub(crate) fn open_link(
    info: &nusb::DeviceInfo,
    setting: &InterfaceSetting,
    port_path: &PortPath,
    label: String,
) -> Result<Arc<UsbLink>> {
    let device = info.open().map_err(|e| claim_error(e, &label))?;

    let config = device
        .active_configuration()
        .map_err(|e| Error::Usb(format!("{label}: {e}")))?;
    let mut ep_in = None;
    let mut ep_out = None;
    let mut max_packet = 512;
    for alt in config.interface_alt_settings() {
        if alt.interface_number() != setting.number || alt.alternate_setting() != setting.alt {
            continue;
        }
        for ep in alt.endpoints() {
            if ep.transfer_type() != EndpointType::Bulk {
                continue;
            }
            match ep.direction() {
                Direction::In => {
                    ep_in = Some(ep.address());
                    max_packet = ep.max_packet_size();
                }
                Direction::Out => ep_out = Some(ep.address()),
            }
        }
    }
    let (Some(ep_in), Some(ep_out)) = (ep_in, ep_out) else {
        return Err(Error::Usb(format!(
            "{label}: interface {} has no bulk endpoint pair",
            setting.number
        )));
    };

    let interface = device
        .detach_and_claim_interface(setting.number)
        .map_err(|e| claim_error(e, &label))?;
    tracing::debug!(device = %label, iface = setting.number, ep_in, ep_out, "claimed interface");

    Ok(Arc::new(UsbLink {
        port_path: port_path.clone(),
        label,
        interface: Mutex::new(Some(interface)),
        ep_in,
        ep_out,
        max_packet: max_packet.max(1),
        closer: Closer::default(),
    }))
}

/// Maps an open/claim failure, treating `EBUSY` as [`Error::DeviceBusy`].
fn claim_error(e: io::Error, label: &str) -> Error {
    const EBUSY: i32 = 16;
    if e.kind() == io::ErrorKind::ResourceBusy || e.raw_os_error() == Some(EBUSY) {
        Error::DeviceBusy(label.to_owned())
    } else {
        Error::Usb(format!("{label}: {e}"))
    }
}

/// Maps a failed bulk transfer onto an I/O error kind the transport layer classifies.
fn transfer_error(e: TransferError) -> io::Error {
    let kind = match e {
        TransferError::Disconnected => io::ErrorKind::BrokenPipe,
        TransferError::Cancelled => io::ErrorKind::ConnectionAborted,
        _ => io::ErrorKind::Other,
    };
    io::Error::new(kind, e)
}

/// Transport over the bulk endpoints of a claimed bridge interface.
///
/// Closing (or opening another transport on the same port path) releases the
/// interface; further I/O fails with [`Error::BrokenConnection`].
#[derive(Debug)]
pub struct UsbTransport {
    /// Shared open state; the cache holds only a weak reference.
    link: Arc<UsbLink>,
    /// Per-call timeout.
    timeout: Duration,
    /// Bytes received beyond what the last caller asked for.
    pending: Vec<u8>,
}

impl UsbTransport {
    /// Wraps a freshly claimed link.
    pub(crate) const fn new(link: Arc<UsbLink>, timeout: Duration) -> Self {
        Self {
            link,
            timeout,
            pending: Vec::new(),
        }
    }

    /// Physical port path of the device.
    pub fn port_path(&self) -> &PortPath {
        &self.link.port_path
    }

    /// Max packet size of the bulk IN endpoint.
    pub fn max_packet(&self) -> usize {
        self.link.max_packet
    }

    /// Error for I/O on a released interface.
    fn released() -> io::Error {
        io::Error::new(
            io::ErrorKind::NotConnected,
            "handle closed, probably because another was opened on the same port",
        )
    }
}

impl Transport for UsbTransport {
    fn recv(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            if !self.pending.is_empty() {
                let n = buf.len().min(self.pending.len());
                buf[..n].copy_from_slice(&self.pending[..n]);
                self.pending.drain(..n);
                return Ok(n);
            }
            let mp = self.link.max_packet;
            let want = buf.len().div_ceil(mp).max(1) * mp;
            loop {
                let transfer = {
                    let guard = self
                        .link
                        .interface
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    match guard.as_ref() {
                        Some(iface) => iface.bulk_in(self.link.ep_in, RequestBuffer::new(want)),
                        None => return Err(Self::released()),
                    }
                };
                let data = transfer.await.into_result().map_err(transfer_error)?;
                if data.is_empty() {
                    continue;
                }
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                self.pending.extend_from_slice(&data[n..]);
                return Ok(n);
            }
        }
    }

    fn send(&mut self, data: &[u8]) -> impl Future<Output = io::Result<usize>> + Send {
        async move {
            let transfer = {
                let guard = self
                    .link
                    .interface
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match guard.as_ref() {
                    Some(iface) => iface.bulk_out(self.link.ep_out, data.to_vec()),
                    None => return Err(Self::released()),
                }
            };
            let done = transfer.await.into_result().map_err(transfer_error)?;
            Ok(done.actual_length())
        }
    }

    fn close(&mut self) {
        HANDLES.forget(&self.link.port_path, &self.link);
        self.link.release();
        self.pending.clear();
    }

    fn closer(&self) -> &Closer {
        &self.link.closer
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn describe(&self) -> String {
        self.link.label.clone()
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if self.link.is_live() {
            self.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link() -> UsbLink {
        UsbLink {
            port_path: PortPath::new([1, 4, 2]),
            label: "abc@1-4.2".to_owned(),
            interface: Mutex::new(None),
            ep_in: 0x81,
            ep_out: 0x01,
            max_packet: 512,
            closer: Closer::default(),
        }
    }

    #[test]
    fn debug_skips_interface_handle() {
        let text = format!("{:?}", link());
        assert!(text.contains("abc@1-4.2"), "{text}");
        assert!(text.contains("\"1-4.2\""), "{text}");
        assert!(text.contains("0x81"), "{text}");
        assert!(!text.contains("interface"), "{text}");
    }

    #[test]
    fn release_closes_and_is_idempotent() {
        let l = link();
        assert!(l.is_live());
        l.release();
        l.release();
        assert!(!l.is_live());
    }
}
