//! Host-side client for the device debugging bridge.
//!
//! `dbridge` speaks the bridge server's length-prefixed request protocol over
//! TCP, switches connections to individual devices, transfers files with the
//! binary sync protocol, and talks to devices directly over USB bulk
//! endpoints on Linux.
//!
//! # Quick start
//!
//! ```no_run
//! use dbridge::{Client, Config, Selector};
//!
//! # async fn run() -> dbridge::Result<()> {
//! let client = Client::new(Config::from_env())?;
//! for device in client.devices().await? {
//!     println!("{}\t{}", device.serial, device.state);
//! }
//!
//! let mut sync = client.sync(Selector::Any).await?;
//! sync.push_file("build/app.bin", "/data/local/tmp/app.bin").await?;
//! sync.quit().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config;
mod error;
#[cfg(test)]
mod fake;
mod launcher;
mod registry;
mod session;
mod sync;
mod transport;

pub use client::Client;
pub use config::{ClaimPolicy, Config};
pub use dbridge_proto::sync::FileStat;
pub use dbridge_proto::{DeviceEntry, DeviceState, ForwardEntry, Prefix, Selector};
pub use error::{Error, Result};
pub use launcher::{CommandLauncher, ServerLauncher};
pub use registry::{
    And, AnyDevice, ByPortPath, BySerial, Candidate, DeviceDescriptor, DeviceMatcher,
    DeviceSource, InterfaceClass, InterfaceSetting, PortPath, Registry, SettingMatcher, SystemUsb,
    UsbDevice,
};
pub use session::{Reply, Session, State};
pub use sync::{DirEntry, SyncClient};
pub use transport::{Closer, TcpTransport, Transport};
#[cfg(target_os = "linux")]
pub use transport::UsbTransport;
