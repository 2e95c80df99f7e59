//! Wire format of the device debugging bridge.
//!
//! Host requests are ASCII services framed with a 4-hex-digit length prefix
//! and answered with an `OKAY`/`FAIL` status word. Once a device-addressed
//! connection enters `sync:` mode, file transfers switch to the binary entries
//! in [`sync`]. Nothing here performs I/O.

pub mod codec;
mod error;
mod message;
pub mod sync;

pub use codec::{Status, decode, encode};
pub use error::{Error, Result};
pub use message::{
    BRIDGE_INTERFACE, DEFAULT_PORT, DeviceEntry, DeviceState, ForwardEntry, MIN_SERVER_VERSION,
    Prefix, Selector, forward_service,
};
