//! Typed host verbs over short-lived sessions.
//!
//! The bridge server closes a host connection after answering a one-shot
//! request, so every method here connects a fresh [`Session`], issues one
//! verb and drops it. Device-scoped verbs take a [`Prefix`] choosing the
//! target: `host:` (any single device), `host-usb:`, `host-local:` or
//! `host-serial:<serial>:`.

use std::sync::Arc;

use dbridge_proto::{DeviceEntry, DeviceState, ForwardEntry, Prefix, Selector, forward_service};

use crate::config::Config;
use crate::launcher::{CommandLauncher, ServerLauncher};
use crate::session::Session;
use crate::sync::SyncClient;
use crate::{Error, Result};

/// Entry point for host verbs, device sessions and file sync.
#[derive(Debug, Clone)]
pub struct Client {
    /// Settings applied to every session.
    config: Config,
    /// Starts the server when it is not running.
    launcher: Arc<dyn ServerLauncher>,
}

impl Client {
    /// Client launching the server with `config.server_command`.
    pub fn new(config: Config) -> Result<Self> {
        let launcher = CommandLauncher::new(&config.server_command)?;
        Ok(Self::with_launcher(config, Arc::new(launcher)))
    }

    /// Client using a custom server launcher.
    pub fn with_launcher(config: Config, launcher: Arc<dyn ServerLauncher>) -> Self {
        Self { config, launcher }
    }

    /// Settings applied to every session.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Connects a new host-addressed session.
    pub async fn session(&self) -> Result<Session> {
        let mut session = Session::with_launcher(self.config.clone(), Arc::clone(&self.launcher));
        session.connect().await?;
        Ok(session)
    }

    /// Issues one payload-returning verb on a fresh session.
    async fn query(&self, prefix: &Prefix, service: &str) -> Result<String> {
        self.session().await?.query(prefix, service).await
    }

    /// Issues one status-only verb on a fresh session.
    async fn command(&self, prefix: &Prefix, service: &str) -> Result<()> {
        self.session().await?.command(prefix, service).await
    }

    /// Issues a forward verb; the server answers once for the target and once
    /// for the outcome.
    async fn forward_command(&self, prefix: &Prefix, service: &str) -> Result<()> {
        let mut session = self.session().await?;
        session.command(prefix, service).await?;
        session.read_status().await
    }

    /// Starts the server if nothing answers on its port.
    pub async fn start_server(&self) -> Result<()> {
        self.session().await.map(drop)
    }

    /// Server protocol version.
    pub async fn version(&self) -> Result<u32> {
        self.session().await?.server_version().await
    }

    /// Attached devices and their states.
    pub async fn devices(&self) -> Result<Vec<DeviceEntry>> {
        let listing = self.query(&Prefix::Host, "devices").await?;
        Ok(DeviceEntry::parse_list(&listing)?)
    }

    /// Attached devices with USB path, product, model and transport id.
    pub async fn devices_long(&self) -> Result<Vec<DeviceEntry>> {
        let listing = self.query(&Prefix::Host, "devices-l").await?;
        Ok(DeviceEntry::parse_list(&listing)?)
    }

    /// Asks the server to exit. Succeeds if no server is running.
    pub async fn kill(&self) -> Result<()> {
        let config = self.config.clone().connect_retries(0).check_version(false);
        let mut session = Session::with_launcher(config, Arc::clone(&self.launcher));
        match session.connect().await {
            Ok(()) => {}
            Err(Error::ServerUnreachable { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }
        match session.command(&Prefix::Host, "kill").await {
            Ok(()) | Err(Error::BrokenConnection(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Announces an emulator whose console listens on `port`.
    pub async fn emulator(&self, port: u16) -> Result<()> {
        self.command(&Prefix::Host, &format!("emulator:{port}")).await
    }

    /// Forwards host endpoint `local` to device endpoint `remote`, replacing
    /// an existing forward of `local`.
    pub async fn forward(&self, prefix: &Prefix, local: &str, remote: &str) -> Result<()> {
        self.forward_command(prefix, &forward_service(local, remote, false))
            .await
    }

    /// Like [`forward`](Self::forward) but fails if `local` is already forwarded.
    pub async fn forward_norebind(&self, prefix: &Prefix, local: &str, remote: &str) -> Result<()> {
        self.forward_command(prefix, &forward_service(local, remote, true))
            .await
    }

    /// Removes the forward of `local`.
    pub async fn kill_forward(&self, prefix: &Prefix, local: &str) -> Result<()> {
        self.forward_command(prefix, &format!("killforward:{local}"))
            .await
    }

    /// Removes every forward.
    pub async fn kill_forward_all(&self, prefix: &Prefix) -> Result<()> {
        self.forward_command(prefix, "killforward-all").await
    }

    /// Lists active forwards.
    pub async fn list_forward(&self, prefix: &Prefix) -> Result<Vec<ForwardEntry>> {
        let listing = self.query(prefix, "list-forward").await?;
        Ok(ForwardEntry::parse_list(&listing)?)
    }

    /// Serial number of the target device.
    pub async fn get_serialno(&self, prefix: &Prefix) -> Result<String> {
        self.query(prefix, "get-serialno").await
    }

    /// State of the target device.
    pub async fn get_state(&self, prefix: &Prefix) -> Result<DeviceState> {
        let state = self.query(prefix, "get-state").await?;
        let Ok(parsed) = state.parse::<DeviceState>();
        Ok(parsed)
    }

    /// Product name of the target device.
    pub async fn get_product(&self, prefix: &Prefix) -> Result<String> {
        self.query(prefix, "get-product").await
    }

    /// USB device path of the target device.
    pub async fn get_devpath(&self, prefix: &Prefix) -> Result<String> {
        self.query(prefix, "get-devpath").await
    }

    /// Attaches a device over TCP. Returns the server's message.
    pub async fn connect_device(&self, host: &str, port: u16) -> Result<String> {
        self.query(&Prefix::Host, &format!("connect:{host}:{port}"))
            .await
    }

    /// Detaches a TCP device, or all of them when `host` is `None`.
    pub async fn disconnect_device(&self, host: Option<&str>, port: u16) -> Result<String> {
        let service = match host {
            Some(h) => format!("disconnect:{h}:{port}"),
            None => "disconnect:".to_owned(),
        };
        self.query(&Prefix::Host, &service).await
    }

    /// Session switched to the device `selector` names.
    pub async fn device(&self, selector: Selector) -> Result<Session> {
        let label = selector.to_string();
        let mut session = self.session().await?;
        session
            .switch_transport(selector)
            .await
            .map_err(|e| e.with_device(label))?;
        Ok(session)
    }

    /// Sync service on the device `selector` names.
    pub async fn sync(&self, selector: Selector) -> Result<SyncClient> {
        let label = selector.to_string();
        let session = self.device(selector).await?;
        SyncClient::start(session)
            .await
            .map_err(|e| e.with_device(label))
    }

    /// Runs `command` in a non-interactive device shell and returns its output.
    pub async fn shell(&self, selector: Selector, command: &str) -> Result<Vec<u8>> {
        let label = selector.to_string();
        let mut session = self.device(selector).await?;
        session
            .open_service(&format!("shell:{command}"))
            .await
            .map_err(|e| e.with_device(label))?;
        session.read_to_end().await
    }
}
