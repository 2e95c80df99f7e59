//! Loopback stand-in for the bridge server, and a counting launcher, for tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::launcher::ServerLauncher;
use crate::{Config, Result};

/// Answers one host request per connection, then closes it.
#[derive(Debug)]
pub(crate) struct FakeServer {
    /// Address the server listens on.
    pub(crate) address: String,
    /// Version reported by `host:version`.
    pub(crate) version: Arc<AtomicU32>,
    /// Accept loop.
    task: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    /// Starts a server reporting `version`.
    pub(crate) async fn start(version: u32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let version = Arc::new(AtomicU32::new(version));
        let reported = Arc::clone(&version);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&reported)));
            }
        });
        Self {
            address,
            version,
            task,
        }
    }

    /// Client config pointing at this server, with no start delay.
    pub(crate) fn config(&self) -> Config {
        let (host, port) = self.address.rsplit_once(':').unwrap();
        Config::default()
            .host(host)
            .port(port.parse().unwrap())
            .start_delay(std::time::Duration::ZERO)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Frames `body` as an `OKAY` reply with a length-prefixed payload.
fn okay(body: &str) -> String {
    format!("OKAY{:04x}{body}", body.len())
}

/// Handles one connection.
async fn serve(mut stream: TcpStream, version: Arc<AtomicU32>) {
    let mut len = [0u8; 4];
    // Probe connections close without sending anything.
    if stream.read_exact(&mut len).await.is_err() {
        return;
    }
    let n = usize::from_str_radix(std::str::from_utf8(&len).unwrap(), 16).unwrap();
    let mut service = vec![0u8; n];
    stream.read_exact(&mut service).await.unwrap();

    let reply = match std::str::from_utf8(&service).unwrap() {
        "host:version" => okay(&format!("{:04x}", version.load(Ordering::SeqCst))),
        "host:kill" => "OKAY".to_owned(),
        "host:devices" => okay("emulator-5554\tdevice\n0123456789ABCDEF\tunauthorized\n"),
        "host:devices-l" => okay(concat!(
            "emulator-5554          device product:sdk_phone model:Pixel ",
            "device:generic transport_id:1\n",
        )),
        "host-serial:emulator-5554:get-state" => okay("device"),
        "host:list-forward" => okay("emulator-5554 tcp:9000 tcp:8000\n"),
        "host:forward:tcp:9000;tcp:8000" | "host:killforward-all" => "OKAYOKAY".to_owned(),
        "host:connect:10.0.0.2:5555" => okay("connected to 10.0.0.2:5555"),
        "host:transport:emulator-5554" => {
            stream.write_all(b"OKAY").await.unwrap();
            return device(stream).await;
        }
        other => {
            let reason = format!("unknown host service '{other}'");
            format!("FAIL{:04x}{reason}", reason.len())
        }
    };
    stream.write_all(reply.as_bytes()).await.unwrap();
}

/// Handles the device-addressed part of a switched connection.
async fn device(mut stream: TcpStream) {
    let mut len = [0u8; 4];
    if stream.read_exact(&mut len).await.is_err() {
        return;
    }
    let n = usize::from_str_radix(std::str::from_utf8(&len).unwrap(), 16).unwrap();
    let mut service = vec![0u8; n];
    stream.read_exact(&mut service).await.unwrap();
    if service == b"shell:echo hi" {
        stream.write_all(b"OKAYhi\n").await.unwrap();
    } else {
        stream.write_all(b"FAIL0006closed").await.unwrap();
    }
}

/// Counts start requests and optionally upgrades a [`FakeServer`].
#[derive(Debug, Default)]
pub(crate) struct CountingLauncher {
    /// Calls to `start_server`.
    pub(crate) starts: AtomicU32,
    /// Version cell to set to `upgrade_to` on start.
    pub(crate) upgrade: Option<(Arc<AtomicU32>, u32)>,
}

impl CountingLauncher {
    /// Shares this launcher as the trait object sessions take.
    pub(crate) fn shared(self: &Arc<Self>) -> Arc<dyn ServerLauncher> {
        Arc::<Self>::clone(self)
    }
}

impl ServerLauncher for CountingLauncher {
    fn start_server(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some((cell, version)) = &self.upgrade {
            cell.store(*version, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Returns an address on which nothing listens.
pub(crate) async fn refused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    drop(listener);
    address
}
