//! Subcommand implementations.

use std::fmt::Display;

use anyhow::{Context, Result, bail};
use dbridge::{Client, Config, DeviceEntry, Prefix, Registry, Selector};
use tokio::io::AsyncWriteExt;

use crate::OutputFormat;

/// Port used by `connect`/`disconnect` when none is given.
const DEFAULT_DEVICE_PORT: u16 = 5555;

/// Arguments for `dbridge forward`.
#[derive(clap::Args)]
pub struct ForwardArgs {
    /// List active forwards.
    #[arg(long, conflicts_with_all = ["remove", "remove_all", "local"])]
    list: bool,

    /// Remove the forward of this local endpoint.
    #[arg(long, value_name = "LOCAL", conflicts_with_all = ["remove_all", "local"])]
    remove: Option<String>,

    /// Remove every forward.
    #[arg(long, conflicts_with = "local")]
    remove_all: bool,

    /// Fail if the local endpoint is already forwarded.
    #[arg(long)]
    no_rebind: bool,

    /// Host endpoint, e.g. `tcp:9000`.
    #[arg(required_unless_present_any = ["list", "remove", "remove_all"], requires = "remote")]
    local: Option<String>,

    /// Device endpoint, e.g. `tcp:8000`.
    remote: Option<String>,
}

pub async fn version(client: &Client) -> Result<()> {
    let v = client.version().await?;
    println!("Bridge server version {v} ({v:#06x})");
    Ok(())
}

pub async fn devices(client: &Client, long: bool, format: OutputFormat) -> Result<()> {
    let list = if long {
        client.devices_long().await?
    } else {
        client.devices().await?
    };

    if matches!(format, OutputFormat::Json) {
        let arr: Vec<_> = list.iter().map(device_json).collect();
        println!("{}", serde_json::to_string_pretty(&arr)?);
        return Ok(());
    }

    println!("List of devices attached");
    for d in &list {
        if long {
            println!("{:<22} {}", d.serial, long_line(d));
        } else {
            println!("{}\t{}", d.serial, d.state);
        }
    }
    Ok(())
}

fn device_json(d: &DeviceEntry) -> serde_json::Value {
    serde_json::json!({
        "serial": d.serial,
        "state": d.state.to_string(),
        "usb": d.usb,
        "product": d.product,
        "model": d.model,
        "device": d.device,
        "transport_id": d.transport_id,
    })
}

/// State followed by the qualifiers present on a long listing entry.
fn long_line(d: &DeviceEntry) -> String {
    let mut line = d.state.to_string();
    let quals = [
        ("usb", d.usb.clone()),
        ("product", d.product.clone()),
        ("model", d.model.clone()),
        ("device", d.device.clone()),
        ("transport_id", d.transport_id.map(|t| t.to_string())),
    ];
    for (key, value) in quals {
        if let Some(v) = value {
            line.push_str(&format!(" {key}:{v}"));
        }
    }
    line
}

pub async fn kill_server(client: &Client) -> Result<()> {
    client.kill().await?;
    Ok(())
}

pub async fn start_server(client: &Client) -> Result<()> {
    client.start_server().await?;
    Ok(())
}

pub async fn connect(client: &Client, target: &str) -> Result<()> {
    let (host, port) = parse_endpoint(target)?;
    print(client.connect_device(&host, port).await?)
}

pub async fn disconnect(client: &Client, target: Option<&str>) -> Result<()> {
    let msg = match target {
        Some(t) => {
            let (host, port) = parse_endpoint(t)?;
            client.disconnect_device(Some(&host), port).await?
        }
        None => client.disconnect_device(None, DEFAULT_DEVICE_PORT).await?,
    };
    print(msg)
}

pub async fn forward(client: &Client, prefix: &Prefix, args: ForwardArgs) -> Result<()> {
    if args.list {
        for f in client.list_forward(prefix).await? {
            println!("{} {} {}", f.serial, f.local, f.remote);
        }
        return Ok(());
    }
    if let Some(local) = args.remove {
        return Ok(client.kill_forward(prefix, &local).await?);
    }
    if args.remove_all {
        return Ok(client.kill_forward_all(prefix).await?);
    }
    let (Some(local), Some(remote)) = (args.local, args.remote) else {
        bail!("forward needs LOCAL and REMOTE");
    };
    if args.no_rebind {
        client.forward_norebind(prefix, &local, &remote).await?;
    } else {
        client.forward(prefix, &local, &remote).await?;
    }
    Ok(())
}

pub async fn push(client: &Client, selector: Selector, local: &str, remote: &str) -> Result<()> {
    let mut sync = client.sync(selector).await?;
    let bytes = sync.push_file(local, remote).await?;
    sync.quit().await?;
    println!("{local}: {bytes} bytes pushed");
    Ok(())
}

pub async fn pull(
    client: &Client,
    selector: Selector,
    remote: &str,
    local: Option<&str>,
) -> Result<()> {
    let local = local.unwrap_or_else(|| default_local(remote));
    let mut sync = client.sync(selector).await?;
    let bytes = sync.pull_file(remote, local).await?;
    sync.quit().await?;
    println!("{remote}: {bytes} bytes pulled");
    Ok(())
}

pub async fn ls(client: &Client, selector: Selector, remote: &str) -> Result<()> {
    let mut sync = client.sync(selector).await?;
    let entries = sync
        .list(remote)
        .await
        .with_context(|| format!("listing {remote}"))?;
    sync.quit().await?;
    for e in entries {
        println!(
            "{:08o} {:>10} {:>10} {}",
            e.stat.mode, e.stat.size, e.stat.mtime, e.name
        );
    }
    Ok(())
}

pub async fn stat(client: &Client, selector: Selector, remote: &str) -> Result<()> {
    let mut sync = client.sync(selector).await?;
    let st = sync.stat(remote).await?;
    sync.quit().await?;
    if !st.exists() {
        bail!("{remote}: remote object does not exist");
    }
    println!("mode:  {:o}", st.mode);
    println!("size:  {}", st.size);
    println!("mtime: {}", st.mtime);
    Ok(())
}

pub async fn shell(client: &Client, selector: Selector, command: &str) -> Result<()> {
    let out = client.shell(selector, command).await?;
    let mut stdout = tokio::io::stdout();
    stdout.write_all(&out).await?;
    stdout.flush().await?;
    Ok(())
}

pub async fn usb(config: Config) -> Result<()> {
    let registry = Registry::new(config);
    let devices = registry.descriptors().context("enumerating USB devices")?;
    if devices.is_empty() {
        println!("No USB devices with a bridge interface.");
        return Ok(());
    }
    for d in &devices {
        let path = d.port_path.as_ref().map(ToString::to_string).unwrap_or_default();
        println!("{:<22} {:<10} {}", d.serial, path, d.state);
    }
    Ok(())
}

pub fn print(value: impl Display) -> Result<()> {
    println!("{value}");
    Ok(())
}

/// Splits `host[:port]`.
fn parse_endpoint(s: &str) -> Result<(String, u16)> {
    match s.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().with_context(|| format!("invalid port in {s:?}"))?;
            Ok((host.to_owned(), port))
        }
        Some(_) => bail!("missing host in {s:?}"),
        None => Ok((s.to_owned(), DEFAULT_DEVICE_PORT)),
    }
}

/// Last path component of a remote path.
fn default_local(remote: &str) -> &str {
    remote
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(".")
}
