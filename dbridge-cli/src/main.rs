//! CLI for the device debugging bridge client.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod cmd;

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use dbridge::{Config, Prefix, Selector};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dbridge", version, about = "Device debugging bridge client")]
struct Cli {
    /// Target the device with this serial (overrides ANDROID_SERIAL).
    #[arg(short = 's', long, global = true, conflicts_with_all = ["usb", "emulator"])]
    serial: Option<String>,

    /// Target the only USB device.
    #[arg(short = 'd', long, global = true, conflicts_with = "emulator")]
    usb: bool,

    /// Target the only emulator.
    #[arg(short = 'e', long, global = true)]
    emulator: bool,

    /// Bridge server host (overrides ADB_SERVER_HOST).
    #[arg(short = 'H', long, global = true)]
    host: Option<String>,

    /// Bridge server port (overrides ANDROID_ADB_SERVER_PORT).
    #[arg(short = 'P', long, global = true)]
    port: Option<u16>,

    /// JSON config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the server protocol version.
    Version,

    /// List attached devices.
    Devices {
        /// Include USB path, product, model and transport id.
        #[arg(short = 'l', long)]
        long: bool,
        /// Output format.
        #[arg(long, default_value = "table")]
        format: OutputFormat,
    },

    /// Stop the bridge server.
    KillServer,

    /// Start the bridge server if it is not running.
    StartServer,

    /// Attach a device over TCP/IP.
    Connect {
        /// `host[:port]`, port defaults to 5555.
        target: String,
    },

    /// Detach a TCP/IP device, or all of them.
    Disconnect {
        /// `host[:port]`; omit to detach all.
        target: Option<String>,
    },

    /// Manage port forwards.
    Forward(cmd::ForwardArgs),

    /// Print the target's serial number.
    GetSerialno,

    /// Print the target's state.
    GetState,

    /// Print the target's product name.
    GetProduct,

    /// Print the target's USB device path.
    GetDevpath,

    /// Copy a local file to the device.
    Push {
        /// Local file.
        local: String,
        /// Remote path.
        remote: String,
    },

    /// Copy a device file to the host.
    Pull {
        /// Remote path.
        remote: String,
        /// Local file; defaults to the remote file name.
        local: Option<String>,
    },

    /// List a device directory.
    Ls {
        /// Remote directory.
        remote: String,
    },

    /// Show mode, size and mtime of a device path.
    Stat {
        /// Remote path.
        remote: String,
    },

    /// Run a command in a non-interactive device shell.
    #[command(trailing_var_arg = true)]
    Shell {
        /// Command and arguments.
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },

    /// List devices exposing a bridge interface on the local USB buses.
    Usb,

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

/// Output format for list commands.
#[derive(Debug, Clone, Copy, Default, clap::ValueEnum)]
pub(crate) enum OutputFormat {
    /// Human-readable table.
    #[default]
    Table,
    /// Machine-readable JSON.
    Json,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = cli.dispatch().await {
        eprintln!("dbridge: {e:#}");
        std::process::exit(1);
    }
}

/// Installs a stderr subscriber; `RUST_LOG` overrides the `-v` level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dbridge={level},dbridge_cli={level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbosity >= 2)
        .try_init();
}

impl Cli {
    /// Config file, then environment, then flags.
    fn config(&self) -> Result<Config> {
        let base = match &self.config {
            Some(path) => Config::load(path).with_context(|| format!("loading {path}"))?,
            None => Config::default(),
        };
        let mut config = base.with_env();
        if let Some(host) = &self.host {
            config = config.host(host.clone());
        }
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(serial) = &self.serial {
            config = config.serial(serial.clone());
        }
        tracing::debug!(address = %config.address(), "using server");
        Ok(config)
    }

    /// Host prefix and transport selector for the chosen target.
    fn target(&self, config: &Config) -> (Prefix, Selector) {
        if self.usb {
            (Prefix::Usb, Selector::Usb)
        } else if self.emulator {
            (Prefix::Local, Selector::Local)
        } else if let Some(serial) = &config.serial {
            (Prefix::Serial(serial.clone()), Selector::Serial(serial.clone()))
        } else {
            (Prefix::Host, Selector::Any)
        }
    }

    async fn dispatch(self) -> Result<()> {
        if let Command::Completion { shell } = self.command {
            clap_complete::generate(shell, &mut Self::command(), "dbridge", &mut std::io::stdout());
            return Ok(());
        }

        let config = self.config()?;
        let (prefix, selector) = self.target(&config);
        let client = dbridge::Client::new(config.clone())?;
        match self.command {
            Command::Version => cmd::version(&client).await,
            Command::Devices { long, format } => cmd::devices(&client, long, format).await,
            Command::KillServer => cmd::kill_server(&client).await,
            Command::StartServer => cmd::start_server(&client).await,
            Command::Connect { target } => cmd::connect(&client, &target).await,
            Command::Disconnect { target } => cmd::disconnect(&client, target.as_deref()).await,
            Command::Forward(args) => cmd::forward(&client, &prefix, args).await,
            Command::GetSerialno => cmd::print(client.get_serialno(&prefix).await?),
            Command::GetState => cmd::print(client.get_state(&prefix).await?),
            Command::GetProduct => cmd::print(client.get_product(&prefix).await?),
            Command::GetDevpath => cmd::print(client.get_devpath(&prefix).await?),
            Command::Push { local, remote } => cmd::push(&client, selector, &local, &remote).await,
            Command::Pull { remote, local } => {
                cmd::pull(&client, selector, &remote, local.as_deref()).await
            }
            Command::Ls { remote } => cmd::ls(&client, selector, &remote).await,
            Command::Stat { remote } => cmd::stat(&client, selector, &remote).await,
            Command::Shell { command } => cmd::shell(&client, selector, &command.join(" ")).await,
            Command::Usb => cmd::usb(config).await,
            Command::Completion { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn target_flags_pick_prefix_and_selector() {
        let cli = Cli::parse_from(["dbridge", "-s", "abc", "get-state"]);
        let config = Config::default().serial("abc");
        assert_eq!(
            cli.target(&config),
            (Prefix::Serial("abc".into()), Selector::Serial("abc".into()))
        );

        let cli = Cli::parse_from(["dbridge", "get-state", "-d"]);
        assert_eq!(cli.target(&Config::default()), (Prefix::Usb, Selector::Usb));

        let cli = Cli::parse_from(["dbridge", "devices"]);
        assert_eq!(cli.target(&Config::default()), (Prefix::Host, Selector::Any));
    }

    #[test]
    fn shell_keeps_trailing_arguments() {
        let cli = Cli::parse_from(["dbridge", "shell", "ls", "-l", "/sdcard"]);
        match cli.command {
            Command::Shell { command } => assert_eq!(command, ["ls", "-l", "/sdcard"]),
            _ => panic!("expected shell"),
        }
    }

    #[test]
    fn serial_conflicts_with_usb() {
        assert!(Cli::try_parse_from(["dbridge", "-s", "abc", "-d", "devices"]).is_err());
    }
}
