//! Starting the bridge server when nothing listens on its port.

use std::fmt;
use std::io;
use std::process::{Command, Stdio};

use crate::{Error, Result};

/// Launches the bridge server. Called by [`Session::connect`](crate::Session::connect)
/// when the server port refuses connections or the server is outdated.
///
/// Implementations block until the server has been asked to start; the
/// session runs them on a blocking thread.
pub trait ServerLauncher: Send + Sync + fmt::Debug {
    /// Starts the server, or fails with [`Error::StartFailed`].
    fn start_server(&self) -> Result<()>;
}

/// Runs an external command such as `adb start-server`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLauncher {
    /// Program to execute.
    program: String,
    /// Arguments passed to `program`.
    args: Vec<String>,
}

impl CommandLauncher {
    /// Launcher running `argv[0]` with the remaining elements as arguments.
    pub fn new(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::StartFailed("empty server command".to_owned()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl ServerLauncher for CommandLauncher {
    fn start_server(&self) -> Result<()> {
        tracing::info!(program = %self.program, args = ?self.args, "starting bridge server");
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    Error::StartFailed(format!("{}: command not found", self.program))
                }
                _ => Error::StartFailed(format!("{}: {e}", self.program)),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(Error::StartFailed(format!(
            "{} exited with {}: {}",
            self.program,
            output.status,
            stderr.trim()
        )))
    }
}
