//! External command invocation.
//!
//! Every host tool this crate drives (7z, mount, the ISO builder) goes
//! through [`Cmd`], which captures output and turns a non-zero exit into an
//! error carrying the tool's stderr.

use anyhow::{bail, Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Captured output of a successful command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
}

/// Builder for a host command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    error_msg: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            error_msg: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message prefixed to the error when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Human-readable command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion; fails if the program cannot be spawned or exits non-zero.
    pub fn run(self) -> Result<CommandResult> {
        debug!(command = %self.display(), "running");
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .with_context(|| format!("spawning '{}'", self.program.to_string_lossy()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let prefix = self
                .error_msg
                .unwrap_or_else(|| format!("'{}' failed", self.program.to_string_lossy()));
            bail!("{} ({}): {}", prefix, output.status, stderr.trim());
        }

        Ok(CommandResult { stdout, stderr })
    }
}
