//! Invocation of external tools (snapshot engine, cloud transport utility).
//!
//! Secrets are only ever handed to children through environment variables,
//! never through arguments, so that the logged command line is safe.

use secrecy::{ExposeSecret, SecretString};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished child process
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code, `None` when terminated by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Last non-empty stderr line, for concise error messages
    pub fn error_summary(&self) -> String {
        let line = self
            .stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("no error output");
        match self.status {
            Some(code) => format!("exit status {}: {}", code, line),
            None => format!("terminated by signal: {}", line),
        }
    }
}

/// A command line for an external tool
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(String, SecretString)>,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pass a secret through the child's environment
    pub fn secret_env(mut self, key: &str, value: &SecretString) -> Self {
        self.env.push((key.to_string(), value.clone()));
        self
    }

    /// Arguments as they would appear on a shell command line
    pub fn display(&self) -> String {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run to completion and capture output.
    ///
    /// The child is killed if the returned future is dropped, so an
    /// interrupted pipeline does not leave orphaned transfers behind.
    pub async fn output(&self) -> std::io::Result<ToolOutput> {
        debug!("Running: {}", self.display());

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, value.expose_secret());
        }

        let output = command.output().await.map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("failed to start {}: {}", self.program.display(), e),
            )
        })?;

        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
