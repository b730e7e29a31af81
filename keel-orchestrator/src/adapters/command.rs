//! External command execution
//!
//! Shared plumbing for adapters that drive a CLI tool: spawning, feeding
//! stdin, capturing output and classifying failures.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::AdapterError;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Builder for one command invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    stdin: Option<Vec<u8>>,
    /// Keep stdout out of the logs
    quiet: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            stdin: None,
            quiet: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Bytes written to the child's stdin. Never logged.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    fn describe(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }

    /// Runs the command to completion
    ///
    /// A non-zero exit is not an error here; use [`Invocation::run_checked`]
    /// to turn it into one. Dropping the returned future kills the child.
    pub async fn run(&self) -> Result<CommandOutput, AdapterError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        debug!("Running {}", self.describe());

        let mut child = command.spawn().map_err(|e| {
            AdapterError::Rejected(format!("failed to execute '{}': {}", self.program, e))
        })?;

        if let (Some(input), Some(mut pipe)) = (&self.stdin, child.stdin.take()) {
            pipe.write_all(input)
                .await
                .map_err(|e| AdapterError::Transient(format!("failed to write stdin: {}", e)))?;
            drop(pipe);
        }

        let output = child.wait_with_output().await.map_err(|e| {
            AdapterError::Transient(format!("failed to wait for '{}': {}", self.program, e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !self.quiet && !stdout.trim().is_empty() {
            debug!("{} stdout: {}", self.program, stdout.trim());
        }
        if !stderr.trim().is_empty() {
            debug!("{} stderr: {}", self.program, stderr.trim());
        }

        Ok(CommandOutput {
            success: output.status.success(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }

    /// Runs the command and classifies a non-zero exit as an adapter error
    pub async fn run_checked(&self) -> Result<CommandOutput, AdapterError> {
        let output = self.run().await?;
        if output.success {
            Ok(output)
        } else {
            Err(classify(&self.describe(), &output))
        }
    }
}

const TRANSIENT_MARKERS: &[&str] = &[
    "connection refused",
    "connection reset",
    "i/o timeout",
    "tls handshake timeout",
    "timeout awaiting",
    "unable to connect",
    "serviceunavailable",
    "service unavailable",
    "too many requests",
    "etcdserver: request timed out",
    "error acquiring the state lock",
    "temporarily unavailable",
];

/// Maps a failed command to an adapter error from its stderr
pub fn classify(command: &str, output: &CommandOutput) -> AdapterError {
    let message = format!(
        "'{}' exited with code {}: {}",
        command,
        output.exit_code,
        output.stderr.trim()
    );
    let stderr = output.stderr.to_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        AdapterError::Transient(message)
    } else {
        AdapterError::Rejected(message)
    }
}
