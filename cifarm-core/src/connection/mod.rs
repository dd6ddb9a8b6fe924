//! Remote execution and file transfer on farm hosts.
//!
//! Every host of the farm is reached through one [`RemoteHost`] session that
//! lives in the [`ConnectionPool`] for the whole run.

pub mod pool;
pub mod ssh;

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, error};

use crate::config::HostMachineInfo;
use crate::error::{FarmError, Result};

pub use pool::ConnectionPool;
pub use ssh::SshConnection;

/// How a command result is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Return non-zero exit codes instead of failing.
    pub ignore_exit_code: bool,
    /// Log stdout lines as they arrive.
    pub stream_output: bool,
}

impl RunOptions {
    /// For commands whose exit code is the answer.
    pub fn probe() -> Self {
        Self { ignore_exit_code: true, stream_output: false }
    }

    /// For long running commands whose output should be visible live.
    pub fn streamed() -> Self {
        Self { ignore_exit_code: false, stream_output: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One authenticated session to a farm host.
///
/// Implementations only provide the raw operations; error handling for exit
/// codes lives in the provided methods so every backend reports failures the
/// same way.
#[async_trait]
pub trait RemoteHost: Send + Sync {
    fn info(&self) -> &HostMachineInfo;

    /// Run `command` in the host's default shell.
    async fn execute(&self, command: &str, stream_output: bool) -> Result<CommandOutput>;

    /// Copy a local file to `remote`.
    async fn upload(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copy `remote` to a local file.
    async fn download(&self, remote: &str, local: &Path) -> Result<()>;

    /// End the session. Later calls are no-ops.
    async fn close(&self) -> Result<()>;

    fn machine_id(&self) -> &str {
        &self.info().machine_id
    }

    /// Run a command that must succeed and return its stdout lines.
    async fn run(&self, command: &str) -> Result<Vec<String>> {
        Ok(self.run_with(command, RunOptions::default()).await?.stdout)
    }

    async fn run_with(&self, command: &str, options: RunOptions) -> Result<CommandOutput> {
        debug!(machine = %self.machine_id(), "{}", command);
        let output = self.execute(command, options.stream_output).await?;
        if !output.success() && !options.ignore_exit_code {
            log_failed_output(self.machine_id(), &output);
            return Err(FarmError::RemoteCommandFailed {
                machine_id: self.machine_id().to_string(),
                command: command.to_string(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        Ok(output)
    }

    /// Write `contents` to the remote file `remote`.
    async fn upload_contents(&self, contents: &str, remote: &str) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| FarmError::io(std::env::temp_dir(), e))?;
        file.write_all(contents.as_bytes()).map_err(|e| FarmError::io(file.path(), e))?;
        file.flush().map_err(|e| FarmError::io(file.path(), e))?;
        self.upload(file.path(), remote).await
    }
}

/// Remote output is invisible otherwise, so it is logged before the error
/// propagates.
fn log_failed_output(machine_id: &str, output: &CommandOutput) {
    for line in &output.stdout {
        error!(target: "remote", "[{}] {}", machine_id, line);
    }
    for line in &output.stderr {
        error!(target: "remote", "[{}] {}", machine_id, line);
    }
}

/// Quote `value` for a POSIX shell.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value.chars().all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parent directory of a forward-slash remote path.
pub fn remote_parent(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}
