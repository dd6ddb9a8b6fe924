//! Sessions over the system OpenSSH client.
//!
//! One master connection per host is opened with `ControlMaster`; every
//! command and copy afterwards multiplexes over its control socket, so the
//! user authenticates once per host and run.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, instrument, warn};

use super::{CommandOutput, RemoteHost};
use crate::config::HostMachineInfo;
use crate::error::{FarmError, Result};

/// Env var the askpass helper reads the password from.
const PASSWORD_ENV: &str = "CIFARM_SSH_PASSWORD";

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$CIFARM_SSH_PASSWORD\"\n";

pub struct SshConnection {
    info: HostMachineInfo,
    /// Holds the control socket and askpass helper; removed on drop.
    control_dir: TempDir,
    closed: AtomicBool,
}

impl SshConnection {
    /// Authenticate against the host and keep the master connection open.
    ///
    /// Without a configured password ssh asks on the terminal.
    #[instrument(skip_all, fields(machine = %info.machine_id, host = %info.host_name))]
    pub async fn open(info: HostMachineInfo, connect_timeout: Duration) -> Result<Self> {
        let control_dir = tempfile::Builder::new()
            .prefix("cifarm-ssh-")
            .tempdir()
            .map_err(|e| FarmError::io(std::env::temp_dir(), e))?;

        let connection = Self { info, control_dir, closed: AtomicBool::new(false) };

        let mut cmd = Command::new("ssh");
        cmd.args(["-M", "-N", "-f"])
            .arg("-o")
            .arg(format!("ControlPath={}", connection.control_path().display()))
            .args(["-o", "ControlPersist=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)))
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args(["-o", "ServerAliveInterval=30"])
            .arg("-E")
            .arg(connection.control_dir.path().join("master.log"))
            .arg(connection.info.ssh_destination())
            // The backgrounded master keeps inherited pipes open; errors go to the -E log.
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if connection.info.user_password.is_empty() {
            info!("No password configured, ssh will prompt for it");
            cmd.stdin(Stdio::inherit());
        } else {
            let askpass = connection.write_askpass()?;
            cmd.stdin(Stdio::null())
                .env("SSH_ASKPASS", askpass)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("DISPLAY", std::env::var("DISPLAY").unwrap_or_else(|_| ":0".to_string()))
                .env(PASSWORD_ENV, &connection.info.user_password);
        }

        let status = cmd.status().await.map_err(|e| connection.connect_error(e.to_string()))?;
        if !status.success() {
            let log = std::fs::read_to_string(connection.control_dir.path().join("master.log"))
                .unwrap_or_default();
            let reason = log.trim().to_string();
            return Err(connection.connect_error(if reason.is_empty() {
                format!("ssh exited with {}", status)
            } else {
                reason
            }));
        }

        info!("Connected");
        Ok(connection)
    }

    fn control_path(&self) -> PathBuf {
        self.control_dir.path().join("master.sock")
    }

    fn write_askpass(&self) -> Result<PathBuf> {
        let path = self.control_dir.path().join("askpass.sh");
        std::fs::write(&path, ASKPASS_SCRIPT).map_err(|e| FarmError::io(&path, e))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| FarmError::io(&path, e))?;
        Ok(path)
    }

    fn connect_error(&self, reason: String) -> FarmError {
        FarmError::ConnectionFailed {
            machine_id: self.info.machine_id.clone(),
            host: self.info.host_name.clone(),
            reason,
        }
    }

    /// Options that route a client through the master connection.
    fn mux_args(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            format!("ControlPath={}", self.control_path().display()),
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }

    /// scp wants `/C:/dir` for Windows drive paths.
    fn scp_target(&self, remote: &str) -> String {
        let bytes = remote.as_bytes();
        let path = if self.info.is_windows() && bytes.len() >= 2 && bytes[1] == b':' {
            format!("/{}", remote)
        } else {
            remote.to_string()
        };
        format!("{}:{}", self.info.ssh_destination(), path)
    }

    async fn scp(&self, from: &str, to: &str) -> Result<()> {
        let output = Command::new("scp")
            .arg("-q")
            .args(self.mux_args())
            .arg(from)
            .arg(to)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| self.transfer_error(from, to, e.to_string()))?;
        if !output.status.success() {
            return Err(self.transfer_error(
                from,
                to,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    fn transfer_error(&self, from: &str, to: &str, reason: String) -> FarmError {
        FarmError::TransferFailed {
            machine_id: self.info.machine_id.clone(),
            source_path: from.to_string(),
            target_path: to.to_string(),
            reason,
        }
    }

    fn exit_command(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new("ssh");
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path().display()))
            .args(["-O", "exit"])
            .arg(self.info.ssh_destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

#[async_trait]
impl RemoteHost for SshConnection {
    fn info(&self) -> &HostMachineInfo {
        &self.info
    }

    async fn execute(&self, command: &str, stream_output: bool) -> Result<CommandOutput> {
        let machine_id = self.info.machine_id.clone();
        let mut child = Command::new("ssh")
            .args(self.mux_args())
            .arg("-T")
            .arg(self.info.ssh_destination())
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.connect_error(format!("failed to spawn ssh: {}", e)))?;

        let stdout =
            child.stdout.take().ok_or_else(|| FarmError::Internal("ssh stdout not captured".into()))?;
        let stderr =
            child.stderr.take().ok_or_else(|| FarmError::Internal("ssh stderr not captured".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push(line);
            }
            collected
        });

        let mut stdout_lines = Vec::new();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| FarmError::Internal(format!("reading ssh output: {}", e)))?
        {
            if stream_output {
                info!(target: "remote", "[{}] {}", machine_id, line);
            }
            stdout_lines.push(line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| FarmError::Internal(format!("waiting for ssh: {}", e)))?;
        let stderr_lines = stderr_task
            .await
            .map_err(|e| FarmError::Internal(format!("stderr reader failed: {}", e)))?;

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_lines,
            stderr: stderr_lines,
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        self.scp(&local.to_string_lossy(), &self.scp_target(remote)).await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<()> {
        self.scp(&self.scp_target(remote), &local.to_string_lossy()).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut cmd = Command::from(self.exit_command());
        match cmd.status().await {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => {
                warn!(machine = %self.info.machine_id, "ssh master exit returned {}", status);
                Ok(())
            }
            Err(e) => Err(self.connect_error(format!("failed to close session: {}", e))),
        }
    }
}

impl Drop for SshConnection {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.exit_command().status();
        }
    }
}
