//! SSH trust between containers and hosts.
//!
//! Two idempotent operations:
//!
//! - key pair creation inside a container, skipped when one exists;
//! - a grant that makes a client container's public key accepted by a
//!   server and registers the server's host key with the client.
//!
//! Keys are generated with the container name as comment, and a grant first
//! drops every `authorized_keys` line ending in that name. Re-running after a
//! container was rebuilt with a fresh key therefore replaces the old key
//! instead of piling up entries.

use tracing::{info, instrument};

use crate::config::{ConfigData, ContainerConfig, HostMachineInfo, HttpsRepositoryHostConfig};
use crate::connection::{quote, ConnectionPool, RemoteHost};
use crate::docker;
use crate::error::{FarmError, Result};
use crate::ports::PORT_SSH;

/// A container whose key should be accepted somewhere.
#[derive(Debug, Clone, Copy)]
pub struct TrustClient<'a> {
    pub machine_id: &'a str,
    pub container: &'a ContainerConfig,
}

/// Where a client's key gets registered.
#[derive(Debug, Clone, Copy)]
pub enum TrustServer<'a> {
    /// The account of a Linux host, e.g. a repository host.
    HostAccount { machine_id: &'a str, ssh_dir: &'a str },
    /// The OpenSSH server of a Windows agent.
    WindowsHost { machine_id: &'a str },
    /// The sshd inside a container, reached on its published port.
    Container { machine_id: &'a str, container: &'a ContainerConfig, ssh_port: u16 },
}

impl TrustServer<'_> {
    pub fn machine_id(&self) -> &str {
        match self {
            TrustServer::HostAccount { machine_id, .. }
            | TrustServer::WindowsHost { machine_id }
            | TrustServer::Container { machine_id, .. } => machine_id,
        }
    }

    fn ssh_port(&self) -> u16 {
        match self {
            TrustServer::Container { ssh_port, .. } => *ssh_port,
            _ => PORT_SSH,
        }
    }

    fn describe(&self) -> String {
        match self {
            TrustServer::HostAccount { machine_id, .. } => format!("host {}", machine_id),
            TrustServer::WindowsHost { machine_id } => format!("windows host {}", machine_id),
            TrustServer::Container { container, .. } => {
                format!("container {}", container.container_name)
            }
        }
    }
}

// ============================================================================
// Scripts
// ============================================================================

fn public_key_path(container: &ContainerConfig) -> String {
    format!("{}/id_rsa.pub", container.ssh_dir())
}

/// Creates `~/.ssh/id_rsa` unless present. `marker` becomes the key comment.
pub fn create_key_pair_script(ssh_dir: &str, marker: &str) -> String {
    let key = format!("{}/id_rsa", ssh_dir);
    format!(
        "mkdir -p {dir} && chmod 700 {dir} && {{ test -f {key} || ssh-keygen -q -t rsa -b 4096 -N '' -C {marker} -f {key}; }}",
        dir = quote(ssh_dir),
        key = quote(&key),
        marker = quote(marker)
    )
}

/// Replaces all keys whose comment equals `marker` with the key in `key_file`.
///
/// The marker is compared against the last field of each line, so
/// `jenkins-slave-linux-1` never removes `jenkins-slave-linux-10`.
pub fn authorized_key_script(ssh_dir: &str, key_file: &str, marker: &str) -> String {
    let keys = format!("{}/authorized_keys", ssh_dir);
    let tmp = format!("{}.tmp", keys);
    format!(
        "mkdir -p {dir} && chmod 700 {dir} && touch {keys} && \
         awk -v m={marker} '$NF != m' {keys} > {tmp} && cat {key} >> {tmp} && \
         mv {tmp} {keys} && chmod 600 {keys} && rm -f {key}",
        dir = quote(ssh_dir),
        keys = quote(&keys),
        tmp = quote(&tmp),
        key = quote(key_file),
        marker = quote(marker)
    )
}

/// cmd.exe variant of [`authorized_key_script`] for Windows OpenSSH.
pub fn windows_authorized_key_script(key_file: &str, marker: &str) -> String {
    let dir = r"%USERPROFILE%\.ssh";
    let keys = format!(r"{}\authorized_keys", dir);
    let key_file = key_file.replace('/', r"\");
    format!(
        "(if not exist \"{dir}\" mkdir \"{dir}\") & type nul >> \"{keys}\" & \
         findstr /v /e /c:\" {marker}\" \"{keys}\" > \"{keys}.tmp\" & \
         type \"{key}\" >> \"{keys}.tmp\" & move /y \"{keys}.tmp\" \"{keys}\" > nul & del \"{key}\"",
        dir = dir,
        keys = keys,
        key = key_file,
        marker = marker
    )
}

/// `known_hosts` entry name as written by `ssh-keyscan`.
pub fn known_hosts_entry(host_name: &str, port: u16) -> String {
    if port == PORT_SSH {
        host_name.to_string()
    } else {
        format!("[{}]:{}", host_name, port)
    }
}

/// Replaces the host key of `host_name:port` in `known_hosts`.
pub fn known_host_script(ssh_dir: &str, host_name: &str, port: u16) -> String {
    let known_hosts = format!("{}/known_hosts", ssh_dir);
    format!(
        "mkdir -p {dir} && touch {kh} && {{ ssh-keygen -R {entry} -f {kh} > /dev/null 2>&1 || true; }} && \
         keys=$(ssh-keyscan -p {port} {host} 2> /dev/null) && test -n \"$keys\" && \
         printf '%s\\n' \"$keys\" >> {kh} && chmod 600 {kh}",
        dir = quote(ssh_dir),
        kh = quote(&known_hosts),
        entry = quote(&known_hosts_entry(host_name, port)),
        port = port,
        host = quote(host_name)
    )
}

/// Lines of a `.git-credentials` file with percent-encoded credentials.
pub fn git_credentials(hosts: &[HttpsRepositoryHostConfig]) -> Result<String> {
    let mut content = String::new();
    for host in hosts {
        let mut url = reqwest::Url::parse(&format!("https://{}", host.host))
            .map_err(|e| FarmError::config(format!("invalid https host {}: {}", host.host, e)))?;
        let invalid = |_| FarmError::config(format!("https host {} takes no credentials", host.host));
        url.set_username(&host.user).map_err(invalid)?;
        url.set_password(Some(&host.password)).map_err(invalid)?;
        content.push_str(url.as_str().trim_end_matches('/'));
        content.push('\n');
    }
    Ok(content)
}

/// Run [`authorized_key_script`] on a host account.
pub async fn register_authorized_key(
    host: &dyn RemoteHost,
    ssh_dir: &str,
    key_file: &str,
    marker: &str,
) -> Result<()> {
    host.run(&authorized_key_script(ssh_dir, key_file, marker)).await?;
    Ok(())
}

// ============================================================================
// Provisioner
// ============================================================================

/// Runs the trust protocol against the farm's hosts.
pub struct TrustProvisioner<'a> {
    config: &'a ConfigData,
    pool: &'a ConnectionPool,
}

impl<'a> TrustProvisioner<'a> {
    pub fn new(config: &'a ConfigData, pool: &'a ConnectionPool) -> Self {
        Self { config, pool }
    }

    fn host(&self, machine_id: &str) -> Result<(&'a HostMachineInfo, &'a dyn RemoteHost)> {
        Ok((self.config.host_info(machine_id)?, self.pool.get(machine_id)?))
    }

    /// Make sure the container owns a key pair.
    #[instrument(skip_all, fields(container = %client.container.container_name))]
    pub async fn create_key_pair(&self, client: TrustClient<'_>) -> Result<()> {
        let (_, host) = self.host(client.machine_id)?;
        let container = client.container;
        info!("Ensuring ssh key pair in {}", container.container_name);
        docker::exec(
            host,
            &container.container_name,
            &create_key_pair_script(&container.ssh_dir(), &container.container_name),
            Some(&container.container_user),
        )
        .await?;
        Ok(())
    }

    /// Let `client` log into `server` without a password or host key prompt.
    #[instrument(skip_all, fields(client = %client.container.container_name, server = %server.describe()))]
    pub async fn grant(&self, client: TrustClient<'_>, server: TrustServer<'_>) -> Result<()> {
        info!("Granting {} ssh access to {}", client.container.container_name, server.describe());
        let marker = client.container.container_name.as_str();
        let file_name = format!("{}_id_rsa.pub", marker);

        // 1. container -> client host
        let (client_info, client_host) = self.host(client.machine_id)?;
        let client_staged = format!("{}/{}", client_info.temp_dir, file_name);
        docker::copy_container_to_host(
            client_host,
            marker,
            &public_key_path(client.container),
            &client_staged,
        )
        .await?;

        // 2. client host -> server host
        let (server_info, server_host) = self.host(server.machine_id())?;
        let server_staged = format!("{}/{}", server_info.temp_dir, file_name);
        self.copy_between_hosts(client_host, &client_staged, server_host, &server_staged).await?;
        if client.machine_id != server.machine_id() {
            client_host.run(&format!("rm -f {}", quote(&client_staged))).await?;
        }

        // 3. replace the client's key on the server
        match server {
            TrustServer::HostAccount { ssh_dir, .. } => {
                register_authorized_key(server_host, ssh_dir, &server_staged, marker).await?;
            }
            TrustServer::WindowsHost { .. } => {
                server_host.run(&windows_authorized_key_script(&server_staged, marker)).await?;
            }
            TrustServer::Container { container, .. } => {
                let in_container = format!("{}/{}", container.ssh_dir(), file_name);
                docker::copy_host_to_container(server_host, container, &server_staged, &in_container)
                    .await?;
                server_host.run(&format!("rm -f {}", quote(&server_staged))).await?;
                docker::exec(
                    server_host,
                    &container.container_name,
                    &authorized_key_script(&container.ssh_dir(), &in_container, marker),
                    Some(&container.container_user),
                )
                .await?;
            }
        }

        // 4. server host key -> client known_hosts
        docker::exec(
            client_host,
            marker,
            &known_host_script(&client.container.ssh_dir(), &server_info.host_name, server.ssh_port()),
            Some(&client.container.container_user),
        )
        .await?;
        Ok(())
    }

    async fn copy_between_hosts(
        &self,
        source: &dyn RemoteHost,
        source_path: &str,
        target: &dyn RemoteHost,
        target_path: &str,
    ) -> Result<()> {
        if source.machine_id() == target.machine_id() {
            if source_path != target_path {
                source.run(&format!("cp {} {}", quote(source_path), quote(target_path))).await?;
            }
            return Ok(());
        }
        let local_dir = tempfile::tempdir().map_err(|e| FarmError::io(std::env::temp_dir(), e))?;
        let local = local_dir.path().join("transfer");
        source.download(source_path, &local).await?;
        target.upload(&local, target_path).await
    }

    /// Store the https repository credentials in the container's git config.
    #[instrument(skip_all, fields(container = %client.container.container_name))]
    pub async fn grant_https_access(
        &self,
        client: TrustClient<'_>,
        hosts: &[HttpsRepositoryHostConfig],
    ) -> Result<()> {
        if hosts.is_empty() {
            return Ok(());
        }
        let (info, host) = self.host(client.machine_id)?;
        let container = client.container;
        let staged = format!("{}/{}_git-credentials", info.temp_dir, container.container_name);
        let target = format!("{}/.git-credentials", container.home_directory);

        host.upload_contents(&git_credentials(hosts)?, &staged).await?;
        let copied = docker::copy_host_to_container(host, container, &staged, &target).await;
        host.run(&format!("rm -f {}", quote(&staged))).await?;
        copied?;

        docker::exec(
            host,
            &container.container_name,
            &format!("chmod 600 {} && git config --global credential.helper store", quote(&target)),
            Some(&container.container_user),
        )
        .await?;
        Ok(())
    }
}
