//! Typed farm configuration.
//!
//! Every value here is produced by [`super::parser::ConfigParser`] after the
//! document passed validation; nothing is mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{FarmError, Result};

/// Version the config document must declare in `CIFarmVersion`.
pub const CONFIG_FILE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Operating system of a host machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OsType {
    Linux,
    Windows,
}

impl OsType {
    /// Temporary directory used when the document does not name one.
    pub fn default_temp_dir(&self) -> &'static str {
        match self {
            OsType::Linux => "/tmp",
            OsType::Windows => "C:/Windows/Temp",
        }
    }
}

impl FromStr for OsType {
    type Err = FarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Linux" => Ok(OsType::Linux),
            "Windows" => Ok(OsType::Windows),
            other => Err(FarmError::config(format!(
                "unsupported OSType \"{}\" (expected Linux or Windows)",
                other
            ))),
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsType::Linux => write!(f, "Linux"),
            OsType::Windows => write!(f, "Windows"),
        }
    }
}

/// One physical or virtual machine of the farm.
#[derive(Clone, PartialEq, Eq)]
pub struct HostMachineInfo {
    pub machine_id: String,
    pub host_name: String,
    pub user_name: String,
    /// Empty means the connection pool prompts for it.
    pub user_password: String,
    pub os_type: OsType,
    pub temp_dir: String,
}

impl HostMachineInfo {
    pub fn is_linux(&self) -> bool {
        self.os_type == OsType::Linux
    }

    pub fn is_windows(&self) -> bool {
        self.os_type == OsType::Windows
    }

    /// `user@host` as understood by ssh.
    pub fn ssh_destination(&self) -> String {
        format!("{}@{}", self.user_name, self.host_name)
    }
}

// The password must never end up in logs through `{:?}`.
impl fmt::Debug for HostMachineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMachineInfo")
            .field("machine_id", &self.machine_id)
            .field("host_name", &self.host_name)
            .field("user_name", &self.user_name)
            .field("user_password", &if self.user_password.is_empty() { "" } else { "***" })
            .field("os_type", &self.os_type)
            .field("temp_dir", &self.temp_dir)
            .finish()
    }
}

/// Everything needed to build and start one docker container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerConfig {
    pub container_name: String,
    pub container_user: String,
    pub container_image_name: String,
    /// Home directory of `container_user` inside the container.
    pub home_directory: String,
    /// host port -> container port
    pub published_ports: BTreeMap<u16, u16>,
    /// host path -> container path
    pub host_volumes: BTreeMap<String, String>,
    pub envvar_definitions: Vec<String>,
}

impl ContainerConfig {
    pub fn ssh_dir(&self) -> String {
        format!("{}/.ssh", self.home_directory)
    }

    /// Host port that maps to `container_port`, if published.
    pub fn host_port_for(&self, container_port: u16) -> Option<u16> {
        self.published_ports.iter().find(|(_, c)| **c == container_port).map(|(h, _)| *h)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JenkinsMasterHostConfig {
    pub machine_id: String,
    /// Directory on the host mounted as the master's home.
    pub jenkins_home_share: String,
    pub container: ContainerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JenkinsSlaveConfig {
    pub machine_id: String,
    pub executors: u32,
    pub slave_name: String,
    /// Only Linux agents run in a container.
    pub container: Option<ContainerConfig>,
}

/// A host whose account serves git repositories over ssh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshRepositoryHostConfig {
    pub machine_id: String,
    pub ssh_dir: String,
}

/// Basic-auth credentials for a git server reached over https.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpsRepositoryHostConfig {
    pub host: String,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for HttpsRepositoryHostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpsRepositoryHostConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// A named xml file that is copied into the master's home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigItem {
    pub name: String,
    pub xml_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebserverConfig {
    pub machine_id: String,
    pub host_html_share_dir: String,
    pub container_ssh_port: u16,
    pub container_web_port: u16,
    pub container: ContainerConfig,
}

/// One CPF pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpfJobConfig {
    pub base_name: String,
    pub repository: String,
    pub result_repository: Option<String>,
    pub webserver: Option<WebserverConfig>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct JenkinsConfig {
    pub use_unconfigured_jenkins: bool,
    pub admin_user: String,
    pub admin_user_password: String,
    pub account_config_files: Vec<ConfigItem>,
    pub job_config_files: Vec<ConfigItem>,
    pub cpf_jobs: Vec<CpfJobConfig>,
    pub approved_system_commands: Vec<String>,
    pub approved_script_signatures: Vec<String>,
}

impl fmt::Debug for JenkinsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JenkinsConfig")
            .field("use_unconfigured_jenkins", &self.use_unconfigured_jenkins)
            .field("admin_user", &self.admin_user)
            .field("account_config_files", &self.account_config_files)
            .field("job_config_files", &self.job_config_files)
            .field("cpf_jobs", &self.cpf_jobs)
            .field("approved_system_commands", &self.approved_system_commands)
            .field("approved_script_signatures", &self.approved_script_signatures)
            .finish_non_exhaustive()
    }
}

/// The validated farm description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigData {
    pub version: String,
    pub host_machines: Vec<HostMachineInfo>,
    pub jenkins_master_host: JenkinsMasterHostConfig,
    pub ssh_repository_hosts: Vec<SshRepositoryHostConfig>,
    pub https_repository_hosts: Vec<HttpsRepositoryHostConfig>,
    pub jenkins_slaves: Vec<JenkinsSlaveConfig>,
    pub jenkins_config: JenkinsConfig,
    /// container name -> machine id
    pub(crate) container_hosts: BTreeMap<String, String>,
}

impl ConfigData {
    /// Machine that runs the given container.
    pub fn get_container_host(&self, container_name: &str) -> Result<&str> {
        self.container_hosts
            .get(container_name)
            .map(String::as_str)
            .ok_or_else(|| FarmError::UnknownContainer { name: container_name.to_string() })
    }

    pub fn host_info(&self, machine_id: &str) -> Result<&HostMachineInfo> {
        self.host_machines
            .iter()
            .find(|h| h.machine_id == machine_id)
            .ok_or_else(|| FarmError::UnknownHost { machine_id: machine_id.to_string() })
    }

    pub fn is_linux_machine(&self, machine_id: &str) -> bool {
        self.host_info(machine_id).map(|h| h.is_linux()).unwrap_or(false)
    }

    pub fn is_windows_machine(&self, machine_id: &str) -> bool {
        self.host_info(machine_id).map(|h| h.is_windows()).unwrap_or(false)
    }

    /// All containers of the farm, master first, then web-servers, then agents.
    ///
    /// This is also the order in which they are started.
    pub fn all_containers(&self) -> Vec<&ContainerConfig> {
        let mut containers = vec![&self.jenkins_master_host.container];
        containers.extend(self.webservers().map(|w| &w.container));
        containers.extend(self.linux_slaves().filter_map(|s| s.container.as_ref()));
        containers
    }

    /// Machines that host at least one container, without duplicates.
    pub fn container_machines(&self) -> Vec<&str> {
        let mut machines: Vec<&str> = Vec::new();
        for container in self.all_containers() {
            if let Some(machine) = self.container_hosts.get(&container.container_name) {
                if !machines.contains(&machine.as_str()) {
                    machines.push(machine);
                }
            }
        }
        machines
    }

    pub fn linux_slaves(&self) -> impl Iterator<Item = &JenkinsSlaveConfig> {
        self.jenkins_slaves.iter().filter(|s| s.container.is_some())
    }

    pub fn windows_slaves(&self) -> impl Iterator<Item = &JenkinsSlaveConfig> {
        self.jenkins_slaves.iter().filter(move |s| self.is_windows_machine(&s.machine_id))
    }

    pub fn webservers(&self) -> impl Iterator<Item = &WebserverConfig> {
        self.jenkins_config.cpf_jobs.iter().filter_map(|j| j.webserver.as_ref())
    }

    /// Web-server attached to the job with the given base name.
    pub fn webserver_for_job(&self, base_name: &str) -> Option<&WebserverConfig> {
        self.jenkins_config
            .cpf_jobs
            .iter()
            .find(|j| j.base_name == base_name)
            .and_then(|j| j.webserver.as_ref())
    }
}
