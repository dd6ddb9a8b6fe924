//! Derivation of container names and published ports.
//!
//! Runs after validation. The same validated input always yields the same
//! names and ports: names are indexed per category in list order and ports
//! come from one ascending scan over a shared claimed-port set.

use std::collections::{BTreeMap, BTreeSet};

use super::types::*;
use crate::error::{FarmError, Result};
use crate::ports::{
    BASE_SSH_PORT, BASE_WEB_PORT, MASTER_WEB_PORT, PORT_HTTP, PORT_JENKINS_WEB, PORT_SSH,
};

pub const JENKINS_MASTER_CONTAINER: &str = "jenkins-master";
pub const JENKINS_MASTER_IMAGE: &str = "jenkins-master-image";
pub const LINUX_SLAVE_BASE_NAME: &str = "jenkins-slave-linux";
pub const LINUX_SLAVE_IMAGE: &str = "jenkins-slave-linux-image";
pub const WEB_SERVER_BASE_NAME: &str = "cpf-web-server";
pub const WEB_SERVER_IMAGE: &str = "cpf-web-server-image";

pub const JENKINS_USER: &str = "jenkins";
pub const WEB_SERVER_USER: &str = "root";

pub const JENKINS_HOME_MASTER_CONTAINER: &str = "/var/jenkins_home";
pub const JENKINS_HOME_SLAVE_CONTAINER: &str = "/home/jenkins";
pub const WEB_SERVER_HOME_CONTAINER: &str = "/root";
pub const HTML_SHARE_WEB_SERVER_CONTAINER: &str = "/var/www/html";

const DISABLE_SETUP_WIZARD: &str = "JAVA_OPTS=-Djenkins.install.runSetupWizard=false";

/// Hands out host ports from one claimed set shared by all categories.
///
/// The ssh and web cursors only ever move forward, so every container that
/// asks later gets a higher port than any earlier one of its category.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    claimed: BTreeSet<u16>,
    next_ssh: u16,
    next_web: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    /// Port 22 belongs to the hosts' own sshd and is claimed up front.
    pub fn new() -> Self {
        Self {
            claimed: BTreeSet::from([PORT_SSH]),
            next_ssh: BASE_SSH_PORT,
            next_web: BASE_WEB_PORT,
        }
    }

    /// Reserve a fixed port. Returns false if it was already taken.
    pub fn claim(&mut self, port: u16) -> bool {
        self.claimed.insert(port)
    }

    pub fn next_ssh_port(&mut self) -> Result<u16> {
        Self::scan(&mut self.next_ssh, &mut self.claimed)
    }

    pub fn next_web_port(&mut self) -> Result<u16> {
        Self::scan(&mut self.next_web, &mut self.claimed)
    }

    pub fn claimed(&self) -> &BTreeSet<u16> {
        &self.claimed
    }

    fn scan(cursor: &mut u16, claimed: &mut BTreeSet<u16>) -> Result<u16> {
        while claimed.contains(cursor) {
            *cursor = cursor
                .checked_add(1)
                .ok_or_else(|| FarmError::config("ran out of free host ports"))?;
        }
        let port = *cursor;
        claimed.insert(port);
        *cursor = cursor.saturating_add(1);
        Ok(port)
    }
}

/// Agent entry as read from `JenkinsSlaves`.
#[derive(Debug, Clone)]
pub(crate) struct SlaveEntry {
    pub machine_id: String,
    pub executors: u32,
}

/// Job entry as read from `CPFJobs`.
#[derive(Debug, Clone)]
pub(crate) struct JobEntry {
    pub base_name: String,
    pub repository: String,
    pub result_repository: Option<String>,
    /// (machine id, host html share)
    pub webserver: Option<(String, String)>,
}

pub(crate) fn derive_master(
    machine_id: &str,
    share: &str,
    configure_jenkins: bool,
    ports: &mut PortAllocator,
) -> JenkinsMasterHostConfig {
    ports.claim(MASTER_WEB_PORT);

    let mut container = ContainerConfig {
        container_name: JENKINS_MASTER_CONTAINER.to_string(),
        container_user: JENKINS_USER.to_string(),
        container_image_name: JENKINS_MASTER_IMAGE.to_string(),
        home_directory: JENKINS_HOME_MASTER_CONTAINER.to_string(),
        published_ports: BTreeMap::from([(MASTER_WEB_PORT, PORT_JENKINS_WEB)]),
        host_volumes: BTreeMap::from([(
            share.to_string(),
            JENKINS_HOME_MASTER_CONTAINER.to_string(),
        )]),
        envvar_definitions: Vec::new(),
    };
    // The wizard would block the scripted configuration.
    if configure_jenkins {
        container.envvar_definitions.push(DISABLE_SETUP_WIZARD.to_string());
    }

    JenkinsMasterHostConfig {
        machine_id: machine_id.to_string(),
        jenkins_home_share: share.to_string(),
        container,
    }
}

pub(crate) fn derive_slaves(
    entries: &[SlaveEntry],
    hosts: &[HostMachineInfo],
    ports: &mut PortAllocator,
) -> Result<Vec<JenkinsSlaveConfig>> {
    let mut linux_index = 0;
    let mut windows_index = 0;
    let mut slaves = Vec::with_capacity(entries.len());

    for entry in entries {
        let host = hosts
            .iter()
            .find(|h| h.machine_id == entry.machine_id)
            .ok_or_else(|| FarmError::UnknownHost { machine_id: entry.machine_id.clone() })?;

        let slave = match host.os_type {
            OsType::Linux => {
                let ssh_port = ports.next_ssh_port()?;
                let container = ContainerConfig {
                    container_name: format!("{}-{}", LINUX_SLAVE_BASE_NAME, linux_index),
                    container_user: JENKINS_USER.to_string(),
                    container_image_name: LINUX_SLAVE_IMAGE.to_string(),
                    home_directory: JENKINS_HOME_SLAVE_CONTAINER.to_string(),
                    published_ports: BTreeMap::from([(ssh_port, PORT_SSH)]),
                    ..Default::default()
                };
                let slave_name = slave_name(OsType::Linux, linux_index);
                linux_index += 1;
                JenkinsSlaveConfig {
                    machine_id: entry.machine_id.clone(),
                    executors: entry.executors,
                    slave_name,
                    container: Some(container),
                }
            }
            OsType::Windows => {
                let slave_name = slave_name(OsType::Windows, windows_index);
                windows_index += 1;
                JenkinsSlaveConfig {
                    machine_id: entry.machine_id.clone(),
                    executors: entry.executors,
                    slave_name,
                    container: None,
                }
            }
        };
        slaves.push(slave);
    }

    Ok(slaves)
}

/// Agent name as registered in Jenkins.
pub fn slave_name(os_type: OsType, index: usize) -> String {
    let os = match os_type {
        OsType::Linux => "linux",
        OsType::Windows => "windows",
    };
    format!("cifarm-{}-{}-slave-{}", CONFIG_FILE_VERSION, os, index)
}

/// Web port first, then ssh port, job by job.
pub(crate) fn derive_jobs(
    entries: Vec<JobEntry>,
    ports: &mut PortAllocator,
) -> Result<Vec<CpfJobConfig>> {
    let mut web_server_index = 0;
    let mut jobs = Vec::with_capacity(entries.len());

    for entry in entries {
        let webserver = match entry.webserver {
            Some((machine_id, html_share)) => {
                let web_port = ports.next_web_port()?;
                let ssh_port = ports.next_ssh_port()?;
                let container = ContainerConfig {
                    container_name: format!("{}-{}", WEB_SERVER_BASE_NAME, web_server_index),
                    container_user: WEB_SERVER_USER.to_string(),
                    container_image_name: WEB_SERVER_IMAGE.to_string(),
                    home_directory: WEB_SERVER_HOME_CONTAINER.to_string(),
                    published_ports: BTreeMap::from([(web_port, PORT_HTTP), (ssh_port, PORT_SSH)]),
                    host_volumes: BTreeMap::from([(
                        html_share.clone(),
                        HTML_SHARE_WEB_SERVER_CONTAINER.to_string(),
                    )]),
                    envvar_definitions: Vec::new(),
                };
                web_server_index += 1;
                Some(WebserverConfig {
                    machine_id,
                    host_html_share_dir: html_share,
                    container_ssh_port: ssh_port,
                    container_web_port: web_port,
                    container,
                })
            }
            None => None,
        };

        jobs.push(CpfJobConfig {
            base_name: entry.base_name,
            repository: entry.repository,
            result_repository: entry.result_repository,
            webserver,
        });
    }

    Ok(jobs)
}

/// Build the container -> machine table, rejecting duplicate names.
pub(crate) fn build_container_index(
    master: &JenkinsMasterHostConfig,
    slaves: &[JenkinsSlaveConfig],
    jobs: &[CpfJobConfig],
) -> Result<BTreeMap<String, String>> {
    let mut index = BTreeMap::new();
    let entries = std::iter::once((&master.container, &master.machine_id))
        .chain(jobs.iter().filter_map(|j| j.webserver.as_ref()).map(|w| (&w.container, &w.machine_id)))
        .chain(slaves.iter().filter_map(|s| s.container.as_ref().map(|c| (c, &s.machine_id))));

    for (container, machine_id) in entries {
        if index.insert(container.container_name.clone(), machine_id.clone()).is_some() {
            return Err(FarmError::config(format!(
                "container name \"{}\" is used more than once",
                container.container_name
            )));
        }
    }
    Ok(index)
}

/// Published host ports must not overlap between containers of one host.
pub(crate) fn check_ports_disjoint(
    containers: &[&ContainerConfig],
    index: &BTreeMap<String, String>,
) -> Result<()> {
    let mut used: BTreeMap<(&str, u16), &str> = BTreeMap::new();
    for container in containers {
        let machine = index
            .get(&container.container_name)
            .ok_or_else(|| FarmError::UnknownContainer { name: container.container_name.clone() })?;
        for host_port in container.published_ports.keys() {
            if let Some(other) = used.insert((machine.as_str(), *host_port), &container.container_name)
            {
                return Err(FarmError::config(format!(
                    "containers \"{}\" and \"{}\" both publish port {} on host {}",
                    other, container.container_name, host_port, machine
                )));
            }
        }
    }
    Ok(())
}
