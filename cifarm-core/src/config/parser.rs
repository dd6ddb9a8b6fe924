//! Farm config document parser.
//!
//! Parsing runs in two passes. The first pulls every key out of the JSON
//! document and fails with [`FarmError::MissingKey`] on the first missing or
//! empty one. The second checks the cross-entity rules and fails with
//! [`FarmError::ConfigInvalid`]. Derivation of names and ports only starts
//! once both passes succeeded.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::derive::{self, JobEntry, PortAllocator, SlaveEntry};
use super::types::*;
use crate::error::{FarmError, Result};

// ============================================================================
// Raw document
// ============================================================================

/// The JSON document as written by the user. Everything is optional here so
/// missing keys can be reported by name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawDocument {
    #[serde(rename = "CIFarmVersion", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(rename = "HostMachines", skip_serializing_if = "Option::is_none")]
    pub host_machines: Option<Vec<RawHostMachine>>,
    #[serde(rename = "JenkinsMasterHost", skip_serializing_if = "Option::is_none")]
    pub jenkins_master_host: Option<RawMasterHost>,
    #[serde(rename = "SSHRepositoryHosts", skip_serializing_if = "Option::is_none")]
    pub ssh_repository_hosts: Option<Vec<RawSshRepositoryHost>>,
    #[serde(rename = "HTTPSRepositoryHosts", skip_serializing_if = "Option::is_none")]
    pub https_repository_hosts: Option<Vec<RawHttpsRepositoryHost>>,
    #[serde(rename = "JenkinsSlaves", skip_serializing_if = "Option::is_none")]
    pub jenkins_slaves: Option<Vec<RawSlave>>,
    #[serde(rename = "JenkinsConfig", skip_serializing_if = "Option::is_none")]
    pub jenkins_config: Option<RawJenkinsConfig>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct RawHostMachine {
    #[serde(rename = "MachineID", skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(rename = "HostNameOrIP", skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Password", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(rename = "OSType", skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(rename = "TemporaryDirectory", skip_serializing_if = "Option::is_none")]
    pub temp_dir: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawMasterHost {
    #[serde(rename = "MachineID", skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(rename = "HostJenkinsMasterShare", skip_serializing_if = "Option::is_none")]
    pub share: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawSshRepositoryHost {
    #[serde(rename = "MachineID", skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(rename = "SSHDir", skip_serializing_if = "Option::is_none")]
    pub ssh_dir: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawHttpsRepositoryHost {
    #[serde(rename = "Host", skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(rename = "User", skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(rename = "Password", skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawSlave {
    #[serde(rename = "MachineID", skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(rename = "Executors", skip_serializing_if = "Option::is_none")]
    pub executors: Option<Executors>,
}

/// Executor counts are accepted as JSON numbers or numeric strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Executors {
    Number(i64),
    Text(String),
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawJenkinsConfig {
    #[serde(rename = "UseUnconfiguredJenkins", skip_serializing_if = "Option::is_none")]
    pub use_unconfigured_jenkins: Option<bool>,
    #[serde(rename = "JenkinsAdminUser", skip_serializing_if = "Option::is_none")]
    pub admin_user: Option<String>,
    #[serde(rename = "JenkinsAdminUserPassword", skip_serializing_if = "Option::is_none")]
    pub admin_user_password: Option<String>,
    #[serde(rename = "JenkinsAccountConfigFiles", skip_serializing_if = "Option::is_none")]
    pub account_config_files: Option<BTreeMap<String, String>>,
    #[serde(rename = "JenkinsJobConfigFiles", skip_serializing_if = "Option::is_none")]
    pub job_config_files: Option<BTreeMap<String, String>>,
    #[serde(rename = "CPFJobs", skip_serializing_if = "Option::is_none")]
    pub cpf_jobs: Option<Vec<RawCpfJob>>,
    #[serde(rename = "JenkinsApprovedSystemCommands", skip_serializing_if = "Option::is_none")]
    pub approved_system_commands: Option<Vec<String>>,
    #[serde(rename = "JenkinsApprovedScriptSignatures", skip_serializing_if = "Option::is_none")]
    pub approved_script_signatures: Option<Vec<String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawCpfJob {
    #[serde(rename = "JenkinsJobBasename", skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
    #[serde(rename = "Repository", skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(rename = "ResultRepository", skip_serializing_if = "Option::is_none")]
    pub result_repository: Option<String>,
    #[serde(rename = "WebServerConfig", skip_serializing_if = "Option::is_none")]
    pub webserver: Option<RawWebServer>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawWebServer {
    #[serde(rename = "MachineID", skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(rename = "HostHTMLShare", skip_serializing_if = "Option::is_none")]
    pub html_share: Option<String>,
}

/// A present, non-empty string value or a `MissingKey` error.
pub(crate) fn required(value: Option<String>, key: &str, context: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(FarmError::MissingKey { key: key.to_string(), context: context.to_string() }),
    }
}

/// A present value of any other type or a `MissingKey` error.
pub(crate) fn present<T>(value: Option<T>, key: &str, context: &str) -> Result<T> {
    value.ok_or_else(|| FarmError::MissingKey { key: key.to_string(), context: context.to_string() })
}

// ============================================================================
// Extracted (pass a) document
// ============================================================================

struct Extracted {
    version: String,
    hosts: Vec<HostMachineInfo>,
    master_machine: String,
    master_share: String,
    ssh_repos: Vec<SshRepositoryHostConfig>,
    https_repos: Vec<HttpsRepositoryHostConfig>,
    slaves: Vec<SlaveEntry>,
    use_unconfigured_jenkins: bool,
    admin_user: String,
    admin_user_password: String,
    account_config_files: Vec<ConfigItem>,
    job_config_files: Vec<ConfigItem>,
    jobs: Vec<JobEntry>,
    approved_system_commands: Vec<String>,
    approved_script_signatures: Vec<String>,
}

/// Parser for farm config documents.
pub struct ConfigParser;

impl ConfigParser {
    /// Parse a farm config document from a string.
    ///
    /// Relative xml file paths are kept as written.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The JSON is invalid
    /// - A required key is missing or empty (`MissingKey`)
    /// - The topology breaks one of the farm rules (`ConfigInvalid`)
    #[instrument(skip(content))]
    pub fn parse(content: &str) -> Result<ConfigData> {
        Self::parse_with_base(content, None)
    }

    /// Parse a config file. Relative xml paths resolve against its directory.
    #[instrument]
    pub fn parse_file<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<ConfigData> {
        let path = path.as_ref();
        info!("Reading farm config from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| FarmError::FileReadError {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;

        Self::parse_with_base(&content, path.parent())
    }

    fn parse_with_base(content: &str, base_dir: Option<&Path>) -> Result<ConfigData> {
        let raw: RawDocument = serde_json::from_str(content)
            .map_err(|e| FarmError::config(format!("malformed JSON: {}", e)))?;

        let extracted = Self::extract(raw, base_dir)?;
        Self::validate(&extracted)?;
        let config = Self::derive(extracted)?;

        info!(
            hosts = config.host_machines.len(),
            containers = config.container_hosts.len(),
            "Farm config validated"
        );
        Ok(config)
    }

    // ------------------------------------------------------------------------
    // Pass (a): field extraction
    // ------------------------------------------------------------------------

    fn extract(raw: RawDocument, base_dir: Option<&Path>) -> Result<Extracted> {
        let version = required(raw.version, "CIFarmVersion", "document root")?;

        let hosts = present(raw.host_machines, "HostMachines", "document root")?
            .into_iter()
            .enumerate()
            .map(|(i, h)| Self::extract_host(h, &format!("HostMachines[{}]", i)))
            .collect::<Result<Vec<_>>>()?;

        let master = present(raw.jenkins_master_host, "JenkinsMasterHost", "document root")?;
        let master_machine = required(master.machine_id, "MachineID", "JenkinsMasterHost")?;
        let master_share = required(master.share, "HostJenkinsMasterShare", "JenkinsMasterHost")?;

        let ssh_repos = raw
            .ssh_repository_hosts
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                let context = format!("SSHRepositoryHosts[{}]", i);
                Ok(SshRepositoryHostConfig {
                    machine_id: required(r.machine_id, "MachineID", &context)?,
                    ssh_dir: required(r.ssh_dir, "SSHDir", &context)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let https_repos = raw
            .https_repository_hosts
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                let context = format!("HTTPSRepositoryHosts[{}]", i);
                Ok(HttpsRepositoryHostConfig {
                    host: required(r.host, "Host", &context)?,
                    user: required(r.user, "User", &context)?,
                    password: required(r.password, "Password", &context)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let slaves = present(raw.jenkins_slaves, "JenkinsSlaves", "document root")?
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                let context = format!("JenkinsSlaves[{}]", i);
                Ok(SlaveEntry {
                    machine_id: required(s.machine_id, "MachineID", &context)?,
                    executors: Self::executors(present(s.executors, "Executors", &context)?, &context)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let jenkins = present(raw.jenkins_config, "JenkinsConfig", "document root")?;
        let context = "JenkinsConfig";
        let use_unconfigured_jenkins =
            present(jenkins.use_unconfigured_jenkins, "UseUnconfiguredJenkins", context)?;
        let admin_user = required(jenkins.admin_user, "JenkinsAdminUser", context)?;
        let admin_user_password =
            required(jenkins.admin_user_password, "JenkinsAdminUserPassword", context)?;
        let account_config_files = Self::config_items(
            present(jenkins.account_config_files, "JenkinsAccountConfigFiles", context)?,
            base_dir,
        );
        let job_config_files = Self::config_items(
            present(jenkins.job_config_files, "JenkinsJobConfigFiles", context)?,
            base_dir,
        );

        let jobs = present(jenkins.cpf_jobs, "CPFJobs", context)?
            .into_iter()
            .enumerate()
            .map(|(i, j)| {
                let context = format!("CPFJobs[{}]", i);
                let webserver = match j.webserver {
                    Some(w) => {
                        let context = format!("{}.WebServerConfig", context);
                        Some((
                            required(w.machine_id, "MachineID", &context)?,
                            required(w.html_share, "HostHTMLShare", &context)?,
                        ))
                    }
                    None => None,
                };
                Ok(JobEntry {
                    base_name: required(j.base_name, "JenkinsJobBasename", &context)?,
                    repository: required(j.repository, "Repository", &context)?,
                    result_repository: j.result_repository.filter(|r| !r.trim().is_empty()),
                    webserver,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Extracted {
            version,
            hosts,
            master_machine,
            master_share,
            ssh_repos,
            https_repos,
            slaves,
            use_unconfigured_jenkins,
            admin_user,
            admin_user_password,
            account_config_files,
            job_config_files,
            jobs,
            approved_system_commands: jenkins.approved_system_commands.unwrap_or_default(),
            approved_script_signatures: jenkins.approved_script_signatures.unwrap_or_default(),
        })
    }

    pub(crate) fn extract_host(raw: RawHostMachine, context: &str) -> Result<HostMachineInfo> {
        let machine_id = required(raw.machine_id, "MachineID", context)?;
        let host_name = required(raw.host_name, "HostNameOrIP", context)?;
        let user_name = required(raw.user, "User", context)?;
        let os_type: OsType = required(raw.os_type, "OSType", context)?.parse()?;
        let temp_dir = raw
            .temp_dir
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| os_type.default_temp_dir().to_string());

        Ok(HostMachineInfo {
            machine_id,
            host_name,
            user_name,
            user_password: raw.password.unwrap_or_default(),
            os_type,
            temp_dir,
        })
    }

    fn executors(value: Executors, context: &str) -> Result<u32> {
        let number = match value {
            Executors::Number(n) => n,
            Executors::Text(s) => {
                if s.trim().is_empty() {
                    return Err(FarmError::MissingKey {
                        key: "Executors".to_string(),
                        context: context.to_string(),
                    });
                }
                s.trim().parse::<i64>().map_err(|_| {
                    FarmError::config(format!("{}: Executors value \"{}\" is not a number", context, s))
                })?
            }
        };
        // Negative counts are reported like zero: both are rejected in pass (b).
        Ok(u32::try_from(number).unwrap_or(0))
    }

    fn config_items(items: BTreeMap<String, String>, base_dir: Option<&Path>) -> Vec<ConfigItem> {
        items
            .into_iter()
            .map(|(name, file)| {
                let file = PathBuf::from(file);
                let xml_file = match base_dir {
                    Some(dir) if file.is_relative() => dir.join(file),
                    _ => file,
                };
                ConfigItem { name, xml_file }
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Pass (b): cross-entity validation
    // ------------------------------------------------------------------------

    fn validate(doc: &Extracted) -> Result<()> {
        Self::check_file_version(doc)?;
        Self::check_one_linux_machine_available(doc)?;
        Self::check_master_uses_linux_machine(doc)?;
        Self::check_host_ids_are_unique(doc)?;
        Self::check_accounts_are_unique(doc)?;
        Self::check_references_are_declared(doc)?;
        Self::check_webservers_use_linux_machines(doc)?;
        Self::check_all_hosts_are_in_use(doc)?;
        Self::check_slave_executor_number(doc)?;
        Self::check_job_names_are_unique(doc)?;
        debug!("Farm config passed validation");
        Ok(())
    }

    fn check_file_version(doc: &Extracted) -> Result<()> {
        if doc.version != CONFIG_FILE_VERSION {
            return Err(FarmError::config(format!(
                "config file version {} does not match the tool version {}",
                doc.version, CONFIG_FILE_VERSION
            )));
        }
        Ok(())
    }

    fn os_of<'a>(doc: &'a Extracted, machine_id: &str) -> Option<&'a OsType> {
        doc.hosts.iter().find(|h| h.machine_id == machine_id).map(|h| &h.os_type)
    }

    fn check_one_linux_machine_available(doc: &Extracted) -> Result<()> {
        if !doc.hosts.iter().any(HostMachineInfo::is_linux) {
            return Err(FarmError::config("at least one host in HostMachines must be a Linux machine"));
        }
        Ok(())
    }

    fn check_master_uses_linux_machine(doc: &Extracted) -> Result<()> {
        match Self::os_of(doc, &doc.master_machine) {
            Some(OsType::Windows) => Err(FarmError::config(format!(
                "the Jenkins master host \"{}\" must be a Linux machine",
                doc.master_machine
            ))),
            // Undeclared ids are reported by the reference check.
            _ => Ok(()),
        }
    }

    fn check_host_ids_are_unique(doc: &Extracted) -> Result<()> {
        let mut seen = HashSet::new();
        for host in &doc.hosts {
            if !seen.insert(host.machine_id.as_str()) {
                return Err(FarmError::config(format!(
                    "host machine id \"{}\" appears more than once in HostMachines",
                    host.machine_id
                )));
            }
        }
        Ok(())
    }

    fn check_accounts_are_unique(doc: &Extracted) -> Result<()> {
        let mut seen = HashSet::new();
        for host in &doc.hosts {
            if !seen.insert((host.user_name.as_str(), host.host_name.as_str())) {
                return Err(FarmError::config(format!(
                    "the account {} appears more than once in HostMachines",
                    host.ssh_destination()
                )));
            }
        }
        Ok(())
    }

    /// Every machine id used by a role, tagged with the role for messages.
    fn referenced_machines(doc: &Extracted) -> Vec<(&str, &'static str)> {
        let mut used = vec![(doc.master_machine.as_str(), "JenkinsMasterHost")];
        used.extend(doc.ssh_repos.iter().map(|r| (r.machine_id.as_str(), "SSHRepositoryHosts")));
        used.extend(doc.slaves.iter().map(|s| (s.machine_id.as_str(), "JenkinsSlaves")));
        used.extend(
            doc.jobs
                .iter()
                .filter_map(|j| j.webserver.as_ref())
                .map(|(machine, _)| (machine.as_str(), "WebServerConfig")),
        );
        used
    }

    fn check_references_are_declared(doc: &Extracted) -> Result<()> {
        for (machine_id, role) in Self::referenced_machines(doc) {
            if Self::os_of(doc, machine_id).is_none() {
                return Err(FarmError::config(format!(
                    "{} references machine \"{}\" which is not declared in HostMachines",
                    role, machine_id
                )));
            }
        }
        Ok(())
    }

    fn check_webservers_use_linux_machines(doc: &Extracted) -> Result<()> {
        for job in &doc.jobs {
            if let Some((machine_id, _)) = &job.webserver {
                if Self::os_of(doc, machine_id) != Some(&OsType::Linux) {
                    return Err(FarmError::config(format!(
                        "the web-server host \"{}\" of job {} is not a Linux machine",
                        machine_id, job.base_name
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_all_hosts_are_in_use(doc: &Extracted) -> Result<()> {
        let used: HashSet<&str> = Self::referenced_machines(doc).into_iter().map(|(m, _)| m).collect();
        for host in &doc.hosts {
            if !used.contains(host.machine_id.as_str()) {
                return Err(FarmError::config(format!(
                    "the host machine \"{}\" is not used by any role",
                    host.machine_id
                )));
            }
        }
        Ok(())
    }

    fn check_slave_executor_number(doc: &Extracted) -> Result<()> {
        for slave in &doc.slaves {
            if slave.executors < 1 {
                return Err(FarmError::config(format!(
                    "Executors of the agent on \"{}\" must be larger than zero",
                    slave.machine_id
                )));
            }
        }
        Ok(())
    }

    fn check_job_names_are_unique(doc: &Extracted) -> Result<()> {
        let mut seen = HashSet::new();
        for job in &doc.jobs {
            if !seen.insert(job.base_name.as_str()) {
                return Err(FarmError::config(format!(
                    "JenkinsJobBasename \"{}\" is used by more than one CPF job",
                    job.base_name
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Derivation
    // ------------------------------------------------------------------------

    fn derive(doc: Extracted) -> Result<ConfigData> {
        let mut ports = PortAllocator::new();

        let jenkins_master_host = derive::derive_master(
            &doc.master_machine,
            &doc.master_share,
            !doc.use_unconfigured_jenkins,
            &mut ports,
        );
        let jenkins_slaves = derive::derive_slaves(&doc.slaves, &doc.hosts, &mut ports)?;
        let cpf_jobs = derive::derive_jobs(doc.jobs, &mut ports)?;

        let container_hosts =
            derive::build_container_index(&jenkins_master_host, &jenkins_slaves, &cpf_jobs)?;

        let config = ConfigData {
            version: doc.version,
            host_machines: doc.hosts,
            jenkins_master_host,
            ssh_repository_hosts: doc.ssh_repos,
            https_repository_hosts: doc.https_repos,
            jenkins_slaves,
            jenkins_config: JenkinsConfig {
                use_unconfigured_jenkins: doc.use_unconfigured_jenkins,
                admin_user: doc.admin_user,
                admin_user_password: doc.admin_user_password,
                account_config_files: doc.account_config_files,
                job_config_files: doc.job_config_files,
                cpf_jobs,
                approved_system_commands: doc.approved_system_commands,
                approved_script_signatures: doc.approved_script_signatures,
            },
            container_hosts,
        };

        derive::check_ports_disjoint(&config.all_containers(), &config.container_hosts)?;
        Ok(config)
    }
}
