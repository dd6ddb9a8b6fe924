//! Files written into the master's home share.
//!
//! The share mirrors `/var/jenkins_home`:
//!
//! ```text
//! nodes/<agent name>/config.xml
//! users/<user>/config.xml
//! jobs/<job>/config.xml
//! ```
//!
//! Jenkins reads them on its next start; cifarm never reads them back.

use crate::config::{ConfigData, CpfJobConfig, JenkinsSlaveConfig, OsType};
use crate::error::Result;
use crate::ports::PORT_SSH;

/// Credentials entry the agents' ssh launchers authenticate with. It has to
/// be defined by the general Jenkins option files.
pub const NODE_CREDENTIALS_ID: &str = "cifarm-master-ssh-key";

/// Agent work directory on Windows hosts.
pub const WINDOWS_AGENT_REMOTE_FS: &str = "C:/jenkins";

const NODE_TEMPLATE: &str = r#"<?xml version='1.1' encoding='UTF-8'?>
<slave>
  <name>$NAME</name>
  <description>$DESCRIPTION</description>
  <remoteFS>$REMOTE_FS</remoteFS>
  <numExecutors>$EXECUTORS</numExecutors>
  <mode>NORMAL</mode>
  <retentionStrategy class="hudson.slaves.RetentionStrategy$Always"/>
  <launcher class="hudson.plugins.sshslaves.SSHLauncher" plugin="ssh-slaves">
    <host>$HOST</host>
    <port>$PORT</port>
    <credentialsId>$CREDENTIALS_ID</credentialsId>
    <sshHostKeyVerificationStrategy class="hudson.plugins.sshslaves.verifiers.KnownHostsFileKeyVerificationStrategy"/>
  </launcher>
  <label>$LABEL</label>
  <nodeProperties/>
</slave>
"#;

pub fn node_config_path(share: &str, slave_name: &str) -> String {
    format!("{}/nodes/{}/config.xml", share, slave_name)
}

pub fn user_config_path(share: &str, user: &str) -> String {
    format!("{}/users/{}/config.xml", share, user)
}

pub fn job_config_path(share: &str, job: &str) -> String {
    format!("{}/jobs/{}/config.xml", share, job)
}

/// Replace every placeholder with its value in one pass over `template`.
///
/// Inserted values are never scanned again. Where two placeholders start at
/// the same position the longer one wins.
pub fn render_template(template: &str, replacements: &[(&str, &str)]) -> String {
    let mut text = String::with_capacity(template.len());
    let mut rest = template;
    loop {
        let next = replacements
            .iter()
            .filter(|(placeholder, _)| !placeholder.is_empty())
            .filter_map(|(placeholder, value)| {
                rest.find(placeholder).map(|at| (at, placeholder.len(), *value))
            })
            .min_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        match next {
            Some((at, len, value)) => {
                text.push_str(&rest[..at]);
                text.push_str(value);
                rest = &rest[at + len..];
            }
            None => {
                text.push_str(rest);
                return text;
            }
        }
    }
}

pub fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// `config.xml` of an agent node, launched over ssh from the master.
pub fn node_config_xml(config: &ConfigData, slave: &JenkinsSlaveConfig) -> Result<String> {
    let host = config.host_info(&slave.machine_id)?;
    let (remote_fs, port, label) = match (&slave.container, host.os_type) {
        (Some(container), _) => (
            container.home_directory.clone(),
            container.host_port_for(PORT_SSH).unwrap_or(PORT_SSH),
            "linux",
        ),
        (None, OsType::Windows) => (WINDOWS_AGENT_REMOTE_FS.to_string(), PORT_SSH, "windows"),
        (None, OsType::Linux) => (format!("/home/{}", host.user_name), PORT_SSH, "linux"),
    };
    let name = xml_escape(&slave.slave_name);
    let description = xml_escape(&format!("Build agent on {}", host.machine_id));
    let remote_fs = xml_escape(&remote_fs);
    let executors = slave.executors.to_string();
    let host_name = xml_escape(&host.host_name);
    let port = port.to_string();

    Ok(render_template(
        NODE_TEMPLATE,
        &[
            ("$NAME", name.as_str()),
            ("$DESCRIPTION", description.as_str()),
            ("$REMOTE_FS", remote_fs.as_str()),
            ("$EXECUTORS", executors.as_str()),
            ("$HOST", host_name.as_str()),
            ("$PORT", port.as_str()),
            ("$CREDENTIALS_ID", NODE_CREDENTIALS_ID),
            ("$LABEL", label),
        ],
    ))
}

/// Values for the CPF job template placeholders.
pub struct JobTemplateValues<'a> {
    /// Repository holding the pipeline's Jenkinsfile; the build repository when `None`.
    pub jenkinsjob_repository: Option<&'a str>,
    pub tag_or_branch: &'a str,
}

/// `config.xml` of a CPF pipeline job rendered from `template`.
///
/// Placeholders: `$JOB_NAME`, `$JENKINSFILE_TAG_OR_BRANCH`,
/// `$BUILD_REPOSITORY`, `$JENKINSJOB_REPOSITORY`, `$RESULT_REPOSITORY`,
/// `$WEBSERVER_HOST`, `$WEBSERVER_SSH_PORT`, `$WEBSERVER_WEB_PORT`.
pub fn cpf_job_config_xml(
    template: &str,
    config: &ConfigData,
    job: &CpfJobConfig,
    values: &JobTemplateValues<'_>,
) -> Result<String> {
    let (webserver_host, ssh_port, web_port) = match &job.webserver {
        Some(webserver) => (
            config.host_info(&webserver.machine_id)?.host_name.clone(),
            webserver.container_ssh_port.to_string(),
            webserver.container_web_port.to_string(),
        ),
        None => (String::new(), String::new(), String::new()),
    };
    let job_name = xml_escape(&job.base_name);
    let tag_or_branch = xml_escape(values.tag_or_branch);
    let build_repository = xml_escape(&job.repository);
    let jenkinsjob_repository =
        xml_escape(values.jenkinsjob_repository.unwrap_or(&job.repository));
    let result_repository = xml_escape(job.result_repository.as_deref().unwrap_or(""));
    let webserver_host = xml_escape(&webserver_host);

    Ok(render_template(
        template,
        &[
            ("$JOB_NAME", job_name.as_str()),
            ("$JENKINSFILE_TAG_OR_BRANCH", tag_or_branch.as_str()),
            ("$BUILD_REPOSITORY", build_repository.as_str()),
            ("$JENKINSJOB_REPOSITORY", jenkinsjob_repository.as_str()),
            ("$RESULT_REPOSITORY", result_repository.as_str()),
            ("$WEBSERVER_HOST", webserver_host.as_str()),
            ("$WEBSERVER_SSH_PORT", ssh_port.as_str()),
            ("$WEBSERVER_WEB_PORT", web_port.as_str()),
        ],
    ))
}
