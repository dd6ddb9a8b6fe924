//! Example farm config document.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use super::parser::*;
use super::types::CONFIG_FILE_VERSION;
use crate::error::{FarmError, Result};

fn host(id: &str, name: &str, password: Option<&str>, os: &str, temp: &str) -> RawHostMachine {
    RawHostMachine {
        machine_id: Some(id.to_string()),
        host_name: Some(name.to_string()),
        user: Some("fritz".to_string()),
        password: password.map(str::to_string),
        os_type: Some(os.to_string()),
        temp_dir: Some(temp.to_string()),
    }
}

fn job(name: &str, repository: &str, html_share: &str) -> RawCpfJob {
    RawCpfJob {
        base_name: Some(name.to_string()),
        repository: Some(repository.to_string()),
        result_repository: None,
        webserver: Some(RawWebServer {
            machine_id: Some("MyMaster".to_string()),
            html_share: Some(html_share.to_string()),
        }),
    }
}

/// A valid document with one master host, one Linux agent host and one
/// Windows agent host, plus two CPF jobs with their own web-servers.
pub fn example_document() -> Result<String> {
    let document = RawDocument {
        version: Some(CONFIG_FILE_VERSION.to_string()),
        host_machines: Some(vec![
            host("MyMaster", "lhost3", Some("1234password"), "Linux", "/home/fritz/temp"),
            host("MyLinuxSlave", "192.168.0.5", Some("1234password"), "Linux", "/home/fritz/temp"),
            host("MyWindowsSlave", "whost12", None, "Windows", "C:/temp"),
        ]),
        jenkins_master_host: Some(RawMasterHost {
            machine_id: Some("MyMaster".to_string()),
            share: Some("/home/fritz/jenkins_home".to_string()),
        }),
        ssh_repository_hosts: Some(vec![RawSshRepositoryHost {
            machine_id: Some("MyMaster".to_string()),
            ssh_dir: Some("/home/fritz/.ssh".to_string()),
        }]),
        https_repository_hosts: Some(vec![]),
        jenkins_slaves: Some(vec![
            RawSlave {
                machine_id: Some("MyLinuxSlave".to_string()),
                executors: Some(Executors::Text("2".to_string())),
            },
            RawSlave {
                machine_id: Some("MyMaster".to_string()),
                executors: Some(Executors::Text("1".to_string())),
            },
            RawSlave {
                machine_id: Some("MyWindowsSlave".to_string()),
                executors: Some(Executors::Text("1".to_string())),
            },
        ]),
        jenkins_config: Some(RawJenkinsConfig {
            use_unconfigured_jenkins: Some(false),
            admin_user: Some("fritz".to_string()),
            admin_user_password: Some("1234password".to_string()),
            account_config_files: Some(BTreeMap::from([(
                "hans".to_string(),
                "UserHans.xml".to_string(),
            )])),
            job_config_files: Some(BTreeMap::from([(
                "MyCustomJob".to_string(),
                "MyCustomJob.xml".to_string(),
            )])),
            cpf_jobs: Some(vec![
                job("MyCPFProject", "ssh://fritz@lhost3/home/fritz/repos/BuildCPF.git", "/home/fritz/cpf_html"),
                job("MyOtherProject", "ssh://fritz@lhost3/home/fritz/repos/Other.git", "/home/fritz/other_html"),
            ]),
            approved_system_commands: Some(vec!["ssh bla blub".to_string()]),
            approved_script_signatures: Some(vec![
                "<script signature from my MyCustomJob jenkinsfile>".to_string(),
            ]),
        }),
    };

    serde_json::to_string_pretty(&document)
        .map_err(|e| FarmError::Internal(format!("failed to serialize example config: {}", e)))
}

/// Write [`example_document`] to `path`.
pub fn write_example_config_file(path: &Path) -> Result<()> {
    let content = example_document()?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| FarmError::io(parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| FarmError::io(path, e))?;
    info!("Wrote example farm config to {:?}", path);
    Ok(())
}
