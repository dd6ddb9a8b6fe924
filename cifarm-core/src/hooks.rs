//! Git `post-receive` hooks that trigger CPF build jobs.
//!
//! A push into a hooked repository calls the job's `buildWithParameters`
//! endpoint, passing the package the repository belongs to.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, instrument};

use crate::config::parser::{present, required, RawHostMachine};
use crate::config::{ConfigParser, HostMachineInfo};
use crate::connection::{quote, ConnectionPool, RemoteHost};
use crate::error::{FarmError, Result};
use crate::jenkins::files::render_template;

/// Used when the assets directory brings no `hooks/post-receive.in`.
pub const DEFAULT_POST_RECEIVE_TEMPLATE: &str = r#"#!/bin/sh
# Installed by cifarm. Triggers @JENKINS_JOB_NAME@ for every pushed ref.
while read oldrev newrev refname
do
    curl --silent --show-error --fail --request POST \
        --user "@JENKINS_USER@:@JENKINS_PASSWORD@" \
        --data-urlencode "CPF_PACKAGE=@CPF_PACKAGE@" \
        --data-urlencode "REF=$refname" \
        "@JENKINS_URL@/job/@JENKINS_JOB_NAME@/buildWithParameters"
done
"#;

#[derive(Debug, Default, Deserialize)]
struct RawHookDocument {
    #[serde(rename = "JenkinsAccount")]
    jenkins_account: Option<RawJenkinsAccount>,
    #[serde(rename = "RepositoryMachines")]
    repository_machines: Option<Vec<RawHostMachine>>,
    #[serde(rename = "CPFBuildJobs")]
    build_jobs: Option<Vec<RawBuildJob>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawJenkinsAccount {
    #[serde(rename = "JenkinsUrl")]
    url: Option<String>,
    #[serde(rename = "JenkinsUser")]
    user: Option<String>,
    #[serde(rename = "JenkinsPassword")]
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBuildJob {
    #[serde(rename = "JenkinsJobBasename")]
    base_name: Option<String>,
    #[serde(rename = "HookedRepositories")]
    hooked_repositories: Option<Vec<RawHookedRepository>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawHookedRepository {
    #[serde(rename = "MachineID")]
    machine_id: Option<String>,
    #[serde(rename = "HookDirectory")]
    hook_directory: Option<String>,
    #[serde(rename = "BuildJobPackageArg")]
    package_arg: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct JenkinsAccount {
    pub url: String,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for JenkinsAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JenkinsAccount")
            .field("url", &self.url)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// One hook to install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    pub job_base_name: String,
    pub machine_id: String,
    pub hook_directory: String,
    /// Package the build job should update; empty for the build repository itself.
    pub package_arg: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfigData {
    pub jenkins_account: JenkinsAccount,
    pub repository_machines: Vec<HostMachineInfo>,
    pub hooks: Vec<HookConfig>,
}

impl HookConfigData {
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawHookDocument = serde_json::from_str(content)
            .map_err(|e| FarmError::config(format!("malformed JSON: {}", e)))?;

        let account = present(raw.jenkins_account, "JenkinsAccount", "document root")?;
        let jenkins_account = JenkinsAccount {
            url: required(account.url, "JenkinsUrl", "JenkinsAccount")?
                .trim_end_matches('/')
                .to_string(),
            user: required(account.user, "JenkinsUser", "JenkinsAccount")?,
            password: required(account.password, "JenkinsPassword", "JenkinsAccount")?,
        };

        let repository_machines =
            present(raw.repository_machines, "RepositoryMachines", "document root")?
                .into_iter()
                .enumerate()
                .map(|(i, host)| {
                    ConfigParser::extract_host(host, &format!("RepositoryMachines[{}]", i))
                })
                .collect::<Result<Vec<_>>>()?;

        let build_jobs = present(raw.build_jobs, "CPFBuildJobs", "document root")?;
        let mut hooks = Vec::new();
        for (i, job) in build_jobs.into_iter().enumerate() {
            let context = format!("CPFBuildJobs[{}]", i);
            let job_base_name = required(job.base_name, "JenkinsJobBasename", &context)?;
            let repositories = present(job.hooked_repositories, "HookedRepositories", &context)?;
            for (j, repository) in repositories.into_iter().enumerate() {
                let context = format!("{}.HookedRepositories[{}]", context, j);
                hooks.push(HookConfig {
                    job_base_name: job_base_name.clone(),
                    machine_id: required(repository.machine_id, "MachineID", &context)?,
                    hook_directory: required(repository.hook_directory, "HookDirectory", &context)?
                        .replace('\\', "/"),
                    package_arg: repository.package_arg.unwrap_or_default(),
                });
            }
        }

        let data = Self { jenkins_account, repository_machines, hooks };
        data.validate()?;
        Ok(data)
    }

    #[instrument]
    pub fn parse_file<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Reading hook config from {:?}", path);
        let content = std::fs::read_to_string(path).map_err(|e| FarmError::FileReadError {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;
        Self::parse(&content)
    }

    fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for host in &self.repository_machines {
            if !ids.insert(host.machine_id.as_str()) {
                return Err(FarmError::config(format!(
                    "RepositoryMachines: machine id \"{}\" is used more than once",
                    host.machine_id
                )));
            }
        }
        for hook in &self.hooks {
            if !ids.contains(hook.machine_id.as_str()) {
                return Err(FarmError::config(format!(
                    "hook of job \"{}\" uses undeclared machine \"{}\"",
                    hook.job_base_name, hook.machine_id
                )));
            }
        }
        Ok(())
    }
}

/// The hook script for one hooked repository.
pub fn render_hook(template: &str, account: &JenkinsAccount, hook: &HookConfig) -> String {
    render_template(
        template,
        &[
            ("@JENKINS_URL@", account.url.as_str()),
            ("@JENKINS_USER@", account.user.as_str()),
            ("@JENKINS_PASSWORD@", account.password.as_str()),
            ("@JENKINS_JOB_NAME@", hook.job_base_name.as_str()),
            ("@CPF_PACKAGE@", hook.package_arg.as_str()),
        ],
    )
}

/// Load `hooks/post-receive.in` from the assets, or the built-in template.
pub fn load_template(assets_dir: &Path) -> Result<String> {
    let path = assets_dir.join("hooks").join("post-receive.in");
    if !path.is_file() {
        return Ok(DEFAULT_POST_RECEIVE_TEMPLATE.to_string());
    }
    std::fs::read_to_string(&path).map_err(|e| FarmError::FileReadError {
        path: path.to_string_lossy().to_string(),
        source: e,
    })
}

/// Install every hook of `data` through the open sessions.
///
/// `on_deployed` is called after each installed hook. The first failure
/// stops the deployment.
#[instrument(skip_all, fields(hooks = data.hooks.len()))]
pub async fn deploy_hooks<F>(
    data: &HookConfigData,
    pool: &ConnectionPool,
    template: &str,
    mut on_deployed: F,
) -> Result<()>
where
    F: FnMut(&HookConfig),
{
    for hook in &data.hooks {
        let host = pool.get(&hook.machine_id)?;
        deploy_hook(host, &data.jenkins_account, hook, template).await?;
        on_deployed(hook);
    }
    Ok(())
}

pub async fn deploy_hook(
    host: &dyn RemoteHost,
    account: &JenkinsAccount,
    hook: &HookConfig,
    template: &str,
) -> Result<()> {
    let target = format!("{}/post-receive", hook.hook_directory.trim_end_matches('/'));
    info!("Installing {} on {}", target, host.machine_id());
    host.upload_contents(&render_hook(template, account, hook), &target).await?;
    if host.info().is_linux() {
        host.run(&format!("chmod +x {}", quote(&target))).await?;
    }
    Ok(())
}
