//! Full provisioning run.
//!
//! A run is four phases executed in order on the already opened sessions:
//!
//! 1. teardown of everything a previous run left behind,
//! 2. image builds and container starts,
//! 3. ssh trust between the containers and the hosts they talk to,
//! 4. Jenkins configuration (skipped for an unconfigured Jenkins).
//!
//! Each phase is idempotent on its own, so a failed run is fixed by running
//! the whole thing again.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::config::{ConfigData, ConfigItem, ContainerConfig};
use crate::connection::{quote, remote_parent, ConnectionPool, RemoteHost};
use crate::docker;
use crate::error::{FarmError, Result};
use crate::jenkins::{self, files, JenkinsRestAccessor};
use crate::ports::MASTER_WEB_PORT;
use crate::settings::Settings;
use crate::trust::{TrustClient, TrustProvisioner, TrustServer};

const GIT_USER_EMAIL: &str = "not@valid.org";
const GIT_USER_NAME: &str = "jenkins";

pub struct Orchestrator<'a> {
    config: &'a ConfigData,
    pool: &'a ConnectionPool,
    settings: &'a Settings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(config: &'a ConfigData, pool: &'a ConnectionPool, settings: &'a Settings) -> Self {
        Self { config, pool, settings }
    }

    /// Run all phases.
    #[instrument(skip_all)]
    pub async fn run(&self) -> Result<()> {
        info!("Phase 1/4: removing previous farm");
        self.teardown().await?;

        info!("Phase 2/4: building and starting containers");
        self.build_and_start().await?;

        info!("Phase 3/4: provisioning ssh trust");
        self.provision_trust().await?;

        if self.config.jenkins_config.use_unconfigured_jenkins {
            info!("Phase 4/4: skipped, Jenkins stays unconfigured");
        } else {
            info!("Phase 4/4: configuring Jenkins");
            self.configure_jenkins().await?;
        }

        info!("Farm is up");
        Ok(())
    }

    fn host_of(&self, container: &ContainerConfig) -> Result<&'a dyn RemoteHost> {
        self.pool.get(self.config.get_container_host(&container.container_name)?)
    }

    fn master_host(&self) -> Result<&'a dyn RemoteHost> {
        self.pool.get(&self.config.jenkins_master_host.machine_id)
    }

    // ========================================================================
    // Phase 1
    // ========================================================================

    /// Remove all farm containers and networks and clear the master's share.
    #[instrument(skip_all)]
    pub async fn teardown(&self) -> Result<()> {
        for container in self.config.all_containers() {
            docker::stop_and_remove(self.host_of(container)?, &container.container_name).await?;
        }
        for machine_id in self.config.container_machines() {
            let host = self.pool.get(machine_id)?;
            docker::remove_network_if_present(host, &self.settings.network_name).await?;
        }

        let share = &self.config.jenkins_master_host.jenkins_home_share;
        info!("Clearing {}", share);
        self.master_host()?.run(&format!("rm -rf {0} && mkdir -p {0}", quote(share))).await?;
        Ok(())
    }

    // ========================================================================
    // Phase 2
    // ========================================================================

    /// Build the images and start master, web-servers and Linux agents.
    #[instrument(skip_all)]
    pub async fn build_and_start(&self) -> Result<()> {
        for machine_id in self.config.container_machines() {
            docker::create_network(self.pool.get(machine_id)?, &self.settings.network_name).await?;
        }

        // Agents on one machine share their image.
        let mut built = BTreeSet::new();

        let master = &self.config.jenkins_master_host.container;
        self.start_container(master, &mut built).await?;
        self.configure_git_user(master).await?;

        for webserver in self.config.webservers() {
            self.start_container(&webserver.container, &mut built).await?;
        }

        for slave in self.config.linux_slaves() {
            if let Some(container) = &slave.container {
                self.start_container(container, &mut built).await?;
                self.configure_git_user(container).await?;
            }
        }
        Ok(())
    }

    async fn start_container(
        &self,
        container: &ContainerConfig,
        built: &mut BTreeSet<(String, String)>,
    ) -> Result<()> {
        let host = self.host_of(container)?;
        let key = (host.machine_id().to_string(), container.container_image_name.clone());
        if !built.contains(&key) {
            self.build_image(host, container).await?;
            built.insert(key);
        }
        let resolved = self.farm_host_addresses(host).await?;
        docker::run_detached(host, container, &self.settings.network_name, &resolved).await
    }

    async fn build_image(&self, host: &dyn RemoteHost, container: &ContainerConfig) -> Result<()> {
        let image = &container.container_image_name;
        if !self.settings.rebuild_images && docker::image_exists(host, image).await? {
            info!("Reusing image {} on {}", image, host.machine_id());
            return Ok(());
        }
        let context = self.settings.image_context_dir(image);
        if !context.join("Dockerfile").is_file() {
            return Err(FarmError::FileReadError {
                path: context.join("Dockerfile").to_string_lossy().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        docker::build_image(host, container, &context, &[]).await
    }

    /// Addresses of all farm hosts as the given host resolves them.
    async fn farm_host_addresses(&self, host: &dyn RemoteHost) -> Result<Vec<(String, IpAddr)>> {
        let names: Vec<&str> =
            self.config.host_machines.iter().map(|h| h.host_name.as_str()).collect();
        docker::resolve_host_names(host, &names).await
    }

    async fn configure_git_user(&self, container: &ContainerConfig) -> Result<()> {
        let script = format!(
            "git config --global user.email {} && git config --global user.name {}",
            quote(GIT_USER_EMAIL),
            quote(GIT_USER_NAME)
        );
        docker::exec(
            self.host_of(container)?,
            &container.container_name,
            &script,
            Some(&container.container_user),
        )
        .await?;
        Ok(())
    }

    // ========================================================================
    // Phase 3
    // ========================================================================

    /// Create key pairs and register them where the containers log in.
    #[instrument(skip_all)]
    pub async fn provision_trust(&self) -> Result<()> {
        let trust = TrustProvisioner::new(self.config, self.pool);
        let master_config = &self.config.jenkins_master_host;
        let master = TrustClient {
            machine_id: &master_config.machine_id,
            container: &master_config.container,
        };

        trust.create_key_pair(master).await?;
        self.grant_repositories(&trust, master).await?;

        for slave in &self.config.jenkins_slaves {
            let server = match &slave.container {
                Some(container) => TrustServer::Container {
                    machine_id: &slave.machine_id,
                    container,
                    ssh_port: container_ssh_port(container)?,
                },
                None => TrustServer::WindowsHost { machine_id: &slave.machine_id },
            };
            trust.grant(master, server).await?;
        }
        self.grant_webservers(&trust, master).await?;

        let slaves: Vec<TrustClient<'_>> = self
            .config
            .linux_slaves()
            .filter_map(|s| {
                s.container.as_ref().map(|c| TrustClient { machine_id: &s.machine_id, container: c })
            })
            .collect();
        for slave in &slaves {
            trust.create_key_pair(*slave).await?;
        }
        for slave in &slaves {
            self.grant_repositories(&trust, *slave).await?;
        }
        for slave in &slaves {
            self.grant_webservers(&trust, *slave).await?;
        }

        let https = &self.config.https_repository_hosts;
        trust.grant_https_access(master, https).await?;
        for slave in &slaves {
            trust.grant_https_access(*slave, https).await?;
        }
        Ok(())
    }

    async fn grant_repositories(
        &self,
        trust: &TrustProvisioner<'_>,
        client: TrustClient<'_>,
    ) -> Result<()> {
        for repository in &self.config.ssh_repository_hosts {
            let server = TrustServer::HostAccount {
                machine_id: &repository.machine_id,
                ssh_dir: &repository.ssh_dir,
            };
            trust.grant(client, server).await?;
        }
        Ok(())
    }

    async fn grant_webservers(
        &self,
        trust: &TrustProvisioner<'_>,
        client: TrustClient<'_>,
    ) -> Result<()> {
        for webserver in self.config.webservers() {
            let server = TrustServer::Container {
                machine_id: &webserver.machine_id,
                container: &webserver.container,
                ssh_port: webserver.container_ssh_port,
            };
            trust.grant(client, server).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Phase 4
    // ========================================================================

    /// Write the Jenkins files, restart the master and approve scripts.
    #[instrument(skip_all)]
    pub async fn configure_jenkins(&self) -> Result<()> {
        self.write_jenkins_files().await?;

        let master = &self.config.jenkins_master_host.container;
        let host = self.master_host()?;
        info!("Restarting {}", master.container_name);
        docker::restart(host, &master.container_name).await?;

        let jenkins = &self.config.jenkins_config;
        let url = format!("http://{}:{}", host.info().host_name, MASTER_WEB_PORT);
        let rest =
            JenkinsRestAccessor::new(&url, &jenkins.admin_user, &jenkins.admin_user_password)?;
        rest.wait_until_online(
            self.settings.online_initial_delay(),
            self.settings.online_poll_interval(),
            self.settings.online_max_wait(),
        )
        .await?;

        rest.approve_system_commands(&jenkins.approved_system_commands).await?;
        rest.approve_script_signatures(&self.script_signatures()).await?;
        Ok(())
    }

    /// Configured signatures plus the ones CPF jobs need, without duplicates.
    pub fn script_signatures(&self) -> Vec<String> {
        let jenkins = &self.config.jenkins_config;
        let mut signatures = jenkins.approved_script_signatures.clone();
        if !jenkins.cpf_jobs.is_empty() {
            for signature in jenkins::CPF_JOB_SCRIPT_SIGNATURES {
                if !signatures.iter().any(|s| s == signature) {
                    signatures.push(signature.to_string());
                }
            }
        }
        signatures
    }

    /// Populate the master's share with option files, accounts, nodes and jobs.
    #[instrument(skip_all)]
    pub async fn write_jenkins_files(&self) -> Result<()> {
        let host = self.master_host()?;
        let share = self.config.jenkins_master_host.jenkins_home_share.as_str();
        let jenkins = &self.config.jenkins_config;

        let general = self.settings.jenkins_general_config_dir();
        if general.is_dir() {
            for file in collect_files(&general)? {
                let relative = file
                    .strip_prefix(&general)
                    .map_err(|e| FarmError::Internal(e.to_string()))?
                    .to_string_lossy()
                    .replace('\\', "/");
                upload_file(host, &file, &format!("{}/{}", share, relative)).await?;
            }
        } else {
            debug!("No general Jenkins option files in {}", general.display());
        }

        for account in &jenkins.account_config_files {
            upload_item(host, account, &files::user_config_path(share, &account.name)).await?;
        }
        for job in &jenkins.job_config_files {
            upload_item(host, job, &files::job_config_path(share, &job.name)).await?;
        }

        for slave in &self.config.jenkins_slaves {
            let target = files::node_config_path(share, &slave.slave_name);
            write_file(host, &files::node_config_xml(self.config, slave)?, &target).await?;
        }

        if !jenkins.cpf_jobs.is_empty() {
            let template_path = self.settings.cpf_job_template();
            let template = std::fs::read_to_string(&template_path).map_err(|e| {
                FarmError::FileReadError {
                    path: template_path.to_string_lossy().to_string(),
                    source: e,
                }
            })?;
            let values = files::JobTemplateValues {
                jenkinsjob_repository: self.settings.jenkinsjob_repository.as_deref(),
                tag_or_branch: &self.settings.jenkinsfile_tag_or_branch,
            };
            for job in &jenkins.cpf_jobs {
                let xml = files::cpf_job_config_xml(&template, self.config, job, &values)?;
                write_file(host, &xml, &files::job_config_path(share, &job.base_name)).await?;
            }
        }

        // Files arrive owned by the host account.
        let master = &self.config.jenkins_master_host.container;
        let owner = format!("{0}:{0}", master.container_user);
        docker::exec(
            host,
            &master.container_name,
            &format!("chown -R {} {}", quote(&owner), quote(&master.home_directory)),
            Some("root"),
        )
        .await?;
        Ok(())
    }
}

fn container_ssh_port(container: &ContainerConfig) -> Result<u16> {
    container.host_port_for(crate::ports::PORT_SSH).ok_or_else(|| {
        FarmError::Internal(format!("{} publishes no ssh port", container.container_name))
    })
}

async fn upload_item(host: &dyn RemoteHost, item: &ConfigItem, target: &str) -> Result<()> {
    if !item.xml_file.is_file() {
        return Err(FarmError::FileReadError {
            path: item.xml_file.to_string_lossy().to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }
    upload_file(host, &item.xml_file, target).await
}

async fn upload_file(host: &dyn RemoteHost, local: &Path, target: &str) -> Result<()> {
    host.run(&format!("mkdir -p {}", quote(remote_parent(target)))).await?;
    host.upload(local, target).await
}

async fn write_file(host: &dyn RemoteHost, contents: &str, target: &str) -> Result<()> {
    host.run(&format!("mkdir -p {}", quote(remote_parent(target)))).await?;
    host.upload_contents(contents, target).await
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).map_err(|e| FarmError::io(&current, e))? {
            let path = entry.map_err(|e| FarmError::io(&current, e))?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
