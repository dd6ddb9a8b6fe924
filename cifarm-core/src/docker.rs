//! Docker CLI operations on a remote host.
//!
//! Stateless helpers: each takes the session to the container's host and the
//! container description and issues the matching `docker` invocation. The
//! command lines are built by separate pure functions so they can be checked
//! without a host.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};

use crate::config::ContainerConfig;
use crate::connection::{quote, remote_parent, CommandOutput, RemoteHost, RunOptions};
use crate::error::{FarmError, Result};

/// Build argument that tells the images which account to create.
pub const CONTAINER_USER_BUILD_ARG: &str = "CONTAINER_USER";

// ============================================================================
// Command lines
// ============================================================================

pub fn list_containers_command(running_only: bool) -> String {
    if running_only {
        "docker ps --format '{{.Names}}'".to_string()
    } else {
        "docker ps -a --format '{{.Names}}'".to_string()
    }
}

pub fn run_command(
    container: &ContainerConfig,
    network: &str,
    resolved: &[(String, IpAddr)],
) -> String {
    let mut cmd = String::from("docker run --detach");
    for (host_port, container_port) in &container.published_ports {
        cmd.push_str(&format!(" --publish {}:{}", host_port, container_port));
    }
    for (host_path, container_path) in &container.host_volumes {
        cmd.push_str(&format!(" --volume {}", quote(&format!("{}:{}", host_path, container_path))));
    }
    for env in &container.envvar_definitions {
        cmd.push_str(&format!(" --env {}", quote(env)));
    }
    for (name, ip) in resolved {
        cmd.push_str(&format!(" --add-host {}", quote(&format!("{}:{}", name, ip))));
    }
    cmd.push_str(&format!(
        " --name {} --net {} {}",
        quote(&container.container_name),
        quote(network),
        quote(&container.container_image_name)
    ));
    cmd
}

pub fn build_command(image: &str, context_dir: &str, build_args: &[(String, String)]) -> String {
    let mut cmd = String::from("docker build");
    for (key, value) in build_args {
        cmd.push_str(&format!(" --build-arg {}", quote(&format!("{}={}", key, value))));
    }
    cmd.push_str(&format!(
        " -t {} -f {} {}",
        quote(image),
        quote(&format!("{}/Dockerfile", context_dir)),
        quote(context_dir)
    ));
    cmd
}

/// `docker exec`, optionally as `user:user`, through `sh -c`.
pub fn exec_command(container_name: &str, command: &str, as_user: Option<&str>) -> String {
    let user = as_user
        .map(|u| format!(" --user {}", quote(&format!("{0}:{0}", u))))
        .unwrap_or_default();
    format!("docker exec{} {} sh -c {}", user, quote(container_name), quote(command))
}

// ============================================================================
// Queries
// ============================================================================

async fn list_containers(host: &dyn RemoteHost, running_only: bool) -> Result<Vec<String>> {
    host.run(&list_containers_command(running_only)).await
}

pub async fn container_exists(host: &dyn RemoteHost, container_name: &str) -> Result<bool> {
    Ok(list_containers(host, false).await?.iter().any(|n| n.trim() == container_name))
}

pub async fn container_is_running(host: &dyn RemoteHost, container_name: &str) -> Result<bool> {
    Ok(list_containers(host, true).await?.iter().any(|n| n.trim() == container_name))
}

pub async fn image_exists(host: &dyn RemoteHost, image: &str) -> Result<bool> {
    let output = host
        .run_with(
            &format!("docker image inspect {} > /dev/null 2>&1", quote(image)),
            RunOptions::probe(),
        )
        .await?;
    Ok(output.success())
}

pub async fn network_exists(host: &dyn RemoteHost, network: &str) -> Result<bool> {
    let names = host.run("docker network ls --format '{{.Name}}'").await?;
    Ok(names.iter().any(|n| n.trim() == network))
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Upload the build context in `context_dir` and build the container's image.
///
/// Text files are sent with LF line endings so recipes edited on Windows
/// still run in the image's shell.
#[instrument(skip_all, fields(machine = %host.machine_id(), image = %container.container_image_name))]
pub async fn build_image(
    host: &dyn RemoteHost,
    container: &ContainerConfig,
    context_dir: &Path,
    extra_build_args: &[(String, String)],
) -> Result<()> {
    info!("Building image {}", container.container_image_name);

    let remote_dir =
        format!("{}/cifarm-build-{}", host.info().temp_dir, container.container_image_name);
    host.run(&format!("rm -rf {0} && mkdir -p {0}", quote(&remote_dir))).await?;

    for file in collect_files(context_dir)? {
        let relative =
            file.strip_prefix(context_dir).map_err(|e| FarmError::Internal(e.to_string()))?;
        let relative = relative.to_string_lossy().replace('\\', "/");
        let target = format!("{}/{}", remote_dir, relative);
        host.run(&format!("mkdir -p {}", quote(remote_parent(&target)))).await?;

        let bytes = std::fs::read(&file).map_err(|e| FarmError::io(&file, e))?;
        match String::from_utf8(bytes) {
            Ok(text) => host.upload_contents(&text.replace("\r\n", "\n"), &target).await?,
            Err(_) => host.upload(&file, &target).await?,
        }
    }

    let mut build_args =
        vec![(CONTAINER_USER_BUILD_ARG.to_string(), container.container_user.clone())];
    build_args.extend_from_slice(extra_build_args);
    host.run_with(
        &build_command(&container.container_image_name, &remote_dir, &build_args),
        RunOptions::streamed(),
    )
    .await?;

    host.run(&format!("rm -rf {}", quote(&remote_dir))).await?;
    Ok(())
}

fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = std::fs::read_dir(&current).map_err(|e| FarmError::io(&current, e))?;
        for entry in entries {
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

/// Start the container detached on `network`.
///
/// `resolved` becomes the container's extra `/etc/hosts` entries; the farm
/// spans several docker hosts without a shared overlay network, so peers are
/// only reachable by the names listed here.
#[instrument(skip_all, fields(machine = %host.machine_id(), container = %container.container_name))]
pub async fn run_detached(
    host: &dyn RemoteHost,
    container: &ContainerConfig,
    network: &str,
    resolved: &[(String, IpAddr)],
) -> Result<()> {
    info!("Starting container {}", container.container_name);
    host.run(&run_command(container, network, resolved)).await?;
    Ok(())
}

pub async fn start(host: &dyn RemoteHost, container_name: &str) -> Result<()> {
    host.run(&format!("docker start {}", quote(container_name))).await?;
    Ok(())
}

pub async fn stop(host: &dyn RemoteHost, container_name: &str) -> Result<()> {
    host.run(&format!("docker stop {}", quote(container_name))).await?;
    Ok(())
}

pub async fn remove(host: &dyn RemoteHost, container_name: &str) -> Result<()> {
    host.run(&format!("docker rm -f {}", quote(container_name))).await?;
    Ok(())
}

/// Stop the container if it runs and remove it if it exists.
#[instrument(skip(host), fields(machine = %host.machine_id()))]
pub async fn stop_and_remove(host: &dyn RemoteHost, container_name: &str) -> Result<()> {
    if container_is_running(host, container_name).await? {
        stop(host, container_name).await?;
    }
    if container_exists(host, container_name).await? {
        remove(host, container_name).await?;
    } else {
        debug!("Container {} not present", container_name);
    }
    Ok(())
}

/// Stop and start again so the process picks up changed files.
pub async fn restart(host: &dyn RemoteHost, container_name: &str) -> Result<()> {
    stop(host, container_name).await?;
    start(host, container_name).await
}

pub async fn create_network(host: &dyn RemoteHost, network: &str) -> Result<()> {
    if !network_exists(host, network).await? {
        host.run(&format!("docker network create {}", quote(network))).await?;
    }
    Ok(())
}

pub async fn remove_network_if_present(host: &dyn RemoteHost, network: &str) -> Result<()> {
    if network_exists(host, network).await? {
        host.run(&format!("docker network rm {}", quote(network))).await?;
    }
    Ok(())
}

// ============================================================================
// Inside containers
// ============================================================================

/// Run `command` in the container, as `as_user` or as the image's default user.
pub async fn exec(
    host: &dyn RemoteHost,
    container_name: &str,
    command: &str,
    as_user: Option<&str>,
) -> Result<CommandOutput> {
    host.run_with(&exec_command(container_name, command, as_user), RunOptions::default()).await
}

/// Copy a host file into the container and hand it to the container user.
pub async fn copy_host_to_container(
    host: &dyn RemoteHost,
    container: &ContainerConfig,
    host_path: &str,
    container_path: &str,
) -> Result<()> {
    let name = &container.container_name;
    let parent = format!("mkdir -p {}", quote(remote_parent(container_path)));
    exec(host, name, &parent, Some("root")).await?;
    let target = format!("{}:{}", name, container_path);
    host.run(&format!("docker cp {} {}", quote(host_path), quote(&target))).await?;
    let owner = format!("{0}:{0}", container.container_user);
    exec(host, name, &format!("chown {} {}", quote(&owner), quote(container_path)), Some("root"))
        .await?;
    Ok(())
}

pub async fn copy_container_to_host(
    host: &dyn RemoteHost,
    container_name: &str,
    container_path: &str,
    host_path: &str,
) -> Result<()> {
    host.run(&format!(
        "docker cp {} {}",
        quote(&format!("{}:{}", container_name, container_path)),
        quote(host_path)
    ))
    .await?;
    Ok(())
}

/// Look up the addresses of `names` as seen from `host`.
///
/// Names that already are IP literals or do not resolve are skipped.
pub async fn resolve_host_names(
    host: &dyn RemoteHost,
    names: &[&str],
) -> Result<Vec<(String, IpAddr)>> {
    let mut resolved: Vec<(String, IpAddr)> = Vec::new();
    for name in names {
        if name.parse::<IpAddr>().is_ok() || resolved.iter().any(|(n, _)| n.as_str() == *name) {
            continue;
        }
        let output =
            host.run_with(&format!("getent hosts {}", quote(name)), RunOptions::probe()).await?;
        let address = output
            .stdout
            .first()
            .and_then(|line| line.split_whitespace().next())
            .and_then(|ip| ip.parse::<IpAddr>().ok());
        match address {
            Some(ip) => resolved.push((name.to_string(), ip)),
            None => debug!("{} does not resolve on {}", name, host.machine_id()),
        }
    }
    Ok(resolved)
}
