//! `cifarm validate` command

use std::path::Path;

use anyhow::{Context, Result};
use cifarm_core::config::{ConfigData, ContainerConfig};
use cifarm_core::ConfigParser;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "CONTAINER")]
    name: String,
    #[tabled(rename = "MACHINE")]
    machine: String,
    #[tabled(rename = "HOST")]
    host: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "PORTS")]
    ports: String,
}

#[derive(Tabled)]
struct AgentRow {
    #[tabled(rename = "AGENT")]
    name: String,
    #[tabled(rename = "MACHINE")]
    machine: String,
    #[tabled(rename = "EXECUTORS")]
    executors: u32,
    #[tabled(rename = "CONTAINER")]
    container: String,
}

/// Parse the config document and print the derived topology.
pub fn validate(config_path: &Path) -> Result<()> {
    let config = ConfigParser::parse_file(config_path)
        .with_context(|| format!("Invalid farm config {}", config_path.display()))?;

    println!("{} {} is valid", "✓".green().bold(), config_path.display());
    println!();

    let mut containers = Table::new(container_rows(&config)?);
    containers.with(Style::modern());
    println!("{}", containers);

    let mut agents = Table::new(agent_rows(&config));
    agents.with(Style::modern());
    println!("{}", agents);

    Ok(())
}

fn container_rows(config: &ConfigData) -> Result<Vec<ContainerRow>> {
    config
        .all_containers()
        .into_iter()
        .map(|container| {
            let machine = config.get_container_host(&container.container_name)?;
            let host = config.host_info(machine)?;
            Ok(ContainerRow {
                name: container.container_name.clone(),
                machine: machine.to_string(),
                host: host.host_name.clone(),
                image: container.container_image_name.clone(),
                ports: format_ports(container),
            })
        })
        .collect()
}

fn agent_rows(config: &ConfigData) -> Vec<AgentRow> {
    config
        .jenkins_slaves
        .iter()
        .map(|slave| AgentRow {
            name: slave.slave_name.clone(),
            machine: slave.machine_id.clone(),
            executors: slave.executors,
            container: slave
                .container
                .as_ref()
                .map(|c| c.container_name.clone())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect()
}

/// `HOST->CONTAINER` pairs, e.g. `25->22, 80->80`.
fn format_ports(container: &ContainerConfig) -> String {
    container
        .published_ports
        .iter()
        .map(|(host, inner)| format!("{}->{}", host, inner))
        .collect::<Vec<_>>()
        .join(", ")
}
