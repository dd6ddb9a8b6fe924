//! `cifarm setup` command

use std::path::Path;
use std::time::Instant;

use anyhow::{Context, Result};
use cifarm_core::ports::MASTER_WEB_PORT;
use cifarm_core::{ConfigParser, ConnectionPool, Orchestrator, Settings};
use colored::Colorize;

/// Tear down and rebuild the farm described by `config_path`.
pub async fn setup(config_path: &Path, settings: &Settings) -> Result<()> {
    let start = Instant::now();
    let config = ConfigParser::parse_file(config_path)
        .with_context(|| format!("Failed to read farm config {}", config_path.display()))?;

    println!(
        "{} Provisioning {} container(s) on {} host(s)",
        "→".cyan().bold(),
        config.all_containers().len(),
        config.host_machines.len()
    );

    let pool = ConnectionPool::open(&config.host_machines, settings.connect_timeout())
        .await
        .context("Failed to connect to the farm hosts")?;

    let result = Orchestrator::new(&config, &pool, settings).run().await;
    // Sessions are closed on failure too.
    let closed = pool.close().await;
    result.context("Farm setup failed")?;
    closed.context("Failed to close host sessions")?;

    let master = config.host_info(&config.jenkins_master_host.machine_id)?;
    println!(
        "{} Farm is up in {}s: {}",
        "✓".green().bold(),
        start.elapsed().as_secs(),
        format!("http://{}:{}", master.host_name, MASTER_WEB_PORT).bold()
    );
    Ok(())
}
