//! `cifarm deploy-hooks` command

use std::path::Path;

use anyhow::{Context, Result};
use cifarm_core::hooks::{self, HookConfigData};
use cifarm_core::{ConnectionPool, Settings};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

/// Install the post-receive hooks listed in `config_path`.
pub async fn deploy_hooks(config_path: &Path, settings: &Settings) -> Result<()> {
    let data = HookConfigData::parse_file(config_path)
        .with_context(|| format!("Failed to read hook config {}", config_path.display()))?;
    let template = hooks::load_template(&settings.assets_dir)?;

    if data.hooks.is_empty() {
        println!("No hooked repositories");
        return Ok(());
    }

    let pool = ConnectionPool::open(&data.repository_machines, settings.connect_timeout())
        .await
        .context("Failed to connect to the repository hosts")?;

    let pb = ProgressBar::new(data.hooks.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=>-"),
    );

    let result = hooks::deploy_hooks(&data, &pool, &template, |hook| {
        pb.set_message(format!("{}:{}", hook.machine_id, hook.hook_directory));
        pb.inc(1);
    })
    .await;
    pb.finish_and_clear();

    let closed = pool.close().await;
    result.context("Failed to deploy hooks")?;
    closed.context("Failed to close host sessions")?;

    println!("{} Deployed {} hook(s)", "✓".green().bold(), data.hooks.len());
    Ok(())
}
