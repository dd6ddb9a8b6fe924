//! `cifarm example-config` command

use std::path::Path;

use anyhow::{Context, Result};
use cifarm_core::config::write_example_config_file;
use colored::Colorize;

pub fn example_config(path: &Path) -> Result<()> {
    write_example_config_file(path)
        .with_context(|| format!("Failed to write example config {}", path.display()))?;
    println!("{} Example config written to {}", "✓".green().bold(), path.display());
    Ok(())
}
