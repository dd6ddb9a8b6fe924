use std::path::PathBuf;

use anyhow::{Context, Result};
use cifarm_core::Settings;
use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "cifarm")]
#[command(about = "Jenkins CI farm provisioning CLI", long_about = None, version)]
struct Cli {
    /// Settings file (defaults to settings.json in the user config directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Tear down and rebuild the whole farm
    Setup {
        /// Farm config document
        config: PathBuf,
    },

    /// Check a config document and print the derived topology
    Validate {
        /// Farm config document
        config: PathBuf,
    },

    /// Write an example config document
    ExampleConfig {
        /// Target file
        path: PathBuf,
    },

    /// Install post-receive hooks that trigger CPF build jobs
    DeployHooks {
        /// Hook config document
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load(cli.settings.as_deref()).context("Failed to load settings")?;
    cifarm_core::init_observability(&settings.log_level)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Setup { config } => {
            commands::setup(&config, &settings).await?;
        }

        Commands::Validate { config } => {
            commands::validate(&config)?;
        }

        Commands::ExampleConfig { path } => {
            commands::example_config(&path)?;
        }

        Commands::DeployHooks { config } => {
            commands::deploy_hooks(&config, &settings).await?;
        }
    }

    Ok(())
}
