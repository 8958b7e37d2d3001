use clap::{Parser, Subcommand};
use eyre::{eyre, WrapErr};
use std::path::PathBuf;

use stagehand::health::DEFAULT_HEALTH_PATH;
use stagehand::{BuildConfiguration, HarnessConfig, TargetRuntime, TeardownPolicy};

type Result<T> = color_eyre::eyre::Result<T>;

/// Scaffolds, runs and verifies template projects in isolation
#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Scaffolds, runs and verifies template projects in isolation")]
#[command(version)]
pub struct Cli {
    /// Harness configuration file
    #[arg(long, short, default_value = "stagehand.toml", env = "STAGEHAND_CONFIG")]
    pub config: PathBuf,

    /// Build configuration (Debug or Release), overrides the configuration file
    #[arg(long)]
    pub build_configuration: Option<String>,

    /// Target runtime (e.g. net8.0), overrides the configuration file
    #[arg(long)]
    pub runtime: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Scaffold a project and leave it on disk
    Scaffold {
        /// Project kind from the configuration file
        #[arg(long)]
        kind: String,

        /// Directory to create the project in
        #[arg(long)]
        destination: PathBuf,
    },

    /// Start a project, report its health and tear it down again
    Run {
        /// Project kind from the configuration file
        #[arg(long)]
        kind: String,

        /// Keep the project directory after teardown
        #[arg(long)]
        keep: bool,
    },

    /// Probe an HTTP health endpoint once
    Probe {
        /// Base URL of the project
        url: String,

        /// Health endpoint path
        #[arg(long, default_value = DEFAULT_HEALTH_PATH)]
        path: String,
    },
}

/// What the binary was asked to do
#[derive(Debug, Clone)]
pub enum Action {
    Scaffold { kind: String, destination: PathBuf },
    Run { kind: String },
    Probe { url: String, path: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub harness: HarnessConfig,
    pub action: Action,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let (action, keep) = match cli.command {
            Command::Scaffold { kind, destination } => (Action::Scaffold { kind, destination }, true),
            Command::Run { kind, keep } => (Action::Run { kind }, keep),
            Command::Probe { url, path } => {
                // Probing needs no configuration file.
                return Ok(Config {
                    harness: HarnessConfig::default(),
                    action: Action::Probe { url, path },
                });
            }
        };

        let mut harness = HarnessConfig::load(&cli.config)
            .wrap_err_with(|| format!("Failed to load configuration {}", cli.config.display()))?;

        if let Some(configuration) = cli.build_configuration {
            harness.build_configuration = configuration
                .parse::<BuildConfiguration>()
                .map_err(|e| eyre!("Invalid build configuration: {}", e))?;
        }
        if let Some(runtime) = cli.runtime {
            harness.target_runtime = TargetRuntime(runtime);
        }

        if keep {
            harness.teardown = TeardownPolicy::KeepProjectDirectory;
        }

        Ok(Config { harness, action })
    }
}
