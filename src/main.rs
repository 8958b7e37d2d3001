type Result<T> = color_eyre::eyre::Result<T>;

mod cli;

use clap::Parser;
use eyre::WrapErr;
use tokio::select;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Action, Cli, Config};
use stagehand::control_plane;
use stagehand::health::HttpHealthProbe;
use stagehand::{HarnessConfig, HealthProbe, TemplateProject};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(cli)?;

    match config.action {
        Action::Scaffold { kind, destination } => {
            scaffold(&config.harness, &kind, destination).await
        }
        Action::Run { kind } => run(&config.harness, &kind).await,
        Action::Probe { url, path } => probe(&url, &path).await,
    }
}

/// Scaffolds `kind` into `destination` and leaves it there
async fn scaffold(
    harness: &HarnessConfig,
    kind: &str,
    destination: std::path::PathBuf,
) -> Result<()> {
    let kind = harness.kind(kind)?.clone();
    let mut project = TemplateProject::builder(kind.clone())
        .template_dir(harness.template_dir(&kind))
        .fixtures_root(harness.fixtures_root())
        .destination(&destination)
        .teardown(harness.teardown)
        .build()?;

    let result = project.scaffold();
    project.dispose().await?;
    result.wrap_err_with(|| format!("Failed to scaffold '{}'", kind.name))?;

    info!("Scaffolded '{}' into {}", kind.name, destination.display());
    Ok(())
}

/// Starts `kind`, reports its health and tears it down again
async fn run(harness: &HarnessConfig, kind: &str) -> Result<()> {
    let control_plane = control_plane::from_config(harness)?;
    let mut project = TemplateProject::from_config(harness, kind, control_plane)?;

    let started = select! {
        result = project.start() => result.map_err(eyre::Report::from),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, tearing down");
            Err(eyre::eyre!("interrupted before '{}' became ready", kind))
        }
    };

    let outcome = match started {
        Ok(()) => match project.probe_health().await {
            Ok(status) => {
                info!("Project '{}' reports {}", kind, status);
                println!("{}", status);
                Ok(())
            }
            Err(e) => Err(eyre::Report::from(e)),
        },
        Err(e) => Err(e),
    };

    if let Err(e) = project.dispose().await {
        error!("Teardown of '{}' was incomplete: {}", kind, e);
        if outcome.is_ok() {
            return Err(e.into());
        }
    }
    outcome
}

/// Probes a health endpoint once and prints the report
async fn probe(url: &str, path: &str) -> Result<()> {
    let probe = HttpHealthProbe::new(url, path)?;
    let report = probe
        .probe_report()
        .await
        .wrap_err_with(|| format!("Failed to probe {}", probe.target()))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
