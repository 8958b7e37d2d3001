use crate::integration::infrastructure::workspace::{ORDER_HANDLER_FIXTURE, WORKER_TEMPLATE};
use crate::integration::infrastructure::{FakeControlPlane, TestWorkspace};
use anyhow::{Context, Result};
use stagehand::{HarnessConfig, HarnessState, TemplateProject};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn write_config(workspace: &TestWorkspace, launch: &str) -> Result<HarnessConfig> {
    let contents = format!(
        r#"
build_configuration = "Release"
target_runtime = "net6.0"
sources_root = "{root}"
fixtures_root = "{fixtures}"
work_root = "{work}"

[launch]
{launch}
graceful_shutdown_timeout_ms = 2000

[service_principal]
tenant_id = "tenant"
client_id = "client"
client_secret = "hunter2"

[[kinds]]
name = "queue-worker"
template = "{template}"
entry_file = "Program.cs"
fixtures = ["{fixture}"]
excluded_features = ["correlation"]

[[kinds.patches]]
strip_user_errors = true

[[kinds.arguments]]
key = "WORKER_MODE"
value = "batch"
"#,
        root = workspace.path().display(),
        fixtures = workspace.fixtures_root().display(),
        work = workspace.work_root().display(),
        template = WORKER_TEMPLATE,
        fixture = ORDER_HANDLER_FIXTURE,
        launch = launch,
    );

    let path = workspace.path().join("stagehand.toml");
    std::fs::write(&path, contents)?;
    Ok(HarnessConfig::load(&path)?)
}

async fn wait_for_file(path: &Path) -> Result<String> {
    for _ in 0..100 {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            if !contents.is_empty() {
                return Ok(contents);
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("{} never appeared", path.display())
}

/// A configured kind scaffolds into the configured work root
#[tokio::test]
async fn test_configured_kind_scaffolds() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let workspace = TestWorkspace::new()?;
    let config = write_config(&workspace, r#"program = "true""#)?;
    let mut project =
        TemplateProject::from_config(&config, "queue-worker", Arc::new(FakeControlPlane::new()))?;

    project.scaffold()?;
    assert!(project.destination().starts_with(workspace.work_root()));

    let program = project.read_file("Program.cs")?;
    assert!(!program.contains("UseSerilog"), "excluded feature was kept");
    assert!(program.contains("AddAuthentication"));
    assert!(!program.contains("#error"));
    assert!(project.read_file(ORDER_HANDLER_FIXTURE).is_ok());

    project.dispose().await?;
    assert!(workspace.scaffolded_projects()?.is_empty());
    Ok(())
}

/// The configured command runs in the project directory with open
/// arguments on its command line and the service principal in its
/// environment only
#[tokio::test]
async fn test_configured_command_receives_arguments() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let workspace = TestWorkspace::new()?;
    let launch = r#"program = "sh"
args = ["-c", "printf '%s\n' \"$@\" > args.txt; env > env.txt; exec sleep 30", "worker", "{configuration}", "{runtime}"]"#;
    let config = write_config(&workspace, launch)?;
    let mut project =
        TemplateProject::from_config(&config, "queue-worker", Arc::new(FakeControlPlane::new()))?;

    project.scaffold()?;
    project.provision().await?;
    project.launch().await?;
    assert_eq!(project.state(), HarnessState::ProcessStarted);

    let directory = project.destination().to_path_buf();
    let port = project.config().context("launched project has a config")?.port;
    let arguments = wait_for_file(&directory.join("args.txt")).await?;
    let environment = wait_for_file(&directory.join("env.txt")).await?;

    let arguments: Vec<&str> = arguments.lines().collect();
    assert_eq!(&arguments[..2], &["Release", "net6.0"]);
    assert!(arguments.windows(2).any(|pair| pair == ["--WORKER_MODE", "batch"]));
    assert!(arguments
        .windows(2)
        .any(|pair| pair[0] == "--ARCUS_HTTP_PORT" && pair[1] == port.to_string()));
    assert!(!arguments.iter().any(|argument| argument.contains("hunter2")));

    assert!(environment.lines().any(|line| line == "AZURE_CLIENT_SECRET=hunter2"));
    assert!(environment.lines().any(|line| line == "AZURE_TENANT_ID=tenant"));

    project.dispose().await?;
    assert!(!directory.exists());
    Ok(())
}
