//! The template project harness: scaffold, provision, launch, wait, verify
//! and tear down one project.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{HarnessConfig, HealthCheck, ProjectKind, Readiness, ResourceSpec};
use crate::control_plane::DetachedControlPlane;
use crate::environment::CommandArgument;
use crate::error::{aggregate, HarnessError, Result};
use crate::health::{
    wait_until_endpoint_responds, wait_until_healthy, HealthProbe, HealthStatus, HttpHealthProbe,
    TcpHealthProbe,
};
use crate::launcher::{BuildConfiguration, CommandLauncher, Launcher, LaunchCommand, TargetRuntime};
use crate::messaging::{DirectorySink, MessagePublisher, MessagingRoundTripVerifier};
use crate::payload::RoundTripPayload;
use crate::ports::PortAllocator;
use crate::resources::{ControlPlane, TemporaryResourceManager};
use crate::retry::RetryPolicy;
use crate::scaffold::{Patch, ProjectDirectory, ProjectOptions, ProjectScaffolder, TeardownPolicy};

const RESOURCE_REFERENCE_PREFIX: &str = "${resource:";

/// Lifecycle of a [`TemplateProject`]. Every step only follows its
/// immediate predecessor; any state may go to `Disposed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    Created,
    Scaffolded,
    ResourcesProvisioned,
    ProcessStarted,
    Healthy,
    Disposed,
}

impl fmt::Display for HarnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HarnessState::Created => "created",
            HarnessState::Scaffolded => "scaffolded",
            HarnessState::ResourcesProvisioned => "provisioned",
            HarnessState::ProcessStarted => "started",
            HarnessState::Healthy => "healthy",
            HarnessState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Runtime configuration handed to a launched project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub build_configuration: BuildConfiguration,
    pub target_runtime: TargetRuntime,
    pub port: u16,
    /// Set for projects with an HTTP surface
    pub base_url: Option<String>,
}

/// A remote resource the project needs, with the name picked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedResource {
    pub spec: ResourceSpec,
    pub name: String,
}

pub struct TemplateProjectBuilder {
    kind: ProjectKind,
    template_dir: Option<PathBuf>,
    fixtures_root: Option<PathBuf>,
    work_root: PathBuf,
    destination: Option<PathBuf>,
    teardown: TeardownPolicy,
    build_configuration: BuildConfiguration,
    target_runtime: TargetRuntime,
    launcher: Option<Box<dyn Launcher>>,
    control_plane: Option<Arc<dyn ControlPlane>>,
    health_policy: RetryPolicy,
    round_trip_policy: RetryPolicy,
    arguments: Vec<CommandArgument>,
    ports: PortAllocator,
}

impl TemplateProjectBuilder {
    pub fn template_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_dir = Some(path.into());
        self
    }

    /// Defaults to the template directory.
    pub fn fixtures_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.fixtures_root = Some(path.into());
        self
    }

    /// Parent directory of the scaffolded project.
    pub fn work_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_root = path.into();
        self
    }

    /// Exact project directory, instead of a unique one under the work root.
    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }

    pub fn build_configuration(mut self, configuration: BuildConfiguration) -> Self {
        self.build_configuration = configuration;
        self
    }

    pub fn target_runtime(mut self, runtime: TargetRuntime) -> Self {
        self.target_runtime = runtime;
        self
    }

    /// Defaults to a [`CommandLauncher`] running the default launch command.
    pub fn launcher(mut self, launcher: Box<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Defaults to a control plane that refuses to create anything.
    pub fn control_plane(mut self, control_plane: Arc<dyn ControlPlane>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    pub fn health_policy(mut self, policy: RetryPolicy) -> Self {
        self.health_policy = policy;
        self
    }

    pub fn round_trip_policy(mut self, policy: RetryPolicy) -> Self {
        self.round_trip_policy = policy;
        self
    }

    /// An argument on top of the ones the project kind declares.
    pub fn argument(mut self, argument: CommandArgument) -> Self {
        self.arguments.push(argument);
        self
    }

    pub fn ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn build(self) -> Result<TemplateProject> {
        self.kind.validate()?;
        let template_dir = self.template_dir.ok_or_else(|| {
            HarnessError::Config(format!(
                "no template directory for project kind '{}'",
                self.kind.name
            ))
        })?;
        let fixtures_root = self.fixtures_root.unwrap_or_else(|| template_dir.clone());
        let destination = self.destination.unwrap_or_else(|| {
            self.work_root
                .join(format!("{}-{}", self.kind.name, Uuid::new_v4().simple()))
        });

        let launcher = self.launcher.unwrap_or_else(|| {
            Box::new(CommandLauncher::new(
                LaunchCommand::default(),
                self.build_configuration,
                self.target_runtime.clone(),
            ))
        });
        let control_plane = self
            .control_plane
            .unwrap_or_else(|| Arc::new(DetachedControlPlane));

        let planned = self
            .kind
            .resources
            .iter()
            .map(|spec| PlannedResource {
                spec: spec.clone(),
                name: TemporaryResourceManager::generate_name(spec.kind),
            })
            .collect();

        Ok(TemplateProject {
            options: self.kind.project_options(self.teardown),
            kind: self.kind,
            template_dir,
            destination,
            scaffolder: ProjectScaffolder::new(fixtures_root),
            launcher,
            resources: TemporaryResourceManager::new(control_plane),
            planned,
            health_policy: self.health_policy,
            round_trip_policy: self.round_trip_policy,
            arguments: self.arguments,
            ports: self.ports,
            build_configuration: self.build_configuration,
            target_runtime: self.target_runtime,
            state: HarnessState::Created,
            project: None,
            config: None,
            probe: None,
        })
    }
}

/// One scaffolded, running and eventually disposed template project.
pub struct TemplateProject {
    kind: ProjectKind,
    template_dir: PathBuf,
    destination: PathBuf,
    options: ProjectOptions,
    scaffolder: ProjectScaffolder,
    launcher: Box<dyn Launcher>,
    resources: TemporaryResourceManager,
    planned: Vec<PlannedResource>,
    health_policy: RetryPolicy,
    round_trip_policy: RetryPolicy,
    arguments: Vec<CommandArgument>,
    ports: PortAllocator,
    build_configuration: BuildConfiguration,
    target_runtime: TargetRuntime,
    state: HarnessState,
    project: Option<ProjectDirectory>,
    config: Option<ProjectConfig>,
    probe: Option<Box<dyn HealthProbe>>,
}

impl TemplateProject {
    pub fn builder(kind: ProjectKind) -> TemplateProjectBuilder {
        TemplateProjectBuilder {
            kind,
            template_dir: None,
            fixtures_root: None,
            work_root: std::env::temp_dir(),
            destination: None,
            teardown: TeardownPolicy::default(),
            build_configuration: BuildConfiguration::default(),
            target_runtime: TargetRuntime::default(),
            launcher: None,
            control_plane: None,
            health_policy: RetryPolicy::health(),
            round_trip_policy: RetryPolicy::round_trip(),
            arguments: Vec::new(),
            ports: PortAllocator::default(),
        }
    }

    /// Builds a project of the configured kind `kind`, launched with the
    /// configured command. The service principal, if any, is handed to the
    /// project as secret arguments.
    pub fn from_config(
        config: &HarnessConfig,
        kind: &str,
        control_plane: Arc<dyn ControlPlane>,
    ) -> Result<Self> {
        let kind = config.kind(kind)?.clone();
        let launcher = CommandLauncher::new(
            config.launch.command.clone(),
            config.build_configuration,
            config.target_runtime.clone(),
        )
        .with_graceful_shutdown_timeout(config.launch.graceful_shutdown_timeout());

        let mut builder = Self::builder(kind.clone())
            .template_dir(config.template_dir(&kind))
            .fixtures_root(config.fixtures_root())
            .work_root(config.work_root())
            .teardown(config.teardown)
            .build_configuration(config.build_configuration)
            .target_runtime(config.target_runtime.clone())
            .launcher(Box::new(launcher))
            .control_plane(control_plane)
            .health_policy(config.timeouts.health_policy())
            .round_trip_policy(config.timeouts.round_trip_policy());

        if let Some(principal) = &config.service_principal {
            for argument in principal.as_secret_arguments() {
                builder = builder.argument(argument);
            }
        }

        builder.build()
    }

    pub fn kind(&self) -> &ProjectKind {
        &self.kind
    }

    pub fn state(&self) -> HarnessState {
        self.state
    }

    /// Where the project is (or will be) scaffolded.
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn project_directory(&self) -> Option<&ProjectDirectory> {
        self.project.as_ref()
    }

    pub fn config(&self) -> Option<&ProjectConfig> {
        self.config.as_ref()
    }

    pub fn planned_resources(&self) -> &[PlannedResource] {
        &self.planned
    }

    /// The name picked for the resource passed through `argument`.
    pub fn resource_name(&self, argument: &str) -> Option<&str> {
        self.planned
            .iter()
            .find(|planned| planned.spec.argument == argument)
            .map(|planned| planned.name.as_str())
    }

    /// Contents of a file in the scaffolded project.
    pub fn read_file(&self, relative_path: impl AsRef<Path>) -> Result<String> {
        self.project
            .as_ref()
            .ok_or(HarnessError::NotStarted("project directory"))?
            .read_file(relative_path.as_ref())
    }

    fn expect_state(&self, expected: HarnessState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HarnessError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    /// Runs every step up to a healthy project. Any failure disposes
    /// everything created so far before the failure is returned.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            HarnessState::Created => {}
            HarnessState::Disposed => {
                return Err(HarnessError::InvalidState {
                    operation: "start",
                    state: self.state.to_string(),
                })
            }
            _ => return Err(HarnessError::AlreadyStarted),
        }

        info!(kind = %self.kind.name, destination = %self.destination.display(), "Starting template project");
        if let Err(e) = self.run_startup().await {
            error!(kind = %self.kind.name, "Template project failed to start: {}", e);
            if let Err(rollback) = self.dispose().await {
                warn!("Rollback after failed start was incomplete: {}", rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn run_startup(&mut self) -> Result<()> {
        self.scaffold()?;
        self.provision().await?;
        self.launch().await?;
        self.wait_until_ready().await
    }

    /// Copies the template, adds the fixtures and applies the patches.
    pub fn scaffold(&mut self) -> Result<()> {
        self.expect_state(HarnessState::Created, "scaffold")?;

        let project = self
            .scaffolder
            .scaffold(&self.template_dir, &self.destination, &self.options)?;
        // Tracked right away so a failing patch still gets cleaned up.
        self.project = Some(project.clone());

        for fixture in &self.kind.fixtures {
            project.add_source_file(fixture)?;
        }
        for file_patch in &self.kind.patches {
            let patch = expand_resource_references(&file_patch.patch, &self.planned)?;
            project.patch_file(file_patch.target(&self.kind.entry_file), &patch)?;
        }

        self.state = HarnessState::Scaffolded;
        Ok(())
    }

    /// Creates the remote resources the project kind declares.
    pub async fn provision(&mut self) -> Result<()> {
        self.expect_state(HarnessState::Scaffolded, "provision resources")?;

        for planned in &self.planned {
            self.resources
                .create(planned.spec.kind, planned.name.clone(), planned.spec.namespace.clone())
                .await?;
        }

        self.state = HarnessState::ResourcesProvisioned;
        Ok(())
    }

    /// Starts the project process on a freshly allocated port.
    pub async fn launch(&mut self) -> Result<()> {
        self.expect_state(HarnessState::ResourcesProvisioned, "launch")?;
        let project_path = self
            .project
            .as_ref()
            .map(|project| project.path().to_path_buf())
            .ok_or(HarnessError::NotStarted("project directory"))?;

        let port = self.ports.allocate()?;
        let address = self.ports.socket_addr(port);
        let base_url = match self.kind.health {
            HealthCheck::Http { .. } => Some(format!("http://{}", address)),
            HealthCheck::Tcp => None,
        };

        let mut arguments = self.kind.arguments.clone();
        arguments.push(CommandArgument::open(&self.kind.port_argument, port.to_string()));
        for planned in &self.planned {
            arguments.push(CommandArgument::open(&planned.spec.argument, &planned.name));
        }
        arguments.extend(self.arguments.iter().cloned());

        self.probe = Some(build_probe(&self.kind.health, address, base_url.as_deref())?);
        self.config = Some(ProjectConfig {
            build_configuration: self.build_configuration,
            target_runtime: self.target_runtime.clone(),
            port,
            base_url,
        });

        self.launcher.start(&project_path, &arguments).await?;
        self.state = HarnessState::ProcessStarted;
        debug!(kind = %self.kind.name, port, "Project process launched");
        Ok(())
    }

    /// Waits until the project is ready, failing early if its process exits.
    pub async fn wait_until_ready(&mut self) -> Result<()> {
        self.expect_state(HarnessState::ProcessStarted, "wait for readiness")?;

        let probe = self
            .probe
            .as_deref()
            .ok_or(HarnessError::NotStarted("health probe"))?;
        let endpoint = self
            .config
            .as_ref()
            .and_then(|config| config.base_url.clone());
        let policy = self.health_policy;
        let readiness = self.kind.readiness;
        let launcher = &mut self.launcher;

        let ready = async {
            match (readiness, endpoint) {
                (Readiness::EndpointResponds, Some(url)) => {
                    wait_until_endpoint_responds(&url, &policy).await
                }
                _ => wait_until_healthy(probe, &policy).await,
            }
        };

        tokio::select! {
            result = ready => result?,
            exit = launcher.wait_for_exit() => {
                let reason = match exit {
                    Ok(Some(status)) => format!("process exited with {} before it became ready", status),
                    Ok(None) => "process is not running".to_string(),
                    Err(e) => format!("process could not be awaited: {}", e),
                };
                return Err(HarnessError::ProcessStart(reason));
            }
        }

        self.state = HarnessState::Healthy;
        info!(kind = %self.kind.name, "Template project is ready");
        Ok(())
    }

    /// The project's health probe; only available once started.
    pub fn health(&self) -> Result<&dyn HealthProbe> {
        match (self.state, self.probe.as_deref()) {
            (HarnessState::Healthy, Some(probe)) => Ok(probe),
            _ => Err(HarnessError::NotStarted("health probe")),
        }
    }

    pub async fn probe_health(&self) -> Result<HealthStatus> {
        self.health()?.probe_once().await
    }

    /// A verifier that publishes through `publisher` and looks for artifacts
    /// in the project directory; only available once started.
    pub fn round_trip_verifier<P: RoundTripPayload>(
        &self,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Result<MessagingRoundTripVerifier<P>> {
        let project = match (self.state, self.project.as_ref()) {
            (HarnessState::Healthy, Some(project)) => project,
            _ => return Err(HarnessError::NotStarted("message round trips")),
        };
        let sink = Arc::new(DirectorySink::new(project.path()));
        Ok(MessagingRoundTripVerifier::new(publisher, sink).with_policy(self.round_trip_policy))
    }

    /// Stops the process, deletes the remote resources and removes the
    /// project directory (unless kept), in that order. Every action runs even
    /// when an earlier one fails; calling it again does nothing.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.state == HarnessState::Disposed {
            return Ok(());
        }
        info!(kind = %self.kind.name, state = %self.state, "Disposing template project");
        self.state = HarnessState::Disposed;
        self.probe = None;

        let mut errors = Vec::new();

        if let Err(e) = self.launcher.stop().await {
            warn!("Failed to stop the project process: {}", e);
            errors.push(e);
        }

        match self.resources.dispose_all().await {
            Ok(()) => {}
            Err(HarnessError::Aggregate(causes)) => errors.extend(causes),
            Err(e) => errors.push(e),
        }

        if let Some(project) = self.project.take() {
            if let Err(e) = project.release() {
                warn!("Failed to remove {}: {}", project.path().display(), e);
                errors.push(e);
            }
        }

        aggregate(errors)
    }
}

impl Drop for TemplateProject {
    fn drop(&mut self) {
        if !matches!(self.state, HarnessState::Created | HarnessState::Disposed) {
            warn!(
                kind = %self.kind.name,
                state = %self.state,
                "Template project dropped without dispose(); the process is killed but remote resources leak"
            );
        }
    }
}

fn build_probe(
    health: &HealthCheck,
    address: SocketAddr,
    base_url: Option<&str>,
) -> Result<Box<dyn HealthProbe>> {
    match (health, base_url) {
        (HealthCheck::Http { path }, Some(base_url)) => {
            Ok(Box::new(HttpHealthProbe::new(base_url, path)?))
        }
        (HealthCheck::Tcp, _) => Ok(Box::new(TcpHealthProbe::new(address))),
        (HealthCheck::Http { .. }, None) => Err(HarnessError::Config(
            "an HTTP health check needs a base URL".into(),
        )),
    }
}

/// Replaces `${resource:<ARGUMENT>}` in replacement texts with the name
/// planned for that resource.
fn expand_resource_references(patch: &Patch, planned: &[PlannedResource]) -> Result<Patch> {
    let mut expanded = patch.clone();
    for substitution in &mut expanded.substitutions {
        let mut text = substitution.replacement.clone();
        while let Some(start) = text.find(RESOURCE_REFERENCE_PREFIX) {
            let rest = &text[start + RESOURCE_REFERENCE_PREFIX.len()..];
            let end = rest.find('}').ok_or_else(|| {
                HarnessError::Config(format!(
                    "unterminated resource reference in '{}'",
                    substitution.replacement
                ))
            })?;
            let argument = &rest[..end];
            let name = planned
                .iter()
                .find(|planned| planned.spec.argument == argument)
                .map(|planned| planned.name.clone())
                .ok_or_else(|| {
                    HarnessError::Config(format!(
                        "patch references unknown resource argument '{}'",
                        argument
                    ))
                })?;
            let reference_end = start + RESOURCE_REFERENCE_PREFIX.len() + end + 1;
            text.replace_range(start..reference_end, &name);
        }
        substitution.replacement = text;
    }
    Ok(expanded)
}
