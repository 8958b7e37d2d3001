//! Harness configuration, loaded from TOML with environment overrides.
//!
//! ```toml
//! build_configuration = "Release"
//! target_runtime = "net8.0"
//! sources_root = "/build/sources"
//!
//! [service_principal]
//! tenant_id = "..."
//! client_id = "..."
//! # client_secret comes from STAGEHAND_CLIENT_SECRET
//!
//! [[kinds]]
//! name = "web-api"
//! template = "src/WebApi"
//! entry_file = "Program.cs"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::environment::CommandArgument;
use crate::error::{HarnessError, Result};
use crate::health::DEFAULT_HEALTH_PATH;
use crate::launcher::{BuildConfiguration, LaunchCommand, TargetRuntime};
use crate::resources::ResourceKind;
use crate::retry::RetryPolicy;
use crate::scaffold::{FilePatch, ProjectOptions, TeardownPolicy};

pub const TENANT_ID_VAR: &str = "STAGEHAND_TENANT_ID";
pub const CLIENT_ID_VAR: &str = "STAGEHAND_CLIENT_ID";
pub const CLIENT_SECRET_VAR: &str = "STAGEHAND_CLIENT_SECRET";
pub const SOURCES_ROOT_VAR: &str = "STAGEHAND_SOURCES_ROOT";

/// Identity used against the remote control plane.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePrincipal {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
}

impl ServicePrincipal {
    pub fn is_complete(&self) -> bool {
        !self.tenant_id.is_empty() && !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    /// The variables credential chains of the launched projects look for.
    pub fn as_secret_arguments(&self) -> Vec<CommandArgument> {
        vec![
            CommandArgument::secret("AZURE_TENANT_ID", &self.tenant_id),
            CommandArgument::secret("AZURE_CLIENT_ID", &self.client_id),
            CommandArgument::secret("AZURE_CLIENT_SECRET", &self.client_secret),
        ]
    }
}

impl fmt::Debug for ServicePrincipal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePrincipal")
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneSettings {
    pub management_endpoint: String,
    pub authority_host: String,
    /// How long a freshly created entity may take to become visible
    pub provisioning_timeout_ms: u64,
    pub provisioning_interval_ms: u64,
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self {
            management_endpoint: "https://management.azure.com".to_string(),
            authority_host: "https://login.microsoftonline.com".to_string(),
            provisioning_timeout_ms: 60_000,
            provisioning_interval_ms: 1_000,
        }
    }
}

impl ControlPlaneSettings {
    pub fn provisioning_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.provisioning_interval_ms),
            Duration::from_millis(self.provisioning_timeout_ms),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    #[serde(flatten)]
    pub command: LaunchCommand,
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            command: LaunchCommand::default(),
            graceful_shutdown_timeout_ms: 10_000,
        }
    }
}

impl LaunchSettings {
    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub round_trip_interval_ms: u64,
    pub round_trip_timeout_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        let health = RetryPolicy::health();
        let round_trip = RetryPolicy::round_trip();
        Self {
            health_interval_ms: health.interval.as_millis() as u64,
            health_timeout_ms: health.timeout.as_millis() as u64,
            round_trip_interval_ms: round_trip.interval.as_millis() as u64,
            round_trip_timeout_ms: round_trip.timeout.as_millis() as u64,
        }
    }
}

impl TimeoutSettings {
    pub fn health_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.health_interval_ms),
            Duration::from_millis(self.health_timeout_ms),
        )
    }

    pub fn round_trip_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.round_trip_interval_ms),
            Duration::from_millis(self.round_trip_timeout_ms),
        )
    }
}

/// A remote entity a project kind needs, and the argument that tells the
/// project its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    /// Open argument receiving the generated name, e.g. `ARCUS_SERVICEBUS_QUEUENAME`
    pub argument: String,
    /// Parent namespace or storage account
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HealthCheck {
    Http {
        #[serde(default = "default_health_path")]
        path: String,
    },
    Tcp,
}

impl Default for HealthCheck {
    fn default() -> Self {
        HealthCheck::Http {
            path: default_health_path(),
        }
    }
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

/// What "started" means for a project kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Readiness {
    /// The health check reports Healthy
    #[default]
    Healthy,
    /// The HTTP endpoint answers any request
    EndpointResponds,
}

/// Everything that distinguishes one kind of template project from another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectKind {
    pub name: String,
    /// Template directory, relative to the sources root
    pub template: PathBuf,
    /// Main source file of the generated project, patched unless a patch
    /// names another file
    pub entry_file: PathBuf,
    #[serde(default)]
    pub fixtures: Vec<String>,
    #[serde(default)]
    pub patches: Vec<FilePatch>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub arguments: Vec<CommandArgument>,
    #[serde(default)]
    pub excluded_features: Vec<String>,
    /// Open argument receiving the allocated port
    #[serde(default = "default_port_argument")]
    pub port_argument: String,
    #[serde(default)]
    pub health: HealthCheck,
    #[serde(default)]
    pub readiness: Readiness,
}

fn default_port_argument() -> String {
    "ARCUS_HTTP_PORT".to_string()
}

impl ProjectKind {
    pub fn new(
        name: impl Into<String>,
        template: impl Into<PathBuf>,
        entry_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            entry_file: entry_file.into(),
            fixtures: Vec::new(),
            patches: Vec::new(),
            resources: Vec::new(),
            arguments: Vec::new(),
            excluded_features: Vec::new(),
            port_argument: default_port_argument(),
            health: HealthCheck::default(),
            readiness: Readiness::default(),
        }
    }

    pub fn project_options(&self, teardown: TeardownPolicy) -> ProjectOptions {
        self.excluded_features
            .iter()
            .fold(ProjectOptions::new().with_teardown(teardown), |options, feature| {
                options.exclude_feature(feature.clone())
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HarnessError::Config("project kind without a name".into()));
        }
        if self.port_argument.is_empty() {
            return Err(HarnessError::Config(format!(
                "project kind '{}' has an empty port argument",
                self.name
            )));
        }
        if self.health == HealthCheck::Tcp && self.readiness == Readiness::EndpointResponds {
            return Err(HarnessError::Config(format!(
                "project kind '{}' uses a TCP health check, it cannot wait for an HTTP endpoint",
                self.name
            )));
        }
        for resource in &self.resources {
            if resource.argument.is_empty() {
                return Err(HarnessError::Config(format!(
                    "a {} of project kind '{}' has no argument name",
                    resource.kind, self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub build_configuration: BuildConfiguration,
    #[serde(default)]
    pub target_runtime: TargetRuntime,
    /// Root the template directories are resolved against
    #[serde(default = "default_sources_root")]
    pub sources_root: PathBuf,
    /// Where fixture files are searched; defaults to the sources root
    #[serde(default)]
    pub fixtures_root: Option<PathBuf>,
    /// Parent of the scaffolded projects; defaults to the system temp dir
    #[serde(default)]
    pub work_root: Option<PathBuf>,
    #[serde(default)]
    pub teardown: TeardownPolicy,
    #[serde(default)]
    pub launch: LaunchSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
    #[serde(default)]
    pub service_principal: Option<ServicePrincipal>,
    #[serde(default)]
    pub control_plane: ControlPlaneSettings,
    #[serde(default)]
    pub kinds: Vec<ProjectKind>,
}

fn default_sources_root() -> PathBuf {
    PathBuf::from(".")
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            build_configuration: BuildConfiguration::default(),
            target_runtime: TargetRuntime::default(),
            sources_root: default_sources_root(),
            fixtures_root: None,
            work_root: None,
            teardown: TeardownPolicy::default(),
            launch: LaunchSettings::default(),
            timeouts: TimeoutSettings::default(),
            service_principal: None,
            control_plane: ControlPlaneSettings::default(),
            kinds: Vec::new(),
        }
    }
}

impl HarnessConfig {
    /// Reads `path`, applies the environment overrides and validates.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&contents)?;
        config.apply_env_overrides();
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| HarnessError::Config(e.to_string()))
    }

    /// Secrets and the sources root may come from the environment instead of
    /// the file; a set variable always wins.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var(SOURCES_ROOT_VAR) {
            self.sources_root = PathBuf::from(root);
        }

        let tenant_id = std::env::var(TENANT_ID_VAR).ok();
        let client_id = std::env::var(CLIENT_ID_VAR).ok();
        let client_secret = std::env::var(CLIENT_SECRET_VAR).ok();
        if tenant_id.is_none() && client_id.is_none() && client_secret.is_none() {
            return;
        }

        let principal = self.service_principal.get_or_insert_with(ServicePrincipal::default);
        if let Some(tenant_id) = tenant_id {
            principal.tenant_id = tenant_id;
        }
        if let Some(client_id) = client_id {
            principal.client_id = client_id;
        }
        if let Some(client_secret) = client_secret {
            principal.client_secret = client_secret;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(principal) = &self.service_principal {
            if !principal.is_complete() {
                return Err(HarnessError::Config(format!(
                    "service principal is incomplete, set tenant_id, client_id and client_secret (or {}, {} and {})",
                    TENANT_ID_VAR, CLIENT_ID_VAR, CLIENT_SECRET_VAR
                )));
            }
        }

        let mut names = std::collections::HashSet::new();
        for kind in &self.kinds {
            kind.validate()?;
            if !names.insert(kind.name.as_str()) {
                return Err(HarnessError::Config(format!(
                    "project kind '{}' is defined twice",
                    kind.name
                )));
            }
        }
        Ok(())
    }

    pub fn kind(&self, name: &str) -> Result<&ProjectKind> {
        self.kinds.iter().find(|kind| kind.name == name).ok_or_else(|| {
            let known: Vec<&str> = self.kinds.iter().map(|kind| kind.name.as_str()).collect();
            HarnessError::Config(format!(
                "unknown project kind '{}', known kinds: {:?}",
                name, known
            ))
        })
    }

    pub fn template_dir(&self, kind: &ProjectKind) -> PathBuf {
        self.sources_root.join(&kind.template)
    }

    pub fn fixtures_root(&self) -> PathBuf {
        self.fixtures_root
            .clone()
            .unwrap_or_else(|| self.sources_root.clone())
    }

    pub fn work_root(&self) -> PathBuf {
        self.work_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}
