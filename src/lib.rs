//! Ephemeral-service test harness.
//!
//! Scaffolds a project from a template, provisions the remote resources it
//! needs, launches it, waits until it is healthy, verifies message round
//! trips through it and tears everything down again.

pub mod config;
pub mod control_plane;
pub mod environment;
pub mod error;
pub mod harness;
pub mod health;
pub mod launcher;
pub mod messaging;
pub mod payload;
pub mod ports;
pub mod resources;
pub mod retry;
pub mod scaffold;

pub use config::{HarnessConfig, HealthCheck, ProjectKind, Readiness, ResourceSpec, ServicePrincipal};
pub use environment::{CommandArgument, Environment, Visibility};
pub use error::{HarnessError, Result};
pub use harness::{HarnessState, ProjectConfig, TemplateProject, TemplateProjectBuilder};
pub use health::{HealthProbe, HealthReport, HealthStatus};
pub use launcher::{BuildConfiguration, CommandLauncher, LaunchCommand, Launcher, TargetRuntime};
pub use messaging::{
    ArtifactSink, CorrelationContext, DirectorySink, MessagePublisher, MessagingRoundTripVerifier,
    OutgoingMessage, RoundTripReport,
};
pub use payload::{Order, RoundTripPayload, SensorUpdate};
pub use resources::{ControlPlane, ResourceKind, TemporaryResource, TemporaryResourceManager};
pub use retry::RetryPolicy;
pub use scaffold::{Patch, ProjectDirectory, ProjectOptions, ProjectScaffolder, TeardownPolicy};
