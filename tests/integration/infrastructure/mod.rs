pub mod fake_control_plane;
pub mod fake_service;

pub use fake_control_plane::{ControlPlaneCall, FakeControlPlane};
pub use fake_service::{FakeService, InMemoryBroker, ServiceState, WorkerBehavior, ARTIFACT_DIRECTORY};
pub use workspace::TestWorkspace;
