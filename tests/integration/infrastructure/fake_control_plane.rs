use async_trait::async_trait;
use stagehand::{ControlPlane, HarnessError, ResourceKind, TemporaryResource};
use std::collections::HashSet;
use std::sync::Mutex;

/// What the control plane was asked to do, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneCall {
    Create(ResourceKind, String),
    Delete(ResourceKind, String),
}

/// In-memory control plane that records every call and fails on request
#[derive(Default)]
pub struct FakeControlPlane {
    calls: Mutex<Vec<ControlPlaneCall>>,
    live: Mutex<HashSet<String>>,
    failing_creates: Mutex<HashSet<ResourceKind>>,
    failing_deletes: Mutex<HashSet<ResourceKind>>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every creation of `kind` fails from now on
    pub fn fail_creating(&self, kind: ResourceKind) {
        self.failing_creates.lock().unwrap().insert(kind);
    }

    /// Every deletion of `kind` fails from now on
    pub fn fail_deleting(&self, kind: ResourceKind) {
        self.failing_deletes.lock().unwrap().insert(kind);
    }

    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn created(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ControlPlaneCall::Create(_, name) => Some(name),
                ControlPlaneCall::Delete(..) => None,
            })
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ControlPlaneCall::Delete(_, name) => Some(name),
                ControlPlaneCall::Create(..) => None,
            })
            .collect()
    }

    /// Names that were created and not deleted yet
    pub fn live(&self) -> HashSet<String> {
        self.live.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn create_or_update(&self, resource: &TemporaryResource) -> stagehand::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(ControlPlaneCall::Create(resource.kind, resource.name.clone()));

        if self.failing_creates.lock().unwrap().contains(&resource.kind) {
            return Err(HarnessError::ProbeFailure(format!(
                "quota exceeded for {}",
                resource.kind
            )));
        }
        self.live.lock().unwrap().insert(resource.name.clone());
        Ok(())
    }

    async fn begin_delete(&self, resource: &TemporaryResource) -> stagehand::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(ControlPlaneCall::Delete(resource.kind, resource.name.clone()));

        if self.failing_deletes.lock().unwrap().contains(&resource.kind) {
            return Err(HarnessError::ProbeFailure(format!(
                "{} is locked",
                resource.name
            )));
        }
        self.live.lock().unwrap().remove(&resource.name);
        Ok(())
    }
}
