//! Remote entities that live exactly as long as one test.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{aggregate, HarnessError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Queue,
    Topic,
    EventHub,
    BlobContainer,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Queue => "queue",
            ResourceKind::Topic => "topic",
            ResourceKind::EventHub => "event hub",
            ResourceKind::BlobContainer => "blob container",
        };
        f.write_str(name)
    }
}

/// A remote entity created for the duration of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporaryResource {
    pub kind: ResourceKind,
    pub name: String,
    /// Parent namespace (or storage account) the entity lives in
    pub namespace: String,
}

impl TemporaryResource {
    pub fn new(kind: ResourceKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    fn provision_error(&self, action: &'static str, error: HarnessError) -> HarnessError {
        match error {
            e @ HarnessError::ResourceProvision { .. } => e,
            other => HarnessError::ResourceProvision {
                kind: self.kind.to_string(),
                name: self.name.clone(),
                action,
                reason: other.to_string(),
            },
        }
    }
}

impl fmt::Display for TemporaryResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}' in '{}'", self.kind, self.name, self.namespace)
    }
}

/// Creates and deletes remote entities.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Returns once the entity exists and is usable.
    async fn create_or_update(&self, resource: &TemporaryResource) -> Result<()>;

    /// Requests deletion without waiting for it to complete.
    async fn begin_delete(&self, resource: &TemporaryResource) -> Result<()>;
}

/// Tracks the remote entities created for one harness and deletes each of
/// them exactly once.
pub struct TemporaryResourceManager {
    control_plane: Arc<dyn ControlPlane>,
    resources: Vec<TemporaryResource>,
}

impl TemporaryResourceManager {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self {
            control_plane,
            resources: Vec::new(),
        }
    }

    /// A name no other test run will pick.
    pub fn generate_name(kind: ResourceKind) -> String {
        let id = Uuid::new_v4();
        match kind {
            ResourceKind::Queue => format!("queue-{}", id),
            ResourceKind::Topic => format!("topic-{}", id),
            ResourceKind::EventHub => format!("hub-{}", id),
            // Container names only allow lowercase letters, digits and dashes.
            ResourceKind::BlobContainer => format!("container{}", id.simple()),
        }
    }

    pub async fn create(
        &mut self,
        kind: ResourceKind,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<TemporaryResource> {
        let resource = TemporaryResource::new(kind, name, namespace);
        info!("Creating temporary {}", resource);

        // Tracked before the request goes out: a create that fails or is
        // cancelled halfway may still have left the entity behind, and
        // deleting a missing entity succeeds.
        self.resources.push(resource.clone());
        self.control_plane
            .create_or_update(&resource)
            .await
            .map_err(|e| resource.provision_error("created", e))?;

        Ok(resource)
    }

    pub fn resources(&self) -> &[TemporaryResource] {
        &self.resources
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Deletes one tracked resource. Untracked (or already disposed)
    /// resources are ignored.
    pub async fn dispose(&mut self, resource: &TemporaryResource) -> Result<()> {
        let Some(index) = self.resources.iter().position(|r| r == resource) else {
            debug!("{} is not tracked, nothing to delete", resource);
            return Ok(());
        };
        let resource = self.resources.remove(index);
        self.delete(&resource).await
    }

    /// Attempts to delete every tracked resource in creation order. Every
    /// resource is forgotten after its first attempt, whatever the outcome.
    pub async fn dispose_all(&mut self) -> Result<()> {
        let mut errors = Vec::new();
        for resource in std::mem::take(&mut self.resources) {
            if let Err(e) = self.delete(&resource).await {
                warn!("Failed to delete {}: {}", resource, e);
                errors.push(e);
            }
        }
        aggregate(errors)
    }

    async fn delete(&self, resource: &TemporaryResource) -> Result<()> {
        info!("Deleting temporary {}", resource);
        self.control_plane
            .begin_delete(resource)
            .await
            .map_err(|e| resource.provision_error("deleted", e))
    }
}

impl Drop for TemporaryResourceManager {
    fn drop(&mut self) {
        for resource in &self.resources {
            warn!("Temporary {} was never deleted and leaks", resource);
        }
    }
}
