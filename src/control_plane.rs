//! Control planes that create and delete the remote entities of a test.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{ControlPlaneSettings, HarnessConfig, ServicePrincipal};
use crate::error::{HarnessError, Result};
use crate::resources::{ControlPlane, ResourceKind, TemporaryResource};
use crate::retry::RetryPolicy;

/// Tokens are renewed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// Resource-manager REST control plane, authenticated as a service principal.
///
/// A resource's namespace is the resource id of its parent, e.g.
/// `/subscriptions/<id>/resourceGroups/<group>/providers/Microsoft.ServiceBus/namespaces/<name>`
/// for queues and topics, or the storage account id for blob containers.
pub struct ArmControlPlane {
    client: reqwest::Client,
    principal: ServicePrincipal,
    settings: ControlPlaneSettings,
    provisioning: RetryPolicy,
    token: Mutex<Option<CachedToken>>,
}

impl ArmControlPlane {
    pub fn new(principal: ServicePrincipal, settings: ControlPlaneSettings) -> Result<Self> {
        if !principal.is_complete() {
            return Err(HarnessError::Config(
                "the control plane needs a complete service principal".into(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let provisioning = settings.provisioning_policy();

        Ok(Self {
            client,
            principal,
            settings,
            provisioning,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.settings.authority_host.trim_end_matches('/'),
            self.principal.tenant_id
        );
        let scope = format!(
            "{}/.default",
            self.settings.management_endpoint.trim_end_matches('/')
        );
        debug!(client_id = %self.principal.client_id, "Requesting control plane token");

        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.principal.client_id.as_str()),
                ("client_secret", self.principal.client_secret.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(HarnessError::Config(format!(
                "service principal '{}' could not authenticate against tenant '{}': {}",
                self.principal.client_id, self.principal.tenant_id, status
            )));
        }

        let token: TokenResponse = response.json().await?;
        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    fn resource_url(&self, resource: &TemporaryResource) -> String {
        let (collection, api_version) = match resource.kind {
            ResourceKind::Queue => ("queues", "2021-11-01"),
            ResourceKind::Topic => ("topics", "2021-11-01"),
            ResourceKind::EventHub => ("eventhubs", "2024-01-01"),
            ResourceKind::BlobContainer => ("blobServices/default/containers", "2023-01-01"),
        };
        format!(
            "{}/{}/{}/{}?api-version={}",
            self.settings.management_endpoint.trim_end_matches('/'),
            resource.namespace.trim_matches('/'),
            collection,
            resource.name,
            api_version
        )
    }

    fn resource_body(kind: ResourceKind) -> Value {
        match kind {
            ResourceKind::EventHub => json!({
                "properties": {
                    "partitionCount": 1,
                    "retentionDescription": {
                        "cleanupPolicy": "Delete",
                        "retentionTimeInHours": 1
                    }
                }
            }),
            _ => json!({ "properties": {} }),
        }
    }

    /// One GET; succeeds once the entity exists and finished provisioning.
    async fn check_provisioned(&self, url: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self.client.get(url).bearer_auth(token).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(HarnessError::ProbeFailure(format!("GET returned {}", status)));
        }

        let body: Value = response.json().await?;
        match body
            .pointer("/properties/provisioningState")
            .and_then(Value::as_str)
        {
            None | Some("Succeeded") => Ok(()),
            Some(state) => Err(HarnessError::ProbeFailure(format!(
                "provisioning state is {}",
                state
            ))),
        }
    }
}

#[async_trait]
impl ControlPlane for ArmControlPlane {
    async fn create_or_update(&self, resource: &TemporaryResource) -> Result<()> {
        let url = self.resource_url(resource);
        let token = self.access_token().await?;

        let response = self
            .client
            .put(&url)
            .bearer_auth(token)
            .json(&Self::resource_body(resource.kind))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let reason = response.text().await.unwrap_or_default();
            return Err(HarnessError::ResourceProvision {
                kind: resource.kind.to_string(),
                name: resource.name.clone(),
                action: "created",
                reason: format!("{}: {}", status, reason),
            });
        }

        self.provisioning
            .execute(
                &format!("provisioning of {}", resource),
                "check the service principal's role assignments on the namespace",
                || self.check_provisioned(&url),
            )
            .await?;

        info!("Temporary {} is available", resource);
        Ok(())
    }

    async fn begin_delete(&self, resource: &TemporaryResource) -> Result<()> {
        let url = self.resource_url(resource);
        let token = self.access_token().await?;

        let response = self.client.delete(&url).bearer_auth(token).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("{} was already gone", resource);
                Ok(())
            }
            status => Err(HarnessError::ResourceProvision {
                kind: resource.kind.to_string(),
                name: resource.name.clone(),
                action: "deleted",
                reason: status.to_string(),
            }),
        }
    }
}

/// Used when no service principal is configured: project kinds that need
/// remote entities cannot run.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedControlPlane;

#[async_trait]
impl ControlPlane for DetachedControlPlane {
    async fn create_or_update(&self, resource: &TemporaryResource) -> Result<()> {
        Err(HarnessError::ResourceProvision {
            kind: resource.kind.to_string(),
            name: resource.name.clone(),
            action: "created",
            reason: "no control plane is configured, add a service principal".to_string(),
        })
    }

    async fn begin_delete(&self, _resource: &TemporaryResource) -> Result<()> {
        Ok(())
    }
}

/// The control plane described by `config`: resource-manager backed when a
/// service principal is configured, detached otherwise.
pub fn from_config(config: &HarnessConfig) -> Result<Arc<dyn ControlPlane>> {
    match &config.service_principal {
        Some(principal) => Ok(Arc::new(ArmControlPlane::new(
            principal.clone(),
            config.control_plane.clone(),
        )?)),
        None => {
            debug!("No service principal configured, remote resources are unavailable");
            Ok(Arc::new(DetachedControlPlane))
        }
    }
}
