//! Liveness and health polling for a running project.

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{HarnessError, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_HEALTH_PATH: &str = "/api/v1/health";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_GUIDANCE: &str =
    "please check any build or runtime errors of the scaffolded project";

/// Reported health of a project. Only [`HealthStatus::Healthy`] counts as
/// ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Unhealthy,
    Degraded,
    Healthy,
}

impl HealthStatus {
    pub fn is_ready(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Unhealthy => "Unhealthy",
            HealthStatus::Degraded => "Degraded",
            HealthStatus::Healthy => "Healthy",
        };
        f.write_str(name)
    }
}

// Services emit the status either by name or as its numeric value
// (0 = Unhealthy, 1 = Degraded, 2 = Healthy).
impl<'de> Deserialize<'de> for HealthStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Number(u8),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(0) => Ok(HealthStatus::Unhealthy),
            Raw::Number(1) => Ok(HealthStatus::Degraded),
            Raw::Number(2) => Ok(HealthStatus::Healthy),
            Raw::Name(name) if name.eq_ignore_ascii_case("unhealthy") => Ok(HealthStatus::Unhealthy),
            Raw::Name(name) if name.eq_ignore_ascii_case("degraded") => Ok(HealthStatus::Degraded),
            Raw::Name(name) if name.eq_ignore_ascii_case("healthy") => Ok(HealthStatus::Healthy),
            Raw::Number(n) => Err(serde::de::Error::custom(format!("unknown health status {}", n))),
            Raw::Name(name) => Err(serde::de::Error::custom(format!(
                "unknown health status '{}'",
                name
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReportEntry {
    #[serde(alias = "Status")]
    pub status: HealthStatus,
    #[serde(default, alias = "Description")]
    pub description: Option<String>,
    /// Kept verbatim, e.g. `00:00:00.0012345`
    #[serde(default, alias = "Duration")]
    pub duration: Option<String>,
    #[serde(default, alias = "Data")]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default, alias = "Tags")]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    #[serde(alias = "Status")]
    pub status: HealthStatus,
    #[serde(default, alias = "TotalDuration")]
    pub total_duration: Option<String>,
    #[serde(default, alias = "Entries")]
    pub entries: BTreeMap<String, HealthReportEntry>,
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Fetches the full report once. Any transport or decoding failure is a
    /// [`HarnessError::ProbeFailure`].
    async fn probe_report(&self) -> Result<HealthReport>;

    async fn probe_once(&self) -> Result<HealthStatus> {
        Ok(self.probe_report().await?.status)
    }

    /// Where the probe looks, for diagnostics.
    fn target(&self) -> String;
}

/// Probes an HTTP health endpoint.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(base_url: &str, path: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: join_url(base_url, path),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe_report(&self) -> Result<HealthReport> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| HarnessError::ProbeFailure(format!("GET {}: {}", self.url, e)))?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::SERVICE_UNAVAILABLE {
            return Err(HarnessError::ProbeFailure(format!(
                "GET {} returned {}",
                self.url, status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| HarnessError::ProbeFailure(format!("GET {}: {}", self.url, e)))?;
        let report: HealthReport = serde_json::from_str(&body).map_err(|e| {
            HarnessError::ProbeFailure(format!("invalid health report from {}: {}", self.url, e))
        })?;

        debug!(url = %self.url, http_status = %status, "health report: {}", report.status);
        Ok(report)
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}

/// Probes a TCP health port: the service writes its JSON report to every
/// connection and closes it.
#[derive(Debug, Clone)]
pub struct TcpHealthProbe {
    address: SocketAddr,
}

impl TcpHealthProbe {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }
}

#[async_trait]
impl HealthProbe for TcpHealthProbe {
    async fn probe_report(&self) -> Result<HealthReport> {
        let read = async {
            let mut stream = TcpStream::connect(self.address).await?;
            let mut body = Vec::new();
            stream.read_to_end(&mut body).await?;
            Ok::<_, std::io::Error>(body)
        };

        let body = match timeout(PROBE_TIMEOUT, read).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                return Err(HarnessError::ProbeFailure(format!(
                    "tcp {}: {}",
                    self.address, e
                )))
            }
            Err(_) => {
                return Err(HarnessError::ProbeFailure(format!(
                    "tcp {}: no report within {:?}",
                    self.address, PROBE_TIMEOUT
                )))
            }
        };

        serde_json::from_slice(&body).map_err(|e| {
            HarnessError::ProbeFailure(format!(
                "invalid health report from tcp {}: {}",
                self.address, e
            ))
        })
    }

    fn target(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Polls `probe` until it reports Healthy. Failures and non-healthy reports
/// are both retried until the policy's timeout.
pub async fn wait_until_healthy(probe: &dyn HealthProbe, policy: &RetryPolicy) -> Result<()> {
    let target = probe.target();
    info!("Waiting for {} to report Healthy", target);

    policy
        .execute(
            &format!("health check at {}", target),
            STARTUP_GUIDANCE,
            || async {
                match probe.probe_once().await? {
                    HealthStatus::Healthy => Ok(()),
                    other => Err(HarnessError::ProbeFailure(format!("reported {}", other))),
                }
            },
        )
        .await?;

    info!("{} is Healthy", target);
    Ok(())
}

/// Polls `url` until the server answers at all. Any HTTP status means the
/// socket is bound and the application is accepting requests.
pub async fn wait_until_endpoint_responds(url: &str, policy: &RetryPolicy) -> Result<()> {
    let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
    info!("Waiting for {} to accept requests", url);

    policy
        .execute(&format!("endpoint {}", url), STARTUP_GUIDANCE, || {
            let request = client.get(url);
            async move { request.send().await.map(|response| response.status()) }
        })
        .await
        .map(|status| debug!(url, %status, "endpoint responds"))
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
