//! Correlation-tracked message round trips through a running project.
//!
//! A round trip publishes a generated payload with fresh correlation
//! metadata, waits for the artifact the project's message handler writes for
//! that transaction, and checks that payload and correlation survived.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{HarnessError, Result};
use crate::payload::{EventData, RoundTripPayload};
use crate::retry::{retry_forever, with_timeout, RetryPolicy};

pub const DIAGNOSTIC_ID: &str = "Diagnostic-Id";
pub const TRANSACTION_ID: &str = "Transaction-Id";
pub const OPERATION_PARENT_ID: &str = "Operation-Parent-Id";

const TRACE_PARENT_VERSION: &str = "00";
const TRACE_FLAGS: &str = "01";

/// Identifies one message as it travels through a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationContext {
    /// 32 lowercase hex digits
    pub transaction_id: String,
    /// 16 lowercase hex digits
    pub operation_parent_id: String,
}

impl CorrelationContext {
    pub fn generate() -> Self {
        let span: u64 = rand::thread_rng().gen();
        Self {
            transaction_id: Uuid::new_v4().simple().to_string(),
            operation_parent_id: format!("{:016x}", span),
        }
    }

    /// W3C trace-parent form: `00-<transaction id>-<parent id>-01`.
    pub fn diagnostic_id(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            TRACE_PARENT_VERSION, self.transaction_id, self.operation_parent_id, TRACE_FLAGS
        )
    }

    pub fn parse_diagnostic_id(value: &str) -> Result<Self> {
        let parts: Vec<&str> = value.split('-').collect();
        let valid = parts.len() == 4
            && parts[0].len() == 2
            && parts[1].len() == 32
            && parts[2].len() == 16
            && parts[3].len() == 2
            && parts.iter().all(|part| part.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(HarnessError::Config(format!(
                "'{}' is not a trace-parent diagnostic id",
                value
            )));
        }

        Ok(Self {
            transaction_id: parts[1].to_string(),
            operation_parent_id: parts[2].to_string(),
        })
    }

    /// Application properties carried by the published message.
    pub fn metadata(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (DIAGNOSTIC_ID.to_string(), self.diagnostic_id()),
            (TRANSACTION_ID.to_string(), self.transaction_id.clone()),
            (OPERATION_PARENT_ID.to_string(), self.operation_parent_id.clone()),
        ])
    }
}

impl fmt::Display for CorrelationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.diagnostic_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// JSON-encoded payload
    pub body: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
}

/// Sends a message to whatever the project consumes from.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, message: OutgoingMessage) -> Result<()>;
}

/// Looks for the artifacts a project produced for a transaction.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Raw contents of every artifact for `transaction_id`; empty while
    /// nothing has been produced yet.
    async fn find(&self, transaction_id: &str) -> Result<Vec<Vec<u8>>>;
}

/// Artifacts are `<transaction id>.json` files anywhere below a directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn find(&self, transaction_id: &str) -> Result<Vec<Vec<u8>>> {
        let root = self.root.clone();
        let file_name = format!("{}.json", transaction_id);

        tokio::task::spawn_blocking(move || {
            WalkDir::new(&root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| entry.file_name() == std::ffi::OsStr::new(&file_name))
                .map(|entry| std::fs::read(entry.path()).map_err(HarnessError::from))
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| HarnessError::Io(std::io::Error::other(e)))?
    }
}

/// What a successful round trip observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundTripReport {
    pub context: CorrelationContext,
    /// Assigned by the project; differs for every processed message
    pub cycle_id: String,
}

pub struct MessagingRoundTripVerifier<P> {
    publisher: Arc<dyn MessagePublisher>,
    sink: Arc<dyn ArtifactSink>,
    policy: RetryPolicy,
    payload: PhantomData<fn() -> P>,
}

impl<P: RoundTripPayload> MessagingRoundTripVerifier<P> {
    pub fn new(publisher: Arc<dyn MessagePublisher>, sink: Arc<dyn ArtifactSink>) -> Self {
        Self {
            publisher,
            sink,
            policy: RetryPolicy::round_trip(),
            payload: PhantomData,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Publishes one generated payload and verifies what the project made
    /// of it.
    pub async fn simulate_round_trip(&self) -> Result<RoundTripReport> {
        let payload = P::generate(&mut rand::thread_rng());
        let context = CorrelationContext::generate();

        let message = OutgoingMessage {
            body: serde_json::to_vec(&payload)?,
            metadata: context.metadata(),
        };
        info!(transaction_id = %context.transaction_id, "Publishing round-trip message");
        self.publisher.publish(message).await?;

        let artifacts = self.wait_for_artifacts(&context.transaction_id).await?;
        if artifacts.len() != 1 {
            return Err(HarnessError::AmbiguousResult {
                what: format!("artifact for transaction '{}'", context.transaction_id),
                count: artifacts.len(),
            });
        }

        let event: EventData<P> = serde_json::from_slice(&artifacts[0])?;
        verify(&payload, &context, &event)?;

        let cycle_id = event.correlation_info.cycle_id;
        info!(
            transaction_id = %context.transaction_id,
            cycle_id = %cycle_id,
            "Round trip verified"
        );
        Ok(RoundTripReport { context, cycle_id })
    }

    async fn wait_for_artifacts(&self, transaction_id: &str) -> Result<Vec<Vec<u8>>> {
        let sink = self.sink.as_ref();
        let mut last_failure = None;

        let found = with_timeout(
            self.policy.timeout,
            retry_forever(
                self.policy.interval,
                || async move {
                    let artifacts = sink.find(transaction_id).await?;
                    if artifacts.is_empty() {
                        return Err(HarnessError::ProbeFailure("no artifact yet".into()));
                    }
                    // A handler may still be writing; only complete JSON counts.
                    for artifact in &artifacts {
                        serde_json::from_slice::<serde_json::Value>(artifact)?;
                    }
                    Ok(artifacts)
                },
                &mut last_failure,
            ),
        )
        .await;

        found.ok_or_else(|| {
            debug!(transaction_id, last_failure = ?last_failure, "round trip timed out");
            HarnessError::RoundTripTimeout {
                transaction_id: transaction_id.to_string(),
                timeout: self.policy.timeout,
            }
        })
    }
}

fn verify<P: RoundTripPayload>(
    payload: &P,
    context: &CorrelationContext,
    event: &EventData<P>,
) -> Result<()> {
    let correlation = &event.correlation_info;
    if correlation.transaction_id != context.transaction_id {
        return Err(mismatch(
            "transaction id",
            &context.transaction_id,
            &correlation.transaction_id,
        ));
    }
    if correlation.operation_parent_id != context.operation_parent_id {
        return Err(mismatch(
            "operation parent id",
            &context.operation_parent_id,
            &correlation.operation_parent_id,
        ));
    }
    if correlation.cycle_id.trim().is_empty() {
        return Err(mismatch("cycle id", "a non-empty value", ""));
    }
    if let Some((field, expected, actual)) = payload.first_difference(&event.payload) {
        return Err(mismatch(&format!("payload field '{}'", field), &expected, &actual));
    }
    Ok(())
}

fn mismatch(field: &str, expected: &str, actual: &str) -> HarnessError {
    HarnessError::RoundTripMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}
