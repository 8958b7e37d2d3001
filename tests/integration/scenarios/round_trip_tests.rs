use crate::integration::infrastructure::{
    FakeControlPlane, FakeService, InMemoryBroker, TestWorkspace, WorkerBehavior,
    ARTIFACT_DIRECTORY,
};
use anyhow::Result;
use serde_json::{json, Value};
use stagehand::{HarnessError, Order, RetryPolicy, SensorUpdate, TemplateProject};
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn started_queue_worker(
    workspace: &TestWorkspace,
    broker: &Arc<InMemoryBroker>,
    worker: WorkerBehavior,
) -> Result<TemplateProject> {
    let kind = workspace.queue_worker_kind();
    let service = FakeService::new(kind.port_argument.clone())
        .with_broker(Arc::clone(broker))
        .with_worker(worker);

    let mut project = workspace
        .builder(kind)
        .launcher(Box::new(service))
        .control_plane(Arc::new(FakeControlPlane::new()))
        .build()?;
    project.start().await?;
    Ok(project)
}

/// Orders sent to a queue worker come back with matching correlation and a
/// fresh cycle id per message
#[tokio::test]
async fn test_queue_worker_round_trips() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let workspace = TestWorkspace::new()?;
    let broker = InMemoryBroker::new();
    let mut project = started_queue_worker(&workspace, &broker, WorkerBehavior::Echo).await?;

    let verifier = project.round_trip_verifier::<Order>(broker.clone())?;
    let first = verifier.simulate_round_trip().await?;
    let second = verifier.simulate_round_trip().await?;

    assert_ne!(first.context.transaction_id, second.context.transaction_id);
    assert_ne!(first.cycle_id, second.cycle_id);
    assert_eq!(broker.published(), 2);

    let artifact = project
        .destination()
        .join(ARTIFACT_DIRECTORY)
        .join(format!("{}.json", first.context.transaction_id));
    assert!(artifact.exists());

    project.dispose().await?;
    Ok(())
}

/// Sensor updates through an event-hub worker
#[tokio::test]
async fn test_event_hub_worker_round_trip() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let workspace = TestWorkspace::new()?;
    let broker = InMemoryBroker::new();
    let kind = workspace.event_hub_worker_kind();
    let service = FakeService::new(kind.port_argument.clone()).with_broker(broker.clone());

    let mut project = workspace
        .builder(kind)
        .launcher(Box::new(service))
        .control_plane(Arc::new(FakeControlPlane::new()))
        .build()?;
    project.start().await?;

    let report = project
        .round_trip_verifier::<SensorUpdate>(broker.clone())?
        .simulate_round_trip()
        .await?;
    assert_eq!(report.context.transaction_id.len(), 32);
    assert_eq!(report.context.operation_parent_id.len(), 16);
    assert!(!report.cycle_id.is_empty());

    project.dispose().await?;
    Ok(())
}

fn change_amount(artifact: &mut Value) {
    let amount = artifact["amount"].as_i64().unwrap_or_default();
    artifact["amount"] = json!(amount + 1);
}

fn drop_parent_id(artifact: &mut Value) {
    artifact["correlationInfo"]["operationParentId"] = json!("0000000000000000");
}

/// A handler that changes the payload is reported with the field it changed
#[tokio::test]
async fn test_changed_payload_is_a_mismatch() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let workspace = TestWorkspace::new()?;
    let broker = InMemoryBroker::new();
    let mut project =
        started_queue_worker(&workspace, &broker, WorkerBehavior::Tamper(change_amount)).await?;

    let result = project
        .round_trip_verifier::<Order>(broker.clone())?
        .simulate_round_trip()
        .await;
    match result {
        Err(HarnessError::RoundTripMismatch { field, .. }) => assert!(field.contains("amount")),
        other => panic!("expected a payload mismatch, got {:?}", other),
    }

    project.dispose().await?;
    Ok(())
}

/// A handler that loses the parent id breaks the correlation chain
#[tokio::test]
async fn test_lost_parent_id_is_a_mismatch() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let workspace = TestWorkspace::new()?;
    let broker = InMemoryBroker::new();
    let mut project =
        started_queue_worker(&workspace, &broker, WorkerBehavior::Tamper(drop_parent_id)).await?;

    let result = project
        .round_trip_verifier::<Order>(broker.clone())?
        .simulate_round_trip()
        .await;
    assert!(matches!(
        result,
        Err(HarnessError::RoundTripMismatch { ref field, .. }) if field == "operation parent id"
    ));

    project.dispose().await?;
    Ok(())
}

/// Two artifacts for one transaction are ambiguous, not a pass
#[tokio::test]
async fn test_duplicate_artifacts_are_ambiguous() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let workspace = TestWorkspace::new()?;
    let broker = InMemoryBroker::new();
    let mut project =
        started_queue_worker(&workspace, &broker, WorkerBehavior::Duplicate).await?;

    let verifier = project
        .round_trip_verifier::<Order>(broker.clone())?
        .with_policy(RetryPolicy::new(Duration::from_millis(200), Duration::from_secs(5)));
    let result = verifier.simulate_round_trip().await;
    assert!(matches!(
        result,
        Err(HarnessError::AmbiguousResult { count: 2, .. })
    ));

    project.dispose().await?;
    Ok(())
}

/// A worker that never answers fails after the round-trip timeout
#[tokio::test]
async fn test_silent_worker_times_out() -> Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let workspace = TestWorkspace::new()?;
    let broker = InMemoryBroker::new();
    let mut project = started_queue_worker(&workspace, &broker, WorkerBehavior::Ignore).await?;

    let timeout = Duration::from_millis(500);
    let verifier = project
        .round_trip_verifier::<Order>(broker.clone())?
        .with_policy(RetryPolicy::new(Duration::from_millis(50), timeout));

    let started = Instant::now();
    let result = verifier.simulate_round_trip().await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(HarnessError::RoundTripTimeout { .. })));
    assert_eq!(broker.published(), 1);
    assert!(elapsed >= timeout, "gave up after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(2), "took {:?}", elapsed);

    project.dispose().await?;
    Ok(())
}
