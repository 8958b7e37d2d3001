use async_trait::async_trait;
use serde_json::{json, Value};
use stagehand::messaging::{DIAGNOSTIC_ID, TRANSACTION_ID};
use stagehand::{
    CommandArgument, CorrelationContext, HarnessError, HealthStatus, Launcher, MessagePublisher,
    OutgoingMessage,
};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

type Result<T> = stagehand::Result<T>;

/// Directory below the project root the worker writes its artifacts to
pub const ARTIFACT_DIRECTORY: &str = "artifacts";

/// Queue between the test and a running fake service. Messages published
/// before the service starts are kept until its worker picks them up.
pub struct InMemoryBroker {
    sender: mpsc::UnboundedSender<OutgoingMessage>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<OutgoingMessage>>>,
    published: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            published: AtomicUsize::new(0),
        })
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<OutgoingMessage>> {
        self.receiver.lock().unwrap().take()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, message: OutgoingMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| HarnessError::ProbeFailure("broker has no consumer left".into()))?;
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How the fake worker treats a received message
#[derive(Clone, Copy)]
pub enum WorkerBehavior {
    /// Writes the payload back with the correlation it saw
    Echo,
    /// Like `Echo`, but lets the function change the artifact first
    Tamper(fn(&mut Value)),
    /// Writes the same artifact twice
    Duplicate,
    /// Consumes the message and does nothing
    Ignore,
}

/// What a test can observe of a fake service once it is owned by a project
#[derive(Default)]
pub struct ServiceState {
    health: Mutex<Option<HealthStatus>>,
    arguments: Mutex<Vec<CommandArgument>>,
    directory: Mutex<Option<PathBuf>>,
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl ServiceState {
    pub fn set_health(&self, status: HealthStatus) {
        *self.health.lock().unwrap() = Some(status);
    }

    fn health(&self) -> HealthStatus {
        self.health.lock().unwrap().unwrap_or(HealthStatus::Healthy)
    }

    pub fn arguments(&self) -> Vec<CommandArgument> {
        self.arguments.lock().unwrap().clone()
    }

    pub fn argument(&self, key: &str) -> Option<String> {
        self.arguments()
            .into_iter()
            .find(|argument| argument.key == key)
            .map(|argument| argument.value)
    }

    pub fn directory(&self) -> Option<PathBuf> {
        self.directory.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

/// An in-process stand-in for a launched project: serves the HTTP health
/// report on the port it is handed and, with a broker, runs a worker that
/// answers every message with an artifact in the project directory.
pub struct FakeService {
    port_argument: String,
    broker: Option<Arc<InMemoryBroker>>,
    worker: WorkerBehavior,
    exit_after: Option<Duration>,
    state: Arc<ServiceState>,
    started_at: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeService {
    pub fn new(port_argument: impl Into<String>) -> Self {
        Self {
            port_argument: port_argument.into(),
            broker: None,
            worker: WorkerBehavior::Echo,
            exit_after: None,
            state: Arc::new(ServiceState::default()),
            started_at: None,
            tasks: Vec::new(),
        }
    }

    pub fn with_broker(mut self, broker: Arc<InMemoryBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_worker(mut self, worker: WorkerBehavior) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_health(self, status: HealthStatus) -> Self {
        self.state.set_health(status);
        self
    }

    /// The "process" exits with code 3 this long after it started
    pub fn exiting_after(mut self, delay: Duration) -> Self {
        self.exit_after = Some(delay);
        self
    }

    pub fn state(&self) -> Arc<ServiceState> {
        Arc::clone(&self.state)
    }

    fn halt(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state.running.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Launcher for FakeService {
    async fn start(&mut self, directory: &Path, arguments: &[CommandArgument]) -> Result<()> {
        if self.state.is_running() {
            return Err(HarnessError::ProcessAlreadyRunning(0));
        }

        let port: u16 = arguments
            .iter()
            .find(|argument| argument.key == self.port_argument)
            .and_then(|argument| argument.value.parse().ok())
            .ok_or_else(|| {
                HarnessError::ProcessStart(format!("no --{} argument", self.port_argument))
            })?;

        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(|e| HarnessError::ProcessStart(format!("cannot bind {}: {}", port, e)))?;
        self.tasks
            .push(tokio::spawn(serve_health(listener, Arc::clone(&self.state))));

        if let Some(receiver) = self.broker.as_ref().and_then(|broker| broker.subscribe()) {
            self.tasks.push(tokio::spawn(run_worker(
                receiver,
                directory.join(ARTIFACT_DIRECTORY),
                self.worker,
            )));
        }

        *self.state.arguments.lock().unwrap() = arguments.to_vec();
        *self.state.directory.lock().unwrap() = Some(directory.to_path_buf());
        self.state.running.store(true, Ordering::SeqCst);
        self.state.starts.fetch_add(1, Ordering::SeqCst);
        self.started_at = Some(Instant::now());
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.state.is_running() {
            self.state.stops.fetch_add(1, Ordering::SeqCst);
        }
        self.halt();
        Ok(())
    }

    async fn wait_for_exit(&mut self) -> Result<Option<ExitStatus>> {
        if !self.state.is_running() {
            return Ok(None);
        }
        match (self.exit_after, self.started_at) {
            (Some(delay), Some(started_at)) => {
                tokio::time::sleep_until(started_at + delay).await;
                self.halt();
                Ok(Some(ExitStatus::from_raw(3 << 8)))
            }
            _ => std::future::pending().await,
        }
    }

    fn is_running(&self) -> bool {
        self.state.is_running()
    }

    fn pid(&self) -> Option<u32> {
        None
    }
}

impl Drop for FakeService {
    fn drop(&mut self) {
        self.halt();
    }
}

async fn serve_health(listener: TcpListener, state: Arc<ServiceState>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(answer_health_request(stream, state.health()));
    }
}

async fn answer_health_request(mut stream: TcpStream, status: HealthStatus) {
    let mut request = Vec::new();
    let mut buffer = [0u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        match stream.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(n) => request.extend_from_slice(&buffer[..n]),
        }
    }

    let body = json!({
        "status": status,
        "totalDuration": "00:00:00.0012000",
        "entries": {
            "self": { "status": status, "description": "fake service", "tags": ["live"] }
        }
    })
    .to_string();
    let code = if status == HealthStatus::Healthy {
        "200 OK"
    } else {
        "503 Service Unavailable"
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        code,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<OutgoingMessage>,
    artifacts: PathBuf,
    behavior: WorkerBehavior,
) {
    while let Some(message) = receiver.recv().await {
        if let Err(e) = handle_message(&message, &artifacts, behavior).await {
            tracing::warn!("fake worker dropped a message: {}", e);
        }
    }
}

async fn handle_message(
    message: &OutgoingMessage,
    artifacts: &Path,
    behavior: WorkerBehavior,
) -> anyhow::Result<()> {
    if let WorkerBehavior::Ignore = behavior {
        return Ok(());
    }

    let diagnostic_id = message
        .metadata
        .get(DIAGNOSTIC_ID)
        .ok_or_else(|| anyhow::anyhow!("message without {}", DIAGNOSTIC_ID))?;
    let context = CorrelationContext::parse_diagnostic_id(diagnostic_id)?;
    let transaction_id = message
        .metadata
        .get(TRANSACTION_ID)
        .cloned()
        .unwrap_or(context.transaction_id);

    let mut artifact: Value = serde_json::from_slice(&message.body)?;
    artifact["correlationInfo"] = json!({
        "transactionId": transaction_id,
        "operationParentId": context.operation_parent_id,
        "cycleId": Uuid::new_v4().to_string(),
    });
    if let WorkerBehavior::Tamper(tamper) = behavior {
        tamper(&mut artifact);
    }

    let contents = serde_json::to_vec_pretty(&artifact)?;
    let file_name = format!("{}.json", transaction_id);
    match behavior {
        WorkerBehavior::Duplicate => {
            // Both copies are staged next to the project and moved in with
            // one rename, so a reader sees either none or both.
            let project = artifacts.parent().unwrap_or(artifacts);
            let staging = project.with_file_name(format!(".staging-{}", transaction_id));
            write_artifact(&staging, &file_name, &contents).await?;
            write_artifact(&staging.join("retry"), &file_name, &contents).await?;
            tokio::fs::create_dir_all(artifacts).await?;
            tokio::fs::rename(&staging, artifacts.join(&transaction_id)).await?;
        }
        _ => write_artifact(artifacts, &file_name, &contents).await?,
    }
    Ok(())
}

/// Writes next to the target first so a reader never sees half a file
async fn write_artifact(directory: &Path, file_name: &str, contents: &[u8]) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(directory).await?;
    let partial = directory.join(format!("{}.partial", file_name));
    tokio::fs::write(&partial, contents).await?;
    tokio::fs::rename(&partial, directory.join(file_name)).await?;
    Ok(())
}
