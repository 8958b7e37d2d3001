use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::environment::{open_argument_tokens, CommandArgument, Environment};
use crate::error::{HarnessError, Result};

/// How long a killed process group gets to be reaped
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Build configuration the project is started with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BuildConfiguration {
    #[default]
    Debug,
    Release,
}

impl fmt::Display for BuildConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildConfiguration::Debug => write!(f, "Debug"),
            BuildConfiguration::Release => write!(f, "Release"),
        }
    }
}

impl std::str::FromStr for BuildConfiguration {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(BuildConfiguration::Debug),
            "release" => Ok(BuildConfiguration::Release),
            other => Err(HarnessError::Config(format!(
                "unknown build configuration '{}', expected Debug or Release",
                other
            ))),
        }
    }
}

/// Target runtime moniker, e.g. `net8.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetRuntime(pub String);

impl Default for TargetRuntime {
    fn default() -> Self {
        TargetRuntime("net8.0".to_string())
    }
}

impl fmt::Display for TargetRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Program and argument template used to run a scaffolded project.
///
/// `{configuration}` and `{runtime}` are expanded in every argument; the open
/// command arguments are appended after the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for LaunchCommand {
    fn default() -> Self {
        Self {
            program: "dotnet".to_string(),
            args: [
                "run",
                "--configuration",
                "{configuration}",
                "--framework",
                "{runtime}",
                "--",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl LaunchCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn expand(&self, configuration: BuildConfiguration, runtime: &TargetRuntime) -> Vec<String> {
        let configuration = configuration.to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{configuration}", &configuration)
                    .replace("{runtime}", &runtime.0)
            })
            .collect()
    }
}

/// State of the launched project process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is starting
    Starting,
    /// Process is running
    Running,
    /// Process is stopping (graceful shutdown)
    Stopping,
    /// Process has stopped
    Stopped,
    /// Process could not be spawned or reaped
    Failed,
}

/// Starts and stops the process of a scaffolded project.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Starts the project in `directory`. Open arguments become command-line
    /// tokens; secret arguments are only visible in the child's environment.
    async fn start(&mut self, directory: &Path, arguments: &[CommandArgument]) -> Result<()>;

    /// Gracefully stops the process, escalating to a kill after the grace
    /// period. Stopping a launcher with no process is a no-op.
    async fn stop(&mut self) -> Result<()>;

    /// Resolves once the process exits. Returns the recorded status right
    /// away when no process is running.
    async fn wait_for_exit(&mut self) -> Result<Option<ExitStatus>>;

    fn is_running(&self) -> bool;

    fn pid(&self) -> Option<u32>;
}

/// Launches the project as a child process in its own process group.
pub struct CommandLauncher {
    command: LaunchCommand,
    configuration: BuildConfiguration,
    runtime: TargetRuntime,
    graceful_shutdown_timeout: Duration,
    environment: Environment,
    state: ProcessState,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
    child: Option<Child>,
    output: Vec<JoinHandle<()>>,
}

impl CommandLauncher {
    pub fn new(
        command: LaunchCommand,
        configuration: BuildConfiguration,
        runtime: TargetRuntime,
    ) -> Self {
        Self {
            command,
            configuration,
            runtime,
            graceful_shutdown_timeout: Duration::from_secs(10),
            environment: Environment::new(),
            state: ProcessState::Stopped,
            pid: None,
            exit_status: None,
            child: None,
            output: Vec::new(),
        }
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    /// Extra variables for the child, on top of the secret arguments.
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    fn send_signal_to_group(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let raw = i32::try_from(pid)
            .map_err(|_| HarnessError::ProcessStart(format!("pid {} out of range", pid)))?;

        debug!("Sending signal {:?} to process group {}", signal, pid);
        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e).into()),
        }
    }

    async fn force_kill(&mut self) -> Result<()> {
        if let Some(pid) = self.pid {
            info!("Force killing process group {}", pid);
            if let Err(e) = self.send_signal_to_group(Signal::SIGKILL) {
                warn!("Failed to send SIGKILL: {}", e);
            }
        }

        if let Some(child) = self.child.as_mut() {
            // The leader may have been re-parented out of the group.
            let _ = child.start_kill();
        }

        match timeout(KILL_REAP_TIMEOUT, self.wait_for_exit()).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => {
                self.state = ProcessState::Failed;
                Err(HarnessError::TimeoutExpired {
                    what: "reaping the killed project process".to_string(),
                    timeout: KILL_REAP_TIMEOUT,
                    guidance: "the process ignored SIGKILL, check for an uninterruptible wait"
                        .to_string(),
                    last_failure: None,
                })
            }
        }
    }

    fn abort_output(&mut self) {
        for task in self.output.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn start(&mut self, directory: &Path, arguments: &[CommandArgument]) -> Result<()> {
        if let (Some(pid), Some(_)) = (self.pid, self.child.as_ref()) {
            return Err(HarnessError::ProcessAlreadyRunning(pid));
        }

        self.state = ProcessState::Starting;
        self.exit_status = None;

        let mut args = self.command.expand(self.configuration, &self.runtime);
        args.extend(open_argument_tokens(arguments));

        let mut environment = self.environment.clone();
        environment.extend(Environment::from_secret_arguments(arguments));

        let visible: Vec<String> = arguments.iter().map(ToString::to_string).collect();
        info!(
            "Starting project in {}: {} {:?} (arguments: {:?}, secret variables: {:?})",
            directory.display(),
            self.command.program,
            args,
            visible,
            environment
        );

        let mut command = Command::new(&self.command.program);
        command
            .args(&args)
            .current_dir(directory)
            .envs(environment.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own group so stop() reaches anything the project spawns.
            .process_group(0)
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.state = ProcessState::Failed;
                return Err(HarnessError::ProcessStart(format!(
                    "cannot spawn '{}': {}",
                    self.command.program, e
                )));
            }
        };

        let Some(pid) = child.id() else {
            self.state = ProcessState::Failed;
            return Err(HarnessError::ProcessStart(
                "process exited before its id could be read".to_string(),
            ));
        };

        let span = info_span!("project", pid);
        if let Some(stdout) = child.stdout.take() {
            self.output
                .push(forward_output(stdout, "stdout", span.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.output.push(forward_output(stderr, "stderr", span));
        }

        self.pid = Some(pid);
        self.child = Some(child);
        self.state = ProcessState::Running;

        info!("Project process started with PID: {}", pid);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if self.child.is_none() {
            return Ok(());
        }

        self.state = ProcessState::Stopping;
        info!("Initiating graceful shutdown of process {:?}", self.pid);

        if let Err(e) = self.send_signal_to_group(Signal::SIGTERM) {
            warn!("Failed to send SIGTERM: {}", e);
        }

        let result = match timeout(self.graceful_shutdown_timeout, self.wait_for_exit()).await {
            Ok(Ok(_)) => {
                info!("Process exited gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Error during graceful shutdown: {}", e);
                self.force_kill().await
            }
            Err(_) => {
                warn!(
                    "Process did not exit within {:?}, forcing kill",
                    self.graceful_shutdown_timeout
                );
                self.force_kill().await
            }
        };

        self.abort_output();
        result
    }

    async fn wait_for_exit(&mut self) -> Result<Option<ExitStatus>> {
        let Some(child) = self.child.as_mut() else {
            return Ok(self.exit_status);
        };

        match child.wait().await {
            Ok(status) => {
                self.exit_status = Some(status);
                self.state = ProcessState::Stopped;
                self.child = None;
                info!("Process exited with status: {}", status);
                Ok(Some(status))
            }
            Err(e) => {
                error!("Error waiting for process: {}", e);
                self.state = ProcessState::Failed;
                Err(e.into())
            }
        }
    }

    fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    fn pid(&self) -> Option<u32> {
        if self.child.is_some() {
            self.pid
        } else {
            None
        }
    }
}

impl Drop for CommandLauncher {
    fn drop(&mut self) {
        if self.child.is_some() {
            warn!(
                "Launcher dropped with running project (PID: {:?}), killing its process group",
                self.pid
            );
            if let Err(e) = self.send_signal_to_group(Signal::SIGKILL) {
                warn!("Failed to kill process group during drop: {}", e);
            }
        }
        self.abort_output();
    }
}

/// Logs the child's output line by line. Lines need not be UTF-8, and the
/// pipe is drained until the child closes it: a reader that goes away early
/// kills the child with SIGPIPE on its next write.
fn forward_output<R>(reader: R, stream: &'static str, span: tracing::Span) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            let codec = AnyDelimiterCodec::new(b"\n".to_vec(), b"\n".to_vec());
            let mut lines = FramedRead::new(reader, codec);
            while let Some(line) = lines.next().await {
                match line {
                    Ok(line) => {
                        let line = String::from_utf8_lossy(&line);
                        info!(stream, "{}", line.trim_end_matches('\r'));
                    }
                    Err(e) => {
                        debug!(stream, "Output is no longer logged: {}", e);
                        let mut reader = lines.into_inner();
                        let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                        break;
                    }
                }
            }
        }
        .instrument(span),
    )
}
