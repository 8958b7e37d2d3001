use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Everything that can go wrong while scaffolding, starting, probing or
/// tearing down a template project.
///
/// Messages name the component that is most likely misconfigured so a
/// failing test reads as a diagnosis rather than a bare stack trace.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("cannot scaffold project: {0}")]
    Scaffold(String),

    #[error("cannot find fixture '{name}' under {root}")]
    FixtureNotFound { name: String, root: PathBuf },

    #[error("more than one fixture named '{name}' under {root}: {matches:?}")]
    FixtureAmbiguous {
        name: String,
        root: PathBuf,
        matches: Vec<PathBuf>,
    },

    #[error("cannot find file '{0}' in the scaffolded project")]
    FileNotFound(PathBuf),

    #[error(
        "placeholder '{placeholder}' not found in '{file}', the template has drifted from the patches applied to it"
    )]
    PlaceholderNotFound { file: PathBuf, placeholder: String },

    #[error(
        "the project process could not be started ({0}), please check any build or runtime errors of the scaffolded project"
    )]
    ProcessStart(String),

    #[error("a project process is already running (pid {0})")]
    ProcessAlreadyRunning(u32),

    #[error("health probe failed: {0}")]
    ProbeFailure(String),

    #[error("{what} did not succeed within {timeout:?}: {guidance}")]
    TimeoutExpired {
        what: String,
        timeout: Duration,
        guidance: String,
        last_failure: Option<String>,
    },

    #[error(
        "no artifact for transaction '{transaction_id}' appeared within {timeout:?}, please check whether the injected message handler is correct and whether the project receives the message"
    )]
    RoundTripTimeout {
        transaction_id: String,
        timeout: Duration,
    },

    #[error("round trip produced a different {field}: expected '{expected}', got '{actual}'")]
    RoundTripMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("remote {kind} '{name}' could not be {action}: {reason}")]
    ResourceProvision {
        kind: String,
        name: String,
        action: &'static str,
        reason: String,
    },

    #[error("expected exactly one {what}, found {count}; a handler is misconfigured or state leaked from a previous run")]
    AmbiguousResult { what: String, count: usize },

    #[error("the project has already been started")]
    AlreadyStarted,

    #[error("cannot {operation} while the project is {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },

    #[error("the project is not started yet; start it before using its {0}")]
    NotStarted(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{}", DisplayAll(.0))]
    Aggregate(Vec<HarnessError>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

struct DisplayAll<'a>(&'a [HarnessError]);

impl fmt::Display for DisplayAll<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failures occurred:", self.0.len())?;
        for (index, error) in self.0.iter().enumerate() {
            write!(f, " [{}] {}", index + 1, error)?;
        }
        Ok(())
    }
}

impl HarnessError {
    /// The individual causes: the inner list for an aggregate, otherwise the
    /// error itself.
    pub fn causes(&self) -> Vec<&HarnessError> {
        match self {
            HarnessError::Aggregate(errors) => errors.iter().collect(),
            other => vec![other],
        }
    }
}

/// Collapses the failures of independent disposal actions.
///
/// No failures is success, a single failure is returned unchanged, and more
/// than one becomes [`HarnessError::Aggregate`].
pub fn aggregate(mut errors: Vec<HarnessError>) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(HarnessError::Aggregate(errors)),
    }
}
