use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

const REDACTED: &str = "***";

/// Whether an argument may show up in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Safe to log; passed to the child as a `--KEY value` command-line pair
    #[default]
    Open,
    /// Redacted everywhere; passed to the child through its environment only
    Secret,
}

/// A single key/value handed to the launched project.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArgument {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub visibility: Visibility,
}

impl CommandArgument {
    pub fn open(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            visibility: Visibility::Open,
        }
    }

    pub fn secret(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            visibility: Visibility::Secret,
        }
    }

    pub fn is_secret(&self) -> bool {
        self.visibility == Visibility::Secret
    }

    /// The value as it may be written to a log line.
    pub fn display_value(&self) -> &str {
        if self.is_secret() {
            REDACTED
        } else {
            &self.value
        }
    }
}

impl fmt::Display for CommandArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.display_value())
    }
}

impl fmt::Debug for CommandArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandArgument")
            .field("key", &self.key)
            .field("value", &self.display_value())
            .field("visibility", &self.visibility)
            .finish()
    }
}

/// Turns the open arguments into command-line tokens, in order.
pub fn open_argument_tokens(arguments: &[CommandArgument]) -> Vec<String> {
    arguments
        .iter()
        .filter(|argument| !argument.is_secret())
        .flat_map(|argument| [format!("--{}", argument.key), argument.value.clone()])
        .collect()
}

/// A set of environment variables destined for exactly one child process.
///
/// Values never appear in `Debug` output, only the variable names.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Collects the secret arguments; open ones travel on the command line.
    pub fn from_secret_arguments(arguments: &[CommandArgument]) -> Self {
        let mut env = Self::new();
        for argument in arguments.iter().filter(|a| a.is_secret()) {
            env.set(argument.key.clone(), argument.value.clone());
        }
        env
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Variables in `other` overwrite variables with the same name.
    pub fn extend(&mut self, other: Environment) {
        self.0.extend(other.0);
    }

    pub fn get(&self, key: &str) -> Option<&String> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|key| (key, REDACTED)))
            .finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}
