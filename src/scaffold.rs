//! Materializes a template directory into a fresh project directory.
//!
//! Templates may mark optional features with line markers:
//!
//! ```text
//! // #if-feature logging
//! builder.add_logging();
//! // #endif-feature
//! ```
//!
//! The marker lines are always dropped; the region between them is dropped
//! too when the feature is excluded through [`ProjectOptions`].

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{HarnessError, Result};

const FEATURE_START: &str = "#if-feature";
const FEATURE_END: &str = "#endif-feature";
const USER_ERROR: &str = "#error";

/// Build output never copied from a template.
const SKIPPED_DIRECTORIES: &[&str] = &["bin", "obj", "target"];

/// What happens to the project directory once the harness is disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TeardownPolicy {
    #[default]
    RemoveProjectDirectory,
    KeepProjectDirectory,
}

/// Immutable description of how a template is materialized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectOptions {
    excluded_features: BTreeSet<String>,
    teardown: TeardownPolicy,
}

impl ProjectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every `#if-feature <feature>` region from the generated files.
    pub fn exclude_feature(mut self, feature: impl Into<String>) -> Self {
        self.excluded_features.insert(feature.into());
        self
    }

    pub fn with_teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }

    pub fn excluded_features(&self) -> &BTreeSet<String> {
        &self.excluded_features
    }

    pub fn is_excluded(&self, feature: &str) -> bool {
        self.excluded_features.contains(feature)
    }

    pub fn teardown(&self) -> TeardownPolicy {
        self.teardown
    }
}

/// One placeholder and the text that replaces every occurrence of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    pub placeholder: String,
    pub replacement: String,
}

/// An ordered text transformation applied to a single generated file.
///
/// Substitutions run in the order they were added; a later one sees the
/// output of the earlier ones. A placeholder that is missing when its turn
/// comes is an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(default)]
    pub strip_user_errors: bool,
    #[serde(default)]
    pub substitutions: Vec<Substitution>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(mut self, placeholder: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.substitutions.push(Substitution {
            placeholder: placeholder.into(),
            replacement: replacement.into(),
        });
        self
    }

    /// Removes the `#error` lines templates carry to force users to edit a
    /// file before it builds. Runs before any substitution.
    pub fn strip_user_errors(mut self) -> Self {
        self.strip_user_errors = true;
        self
    }

    pub fn apply(&self, file: &Path, contents: &str) -> Result<String> {
        let mut text = if self.strip_user_errors {
            contents
                .split_inclusive('\n')
                .filter(|line| !line.trim_start().starts_with(USER_ERROR))
                .collect()
        } else {
            contents.to_string()
        };

        for substitution in &self.substitutions {
            if !text.contains(&substitution.placeholder) {
                return Err(HarnessError::PlaceholderNotFound {
                    file: file.to_path_buf(),
                    placeholder: substitution.placeholder.clone(),
                });
            }
            text = text.replace(&substitution.placeholder, &substitution.replacement);
        }

        Ok(text)
    }
}

/// A [`Patch`] bound to the file it targets, relative to the project root.
/// Without a file it targets the project kind's entry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(flatten)]
    pub patch: Patch,
}

impl FilePatch {
    pub fn new(file: impl Into<PathBuf>, patch: Patch) -> Self {
        Self {
            file: Some(file.into()),
            patch,
        }
    }

    pub fn entry(patch: Patch) -> Self {
        Self { file: None, patch }
    }

    pub fn target<'a>(&'a self, entry_file: &'a Path) -> &'a Path {
        self.file.as_deref().unwrap_or(entry_file)
    }
}

/// Copies templates and locates fixture sources.
#[derive(Debug, Clone)]
pub struct ProjectScaffolder {
    fixtures_root: PathBuf,
}

impl ProjectScaffolder {
    pub fn new(fixtures_root: impl Into<PathBuf>) -> Self {
        Self {
            fixtures_root: fixtures_root.into(),
        }
    }

    pub fn fixtures_root(&self) -> &Path {
        &self.fixtures_root
    }

    /// Copies `template_dir` into `destination`, which must not exist yet.
    ///
    /// A partially written destination is removed again when the copy fails.
    pub fn scaffold(
        &self,
        template_dir: &Path,
        destination: &Path,
        options: &ProjectOptions,
    ) -> Result<ProjectDirectory> {
        if !template_dir.is_dir() {
            return Err(HarnessError::Scaffold(format!(
                "template directory {} does not exist",
                template_dir.display()
            )));
        }
        if destination.exists() {
            return Err(HarnessError::Scaffold(format!(
                "destination {} already exists",
                destination.display()
            )));
        }

        info!(
            "Scaffolding {} into {}",
            template_dir.display(),
            destination.display()
        );

        if let Err(e) = copy_template(template_dir, destination, options) {
            if let Err(cleanup) = fs::remove_dir_all(destination) {
                warn!(
                    "Failed to clean up partial project {}: {}",
                    destination.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        Ok(ProjectDirectory {
            root: destination.to_path_buf(),
            fixtures_root: self.fixtures_root.clone(),
            teardown: options.teardown(),
        })
    }
}

fn copy_template(template_dir: &Path, destination: &Path, options: &ProjectOptions) -> Result<()> {
    fs::create_dir_all(destination)?;

    let entries = WalkDir::new(template_dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| !is_skipped(entry.path(), template_dir));

    for entry in entries {
        let entry = entry.map_err(|e| HarnessError::Scaffold(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(template_dir)
            .map_err(|e| HarnessError::Scaffold(e.to_string()))?;
        let target = destination.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        fs::copy(entry.path(), &target)?;

        // Binary files are copied untouched.
        if let Ok(contents) = fs::read_to_string(&target) {
            if contents.contains(FEATURE_START) || contents.contains(FEATURE_END) {
                let filtered = strip_feature_regions(&contents, options, relative)?;
                fs::write(&target, filtered)?;
            }
        }
    }

    Ok(())
}

fn is_skipped(path: &Path, template_dir: &Path) -> bool {
    path.strip_prefix(template_dir)
        .ok()
        .and_then(|relative| relative.components().next())
        .map(|first| match first {
            Component::Normal(name) => SKIPPED_DIRECTORIES
                .iter()
                .any(|skipped| name == std::ffi::OsStr::new(skipped)),
            _ => false,
        })
        .unwrap_or(false)
}

fn strip_feature_regions(contents: &str, options: &ProjectOptions, file: &Path) -> Result<String> {
    let mut output = String::with_capacity(contents.len());
    // Each open region records whether it is being dropped.
    let mut open: Vec<bool> = Vec::new();

    for line in contents.split_inclusive('\n') {
        if line.contains(FEATURE_END) {
            if open.pop().is_none() {
                return Err(HarnessError::Scaffold(format!(
                    "unbalanced '{}' in {}",
                    FEATURE_END,
                    file.display()
                )));
            }
            continue;
        }

        if let Some(index) = line.find(FEATURE_START) {
            let feature = line[index + FEATURE_START.len()..]
                .split_whitespace()
                .next()
                .ok_or_else(|| {
                    HarnessError::Scaffold(format!(
                        "'{}' without a feature name in {}",
                        FEATURE_START,
                        file.display()
                    ))
                })?;
            let dropped = open.last().copied().unwrap_or(false) || options.is_excluded(feature);
            open.push(dropped);
            continue;
        }

        if !open.last().copied().unwrap_or(false) {
            output.push_str(line);
        }
    }

    if !open.is_empty() {
        return Err(HarnessError::Scaffold(format!(
            "'{}' without matching '{}' in {}",
            FEATURE_START,
            FEATURE_END,
            file.display()
        )));
    }

    Ok(output)
}

/// A scaffolded project on disk.
#[derive(Debug, Clone)]
pub struct ProjectDirectory {
    root: PathBuf,
    fixtures_root: PathBuf,
    teardown: TeardownPolicy,
}

impl ProjectDirectory {
    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn teardown(&self) -> TeardownPolicy {
        self.teardown
    }

    /// Copies the single fixture file called `file_name` found anywhere under
    /// the fixtures root into the project root.
    pub fn add_source_file(&self, file_name: &str) -> Result<PathBuf> {
        let source = self.find_fixture(file_name)?;
        let target = self.root.join(file_name);
        if target.exists() {
            return Err(HarnessError::Scaffold(format!(
                "fixture {} would overwrite an existing project file",
                file_name
            )));
        }

        fs::copy(&source, &target)?;
        debug!("Added fixture {} from {}", file_name, source.display());
        Ok(target)
    }

    fn find_fixture(&self, file_name: &str) -> Result<PathBuf> {
        let matches: Vec<PathBuf> = if self.fixtures_root.is_dir() {
            WalkDir::new(&self.fixtures_root)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .filter(|entry| entry.file_name() == std::ffi::OsStr::new(file_name))
                .map(|entry| entry.into_path())
                .collect()
        } else {
            Vec::new()
        };

        match matches.len() {
            0 => Err(HarnessError::FixtureNotFound {
                name: file_name.to_string(),
                root: self.fixtures_root.clone(),
            }),
            1 => Ok(matches[0].clone()),
            _ => Err(HarnessError::FixtureAmbiguous {
                name: file_name.to_string(),
                root: self.fixtures_root.clone(),
                matches,
            }),
        }
    }

    /// Rewrites `relative_path` through `patch`.
    pub fn patch_file(&self, relative_path: &Path, patch: &Patch) -> Result<()> {
        let path = self.root.join(relative_path);
        if !path.is_file() {
            return Err(HarnessError::FileNotFound(relative_path.to_path_buf()));
        }

        let contents = fs::read_to_string(&path)?;
        let patched = patch.apply(relative_path, &contents)?;
        fs::write(&path, patched)?;

        debug!(
            "Patched {} with {} substitution(s)",
            relative_path.display(),
            patch.substitutions.len()
        );
        Ok(())
    }

    pub fn read_file(&self, relative_path: &Path) -> Result<String> {
        let path = self.root.join(relative_path);
        if !path.is_file() {
            return Err(HarnessError::FileNotFound(relative_path.to_path_buf()));
        }
        Ok(fs::read_to_string(path)?)
    }

    /// Applies the teardown policy. Removing an already removed directory
    /// is not an error.
    pub fn release(&self) -> Result<()> {
        match self.teardown {
            TeardownPolicy::KeepProjectDirectory => {
                info!("Keeping project directory {}", self.root.display());
                Ok(())
            }
            TeardownPolicy::RemoveProjectDirectory => {
                if self.root.exists() {
                    fs::remove_dir_all(&self.root)?;
                    debug!("Removed project directory {}", self.root.display());
                }
                Ok(())
            }
        }
    }
}
