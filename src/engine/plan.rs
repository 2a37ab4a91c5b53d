//! Action Planning
//!
//! Maps (exists locally, exists remotely, run mode) to the action the
//! engine takes for one template.

use crate::build::BuildMode;
use serde::Serialize;
use std::fmt;

/// Invocation-wide mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Build what is missing, publish what is unpublished
    #[default]
    Default,
    /// Update cached images in place and republish
    Update,
    /// Rebuild everything from source and republish
    Rebuild,
}

/// What to do for one template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Build, then publish. `overwrite` means a remote entity of the same
    /// name exists and is replaced.
    Build { mode: BuildMode, overwrite: bool },
    /// Publish the cached image without rebuilding
    PublishCached,
    /// Up to date; only hardening is re-checked
    Keep,
}

impl Action {
    /// Whether this action destroys a remote entity
    pub fn is_overwrite(&self) -> bool {
        matches!(self, Action::Build { overwrite: true, .. })
    }

    pub fn build_mode(&self) -> Option<BuildMode> {
        match self {
            Action::Build { mode, .. } => Some(*mode),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Build {
                mode,
                overwrite: false,
            } => write!(f, "build ({})", mode),
            Action::Build {
                mode,
                overwrite: true,
            } => write!(f, "build ({}) + replace", mode),
            Action::PublishCached => write!(f, "publish cached"),
            Action::Keep => write!(f, "none"),
        }
    }
}

/// Decide the action for one template
pub fn classify(exists_locally: bool, exists_remotely: bool, mode: RunMode) -> Action {
    match (mode, exists_locally, exists_remotely) {
        (RunMode::Rebuild, _, remote) => Action::Build {
            mode: BuildMode::ForceRebuild,
            overwrite: remote,
        },
        (RunMode::Update, true, remote) => Action::Build {
            mode: BuildMode::Update,
            overwrite: remote,
        },
        (_, false, remote) => Action::Build {
            mode: BuildMode::New,
            overwrite: remote,
        },
        (RunMode::Default, true, false) => Action::PublishCached,
        (RunMode::Default, true, true) => Action::Keep,
    }
}
