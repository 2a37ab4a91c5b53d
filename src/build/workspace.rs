//! Scratch Workspace
//!
//! Every run works inside one temporary directory under the configured temp
//! root; each template gets its own subdirectory. Both are removed on drop,
//! which covers normal exit, errors, and signal-driven shutdown. Directories
//! left by a killed process are swept at the next start.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

const RUN_PREFIX: &str = "cloudbuilder-run-";

/// Run-scoped scratch directory
#[derive(Debug)]
pub struct Workspace {
    root: TempDir,
}

impl Workspace {
    /// Create a fresh run directory under `base`
    pub fn create(base: &Path) -> Result<Self> {
        std::fs::create_dir_all(base)?;
        let root = tempfile::Builder::new().prefix(RUN_PREFIX).tempdir_in(base)?;
        debug!(path = %root.path().display(), "Created run workspace");
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Scratch directory for one template
    pub fn scratch(&self, template: &str) -> Result<Scratch> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}-", template))
            .tempdir_in(self.root.path())?;
        Ok(Scratch { dir })
    }

    /// Remove run directories left behind by a killed process
    pub fn sweep_stale(base: &Path) -> Result<usize> {
        let pattern = base.join(format!("{}*", RUN_PREFIX));
        let pattern = pattern
            .to_str()
            .ok_or_else(|| Error::Configuration(format!("non-UTF-8 temp dir {:?}", base)))?;

        let mut removed = 0;
        let entries = glob::glob(pattern)
            .map_err(|e| Error::Configuration(format!("bad temp pattern: {}", e)))?;
        for dir in entries.flatten().filter(|p| p.is_dir()) {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %dir.display(), error = %e, "Cannot remove stale workspace"),
            }
        }

        if removed > 0 {
            info!(count = removed, "Removed stale workspaces");
        }
        Ok(removed)
    }
}

/// Template-scoped scratch directory, removed on drop
#[derive(Debug)]
pub struct Scratch {
    dir: TempDir,
}

impl Scratch {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
