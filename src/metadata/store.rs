//! Metadata Sidecar Store
//!
//! One human-readable JSON document per template directory. Saves go through
//! a temporary file in the same directory and a rename, so a crash never
//! leaves the document half-written.

use super::record::{Records, TemplateRecord};
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Sidecar file name inside the template directory
pub const METADATA_FILE: &str = "metadata.json";

/// Store for [`Records`]
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    /// Store for the sidecar inside `template_dir`
    pub fn new(template_dir: impl AsRef<Path>) -> Self {
        Self {
            path: template_dir.as_ref().join(METADATA_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all records. A missing or malformed document yields an empty map;
    /// a malformed entry only degrades that entry.
    pub async fn load(&self) -> Records {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No metadata document yet");
                return Records::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cannot read metadata, starting empty");
                return Records::new();
            }
        };

        if raw.trim().is_empty() {
            return Records::new();
        }

        let entries = match serde_json::from_str::<BTreeMap<String, Value>>(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Malformed metadata, starting empty");
                return Records::new();
            }
        };

        let records: Records = entries
            .iter()
            .map(|(name, value)| (name.clone(), TemplateRecord::from_value(name, value)))
            .collect();
        debug!(path = %self.path.display(), count = records.len(), "Loaded metadata");
        records
    }

    /// Persist all records atomically
    pub async fn save(&self, records: &Records) -> Result<()> {
        let mut body = serde_json::to_string_pretty(records)?;
        body.push('\n');

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, body.as_bytes()))
            .await
            .map_err(|e| Error::Internal(format!("metadata save task failed: {}", e)))??;

        debug!(path = %self.path.display(), count = records.len(), "Saved metadata");
        Ok(())
    }
}

fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(body)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}
