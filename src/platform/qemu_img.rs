//! qemu-img Adapter

use super::process::{args, run_checked};
use crate::domain::DiskResizer;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// [`DiskResizer`] backed by `qemu-img`
pub struct QemuImg {
    binary: String,
    timeout: Duration,
}

impl QemuImg {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }
}

impl Default for QemuImg {
    fn default() -> Self {
        Self::new("qemu-img", Duration::from_secs(300))
    }
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

/// Virtual size from `qemu-img info --output=json`
pub fn parse_virtual_size(json: &str) -> Result<u64> {
    let info: ImageInfo = serde_json::from_str(json)?;
    Ok(info.virtual_size)
}

#[async_trait]
impl DiskResizer for QemuImg {
    async fn virtual_size(&self, image: &Path) -> Result<u64> {
        let argv = args(["info".to_string(), "--output=json".into(), image.display().to_string()]);
        let stdout = run_checked(&self.binary, &argv, self.timeout)
            .await
            .map_err(|e| Error::Resize {
                path: image.display().to_string(),
                reason: e.to_string(),
            })?;
        parse_virtual_size(&stdout).map_err(|e| Error::Resize {
            path: image.display().to_string(),
            reason: e.to_string(),
        })
    }

    async fn grow(&self, image: &Path, target_bytes: u64) -> Result<()> {
        debug!(image = %image.display(), target_bytes, "qemu-img resize");
        let argv = args([
            "resize".to_string(),
            image.display().to_string(),
            target_bytes.to_string(),
        ]);
        run_checked(&self.binary, &argv, self.timeout)
            .await
            .map_err(|e| Error::Resize {
                path: image.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}
