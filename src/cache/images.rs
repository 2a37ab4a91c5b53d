//! Image Cache
//!
//! Maps a template name to `<dir>/<name>.qcow2`. Images enter the cache
//! through a `.partial` copy and a rename, so an interrupted install never
//! leaves a truncated image under the final name.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extension of cached images
pub const IMAGE_EXTENSION: &str = "qcow2";

/// Suffix of in-flight copies
pub const PARTIAL_SUFFIX: &str = "partial";

/// On-disk cache of built images
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the cache directory
    pub async fn init(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Where the image for `name` lives
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, IMAGE_EXTENSION))
    }

    /// Whether a non-empty image file exists for `name`
    pub async fn contains(&self, name: &str) -> bool {
        match tokio::fs::metadata(self.path_for(name)).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Move a finished image into the cache under `name`
    pub async fn install(&self, name: &str, image: &Path) -> Result<PathBuf> {
        let target = self.path_for(name);
        if image == target {
            return Ok(target);
        }

        let partial = self.partial_path(name);
        let copy = async {
            // A rename is enough when scratch space shares the filesystem
            if tokio::fs::rename(image, &partial).await.is_err() {
                tokio::fs::copy(image, &partial).await?;
            }
            let file = tokio::fs::OpenOptions::new().write(true).open(&partial).await?;
            file.sync_all().await?;
            tokio::fs::rename(&partial, &target).await?;
            Ok::<_, std::io::Error>(())
        };

        if let Err(e) = copy.await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(Error::Io(e));
        }

        info!(template = %name, path = %target.display(), "Installed image into cache");
        Ok(target)
    }

    /// Copy the cached image for `name` into `dest`
    pub async fn checkout(&self, name: &str, dest: &Path) -> Result<u64> {
        let source = self.path_for(name);
        let bytes = tokio::fs::copy(&source, dest).await?;
        debug!(template = %name, bytes, "Checked out cached image");
        Ok(bytes)
    }

    /// Remove `*.partial` leftovers of an interrupted run
    pub fn clean_partials(&self) -> Result<usize> {
        let pattern = self.dir.join(format!("*.{}", PARTIAL_SUFFIX));
        let pattern = pattern
            .to_str()
            .ok_or_else(|| Error::Configuration(format!("non-UTF-8 cache dir {:?}", self.dir)))?;

        let mut removed = 0;
        let entries = glob::glob(pattern)
            .map_err(|e| Error::Configuration(format!("bad cache pattern: {}", e)))?;
        for entry in entries.flatten() {
            match std::fs::remove_file(&entry) {
                Ok(()) => {
                    removed += 1;
                    debug!(path = %entry.display(), "Removed stale partial file");
                }
                Err(e) => warn!(path = %entry.display(), error = %e, "Cannot remove partial file"),
            }
        }

        if removed > 0 {
            info!(count = removed, "Cleaned stale partial files from image cache");
        }
        Ok(removed)
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}.{}", name, IMAGE_EXTENSION, PARTIAL_SUFFIX))
    }
}
