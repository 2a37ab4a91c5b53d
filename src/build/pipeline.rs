//! Build Pipeline
//!
//! Produces one template image: acquire the base image (fresh, cached, or
//! cached as a fallback), grow it to the declared minimum, customize it,
//! move it into the cache, and stamp the record. The record is only touched
//! after the cached image is complete.

use super::customize;
use super::workspace::Scratch;
use crate::cache::{decompress_if_needed, ImageCache};
use crate::catalog::{SourceRef, TemplateSpec};
use crate::domain::{ByteFetcherRef, CustomizeStatus, DiskCustomizerRef, DiskResizerRef};
use crate::error::{Error, Result};
use crate::metadata::{now, TemplateRecord};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for local builds
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Wall-clock bound on one image download
    pub download_timeout: Duration,
    /// Wall-clock bound on one customization run
    pub customize_timeout: Duration,
    /// Directory relative copy sources resolve against
    pub base_dir: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            download_timeout: Duration::from_secs(600),
            customize_timeout: Duration::from_secs(600),
            base_dir: PathBuf::from("."),
        }
    }
}

/// How a build treats existing local state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// First build, or a build whose cached image may be reused
    New,
    /// Incremental update of the cached image
    Update,
    /// Ignore the cache and start from the source
    ForceRebuild,
}

impl std::fmt::Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildMode::New => write!(f, "new"),
            BuildMode::Update => write!(f, "update"),
            BuildMode::ForceRebuild => write!(f, "rebuild"),
        }
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Builds template images into the [`ImageCache`]
pub struct BuildPipeline {
    config: BuildConfig,
    cache: ImageCache,
    fetcher: ByteFetcherRef,
    customizer: DiskCustomizerRef,
    resizer: DiskResizerRef,
}

impl BuildPipeline {
    pub fn new(
        config: BuildConfig,
        cache: ImageCache,
        fetcher: ByteFetcherRef,
        customizer: DiskCustomizerRef,
        resizer: DiskResizerRef,
    ) -> Self {
        Self {
            config,
            cache,
            fetcher,
            customizer,
            resizer,
        }
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    /// Build `spec` and stamp `record`. Returns the cached image path.
    pub async fn build(
        &self,
        spec: &TemplateSpec,
        record: &mut TemplateRecord,
        mode: BuildMode,
        scratch: &Scratch,
    ) -> Result<PathBuf> {
        info!(template = %spec.name, mode = %mode, "Building template");

        // Validate injections before any expensive work
        let plan = customize::plan(spec, mode, &self.config.base_dir)?;

        let image = self.acquire(spec, record, mode, scratch).await?;
        self.enforce_min_size(spec, &image).await?;

        if plan.should_run(mode) {
            self.customize(spec, &image, &plan.ops).await?;
        } else {
            debug!(template = %spec.name, "No customization requested, skipping");
        }

        let path = self.cache.install(&spec.name, &image).await?;

        let at = now();
        if mode == BuildMode::Update && record.is_built() {
            record.stamp_updated(at);
        } else {
            record.stamp_built(at);
        }

        info!(template = %spec.name, path = %path.display(), "Template built");
        Ok(path)
    }

    async fn acquire(
        &self,
        spec: &TemplateSpec,
        record: &TemplateRecord,
        mode: BuildMode,
        scratch: &Scratch,
    ) -> Result<PathBuf> {
        let work = scratch.file("image.qcow2");
        let cached = self.cache.contains(&spec.name).await;

        if mode != BuildMode::ForceRebuild && cached && record.is_built() {
            info!(template = %spec.name, "Using cached image as base");
            self.cache.checkout(&spec.name, &work).await?;
            return Ok(work);
        }

        match self.fetch_source(spec, scratch).await {
            Ok(path) => Ok(path),
            Err(e) if e.allows_cached_fallback() && cached => {
                warn!(
                    template = %spec.name,
                    error = %e,
                    "Fetch failed, falling back to cached image"
                );
                self.cache.checkout(&spec.name, &work).await?;
                Ok(work)
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_source(&self, spec: &TemplateSpec, scratch: &Scratch) -> Result<PathBuf> {
        let download = scratch.file("source");

        let bytes = match &spec.source {
            SourceRef::Url(url) => {
                info!(template = %spec.name, url = %url, "Downloading source image");
                self.fetcher
                    .fetch(url, &download, self.config.download_timeout)
                    .await?
            }
            SourceRef::Local(path) => {
                info!(template = %spec.name, path = %path.display(), "Copying local source image");
                self.fetcher.fetch_local(path, &download).await?
            }
        };
        debug!(template = %spec.name, bytes, "Source image acquired");

        let image = decompress_if_needed(download, &spec.source.file_name()).await?;
        let work = scratch.file("image.qcow2");
        tokio::fs::rename(&image, &work).await?;
        Ok(work)
    }

    async fn enforce_min_size(&self, spec: &TemplateSpec, image: &Path) -> Result<()> {
        let Some(min) = spec.min_disk_size else {
            return Ok(());
        };

        let current = self.resizer.virtual_size(image).await?;
        if current >= min {
            debug!(template = %spec.name, current, min, "Disk already large enough");
            return Ok(());
        }

        info!(template = %spec.name, from = current, to = min, "Growing disk");
        self.resizer.grow(image, min).await
    }

    async fn customize(
        &self,
        spec: &TemplateSpec,
        image: &Path,
        ops: &[crate::domain::CustomizeOp],
    ) -> Result<()> {
        info!(template = %spec.name, steps = ops.len(), "Customizing image");

        let timeout = self.config.customize_timeout;
        match self.customizer.customize(image, ops, timeout).await? {
            CustomizeStatus::TimedOut => Err(Error::CustomizeTimeout {
                template: spec.name.clone(),
                secs: timeout.as_secs(),
            }),
            status @ CustomizeStatus::Exited { .. } if status.success() => Ok(()),
            CustomizeStatus::Exited { code, diagnostics } => Err(Error::CustomizeFailed {
                template: spec.name.clone(),
                code,
                diagnostics,
            }),
        }
    }
}
