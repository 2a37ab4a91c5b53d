//! Remote Inventory Adapter
//!
//! Everything the engine does to the hypervisor goes through here: listing
//! published templates, the linked-clone veto, publishing an image as a
//! template entity, removing one, and hardening repair.

use super::allocator::IdentifierAllocator;
use super::hardening::{self, HardeningPolicy};
use super::storage::linked_dependents;
use crate::catalog::TemplateSpec;
use crate::domain::{HypervisorApiRef, Vmid, VmOptions};
use crate::error::{Error, RemoteFailureKind, Result};
use crate::metadata::{TemplateRecord, TIMESTAMP_FORMAT};
use backoff::ExponentialBackoffBuilder;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Identifier conflicts tolerated at create time before giving up
const MAX_CREATE_CONFLICTS: usize = 5;

// =============================================================================
// Configuration
// =============================================================================

/// Shape and placement of published entities
#[derive(Debug, Clone)]
pub struct PublishConfig {
    /// Storage the disk and cloud-init drive are imported into
    pub storage: String,
    /// Bridge for `net0`
    pub bridge: String,
    /// Memory in MiB
    pub memory_mib: u32,
    pub cores: u32,
    pub hardening: HardeningPolicy,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            storage: "local-lvm".to_string(),
            bridge: "vmbr0".to_string(),
            memory_mib: 1024,
            cores: 1,
            hardening: HardeningPolicy::default(),
        }
    }
}

/// Backoff for read-only listing queries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Give up once this much time has passed
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            max_elapsed: Duration::from_secs(20),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no retries
    pub fn none() -> Self {
        Self {
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(1),
            max_elapsed: Duration::ZERO,
        }
    }
}

// =============================================================================
// Adapter
// =============================================================================

/// Adapter over the hypervisor for template lifecycle operations
pub struct RemoteInventory {
    api: HypervisorApiRef,
    allocator: Arc<IdentifierAllocator>,
    config: PublishConfig,
    retry: RetryConfig,
}

impl RemoteInventory {
    pub fn new(
        api: HypervisorApiRef,
        allocator: Arc<IdentifierAllocator>,
        config: PublishConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            api,
            allocator,
            config,
            retry,
        }
    }

    /// Published templates by name. Degrades to empty when the query fails.
    pub async fn list_templates(&self) -> BTreeMap<String, Vmid> {
        match self.with_retry("list entities", || self.api.list_entities()).await {
            Ok(entities) => {
                let templates: BTreeMap<String, Vmid> = entities
                    .into_iter()
                    .filter(|e| e.template)
                    .map(|e| (e.name, e.vmid))
                    .collect();
                debug!(count = templates.len(), node = %self.api.node(), "Listed remote templates");
                templates
            }
            Err(e) => {
                warn!(error = %e, "Cannot list remote templates, treating inventory as empty");
                BTreeMap::new()
            }
        }
    }

    /// Whether any volume is a linked clone of `vmid`'s base disk
    pub async fn has_linked_dependents(&self, vmid: Vmid) -> Result<bool> {
        let storage = self.config.storage.as_str();
        let volumes = self
            .with_retry("storage content", || self.api.storage_content(storage))
            .await?;

        let dependents = linked_dependents(vmid, &volumes);
        for clone in &dependents {
            warn!(
                vmid,
                clone_vmid = ?clone.vmid,
                volume = %clone.volid,
                "Template has a linked clone"
            );
        }
        Ok(!dependents.is_empty())
    }

    /// Publish `image` as a template entity for `spec`.
    ///
    /// Uses `vmid` when given; otherwise allocates one, retrying allocation
    /// when another actor takes the identifier first.
    pub async fn publish(
        &self,
        spec: &TemplateSpec,
        record: &TemplateRecord,
        image: &Path,
        vmid: Option<Vmid>,
    ) -> Result<Vmid> {
        if !image.is_file() {
            return Err(Error::Internal(format!(
                "image for '{}' not found at {}",
                spec.name,
                image.display()
            )));
        }

        let mut conflicts = BTreeSet::new();
        let vmid = loop {
            let (candidate, allocated) = match vmid {
                Some(v) => (v, false),
                None => (self.allocator.allocate(&conflicts).await?, true),
            };

            info!(template = %spec.name, vmid = candidate, "Creating entity");
            match self.api.create(candidate, &self.create_options(spec)).await {
                Ok(()) => break candidate,
                Err(e) if e.remote_kind() == Some(RemoteFailureKind::AlreadyExists) => {
                    if allocated && conflicts.len() < MAX_CREATE_CONFLICTS {
                        warn!(vmid = candidate, "Identifier taken concurrently, reallocating");
                        conflicts.insert(candidate);
                        continue;
                    }
                    // Someone else's entity: never clean it up
                    return Err(e);
                }
                Err(e) => {
                    self.cleanup(candidate).await;
                    return Err(e);
                }
            }
        };

        if let Err(e) = self.finish_publish(spec, record, image, vmid).await {
            error!(template = %spec.name, vmid, error = %e, "Publish failed");
            self.cleanup(vmid).await;
            return Err(e);
        }

        info!(
            "Successfully imported template {} with VMID {}",
            spec.name, vmid
        );
        Ok(vmid)
    }

    async fn finish_publish(
        &self,
        spec: &TemplateSpec,
        record: &TemplateRecord,
        image: &Path,
        vmid: Vmid,
    ) -> Result<()> {
        let storage = &self.config.storage;

        debug!(vmid, storage = %storage, "Importing disk");
        self.api
            .configure(
                vmid,
                &vec![(
                    "scsi0".to_string(),
                    format!("{}:0,import-from={},discard=on", storage, image.display()),
                )],
            )
            .await?;

        self.api
            .configure(
                vmid,
                &vec![
                    ("boot".to_string(), "c".to_string()),
                    ("bootdisk".to_string(), "scsi0".to_string()),
                ],
            )
            .await?;

        let cloudinit = vec![("ide2".to_string(), format!("{}:cloudinit", storage))];
        if let Err(e) = self.api.configure(vmid, &cloudinit).await {
            warn!(vmid, error = %e, "Cannot attach cloud-init drive, storage may not support it");
        }

        hardening::ensure_hardening(&self.api, vmid, &self.config.hardening).await?;

        if let Err(e) = self
            .api
            .set_description(vmid, &description(spec, record))
            .await
        {
            warn!(vmid, error = %e, "Cannot set template description");
        }

        self.api.mark_template(vmid).await
    }

    /// Destroy the entity behind `record`. Never clears the identifier.
    pub async fn remove(&self, name: &str, record: &TemplateRecord) -> Result<()> {
        let Some(vmid) = record.vmid else {
            warn!(template = %name, "No identifier recorded, nothing to remove");
            return Ok(());
        };

        info!("Removing template {} (VMID: {})", name, vmid);
        match self.api.destroy(vmid).await {
            Ok(()) => Ok(()),
            Err(e) if e.remote_kind() == Some(RemoteFailureKind::NotFound) => {
                warn!(template = %name, vmid, "Template not present on hypervisor");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Repair hardening drift on an already published template
    pub async fn ensure_hardening(&self, vmid: Vmid) -> Result<bool> {
        hardening::ensure_hardening(&self.api, vmid, &self.config.hardening).await
    }

    fn create_options(&self, spec: &TemplateSpec) -> VmOptions {
        let opt = |k: &str, v: String| (k.to_string(), v);
        vec![
            opt("name", spec.name.clone()),
            opt("memory", self.config.memory_mib.to_string()),
            opt("cores", self.config.cores.to_string()),
            opt("net0", format!("virtio,bridge={},firewall=1", self.config.bridge)),
            opt("agent", "enabled=1".into()),
            opt("scsihw", "virtio-scsi-pci".into()),
            opt("serial0", "socket".into()),
            opt("vga", "serial0".into()),
            opt("cpu", "host".into()),
        ]
    }

    async fn cleanup(&self, vmid: Vmid) {
        warn!(vmid, "Cleaning up half-built entity");
        if let Err(e) = self.api.destroy(vmid).await {
            if e.remote_kind() != Some(RemoteFailureKind::NotFound) {
                warn!(vmid, error = %e, "Cleanup failed");
            }
        }
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.retry.initial_interval)
            .with_max_interval(self.retry.max_interval)
            .with_max_elapsed_time(Some(self.retry.max_elapsed))
            .build();

        let op = &op;
        backoff::future::retry(policy, move || async move {
            op().await.map_err(|e| {
                if e.is_transient() {
                    debug!(operation, error = %e, "Transient failure, retrying");
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        })
        .await
    }
}

/// JSON description attached to published entities
pub fn description(spec: &TemplateSpec, record: &TemplateRecord) -> String {
    let mut doc = serde_json::Map::new();
    doc.insert("name".into(), spec.name.clone().into());
    if let Some(built) = record.build_date {
        doc.insert(
            "build_date".into(),
            built.format(TIMESTAMP_FORMAT).to_string().into(),
        );
    }
    if let Some(updated) = record.last_update {
        doc.insert(
            "last_update".into(),
            updated.format(TIMESTAMP_FORMAT).to_string().into(),
        );
    }
    doc.insert("source".into(), spec.source.to_string().into());
    doc.insert(
        "generator".into(),
        format!("{} {}", crate::NAME, crate::VERSION).into(),
    );

    serde_json::to_string_pretty(&serde_json::Value::Object(doc))
        .unwrap_or_else(|_| format!("{{\"name\": \"{}\"}}", spec.name))
}
