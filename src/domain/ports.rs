//! Domain Ports - Core trait definitions for cloudbuilder
//!
//! These traits define the boundaries between the reconciliation logic and
//! the external systems it orchestrates: the image fetcher, the disk tools,
//! and the hypervisor management interface. Adapters in [`crate::platform`]
//! implement them against real binaries; tests use in-memory fakes.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Cluster-wide numeric handle of a hypervisor entity
pub type Vmid = u32;

// =============================================================================
// Hypervisor Inventory Types
// =============================================================================

/// A compute entity as reported by the hypervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntity {
    /// Entity name
    pub name: String,
    /// Cluster-wide identifier
    pub vmid: Vmid,
    /// Whether the entity has been converted to a template
    pub template: bool,
}

/// An identifier in use somewhere in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterResource {
    pub vmid: Vmid,
    pub name: Option<String>,
    pub node: Option<String>,
}

/// A volume on a storage backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageVolume {
    /// Volume identifier, e.g. `local-zfs:base-9000-disk-0`
    pub volid: String,
    /// Owning entity, if any
    pub vmid: Option<Vmid>,
    /// Copy-on-write parent, e.g. `base-9000-disk-0@__base__`
    pub parent: Option<String>,
    /// Content type (`images`, `rootdir`, `iso`, ...)
    pub content: String,
    /// Disk format (`raw`, `qcow2`, `subvol`, ...)
    pub format: Option<String>,
}

/// A storage backend configured on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage: String,
    pub active: bool,
    pub enabled: bool,
    /// Content types the storage accepts
    pub content: Vec<String>,
}

impl StorageInfo {
    /// Whether this storage can hold VM disks
    pub fn accepts_vm_images(&self) -> bool {
        self.active
            && self.enabled
            && self
                .content
                .iter()
                .any(|c| c == "images" || c == "rootdir")
    }
}

/// Entity-level firewall options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallOptions {
    pub enable: bool,
    pub dhcp: bool,
    pub macfilter: bool,
    pub policy_in: String,
    pub policy_out: String,
}

impl Default for FirewallOptions {
    fn default() -> Self {
        // What the hypervisor reports for an entity that never had options set
        Self {
            enable: false,
            dhcp: true,
            macfilter: true,
            policy_in: "ACCEPT".to_string(),
            policy_out: "ACCEPT".to_string(),
        }
    }
}

/// Ordered key/value options for create and configure calls
pub type VmOptions = Vec<(String, String)>;

// =============================================================================
// Hypervisor Port
// =============================================================================

/// Port for the hypervisor management interface
#[async_trait]
pub trait HypervisorApi: Send + Sync {
    /// Name of the node this adapter operates on
    fn node(&self) -> &str;

    /// List compute entities on the node
    async fn list_entities(&self) -> Result<Vec<RemoteEntity>>;

    /// List every identifier in use anywhere in the cluster
    async fn cluster_resources(&self) -> Result<Vec<ClusterResource>>;

    /// List storage backends on the node
    async fn list_storages(&self) -> Result<Vec<StorageInfo>>;

    /// List volumes on a storage backend
    async fn storage_content(&self, storage: &str) -> Result<Vec<StorageVolume>>;

    /// Create an entity
    async fn create(&self, vmid: Vmid, options: &VmOptions) -> Result<()>;

    /// Apply configuration options to an entity
    async fn configure(&self, vmid: Vmid, options: &VmOptions) -> Result<()>;

    /// Read an entity's configuration
    async fn config(&self, vmid: Vmid) -> Result<BTreeMap<String, String>>;

    /// Set the free-text description of an entity
    async fn set_description(&self, vmid: Vmid, description: &str) -> Result<()>;

    /// Destroy an entity
    async fn destroy(&self, vmid: Vmid) -> Result<()>;

    /// Convert an entity into a template
    async fn mark_template(&self, vmid: Vmid) -> Result<()>;

    /// Read entity-level firewall options
    async fn firewall_options(&self, vmid: Vmid) -> Result<FirewallOptions>;

    /// Write entity-level firewall options
    async fn set_firewall_options(&self, vmid: Vmid, options: &FirewallOptions) -> Result<()>;
}

// =============================================================================
// Image Source Port
// =============================================================================

/// Port for moving source image bytes onto local disk
#[async_trait]
pub trait ByteFetcher: Send + Sync {
    /// Download `url` into `dest`, bounded by `timeout`. Returns bytes written.
    async fn fetch(&self, url: &str, dest: &Path, timeout: Duration) -> Result<u64>;

    /// Copy a local file into `dest`. Returns bytes written.
    async fn fetch_local(&self, source: &Path, dest: &Path) -> Result<u64>;
}

// =============================================================================
// Disk Tool Ports
// =============================================================================

/// A single in-image customization step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CustomizeOp {
    /// Update all installed packages
    Update,
    /// Install packages
    Install(Vec<String>),
    /// Copy a local file into a directory inside the image
    CopyIn { source: PathBuf, dest_dir: String },
    /// Run a shell command inside the image
    RunCommand(String),
    /// Write a file inside the image
    Write { path: String, content: String },
}

/// How a customization subprocess ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CustomizeStatus {
    /// The process exited on its own
    Exited {
        code: Option<i32>,
        diagnostics: String,
    },
    /// The wall-clock bound was hit and the process was killed
    TimedOut,
}

impl CustomizeStatus {
    pub fn success(&self) -> bool {
        matches!(self, CustomizeStatus::Exited { code: Some(0), .. })
    }
}

/// Port for offline disk-image customization
#[async_trait]
pub trait DiskCustomizer: Send + Sync {
    /// Apply `ops` to the image, killing the subprocess after `timeout`
    async fn customize(
        &self,
        image: &Path,
        ops: &[CustomizeOp],
        timeout: Duration,
    ) -> Result<CustomizeStatus>;
}

/// Port for disk-image size inspection and growth
#[async_trait]
pub trait DiskResizer: Send + Sync {
    /// Virtual size of the image in bytes
    async fn virtual_size(&self, image: &Path) -> Result<u64>;

    /// Grow the image to `target_bytes`
    async fn grow(&self, image: &Path, target_bytes: u64) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type HypervisorApiRef = Arc<dyn HypervisorApi>;
pub type ByteFetcherRef = Arc<dyn ByteFetcher>;
pub type DiskCustomizerRef = Arc<dyn DiskCustomizer>;
pub type DiskResizerRef = Arc<dyn DiskResizer>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_accepts_vm_images() {
        let mut storage = StorageInfo {
            storage: "local-zfs".into(),
            active: true,
            enabled: true,
            content: vec!["images".into(), "rootdir".into()],
        };
        assert!(storage.accepts_vm_images());

        storage.content = vec!["iso".into(), "vztmpl".into()];
        assert!(!storage.accepts_vm_images());

        storage.content = vec!["images".into()];
        storage.active = false;
        assert!(!storage.accepts_vm_images());
    }

    #[test]
    fn test_customize_status_success() {
        assert!(CustomizeStatus::Exited {
            code: Some(0),
            diagnostics: String::new()
        }
        .success());
        assert!(!CustomizeStatus::Exited {
            code: Some(1),
            diagnostics: "boom".into()
        }
        .success());
        assert!(!CustomizeStatus::TimedOut.success());
    }
}
