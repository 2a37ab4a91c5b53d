//! Storage Selection and Linked-Clone Detection
//!
//! Chooses the storage templates are imported into and inspects its volumes
//! for copy-on-write children of a template's base disk.

use crate::domain::{HypervisorApiRef, StorageInfo, StorageVolume, Vmid};
use crate::error::{Error, Result};
use tracing::{debug, info, warn};

/// Snapshot suffix marking a base volume that clones link to
pub const BASE_SNAPSHOT: &str = "@__base__";

/// Pick the storage to import into.
///
/// With no request, the first storage that can hold VM disks wins. A
/// requested storage must exist and be suitable.
pub async fn select_storage(api: &HypervisorApiRef, requested: Option<&str>) -> Result<String> {
    let storages = api.list_storages().await.map_err(|e| {
        Error::Storage(format!("cannot list storages on {}: {}", api.node(), e))
    })?;
    choose_storage(&storages, requested)
}

/// Pure selection over a storage listing
pub fn choose_storage(storages: &[StorageInfo], requested: Option<&str>) -> Result<String> {
    let suitable: Vec<&str> = storages
        .iter()
        .filter(|s| s.accepts_vm_images())
        .map(|s| s.storage.as_str())
        .collect();

    match requested {
        None => {
            let chosen = suitable.first().ok_or_else(|| {
                Error::Storage("no active storage accepts VM images".into())
            })?;
            info!("Auto-selected storage: {}", chosen);
            Ok(chosen.to_string())
        }
        Some(name) => {
            let Some(storage) = storages.iter().find(|s| s.storage == name) else {
                warn!(available = ?suitable, "Requested storage not found");
                return Err(Error::Storage(format!(
                    "storage '{}' does not exist (suitable: {})",
                    name,
                    suitable.join(", ")
                )));
            };
            if !storage.accepts_vm_images() {
                warn!(available = ?suitable, "Requested storage cannot hold VM images");
                return Err(Error::Storage(format!(
                    "storage '{}' is inactive, disabled or does not accept images (suitable: {})",
                    name,
                    suitable.join(", ")
                )));
            }
            debug!("Using requested storage: {}", name);
            Ok(name.to_string())
        }
    }
}

/// Volume names (the part after `storage:`) of an entity's base disks
pub fn base_volumes(vmid: Vmid, volumes: &[StorageVolume]) -> Vec<String> {
    volumes
        .iter()
        .filter(|v| v.vmid == Some(vmid) && v.content == "images" && v.format.is_some())
        .filter(|v| {
            v.parent
                .as_deref()
                .map_or(true, |p| !p.ends_with(BASE_SNAPSHOT))
        })
        .filter_map(|v| {
            let name = v.volid.rsplit(':').next().unwrap_or_default();
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

/// Volumes whose copy-on-write parent is one of `vmid`'s base disks
pub fn linked_dependents(vmid: Vmid, volumes: &[StorageVolume]) -> Vec<&StorageVolume> {
    let bases = base_volumes(vmid, volumes);
    if bases.is_empty() {
        return Vec::new();
    }

    volumes
        .iter()
        .filter(|v| {
            v.parent.as_deref().is_some_and(|parent| {
                let parent_disk = parent.split(BASE_SNAPSHOT).next().unwrap_or(parent);
                bases.iter().any(|b| parent_disk.ends_with(b.as_str()))
            })
        })
        .collect()
}
