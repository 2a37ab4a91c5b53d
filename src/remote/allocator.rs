//! Identifier Allocator
//!
//! Picks the lowest identifier at or above the floor that no entity in the
//! cluster uses. The cluster is re-queried on every call and the scan-and-pick
//! runs under a lock, so two allocations in one process never race.

use crate::domain::{HypervisorApiRef, Vmid};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Highest identifier the hypervisor accepts
pub const MAX_VMID: Vmid = 999_999_999;

/// Lowest value in `floor..=ceiling` absent from `used`
pub fn lowest_free(floor: Vmid, ceiling: Vmid, used: &BTreeSet<Vmid>) -> Option<Vmid> {
    let mut candidate = floor;
    for &id in used.range(floor..) {
        if id != candidate {
            break;
        }
        candidate = candidate.checked_add(1)?;
    }
    (candidate <= ceiling).then_some(candidate)
}

/// Cluster-wide identifier allocator
pub struct IdentifierAllocator {
    api: HypervisorApiRef,
    floor: Vmid,
    lock: Mutex<()>,
}

impl IdentifierAllocator {
    pub fn new(api: HypervisorApiRef, floor: Vmid) -> Self {
        Self {
            api,
            floor,
            lock: Mutex::new(()),
        }
    }

    pub fn floor(&self) -> Vmid {
        self.floor
    }

    /// Allocate a free identifier, skipping anything in `exclude`.
    ///
    /// A failed cluster query is returned as-is: allocating against an
    /// unknown used-set is never safe.
    pub async fn allocate(&self, exclude: &BTreeSet<Vmid>) -> Result<Vmid> {
        let _guard = self.lock.lock().await;

        let resources = self.api.cluster_resources().await?;
        let mut used: BTreeSet<Vmid> = resources.iter().map(|r| r.vmid).collect();
        debug!(in_use = used.len(), floor = self.floor, "Scanned cluster identifiers");
        used.extend(exclude.iter().copied());

        let vmid = lowest_free(self.floor, MAX_VMID, &used)
            .ok_or(Error::IdentifierExhausted { floor: self.floor })?;

        info!("Selected new VMID: {}", vmid);
        Ok(vmid)
    }
}
