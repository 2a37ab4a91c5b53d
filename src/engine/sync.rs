//! Metadata Synchronization
//!
//! The hypervisor is authoritative for name-to-identifier mapping. Sync is a
//! pure function over the records and the remote listing; the caller logs
//! the repairs and persists the result.

use crate::domain::Vmid;
use crate::metadata::Records;
use std::collections::BTreeMap;
use std::fmt;

/// One correction made to a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Repair {
    /// Local identifier replaced by the remote one
    Adopted {
        name: String,
        previous: Option<Vmid>,
        vmid: Vmid,
    },
    /// Identifier cleared because the name is not published
    Cleared { name: String, previous: Vmid },
}

impl fmt::Display for Repair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repair::Adopted {
                name,
                previous: Some(prev),
                vmid,
            } => write!(f, "{}: identifier {} corrected to {}", name, prev, vmid),
            Repair::Adopted {
                name,
                previous: None,
                vmid,
            } => write!(f, "{}: adopted remote identifier {}", name, vmid),
            Repair::Cleared { name, previous } => {
                write!(f, "{}: cleared identifier {} (not published)", name, previous)
            }
        }
    }
}

/// Reconcile record identifiers against the remote listing.
///
/// Only existing records are touched; remote names without a record are
/// left alone.
pub fn sync_records(records: &Records, remote: &BTreeMap<String, Vmid>) -> (Records, Vec<Repair>) {
    let mut synced = records.clone();
    let mut repairs = Vec::new();

    for (name, record) in synced.iter_mut() {
        match (remote.get(name), record.vmid) {
            (Some(&vmid), current) if current != Some(vmid) => {
                repairs.push(Repair::Adopted {
                    name: name.clone(),
                    previous: current,
                    vmid,
                });
                record.vmid = Some(vmid);
            }
            (None, Some(previous)) => {
                repairs.push(Repair::Cleared {
                    name: name.clone(),
                    previous,
                });
                record.vmid = None;
            }
            _ => {}
        }
    }

    (synced, repairs)
}
