//! Remote Inventory
//!
//! Template lifecycle operations against the hypervisor, identifier
//! allocation, storage selection, and firewall hardening.

pub mod allocator;
pub mod hardening;
pub mod inventory;
pub mod storage;

pub use allocator::{lowest_free, IdentifierAllocator, MAX_VMID};
pub use hardening::{ensure_hardening, HardeningPolicy};
pub use inventory::{description, PublishConfig, RemoteInventory, RetryConfig};
pub use storage::{choose_storage, linked_dependents, select_storage};
