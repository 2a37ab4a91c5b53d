//! cloudbuilder
//!
//! Builds customized VM templates from cloud images and keeps them
//! reconciled with a Proxmox VE cluster.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                      Reconciliation Engine                         │
//! │      sync metadata ─▶ classify ─▶ veto ─▶ build ─▶ publish          │
//! ├──────────────────┬──────────────────────┬─────────────────────────┤
//! │  Catalog         │  Build Pipeline      │  Remote Inventory        │
//! │  (fragments,     │  (fetch, decompress, │  (list, publish, remove, │
//! │   validation)    │   resize, customize) │   allocate, harden)      │
//! ├──────────────────┼──────────────────────┼─────────────────────────┤
//! │  Metadata Store  │  Image Cache         │  Hypervisor port         │
//! │  (sidecar JSON)  │  (qcow2 per template)│  (qm / pvesh)            │
//! └──────────────────┴──────────────────────┴─────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`catalog`]: Template catalog parsing and fragment resolution
//! - [`metadata`]: Per-template build metadata sidecar
//! - [`cache`]: Local image cache and source decompression
//! - [`build`]: Local build pipeline
//! - [`remote`]: Hypervisor inventory, identifier allocation, hardening
//! - [`engine`]: Reconciliation engine and run context
//! - [`platform`]: Concrete adapters for external tools
//! - [`domain`]: Port traits and boundary types
//! - [`error`]: Error types and handling

pub mod build;
pub mod cache;
pub mod catalog;
pub mod domain;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod platform;
pub mod remote;

#[cfg(test)]
pub mod testing;

// Re-export commonly used types
pub use build::{BuildConfig, BuildMode, BuildPipeline, Workspace};
pub use cache::ImageCache;
pub use catalog::{Catalog, TemplateSpec};
pub use domain::ports::{
    ByteFetcher, DiskCustomizer, DiskResizer, HypervisorApi, HypervisorApiRef, Vmid,
};
pub use engine::{EngineConfig, Reconciler, RunContext, RunMode, Selection};
pub use error::{Error, ErrorScope, Result};
pub use metadata::{MetadataStore, TemplateRecord};
pub use platform::{HttpFetcher, PveCli, QemuImg, VirtCustomize};
pub use remote::{HardeningPolicy, IdentifierAllocator, PublishConfig, RemoteInventory, RetryConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
