//! Platform Adapters
//!
//! Concrete implementations of the domain ports against real tools:
//!
//! - [`PveCli`]: Proxmox VE via `qm` / `pvesh`
//! - [`HttpFetcher`]: image downloads via `reqwest`
//! - [`VirtCustomize`]: offline image customization
//! - [`QemuImg`]: image inspection and growth

pub mod http;
pub mod process;
pub mod pve;
pub mod qemu_img;
pub mod virt_customize;

pub use http::{HttpFetcher, HttpFetcherConfig};
pub use pve::{classify_failure, detect_node, PveCli, PveConfig};
pub use qemu_img::QemuImg;
pub use virt_customize::VirtCustomize;
