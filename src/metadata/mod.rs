//! Local Metadata
//!
//! Per-template build/update timestamps and published identifiers,
//! persisted as a sidecar document next to the image cache.

pub mod record;
pub mod store;

pub use record::{format_timestamp, now, Records, TemplateRecord, TIMESTAMP_FORMAT};
pub use store::{MetadataStore, METADATA_FILE};
