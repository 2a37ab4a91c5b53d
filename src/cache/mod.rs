//! Image Cache
//!
//! The local store of built template images, plus decompression of
//! compressed source images before they are customized.
//!
//! ```text
//! <template_dir>/
//!   metadata.json        sidecar records
//!   web.qcow2            built image for template "web"
//!   db.qcow2.partial     in-flight install (removed at startup)
//! ```

pub mod compression;
pub mod images;

pub use compression::{decompress_file, decompress_if_needed, CompressionAlgorithm};
pub use images::{ImageCache, IMAGE_EXTENSION, PARTIAL_SUFFIX};
