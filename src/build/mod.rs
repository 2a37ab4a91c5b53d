//! Local Build
//!
//! Turns a resolved template into a customized image in the cache.

pub mod customize;
pub mod pipeline;
pub mod workspace;

pub use customize::{plan as plan_customization, CustomizePlan};
pub use pipeline::{BuildConfig, BuildMode, BuildPipeline};
pub use workspace::{Scratch, Workspace};
