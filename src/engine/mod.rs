//! Reconciliation Engine
//!
//! Decides, per template, whether to build, publish, replace, or leave it
//! alone, and carries the run through to a summary.

pub mod context;
pub mod plan;
pub mod reconciler;
pub mod sync;

pub use context::{status_table, Outcome, Phase, RunContext, StatusRow, Summary, TemplateReport};
pub use plan::{classify, Action, RunMode};
pub use reconciler::{EngineConfig, Reconciler, Selection};
pub use sync::{sync_records, Repair};
