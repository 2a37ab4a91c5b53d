//! Run Context
//!
//! Per-invocation state passed explicitly through the engine: what mode the
//! run is in, and what happened to each template.

use super::plan::{Action, RunMode};
use crate::domain::Vmid;
use crate::metadata::{format_timestamp, TemplateRecord};
use comfy_table::{ContentArrangement, Table};
use std::fmt;
use std::time::{Duration, Instant};

/// Phase a template was in when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resolve,
    Build,
    Remove,
    Publish,
    Persist,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Resolve => "resolve",
            Phase::Build => "build",
            Phase::Remove => "remove",
            Phase::Publish => "publish",
            Phase::Persist => "persist",
        };
        write!(f, "{}", s)
    }
}

/// Final state of one template in this run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Built into the cache but not published
    Built,
    Published { vmid: Vmid },
    Unchanged,
    Failed { phase: Phase, message: String },
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// Result line for one template
#[derive(Debug, Clone)]
pub struct TemplateReport {
    pub name: String,
    pub action: Option<Action>,
    pub outcome: Outcome,
}

/// Totals for the end-of-run summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} succeeded, {} unchanged, {} failed",
            self.succeeded, self.unchanged, self.failed
        )
    }
}

/// Explicit state of one invocation
#[derive(Debug)]
pub struct RunContext {
    pub mode: RunMode,
    /// Never mutate the remote inventory
    pub build_only: bool,
    started: Instant,
    reports: Vec<TemplateReport>,
}

impl RunContext {
    pub fn new(mode: RunMode, build_only: bool) -> Self {
        Self {
            mode,
            build_only,
            started: Instant::now(),
            reports: Vec::new(),
        }
    }

    pub fn record(&mut self, name: &str, action: Option<Action>, outcome: Outcome) {
        self.reports.push(TemplateReport {
            name: name.to_string(),
            action,
            outcome,
        });
    }

    pub fn fail(&mut self, name: &str, action: Option<Action>, phase: Phase, message: impl Into<String>) {
        self.record(
            name,
            action,
            Outcome::Failed {
                phase,
                message: message.into(),
            },
        );
    }

    pub fn reports(&self) -> &[TemplateReport] {
        &self.reports
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for report in &self.reports {
            match report.outcome {
                Outcome::Built | Outcome::Published { .. } => summary.succeeded += 1,
                Outcome::Unchanged => summary.unchanged += 1,
                Outcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }

    pub fn has_failures(&self) -> bool {
        self.reports.iter().any(|r| r.outcome.is_failure())
    }

    /// Process exit status: non-zero when the run aborted or anything failed
    pub fn exit_code(&self, aborted: bool) -> i32 {
        if aborted || self.has_failures() {
            1
        } else {
            0
        }
    }

    /// Failed templates with phase and message
    pub fn failures(&self) -> impl Iterator<Item = (&str, Phase, &str)> {
        self.reports.iter().filter_map(|r| match &r.outcome {
            Outcome::Failed { phase, message } => Some((r.name.as_str(), *phase, message.as_str())),
            _ => None,
        })
    }
}

// =============================================================================
// Status Table
// =============================================================================

/// One row of the status view
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub name: String,
    pub cached: bool,
    pub record: TemplateRecord,
    pub remote_vmid: Option<Vmid>,
    pub planned: Action,
}

fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Render the status view
pub fn status_table(rows: &[StatusRow]) -> String {
    let mut table = new_table(&[
        "TEMPLATE",
        "LOCAL",
        "BUILT",
        "UPDATED",
        "VMID",
        "REMOTE",
        "PLANNED",
    ]);

    for row in rows {
        table.add_row(vec![
            row.name.clone(),
            if row.cached && row.record.is_built() { "cached" } else { "missing" }.to_string(),
            format_timestamp(row.record.build_date),
            format_timestamp(row.record.last_update),
            row.record
                .vmid
                .map(|v| v.to_string())
                .unwrap_or_else(|| "-".to_string()),
            match row.remote_vmid {
                Some(_) => "published".to_string(),
                None => "absent".to_string(),
            },
            row.planned.to_string(),
        ]);
    }

    table.to_string()
}
