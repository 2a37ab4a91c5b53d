//! Error types for cloudbuilder
//!
//! Provides structured error types for every component of the template
//! lifecycle: catalog loading, local builds, and the hypervisor adapters.

use thiserror::Error;

/// Structured category of a failed hypervisor operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteFailureKind {
    /// The target entity does not exist
    NotFound,
    /// The target entity (or identifier) is already taken
    AlreadyExists,
    /// Anything else
    Other,
}

impl std::fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteFailureKind::NotFound => write!(f, "not-found"),
            RemoteFailureKind::AlreadyExists => write!(f, "already-exists"),
            RemoteFailureKind::Other => write!(f, "other"),
        }
    }
}

/// Unified error type for cloudbuilder
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Catalog Errors
    // =========================================================================
    #[error("Catalog error in {path}: {reason}")]
    Catalog { path: String, reason: String },

    #[error("Invalid template name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Template '{template}' references unknown fragment '{fragment}'")]
    UnknownFragment { template: String, fragment: String },

    #[error("Template '{template}' failed validation: {reason}")]
    Validation { template: String, reason: String },

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // Fetch Errors
    // =========================================================================
    #[error("Failed to fetch {source_ref}: {reason}")]
    Fetch { source_ref: String, reason: String },

    #[error("Source image not found: {path}")]
    SourceNotFound { path: String },

    #[error("Fetching {source_ref} timed out after {secs}s")]
    FetchTimeout { source_ref: String, secs: u64 },

    #[error("Decompression of {path} failed: {reason}")]
    Decompression { path: String, reason: String },

    // =========================================================================
    // Build Errors
    // =========================================================================
    #[error("Disk resize failed for {path}: {reason}")]
    Resize { path: String, reason: String },

    #[error("Customization of '{template}' timed out after {secs}s")]
    CustomizeTimeout { template: String, secs: u64 },

    #[error("Customization of '{template}' failed (exit code {code:?}): {diagnostics}")]
    CustomizeFailed {
        template: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("Tool invocation failed: {tool} - {reason}")]
    Tool { tool: String, reason: String },

    // =========================================================================
    // Remote Errors
    // =========================================================================
    #[error("Hypervisor query failed: {operation} - {reason}")]
    RemoteQuery { operation: String, reason: String },

    #[error("Hypervisor operation failed: {operation} on {vmid} ({kind}): {reason}")]
    RemoteOperation {
        operation: String,
        vmid: u32,
        kind: RemoteFailureKind,
        reason: String,
    },

    #[error(
        "Refusing to modify templates with linked clones: {}",
        .templates.join(", ")
    )]
    LinkedDependentVeto { templates: Vec<String> },

    #[error("No free identifier at or above {floor}")]
    IdentifierExhausted { floor: u32 },

    #[error("Storage error: {0}")]
    Storage(String),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How far an error reaches when it surfaces in the reconciliation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    /// Caught at the per-template boundary; the run continues
    Template,
    /// Aborts the whole run
    Run,
}

impl Error {
    /// Determine how far this error propagates
    pub fn scope(&self) -> ErrorScope {
        match self {
            // Whole-run safety and setup failures
            Error::LinkedDependentVeto { .. }
            | Error::Catalog { .. }
            | Error::Configuration(_)
            | Error::Storage(_)
            | Error::IdentifierExhausted { .. } => ErrorScope::Run,

            // Everything else is local to one template
            _ => ErrorScope::Template,
        }
    }

    /// Check if this error aborts the run
    pub fn is_fatal(&self) -> bool {
        matches!(self.scope(), ErrorScope::Run)
    }

    /// Check if this error is transient (worth retrying)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::RemoteQuery { .. } | Error::FetchTimeout { .. } | Error::Fetch { .. }
        )
    }

    /// The structured remote failure category, if any
    pub fn remote_kind(&self) -> Option<RemoteFailureKind> {
        match self {
            Error::RemoteOperation { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether the build pipeline may fall back to a cached image
    pub fn allows_cached_fallback(&self) -> bool {
        matches!(
            self,
            Error::Fetch { .. } | Error::FetchTimeout { .. } | Error::SourceNotFound { .. }
        )
    }
}

/// Result type alias for cloudbuilder
pub type Result<T> = std::result::Result<T, Error>;
