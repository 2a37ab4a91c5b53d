//! Catalog Document Model
//!
//! Raw, strictly-validated shapes of the catalog document (flat or
//! component-based) and the fully-resolved [`TemplateSpec`] they produce.

use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

// =============================================================================
// Raw Document Types
// =============================================================================

/// A template entry exactly as written in the catalog
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawTemplate {
    /// Source image: an http(s) URL or a local path
    pub image_url: String,

    /// Fragments to merge, in order
    #[serde(default)]
    pub fragments: Vec<String>,

    #[serde(default)]
    pub install_packages: Vec<String>,

    #[serde(default)]
    pub update_packages: bool,

    #[serde(default)]
    pub run_commands: Vec<String>,

    /// Local file -> directory inside the image
    #[serde(default)]
    pub copy_files: BTreeMap<String, String>,

    #[serde(default)]
    pub ssh_password_auth: bool,

    #[serde(default)]
    pub ssh_root_login: bool,

    /// Minimum virtual disk size, e.g. `"20G"` or a byte count
    #[serde(default)]
    pub min_disk_size: Option<DiskSize>,
}

/// A reusable bundle of customization instructions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawFragment {
    #[serde(default)]
    pub install_packages: Vec<String>,

    #[serde(default)]
    pub run_commands: Vec<String>,

    #[serde(default)]
    pub copy_files: BTreeMap<String, String>,
}

/// Component-based catalog: `{ fragments, templates }`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentCatalog {
    #[serde(default)]
    pub fragments: BTreeMap<String, RawFragment>,

    pub templates: IndexMap<String, RawTemplate>,
}

/// Either catalog layout, normalized to the component form
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogDocument {
    pub fragments: BTreeMap<String, RawFragment>,
    pub templates: IndexMap<String, RawTemplate>,
}

impl From<ComponentCatalog> for CatalogDocument {
    fn from(c: ComponentCatalog) -> Self {
        Self {
            fragments: c.fragments,
            templates: c.templates,
        }
    }
}

impl From<IndexMap<String, RawTemplate>> for CatalogDocument {
    fn from(templates: IndexMap<String, RawTemplate>) -> Self {
        Self {
            fragments: BTreeMap::new(),
            templates,
        }
    }
}

// =============================================================================
// Disk Size
// =============================================================================

/// A byte count written either as an integer or a string with a unit suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DiskSizeRepr", into = "u64")]
pub struct DiskSize(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum DiskSizeRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<DiskSizeRepr> for DiskSize {
    type Error = Error;

    fn try_from(repr: DiskSizeRepr) -> Result<Self> {
        match repr {
            DiskSizeRepr::Bytes(b) => Ok(DiskSize(b)),
            DiskSizeRepr::Text(s) => parse_capacity(&s).map(DiskSize),
        }
    }
}

impl From<DiskSize> for u64 {
    fn from(size: DiskSize) -> u64 {
        size.0
    }
}

/// Parse capacity string (e.g., "20G", "512Mi") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str.to_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KI" | "KIB" => 1024,
        "M" | "MB" | "MI" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GI" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TI" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}

// =============================================================================
// Resolved Template
// =============================================================================

/// Where a template's base image comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRef {
    Url(String),
    Local(PathBuf),
}

impl SourceRef {
    /// Classify a catalog `image_url` value
    pub fn parse(raw: &str) -> Self {
        let lower = raw.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            SourceRef::Url(raw.to_string())
        } else if let Some(path) = raw.strip_prefix("file://") {
            SourceRef::Local(PathBuf::from(path))
        } else {
            SourceRef::Local(PathBuf::from(raw))
        }
    }

    /// Final path segment, used to detect compressed sources
    pub fn file_name(&self) -> String {
        match self {
            SourceRef::Url(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                path.rsplit('/').next().unwrap_or(path).to_string()
            }
            SourceRef::Local(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRef::Url(url) => write!(f, "{}", url),
            SourceRef::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A fully resolved template definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    pub source: SourceRef,
    pub install_packages: Vec<String>,
    pub update_packages: bool,
    pub run_commands: Vec<String>,
    /// Local file -> directory inside the image
    pub copy_files: BTreeMap<String, String>,
    pub ssh_password_auth: bool,
    pub ssh_root_login: bool,
    /// Minimum virtual disk size in bytes
    pub min_disk_size: Option<u64>,
}
