//! Catalog Loading and Fragment Resolution
//!
//! Turns a catalog document into resolved [`TemplateSpec`]s. Loading fails
//! as a whole only when the document itself is unreadable; a bad template
//! (invalid name, unknown fragment) is rejected on its own.

use super::model::{
    CatalogDocument, ComponentCatalog, RawFragment, RawTemplate, SourceRef, TemplateSpec,
};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Longest name the hypervisor accepts
pub const MAX_NAME_LEN: usize = 63;

/// Result of loading a catalog
#[derive(Debug, Default)]
pub struct Catalog {
    /// Resolved templates, in document order
    pub templates: Vec<TemplateSpec>,
    /// Templates that could not be resolved
    pub rejected: Vec<(String, Error)>,
}

impl Catalog {
    pub fn names(&self) -> Vec<&str> {
        self.templates.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&TemplateSpec> {
        self.templates.iter().find(|t| t.name == name)
    }
}

// =============================================================================
// Loading
// =============================================================================

/// Load and resolve every template in the catalog at `path`
pub async fn load(path: &Path) -> Result<Catalog> {
    let shown = path.display().to_string();

    let raw = tokio::fs::read_to_string(path).await.map_err(|e| Error::Catalog {
        path: shown.clone(),
        reason: e.to_string(),
    })?;

    let document = parse_document(&raw, is_yaml(path)).map_err(|e| Error::Catalog {
        path: shown.clone(),
        reason: e.to_string(),
    })?;

    let catalog = resolve_document(&document);

    info!(
        path = %shown,
        templates = catalog.templates.len(),
        rejected = catalog.rejected.len(),
        fragments = document.fragments.len(),
        "Loaded template catalog"
    );

    Ok(catalog)
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Parse catalog text in either layout
pub fn parse_document(raw: &str, yaml: bool) -> Result<CatalogDocument> {
    let value: serde_json::Value = if yaml {
        serde_yaml::from_str(raw)?
    } else {
        serde_json::from_str(raw)?
    };

    if !value.is_object() {
        return Err(Error::Configuration(
            "catalog must be a mapping at the top level".into(),
        ));
    }

    if is_component_layout(&value) {
        debug!("Catalog uses fragments/templates layout");
        let doc: ComponentCatalog = serde_json::from_value(value)?;
        Ok(doc.into())
    } else {
        let flat: IndexMap<String, RawTemplate> = serde_json::from_value(value)?;
        Ok(flat.into())
    }
}

/// The fragment layout has only `fragments` and `templates` at the top level,
/// and `templates` maps names to entries. Anything else is a flat catalog,
/// which may itself contain a template called `templates`.
fn is_component_layout(value: &serde_json::Value) -> bool {
    let Some(top) = value.as_object() else {
        return false;
    };
    let Some(templates) = top.get("templates").and_then(|t| t.as_object()) else {
        return false;
    };
    top.keys().all(|k| k == "fragments" || k == "templates")
        && templates.values().all(|t| t.is_object())
}

/// Resolve every entry, collecting per-template failures
pub fn resolve_document(document: &CatalogDocument) -> Catalog {
    let mut catalog = Catalog::default();

    for (name, raw) in &document.templates {
        match resolve(name, raw, &document.fragments) {
            Ok(spec) => catalog.templates.push(spec),
            Err(e) => {
                warn!(template = %name, error = %e, "Rejecting template");
                catalog.rejected.push((name.clone(), e));
            }
        }
    }

    catalog
}

// =============================================================================
// Resolution
// =============================================================================

/// Resolve one catalog entry against the fragment library
pub fn resolve(
    name: &str,
    raw: &RawTemplate,
    fragments: &BTreeMap<String, RawFragment>,
) -> Result<TemplateSpec> {
    validate_name(name)?;

    if raw.image_url.trim().is_empty() {
        return Err(Error::Validation {
            template: name.to_string(),
            reason: "image_url must not be empty".into(),
        });
    }

    let mut install_packages = Vec::new();
    let mut run_commands = Vec::new();
    let mut copy_files = BTreeMap::new();

    for fragment_name in &raw.fragments {
        let fragment = fragments
            .get(fragment_name)
            .ok_or_else(|| Error::UnknownFragment {
                template: name.to_string(),
                fragment: fragment_name.clone(),
            })?;

        install_packages.extend(fragment.install_packages.iter().cloned());
        run_commands.extend(fragment.run_commands.iter().cloned());
        copy_files.extend(
            fragment
                .copy_files
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
    }

    install_packages.extend(raw.install_packages.iter().cloned());
    run_commands.extend(raw.run_commands.iter().cloned());
    // Own entries win on key collision
    copy_files.extend(raw.copy_files.iter().map(|(k, v)| (k.clone(), v.clone())));

    Ok(TemplateSpec {
        name: name.to_string(),
        source: SourceRef::parse(raw.image_url.trim()),
        install_packages,
        update_packages: raw.update_packages,
        run_commands,
        copy_files,
        ssh_password_auth: raw.ssh_password_auth,
        ssh_root_login: raw.ssh_root_login,
        min_disk_size: raw.min_disk_size.map(u64::from),
    })
}

/// Check a name against the hypervisor naming rules
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(Error::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };

    if name.is_empty() {
        return invalid("must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("must be at most 63 characters");
    }
    if name.starts_with('-') {
        return invalid("must not start with '-'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return invalid(&format!("contains invalid character {:?}", c));
    }

    Ok(())
}
