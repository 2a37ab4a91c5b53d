//! Template Catalog
//!
//! Declarative template definitions, in a flat layout or a component layout
//! with reusable fragments, resolved into [`TemplateSpec`]s.

pub mod model;
pub mod resolver;

pub use model::*;
pub use resolver::{load, parse_document, resolve, resolve_document, validate_name, Catalog};
