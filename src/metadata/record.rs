//! Template Records
//!
//! The persisted per-template state: when it was built, when it was last
//! updated in place, and which identifier it was published under.

use crate::domain::Vmid;
use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

/// Timestamp format used in the sidecar document
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats accepted when reading hand-edited timestamps
const ACCEPTED_FORMATS: [&str; 2] = [TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M:%S"];

/// All records, keyed by template name
pub type Records = BTreeMap<String, TemplateRecord>;

/// Persisted state of one template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRecord {
    /// Set on every fresh (non-update) build
    #[serde(default, with = "timestamp")]
    pub build_date: Option<NaiveDateTime>,

    /// Set on every in-place update, cleared by a fresh build
    #[serde(default, with = "timestamp")]
    pub last_update: Option<NaiveDateTime>,

    /// Identifier of the published entity
    #[serde(default)]
    pub vmid: Option<Vmid>,
}

impl TemplateRecord {
    /// Whether a build has ever completed for this template
    pub fn is_built(&self) -> bool {
        self.build_date.is_some()
    }

    /// Record a fresh build
    pub fn stamp_built(&mut self, at: NaiveDateTime) {
        self.build_date = Some(at);
        self.last_update = None;
    }

    /// Record an in-place update of an existing build
    pub fn stamp_updated(&mut self, at: NaiveDateTime) {
        self.last_update = Some(at);
    }

    /// Decode one sidecar entry. Fields that do not parse are dropped with a
    /// warning; the rest of the entry is kept.
    pub fn from_value(name: &str, value: &Value) -> Self {
        let Some(fields) = value.as_object() else {
            warn!(template = %name, "Metadata entry is not an object, ignoring it");
            return Self::default();
        };
        Self {
            build_date: timestamp_field(name, fields, "build_date"),
            last_update: timestamp_field(name, fields, "last_update"),
            vmid: vmid_field(name, fields),
        }
    }
}

/// Parse a sidecar timestamp in any accepted format
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    ACCEPTED_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
}

fn timestamp_field(name: &str, fields: &Map<String, Value>, key: &str) -> Option<NaiveDateTime> {
    match fields.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => {
            let parsed = parse_timestamp(s);
            if parsed.is_none() {
                warn!(template = %name, field = key, value = %s, "Unparseable timestamp, treating as unset");
            }
            parsed
        }
        Some(other) => {
            warn!(template = %name, field = key, value = %other, "Timestamp is not a string, treating as unset");
            None
        }
    }
}

fn vmid_field(name: &str, fields: &Map<String, Value>) -> Option<Vmid> {
    let parsed = match fields.get("vmid") {
        None | Some(Value::Null) => return None,
        Some(Value::Number(n)) => n.as_u64().and_then(|v| Vmid::try_from(v).ok()),
        Some(Value::String(s)) => s.trim().parse::<Vmid>().ok(),
        Some(_) => None,
    };
    if parsed.is_none() {
        warn!(template = %name, "Invalid identifier in metadata, treating as unset");
    }
    parsed
}

/// Current local time at the sidecar's precision
pub fn now() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Render a timestamp for humans
pub fn format_timestamp(ts: Option<NaiveDateTime>) -> String {
    ts.map(|t| t.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| "-".to_string())
}

mod timestamp {
    use super::TIMESTAMP_FORMAT;
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<NaiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(ts) => serializer.serialize_str(&ts.format(TIMESTAMP_FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw {
            None => Ok(None),
            Some(s) if s.trim().is_empty() => Ok(None),
            Some(s) => super::parse_timestamp(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp '{}'", s))),
        }
    }
}
