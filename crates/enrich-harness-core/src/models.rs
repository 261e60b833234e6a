//! Core data models for Enrich Harness.
//!
//! Raw [`Item`]s are written by the raw-fetch phase; [`RichItem`]s are
//! derived from them during enrichment. Identities flow through the
//! engine as [`IdentityTuple`]s and resolve to a [`CanonicalPerson`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Rendering of a missing identity field in logs and legacy payloads.
pub const MISSING: &str = "<nil>";

/// Rendering of a missing field inside identity hashes.
pub const NONE: &str = "None";

/// Default gender and organization label when the profile carries none.
pub const UNKNOWN: &str = "Unknown";

/// Marker used for every field of an identity that never resolved.
pub const UNDEFINED: &str = "-- UNDEFINED --";

/// A raw record as stored in the raw index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Content hash of `(origin, item id)`; used as the index `_id`.
    pub uuid: String,
    pub origin: String,
    #[serde(default)]
    pub tag: String,
    #[serde(rename = "metadata__updated_on")]
    pub updated_on: DateTime<Utc>,
    #[serde(rename = "metadata__timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub backend_name: String,
    pub data: Value,
    /// Connector-specific top-level fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An enriched record as stored in the rich index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RichItem {
    pub id: String,
    pub uuid: String,
    pub origin: String,
    #[serde(rename = "metadata__updated_on")]
    pub updated_on: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RichItem {
    /// Start a rich item from the raw item it derives from.
    pub fn from_item(id: impl Into<String>, item: &Item) -> Self {
        let mut fields = Map::new();
        fields.insert("tag".to_string(), Value::String(item.tag.clone()));
        fields.insert(
            "metadata__timestamp".to_string(),
            Value::String(item.timestamp.to_rfc3339()),
        );
        fields.insert(
            "metadata__enriched_on".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );
        if let Some(offset) = item.offset {
            fields.insert("offset".to_string(), serde_json::json!(offset));
        }
        Self {
            id: id.into(),
            uuid: item.uuid.clone(),
            origin: item.origin.clone(),
            updated_on: item.updated_on,
            fields,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn extend(&mut self, fields: Map<String, Value>) {
        self.fields.extend(fields);
    }
}

/// Documents that can be bulk-indexed under a stable primary key.
pub trait IndexDocument: Serialize + Send + Sync {
    fn doc_id(&self) -> &str;
}

impl IndexDocument for Item {
    fn doc_id(&self) -> &str {
        &self.uuid
    }
}

impl IndexDocument for RichItem {
    fn doc_id(&self) -> &str {
        &self.id
    }
}

/// `(name, username, email)` as seen in one source record.
///
/// `None` marks a missing field and is distinct from `Some("")`. The
/// tuple is hashable so a run can dedup on the full triple.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityTuple {
    pub name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
}

impl IdentityTuple {
    pub fn new(name: Option<&str>, username: Option<&str>, email: Option<&str>) -> Self {
        Self {
            name: from_raw(name),
            username: from_raw(username),
            email: from_raw(email),
        }
    }

    /// True when no field carries a value, not even an empty one.
    pub fn is_missing_all(&self) -> bool {
        self.name.is_none() && self.username.is_none() && self.email.is_none()
    }

    /// Display name for the profile row: name, falling back to username.
    pub fn display_name(&self) -> Option<&str> {
        self.name
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.username.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Treat the `<nil>` wire rendering as a missing value.
fn from_raw(value: Option<&str>) -> Option<String> {
    match value {
        Some(MISSING) | None => None,
        Some(v) => Some(v.to_string()),
    }
}

/// Row of the `identities` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRow {
    pub id: String,
    pub source: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub username: Option<String>,
    pub uuid: String,
    pub last_modified: DateTime<Utc>,
}

/// Row of the `profiles` table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileRow {
    pub uuid: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub gender_acc: Option<i64>,
    pub is_bot: Option<bool>,
}

/// One pending identity in an upload pack: the three rows it creates.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIdentity {
    pub identity: IdentityRow,
    pub profile: ProfileRow,
}

/// A resolved contributor as seen by the enrichment phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalPerson {
    pub id: String,
    pub uuid: String,
    pub name: String,
    pub username: String,
    pub domain: String,
    pub gender: String,
    pub gender_acc: i64,
    pub is_bot: bool,
    pub org_name: String,
    pub multi_org_names: Vec<String>,
}

/// Outcome of resolving one identity for one role.
#[derive(Debug, Clone, PartialEq)]
pub enum Affiliation {
    Resolved(CanonicalPerson),
    Unresolved,
}

impl Affiliation {
    /// Flatten into `<role>_*` rich-item fields.
    ///
    /// Unresolved identities render every string field as [`UNDEFINED`]
    /// and the numeric and boolean fields as `null`.
    pub fn to_fields(&self, role: &str) -> Map<String, Value> {
        let mut out = Map::new();
        let mut put = |suffix: &str, value: Value| {
            out.insert(format!("{}{}", role, suffix), value);
        };
        match self {
            Affiliation::Resolved(p) => {
                put("_id", Value::String(p.id.clone()));
                put("_uuid", Value::String(p.uuid.clone()));
                put("_name", Value::String(p.name.clone()));
                put("_user_name", Value::String(p.username.clone()));
                put("_domain", Value::String(p.domain.clone()));
                put("_gender", Value::String(p.gender.clone()));
                put("_gender_acc", Value::from(p.gender_acc));
                put("_org_name", Value::String(p.org_name.clone()));
                put("_bot", Value::Bool(p.is_bot));
                put(
                    "_multi_org_names",
                    Value::Array(
                        p.multi_org_names
                            .iter()
                            .cloned()
                            .map(Value::String)
                            .collect(),
                    ),
                );
            }
            Affiliation::Unresolved => {
                for suffix in [
                    "_id",
                    "_uuid",
                    "_name",
                    "_user_name",
                    "_domain",
                    "_gender",
                    "_org_name",
                ] {
                    put(suffix, Value::String(UNDEFINED.to_string()));
                }
                put("_gender_acc", Value::Null);
                put("_bot", Value::Null);
                put(
                    "_multi_org_names",
                    Value::Array(vec![Value::String(UNDEFINED.to_string())]),
                );
            }
        }
        out
    }
}

/// Domain part of an email address, empty when there is none.
pub fn email_domain(email: &str) -> String {
    match email.split_once('@') {
        Some((_, domain)) => domain.to_string(),
        None => String::new(),
    }
}
