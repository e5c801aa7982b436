//! Core domain model for remote work item reconciliation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rwi-core";

/// Identifies which remote tracker flavour produced a payload.
///
/// Stored trimmed and lowercased. Any name is accepted here; a provider is
/// usable once a field-mapping schema is registered for it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProviderType(String);

impl ProviderType {
    pub const GITHUB: &'static str = "github";
    pub const JIRA: &'static str = "jira";

    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn github() -> Self {
        Self::new(Self::GITHUB)
    }

    pub fn jira() -> Self {
        Self::new(Self::JIRA)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderType {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<ProviderType> for String {
    fn from(value: ProviderType) -> Self {
        value.0
    }
}

/// Provider-agnostic attribute names every provider maps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CanonicalField {
    #[serde(rename = "system.title", alias = "title")]
    Title,
    #[serde(rename = "system.description", alias = "description")]
    Description,
    #[serde(rename = "system.state", alias = "state")]
    State,
    #[serde(rename = "system.creator", alias = "creator")]
    Creator,
    #[serde(rename = "system.assignee", alias = "assignee")]
    Assignee,
    #[serde(rename = "system.remote_item_url", alias = "remote_item_url")]
    RemoteItemUrl,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 6] = [
        CanonicalField::Title,
        CanonicalField::Description,
        CanonicalField::State,
        CanonicalField::Creator,
        CanonicalField::Assignee,
        CanonicalField::RemoteItemUrl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalField::Title => "system.title",
            CanonicalField::Description => "system.description",
            CanonicalField::State => "system.state",
            CanonicalField::Creator => "system.creator",
            CanonicalField::Assignee => "system.assignee",
            CanonicalField::RemoteItemUrl => "system.remote_item_url",
        }
    }
}

impl fmt::Display for CanonicalField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar leaf value taken from a flattened payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl ScalarValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(v) => write!(f, "{v}"),
            ScalarValue::Integer(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::String(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::String(value)
    }
}

/// Canonical attribute mapping produced by the normalizer.
pub type FieldMap = BTreeMap<CanonicalField, ScalarValue>;

/// One externally fetched issue payload plus its provider-scoped identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub identifier: String,
    pub payload: Vec<u8>,
    pub provider_type: ProviderType,
}

impl RemoteRecord {
    pub fn new(
        identifier: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        provider_type: ProviderType,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            payload: payload.into(),
            provider_type,
        }
    }
}

/// Association between a work item and the remote record it mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteLink {
    pub tracker_query_id: String,
    pub remote_item_id: String,
    pub provider_type: ProviderType,
}

impl RemoteLink {
    pub fn external_key(&self) -> ExternalKey {
        ExternalKey {
            tracker_query_id: self.tracker_query_id.clone(),
            remote_item_id: self.remote_item_id.clone(),
        }
    }
}

/// Uniqueness key of a reconciled work item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExternalKey {
    pub tracker_query_id: String,
    pub remote_item_id: String,
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tracker_query_id, self.remote_item_id)
    }
}

/// Canonical persisted work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    pub fields: FieldMap,
    pub remote: RemoteLink,
    pub version: i64,
    pub payload_sha256: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub fn field(&self, field: CanonicalField) -> Option<&ScalarValue> {
        self.fields.get(&field)
    }

    pub fn field_str(&self, field: CanonicalField) -> Option<&str> {
        self.field(field).and_then(ScalarValue::as_str)
    }

    /// Overwrite every field present in `mapped`; fields it lacks keep their value.
    pub fn merge_fields(&mut self, mapped: FieldMap) {
        for (field, value) in mapped {
            self.fields.insert(field, value);
        }
    }
}

/// Remote tracker endpoint (e.g. `https://api.github.com/`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub id: String,
    pub url: String,
    pub provider_type: ProviderType,
}

/// Query scheduled against a tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerQuery {
    pub id: String,
    pub query: String,
    pub schedule: String,
    pub tracker_id: String,
}

#[derive(Debug, Error)]
pub enum WorkItemError {
    #[error("{entity} with id '{id}' not found")]
    NotFound { entity: &'static str, id: String },
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("bad parameter '{parameter}': {reason}")]
    BadParameter {
        parameter: &'static str,
        reason: String,
    },
    #[error("no field mapping schema registered for provider '{0}'")]
    UnknownProvider(ProviderType),
    #[error("internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl WorkItemError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        WorkItemError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn internal(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        WorkItemError::Internal(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, WorkItemError::NotFound { .. })
    }
}

pub type Result<T, E = WorkItemError> = std::result::Result<T, E>;

/// Parse a numeric storage id exposed as a string.
///
/// Callers only ever see string ids, so an id that is not a number cannot
/// exist and is reported as not found.
pub fn parse_numeric_id(entity: &'static str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .and_then(|id| i64::try_from(id).ok())
        .ok_or_else(|| WorkItemError::not_found(entity, raw))
}
