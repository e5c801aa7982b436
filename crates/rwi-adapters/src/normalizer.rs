//! Payload parsing, flattening and canonical field mapping.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::map::Entry;
use indexmap::IndexMap;
use rwi_core::{FieldMap, ProviderType, ScalarValue};
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::trace;

use crate::{AdapterError, SchemaRegistry};

pub const KEY_SEPARATOR: char = '.';

/// Single-level view of a payload: dotted key to scalar leaf, in document order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct FlattenedAttributes(IndexMap<String, ScalarValue>);

impl FlattenedAttributes {
    pub fn get(&self, key: &str) -> Option<&ScalarValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ScalarValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Keep the first value seen for a key; later duplicates are dropped.
    fn insert_first(&mut self, key: String, value: ScalarValue) {
        match self.0.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(slot) => {
                trace!(key = slot.key().as_str(), "duplicate flattened key ignored");
            }
        }
    }
}

/// Parse raw bytes into a JSON object tree.
pub fn parse_payload(payload: &[u8]) -> Result<JsonMap<String, JsonValue>, AdapterError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| AdapterError::MalformedPayload(format!("payload is not valid UTF-8: {e}")))?;
    let value: JsonValue = serde_json::from_str(text)
        .map_err(|e| AdapterError::MalformedPayload(format!("payload is not valid JSON: {e}")))?;
    match value {
        JsonValue::Object(map) => Ok(map),
        other => Err(AdapterError::MalformedPayload(format!(
            "expected a JSON object at the payload root, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

fn scalar_of(value: &JsonValue) -> Option<ScalarValue> {
    match value {
        JsonValue::Bool(b) => Some(ScalarValue::Bool(*b)),
        JsonValue::Number(n) => n
            .as_i64()
            .map(ScalarValue::Integer)
            .or_else(|| n.as_f64().map(ScalarValue::Float)),
        JsonValue::String(s) => Some(ScalarValue::String(s.clone())),
        _ => None,
    }
}

fn join_key(prefix: &str, segment: &str) -> String {
    format!("{prefix}{KEY_SEPARATOR}{segment}")
}

fn flatten_value(
    prefix: &str,
    value: &JsonValue,
    indexed_arrays: &BTreeSet<String>,
    out: &mut FlattenedAttributes,
) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                flatten_value(&join_key(prefix, key), child, indexed_arrays, out);
            }
        }
        JsonValue::Array(items) => {
            if !indexed_arrays.contains(prefix) {
                trace!(key = prefix, "array skipped during flattening");
                return;
            }
            for (idx, child) in items.iter().enumerate() {
                flatten_value(&join_key(prefix, &idx.to_string()), child, indexed_arrays, out);
            }
        }
        JsonValue::Null => {}
        leaf => {
            if let Some(scalar) = scalar_of(leaf) {
                out.insert_first(prefix.to_string(), scalar);
            }
        }
    }
}

/// Flatten nested objects into dotted keys, keeping scalar leaves only.
///
/// Top-level keys are used verbatim, even when empty; nested keys always
/// join with [`KEY_SEPARATOR`]. `null` leaves count as absent. Arrays are
/// dropped unless their key is listed in `indexed_arrays`.
pub fn flatten(
    root: &JsonMap<String, JsonValue>,
    indexed_arrays: &BTreeSet<String>,
) -> FlattenedAttributes {
    let mut out = FlattenedAttributes::default();
    for (key, value) in root {
        flatten_value(key, value, indexed_arrays, &mut out);
    }
    out
}

/// Turns provider payloads into canonical field mappings.
#[derive(Debug, Clone)]
pub struct Normalizer {
    registry: Arc<SchemaRegistry>,
}

impl Normalizer {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn normalize(
        &self,
        provider_type: &ProviderType,
        payload: &[u8],
    ) -> Result<FlattenedAttributes, AdapterError> {
        let schema = self.registry.schema(provider_type)?;
        let root = parse_payload(payload)?;
        Ok(flatten(&root, &schema.indexed_arrays))
    }

    /// Apply the provider schema: first present candidate key wins, unmapped
    /// fields are left out.
    pub fn map(
        &self,
        attributes: &FlattenedAttributes,
        provider_type: &ProviderType,
    ) -> Result<FieldMap, AdapterError> {
        let schema = self.registry.schema(provider_type)?;
        let mut fields = FieldMap::new();
        for (field, candidates) in &schema.fields {
            if let Some(value) = candidates.iter().find_map(|key| attributes.get(key)) {
                fields.insert(*field, value.clone());
            }
        }
        Ok(fields)
    }

    pub fn normalize_and_map(
        &self,
        provider_type: &ProviderType,
        payload: &[u8],
    ) -> Result<FieldMap, AdapterError> {
        let attributes = self.normalize(provider_type, payload)?;
        self.map(&attributes, provider_type)
    }
}
