//! Per-provider field-mapping schemas.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use rwi_core::{CanonicalField, ProviderType};
use serde::{Deserialize, Serialize};

use crate::AdapterError;

/// Maps each canonical field to candidate flattened keys, tried in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMappingSchema {
    pub provider_type: ProviderType,
    /// Array keys whose elements are flattened with their index as a path
    /// segment (`assignees.0.login`). Every other array is skipped.
    #[serde(default)]
    pub indexed_arrays: BTreeSet<String>,
    pub fields: BTreeMap<CanonicalField, Vec<String>>,
}

impl FieldMappingSchema {
    pub fn new(provider_type: ProviderType) -> Self {
        Self {
            provider_type,
            indexed_arrays: BTreeSet::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn map_field<I, S>(mut self, field: CanonicalField, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields
            .insert(field, candidates.into_iter().map(Into::into).collect());
        self
    }

    pub fn index_array(mut self, key: impl Into<String>) -> Self {
        self.indexed_arrays.insert(key.into());
        self
    }

    pub fn candidates(&self, field: CanonicalField) -> &[String] {
        self.fields.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn github() -> Self {
        Self::new(ProviderType::github())
            .index_array("assignees")
            .map_field(CanonicalField::Title, ["title"])
            .map_field(CanonicalField::Description, ["body"])
            .map_field(CanonicalField::State, ["state"])
            .map_field(CanonicalField::Creator, ["user.login", "author.login"])
            .map_field(CanonicalField::Assignee, ["assignee.login", "assignees.0.login"])
            .map_field(CanonicalField::RemoteItemUrl, ["html_url", "url"])
    }

    pub fn jira() -> Self {
        Self::new(ProviderType::jira())
            .map_field(CanonicalField::Title, ["fields.summary"])
            .map_field(CanonicalField::Description, ["fields.description"])
            .map_field(CanonicalField::State, ["fields.status.name"])
            .map_field(
                CanonicalField::Creator,
                ["fields.creator.key", "fields.reporter.key"],
            )
            .map_field(CanonicalField::Assignee, ["fields.assignee.key"])
            .map_field(CanonicalField::RemoteItemUrl, ["self"])
    }
}

#[derive(Debug, Deserialize)]
struct SchemaFile {
    #[serde(default)]
    providers: Vec<FieldMappingSchema>,
}

/// Immutable set of provider schemas, assembled once at start-up and shared
/// behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<ProviderType, FieldMappingSchema>,
}

impl SchemaRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::empty()
            .with_schema(FieldMappingSchema::github())
            .with_schema(FieldMappingSchema::jira())
    }

    /// Register a schema, replacing any previous one for the same provider.
    pub fn with_schema(mut self, schema: FieldMappingSchema) -> Self {
        self.schemas.insert(schema.provider_type.clone(), schema);
        self
    }

    pub fn with_yaml_str(mut self, yaml: &str) -> Result<Self, AdapterError> {
        let file: SchemaFile = serde_yaml::from_str(yaml)
            .map_err(|e| AdapterError::Schema(format!("invalid schema file: {e}")))?;
        for mut schema in file.providers {
            schema.provider_type = ProviderType::new(schema.provider_type.as_str());
            if schema.provider_type.as_str().is_empty() {
                return Err(AdapterError::Schema(
                    "schema entry has an empty provider_type".to_string(),
                ));
            }
            self = self.with_schema(schema);
        }
        Ok(self)
    }

    pub fn with_yaml_file(self, path: impl AsRef<Path>) -> Result<Self, AdapterError> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        self.with_yaml_str(&yaml)
    }

    pub fn schema(&self, provider_type: &ProviderType) -> Result<&FieldMappingSchema, AdapterError> {
        self.schemas
            .get(provider_type)
            .ok_or_else(|| AdapterError::UnknownProvider(provider_type.clone()))
    }

    pub fn resolve(
        &self,
        provider_type: &ProviderType,
        field: CanonicalField,
    ) -> Result<&[String], AdapterError> {
        Ok(self.schema(provider_type)?.candidates(field))
    }

    pub fn contains(&self, provider_type: &ProviderType) -> bool {
        self.schemas.contains_key(provider_type)
    }

    pub fn providers(&self) -> impl Iterator<Item = &ProviderType> {
        self.schemas.keys()
    }
}
