//! Provider adapters: field-mapping schemas, payload normalization and
//! fixture record bundles.

use rwi_core::{ProviderType, WorkItemError};
use thiserror::Error;

mod bundle;
mod normalizer;
mod schema;

pub use bundle::{bundle_paths_in, load_record_bundle, BundleRecord, RecordBundle};
pub use normalizer::{flatten, parse_payload, FlattenedAttributes, Normalizer, KEY_SEPARATOR};
pub use schema::{FieldMappingSchema, SchemaRegistry};

pub const CRATE_NAME: &str = "rwi-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("no field mapping schema registered for provider '{0}'")]
    UnknownProvider(ProviderType),
    #[error("{0}")]
    Schema(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<AdapterError> for WorkItemError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::MalformedPayload(reason) => WorkItemError::MalformedPayload(reason),
            AdapterError::UnknownProvider(provider) => WorkItemError::UnknownProvider(provider),
            other => WorkItemError::internal(other),
        }
    }
}
