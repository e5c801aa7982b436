//! Fixture-first record bundles: captured remote payloads stored on disk.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rwi_core::{ProviderType, RemoteRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordBundle {
    pub bundle_id: String,
    pub provider_type: ProviderType,
    pub captured_from_url: Option<String>,
    /// Tracker query text the bundle was captured for. Bundles without one
    /// serve every query of their provider.
    #[serde(default)]
    pub query: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<BundleRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRecord {
    pub identifier: String,
    pub payload: JsonValue,
}

impl RecordBundle {
    pub fn serves(&self, provider_type: &ProviderType, query: &str) -> bool {
        &self.provider_type == provider_type
            && self.query.as_deref().map_or(true, |q| q.trim() == query.trim())
    }

    pub fn remote_records(&self) -> Result<Vec<RemoteRecord>> {
        self.records
            .iter()
            .map(|record| {
                let payload = serde_json::to_vec(&record.payload)
                    .with_context(|| format!("encoding payload of {}", record.identifier))?;
                Ok(RemoteRecord::new(
                    record.identifier.clone(),
                    payload,
                    self.provider_type.clone(),
                ))
            })
            .collect()
    }
}

pub fn load_record_bundle(path: impl AsRef<Path>) -> Result<RecordBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Bundle files (`*.json`) in `dir`, sorted by name. A missing directory
/// yields no bundles.
pub fn bundle_paths_in(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect::<Vec<_>>();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const BUNDLE: &str = r#"{
        "bundle_id": "github-sample",
        "provider_type": "GitHub",
        "captured_from_url": "https://api.github.com/repos/sbose/api/issues",
        "fetched_at": "2026-02-24T12:00:00Z",
        "records": [
            {"identifier": "http://github.com/sbose/api/testonly/1", "payload": {"title": "linking"}}
        ]
    }"#;

    #[test]
    fn bundles_load_into_remote_records() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("github.json");
        fs::write(&path, BUNDLE).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let paths = bundle_paths_in(dir.path()).unwrap();
        assert_eq!(paths, vec![path.clone()]);

        let bundle = load_record_bundle(&path).unwrap();
        let records = bundle.remote_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].provider_type, ProviderType::github());
        assert_eq!(records[0].payload, br#"{"title":"linking"}"#.to_vec());
        assert!(bundle.serves(&ProviderType::github(), "is:open"));
        assert!(!bundle.serves(&ProviderType::jira(), "is:open"));
    }

    #[test]
    fn missing_bundle_directories_are_empty() {
        let dir = tempdir().expect("tempdir");
        assert!(bundle_paths_in(dir.path().join("absent")).unwrap().is_empty());
    }
}
