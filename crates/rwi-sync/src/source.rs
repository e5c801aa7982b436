use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rwi_adapters::{bundle_paths_in, load_record_bundle};
use rwi_core::{RemoteRecord, Tracker, TrackerQuery};
use tracing::debug;

/// Where scheduled imports get their remote records from.
#[async_trait]
pub trait RemoteItemSource: Send + Sync {
    async fn fetch(&self, tracker: &Tracker, query: &TrackerQuery) -> Result<Vec<RemoteRecord>>;
}

/// Serves records from captured bundle files in a directory.
#[derive(Debug, Clone)]
pub struct BundleDirectorySource {
    dir: PathBuf,
}

impl BundleDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn collect(&self, tracker: &Tracker, query: &TrackerQuery) -> Result<Vec<RemoteRecord>> {
        let mut records = Vec::new();
        for path in bundle_paths_in(&self.dir)? {
            let bundle = load_record_bundle(&path)?;
            if !bundle.serves(&tracker.provider_type, &query.query) {
                continue;
            }
            debug!(bundle = bundle.bundle_id.as_str(), records = bundle.records.len(), "using bundle");
            records.extend(bundle.remote_records()?);
        }
        Ok(records)
    }
}

#[async_trait]
impl RemoteItemSource for BundleDirectorySource {
    async fn fetch(&self, tracker: &Tracker, query: &TrackerQuery) -> Result<Vec<RemoteRecord>> {
        let source = self.clone();
        let tracker = tracker.clone();
        let query = query.clone();
        tokio::task::spawn_blocking(move || source.collect(&tracker, &query))
            .await
            .context("bundle loading task")?
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use rwi_core::ProviderType;

    use super::*;

    fn bundle(provider: &str, query: Option<&str>, identifier: &str) -> String {
        serde_json::json!({
            "bundle_id": identifier,
            "provider_type": provider,
            "query": query,
            "fetched_at": "2026-02-24T12:00:00Z",
            "records": [{"identifier": identifier, "payload": {"title": identifier}}]
        })
        .to_string()
    }

    fn tracker(provider: ProviderType) -> Tracker {
        Tracker {
            id: "1".into(),
            url: "https://api.github.com/".into(),
            provider_type: provider,
        }
    }

    fn query(text: &str) -> TrackerQuery {
        TrackerQuery {
            id: "1".into(),
            query: text.into(),
            schedule: "0 0 * * * *".into(),
            tracker_id: "1".into(),
        }
    }

    #[tokio::test]
    async fn bundles_are_filtered_by_provider_and_query() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("a.json"), bundle("github", None, "any-query")).unwrap();
        fs::write(dir.path().join("b.json"), bundle("github", Some("is:open"), "open-only")).unwrap();
        fs::write(dir.path().join("c.json"), bundle("jira", None, "jira")).unwrap();

        let source = BundleDirectorySource::new(dir.path());
        let records = source
            .fetch(&tracker(ProviderType::github()), &query("is:closed"))
            .await
            .unwrap();
        let ids = records.iter().map(|r| r.identifier.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["any-query"]);

        let records = source
            .fetch(&tracker(ProviderType::github()), &query("is:open"))
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn unreadable_bundles_are_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("broken.json"), "{").unwrap();

        let source = BundleDirectorySource::new(dir.path());
        assert!(source
            .fetch(&tracker(ProviderType::github()), &query("is:open"))
            .await
            .is_err());
    }
}
