//! Tracker writes that must agree with the registered provider schemas.

use rwi_adapters::SchemaRegistry;
use rwi_core::{ProviderType, Result, Tracker, WorkItemError};
use rwi_storage::TrackerStore;

fn require_known_provider(registry: &SchemaRegistry, provider_type: &ProviderType) -> Result<()> {
    if registry.contains(provider_type) {
        return Ok(());
    }
    Err(WorkItemError::BadParameter {
        parameter: "provider_type",
        reason: format!("no field mapping schema registered for '{provider_type}'"),
    })
}

pub async fn create_tracker<S>(
    store: &mut S,
    registry: &SchemaRegistry,
    url: &str,
    provider_type: &ProviderType,
) -> Result<Tracker>
where
    S: TrackerStore,
{
    require_known_provider(registry, provider_type)?;
    Ok(store.create_tracker(url, provider_type).await?)
}

pub async fn save_tracker<S>(
    store: &mut S,
    registry: &SchemaRegistry,
    tracker: &Tracker,
) -> Result<Tracker>
where
    S: TrackerStore,
{
    require_known_provider(registry, &tracker.provider_type)?;
    Ok(store.save_tracker(tracker).await?)
}

#[cfg(test)]
mod tests {
    use rwi_storage::{InMemoryBackend, StorageBackend};

    use super::*;

    #[tokio::test]
    async fn trackers_need_a_registered_provider() {
        let backend = InMemoryBackend::new();
        let registry = SchemaRegistry::builtin();
        let mut tx = backend.begin().await.unwrap();

        let err = create_tracker(&mut tx, &registry, "https://gitlab.com/", &ProviderType::new("gitlab"))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkItemError::BadParameter { parameter: "provider_type", .. }));

        let mut tracker = create_tracker(&mut tx, &registry, "https://api.github.com/", &ProviderType::github())
            .await
            .unwrap();
        tracker.provider_type = ProviderType::new("gitlab");
        assert!(save_tracker(&mut tx, &registry, &tracker).await.is_err());

        tracker.provider_type = ProviderType::jira();
        let saved = save_tracker(&mut tx, &registry, &tracker).await.unwrap();
        assert_eq!(saved.provider_type, ProviderType::jira());
    }

    #[tokio::test]
    async fn empty_urls_surface_as_bad_parameters() {
        let backend = InMemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        let err = create_tracker(&mut tx, &SchemaRegistry::builtin(), "  ", &ProviderType::github())
            .await
            .unwrap_err();
        assert!(matches!(err, WorkItemError::BadParameter { parameter: "url", .. }));
    }
}
