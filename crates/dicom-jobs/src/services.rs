//! Operator-facing extended query tag services.
//!
//! These are the operations a web layer exposes: register tags (which starts
//! a reindex operation), inspect tags and their errors, toggle queryability,
//! pause or delete a tag, and poll an operation's progress.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use dicom_core::{
    defaults, new_operation_id, normalize_path, operation_status, validate_new_tag,
    AddExtendedQueryTagEntry, Error, ExtendedQueryTagErrorStore, ExtendedQueryTagStore,
    NewTagDefinition, OperationStatus, QueryStatus, ReindexStateStore, Result,
    SchemaCapabilities, TagDefinition, TagEntry, TagError,
};

use crate::worker::ReindexClient;

/// Result of registering new tags.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddTagsResponse {
    /// Correlation id to poll; `None` when the schema predates reindexing.
    pub operation_id: Option<String>,
    pub tags: Vec<TagDefinition>,
}

/// Extended query tag operations over the configured stores.
#[derive(Clone)]
pub struct ExtendedQueryTagService {
    tags: Arc<dyn ExtendedQueryTagStore>,
    errors: Arc<dyn ExtendedQueryTagErrorStore>,
    reindex: Arc<dyn ReindexStateStore>,
    capabilities: SchemaCapabilities,
    max_tag_count: usize,
    client: Option<ReindexClient>,
}

impl ExtendedQueryTagService {
    pub fn new(
        tags: Arc<dyn ExtendedQueryTagStore>,
        errors: Arc<dyn ExtendedQueryTagErrorStore>,
        reindex: Arc<dyn ReindexStateStore>,
        capabilities: SchemaCapabilities,
    ) -> Self {
        Self {
            tags,
            errors,
            reindex,
            capabilities,
            max_tag_count: defaults::MAX_EXTENDED_QUERY_TAG_COUNT,
            client: None,
        }
    }

    /// Route new operations to a running reindex worker.
    pub fn with_client(mut self, client: ReindexClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_max_tag_count(mut self, max: usize) -> Self {
        self.max_tag_count = max;
        self
    }

    /// Validate and register tags, then start reindexing them.
    pub async fn add_extended_query_tags(
        &self,
        entries: Vec<AddExtendedQueryTagEntry>,
    ) -> Result<AddTagsResponse> {
        if entries.is_empty() {
            return Err(Error::InvalidInput("no tags to add".to_string()));
        }
        let new_tags = entries
            .iter()
            .map(validate_new_tag)
            .collect::<Result<Vec<NewTagDefinition>>>()?;

        let added = self.tags.add_tags(new_tags, self.max_tag_count).await?;
        if !self.capabilities.reindex_operations {
            return Ok(AddTagsResponse {
                operation_id: None,
                tags: added,
            });
        }

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::Config("no reindex worker is configured".to_string()))?;
        let operation_id = new_operation_id();
        let operation = client
            .start_operation(&operation_id, added.iter().map(|t| t.key).collect())
            .await?;

        info!(
            subsystem = "jobs",
            component = "tag_service",
            op = "add_extended_query_tags",
            operation_id = %operation_id,
            tag_count = added.len(),
            remaining = ?operation.remaining,
            "Registered tags and started reindexing"
        );
        Ok(AddTagsResponse {
            operation_id: Some(operation_id),
            tags: added,
        })
    }

    pub async fn get_extended_query_tag(&self, path: &str) -> Result<TagEntry> {
        self.tags.get_tag(&normalize_path(path)?).await
    }

    pub async fn list_extended_query_tags(
        &self,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<TagEntry>> {
        self.tags
            .list_tags(
                limit.unwrap_or(defaults::PAGE_LIMIT),
                offset.unwrap_or(defaults::PAGE_OFFSET),
            )
            .await
    }

    /// Errors recorded for a tag, oldest first.
    pub async fn get_extended_query_tag_errors(&self, path: &str) -> Result<Vec<TagError>> {
        self.errors.get_errors(&normalize_path(path)?).await
    }

    pub async fn update_extended_query_tag(
        &self,
        path: &str,
        query_status: QueryStatus,
    ) -> Result<TagEntry> {
        self.tags
            .update_query_status(&normalize_path(path)?, query_status)
            .await
    }

    /// Delete a tag with its index rows and errors.
    ///
    /// Fails with `Busy` while the tag is bound to a running operation.
    pub async fn delete_extended_query_tag(&self, path: &str) -> Result<()> {
        let path = normalize_path(path)?;
        let entry = self.tags.get_tag(&path).await?;
        self.tags.delete_tag(&path, entry.definition.vr).await?;
        info!(
            subsystem = "jobs",
            component = "tag_service",
            op = "delete_extended_query_tag",
            tag_path = %path,
            error_count = entry.error_count,
            "Deleted extended query tag"
        );
        Ok(())
    }

    /// Take a tag out of its running operation. The tag stays non-Ready.
    pub async fn pause_extended_query_tag(&self, path: &str) -> Result<TagEntry> {
        let path = normalize_path(path)?;
        let entry = self.tags.get_tag(&path).await?;
        let operation_id = entry.operation_id.as_deref().ok_or_else(|| {
            Error::Conflict(format!("tag {} is not being reindexed", path))
        })?;
        self.reindex
            .pause_tag(operation_id, entry.definition.key)
            .await?;
        info!(
            subsystem = "jobs",
            component = "tag_service",
            op = "pause_extended_query_tag",
            operation_id,
            tag_path = %path,
            "Paused tag reindexing"
        );
        self.tags.get_tag(&path).await
    }

    pub async fn get_operation_status(&self, operation_id: &str) -> Result<OperationStatus> {
        let operation = self.reindex.get_operation(operation_id).await?;
        Ok(operation_status(&operation))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use dicom_core::mock::InMemoryStore;
    use dicom_core::{ExtendedQueryTagStatus, OperationRuntimeStatus, SchemaVersion};
    use serde_json::json;

    use tokio::sync::broadcast;

    use crate::test_support::{config, seed, stores, SEX};
    use crate::worker::{WorkerBuilder, WorkerEvent, WorkerHandle};

    fn entry(path: &str, vr: &str) -> AddExtendedQueryTagEntry {
        AddExtendedQueryTagEntry {
            path: path.to_string(),
            vr: vr.to_string(),
            private_creator: None,
            level: "Instance".to_string(),
        }
    }

    fn service(store: &InMemoryStore, version: SchemaVersion) -> ExtendedQueryTagService {
        ExtendedQueryTagService::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            version.capabilities(),
        )
    }

    fn start_worker(store: &InMemoryStore) -> WorkerHandle {
        WorkerBuilder::new(stores(store))
            .with_reindex_config(config())
            .build()
            .start()
    }

    async fn wait_for_completion(events: &mut broadcast::Receiver<WorkerEvent>) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(WorkerEvent::OperationCompleted { operation_id, .. }) =
                    events.recv().await
                {
                    return operation_id;
                }
            }
        })
        .await
        .expect("operation completes")
    }

    #[tokio::test]
    async fn test_registered_tag_becomes_ready() {
        let store = InMemoryStore::new();
        seed(&store, 10);
        let handle = start_worker(&store);
        let svc = service(&store, SchemaVersion::V5).with_client(handle.client());
        let mut events = handle.events();

        let response = svc
            .add_extended_query_tags(vec![entry("(0010,0040)", "CS")])
            .await
            .unwrap();
        let operation_id = response.operation_id.clone().expect("operation id");
        assert_eq!(response.tags.len(), 1);
        assert_eq!(response.tags[0].path, SEX);
        assert_eq!(response.tags[0].status, ExtendedQueryTagStatus::Adding);

        assert_eq!(wait_for_completion(&mut events).await, operation_id);

        let tag = svc.get_extended_query_tag(SEX).await.unwrap();
        assert_eq!(tag.definition.status, ExtendedQueryTagStatus::Ready);
        assert_eq!(tag.operation_id, None);

        let status = svc.get_operation_status(&operation_id).await.unwrap();
        assert_eq!(status.status, OperationRuntimeStatus::Completed);
        assert_eq!(status.percent_complete, 100);
        assert_eq!(status.resource_ids, None);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_entries_add_nothing() {
        let store = InMemoryStore::new();
        let svc = service(&store, SchemaVersion::V5);

        let err = svc
            .add_extended_query_tags(vec![entry("00100040", "CS"), entry("00091001", "LO")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let err = svc.add_extended_query_tags(vec![]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        assert!(svc.list_extended_query_tags(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_legacy_schema_adds_without_operation() {
        let store = InMemoryStore::new();
        let svc = service(&store, SchemaVersion::V3);

        let response = svc
            .add_extended_query_tags(vec![entry("00100040", "CS")])
            .await
            .unwrap();
        assert_eq!(response.operation_id, None);
    }

    #[tokio::test]
    async fn test_delete_while_reindexing_is_busy() {
        let store = InMemoryStore::new();
        seed(&store, 3);
        let svc = service(&store, SchemaVersion::V3);
        svc.add_extended_query_tags(vec![entry("00100040", "CS")])
            .await
            .unwrap();
        let key = svc.get_extended_query_tag(SEX).await.unwrap().definition.key;
        store.prepare(&[key], "op-1").await.unwrap();

        let err = svc.delete_extended_query_tag(SEX).await.unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[tokio::test]
    async fn test_delete_after_completion_purges_errors() {
        let store = InMemoryStore::new();
        seed(&store, 4);
        let mut bad = dicom_core::InstanceMetadata::default();
        bad.insert(SEX, "CS", vec![json!("female")]);
        store.put_metadata(2, bad);
        let handle = start_worker(&store);
        let svc = service(&store, SchemaVersion::V5).with_client(handle.client());

        let mut events = handle.events();
        svc.add_extended_query_tags(vec![entry("00100040", "CS")])
            .await
            .unwrap();
        wait_for_completion(&mut events).await;

        let errors = svc.get_extended_query_tag_errors(SEX).await.unwrap();
        assert_eq!(errors.len(), 1);

        svc.delete_extended_query_tag(SEX).await.unwrap();
        let err = svc.get_extended_query_tag(SEX).await.unwrap_err();
        assert!(matches!(err, Error::ExtendedQueryTagNotFound(_)));
        assert!(store.get_errors(SEX).await.is_err());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_releases_tag_and_cancels_operation() {
        let store = InMemoryStore::new();
        seed(&store, 3);
        let svc = service(&store, SchemaVersion::V3);
        svc.add_extended_query_tags(vec![entry("00100040", "CS")])
            .await
            .unwrap();
        let key = svc.get_extended_query_tag(SEX).await.unwrap().definition.key;
        store.prepare(&[key], "op-1").await.unwrap();

        let paused = svc.pause_extended_query_tag("00100040").await.unwrap();
        assert_eq!(paused.operation_id, None);
        assert_eq!(paused.definition.status, ExtendedQueryTagStatus::Adding);

        let status = svc.get_operation_status("op-1").await.unwrap();
        assert_eq!(status.status, OperationRuntimeStatus::Cancelled);
        assert_eq!(status.resource_ids, None);

        let err = svc.pause_extended_query_tag(SEX).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        svc.delete_extended_query_tag(SEX).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_query_status() {
        let store = InMemoryStore::new();
        let svc = service(&store, SchemaVersion::V3);
        svc.add_extended_query_tags(vec![entry("00100040", "CS")])
            .await
            .unwrap();

        let updated = svc
            .update_extended_query_tag(SEX, QueryStatus::Disabled)
            .await
            .unwrap();
        assert_eq!(updated.definition.query_status, QueryStatus::Disabled);
    }

    #[tokio::test]
    async fn test_unknown_operation_is_not_found() {
        let store = InMemoryStore::new();
        let svc = service(&store, SchemaVersion::V5);
        let err = svc.get_operation_status("missing").await.unwrap_err();
        assert!(matches!(err, Error::OperationNotFound(_)));
    }
}
