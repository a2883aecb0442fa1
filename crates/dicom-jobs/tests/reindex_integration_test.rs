//! End-to-end reindexing against PostgreSQL and on-disk metadata.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use dicom_db::test_fixtures::TestDatabase;
use dicom_jobs::{
    AddExtendedQueryTagEntry, ExtendedQueryTagStatus, ExtendedQueryTagService,
    FilesystemMetadataStore, InstanceMetadata, OperationRuntimeStatus, ReindexConfig,
    ReindexStores, VersionedInstanceIdentifier, WorkerBuilder, WorkerEvent,
};

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_ten_instances_reindex_to_ready() {
    let test_db = TestDatabase::new().await.expect("test database");
    let ids = test_db.seed_instances(10).await.expect("seed");

    let dir = TempDir::new().expect("temp dir");
    let metadata = FilesystemMetadataStore::new(dir.path());
    for (i, id) in ids.iter().enumerate() {
        let watermark = i as i64 + 1;
        let mut attributes = InstanceMetadata::default();
        let age = if watermark == 5 {
            "5 yrs".to_string()
        } else {
            format!("{:03}Y", watermark)
        };
        attributes.insert("00101010", "AS", vec![json!(age)]);
        let instance = VersionedInstanceIdentifier::new(id.clone(), watermark);
        metadata
            .put_instance_metadata(&instance, &attributes)
            .await
            .expect("write metadata");
    }

    let stores = ReindexStores::from_database(&test_db.db, Arc::new(metadata));
    let handle = WorkerBuilder::new(stores)
        .with_reindex_config(ReindexConfig::default().with_batch_size(4))
        .build()
        .start();
    let mut events = handle.events();
    let service = ExtendedQueryTagService::new(
        Arc::new(test_db.db.tags.clone()),
        Arc::new(test_db.db.tag_errors.clone()),
        Arc::new(test_db.db.reindex.clone()),
        test_db.db.capabilities(),
    )
    .with_client(handle.client());

    let response = service
        .add_extended_query_tags(vec![AddExtendedQueryTagEntry {
            path: "00101010".to_string(),
            vr: "AS".to_string(),
            private_creator: None,
            level: "Instance".to_string(),
        }])
        .await
        .expect("add tags");
    let operation_id = response.operation_id.expect("operation id");

    let mut checkpoints = 0;
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::BatchCheckpointed { .. }) => checkpoints += 1,
                Ok(WorkerEvent::OperationCompleted { .. }) => return,
                Ok(WorkerEvent::OperationFailed { error, .. }) => panic!("failed: {}", error),
                _ => {}
            }
        }
    })
    .await
    .expect("operation completes");
    assert_eq!(checkpoints, 3);

    let tag = service.get_extended_query_tag("00101010").await.expect("tag");
    assert_eq!(tag.definition.status, ExtendedQueryTagStatus::Ready);
    assert_eq!(tag.error_count, 1);

    let status = service
        .get_operation_status(&operation_id)
        .await
        .expect("status");
    assert_eq!(status.status, OperationRuntimeStatus::Completed);
    assert_eq!(status.percent_complete, 100);

    let indexed: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM extended_query_tag_string WHERE tag_key = $1")
            .bind(tag.definition.key)
            .fetch_one(&test_db.pool)
            .await
            .expect("count");
    assert_eq!(indexed.0, 9);

    service
        .delete_extended_query_tag("00101010")
        .await
        .expect("delete after completion");

    handle.shutdown().await.expect("shutdown");
    test_db.cleanup().await;
}
