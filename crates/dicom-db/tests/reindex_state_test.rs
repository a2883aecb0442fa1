//! Integration tests for instance batching and reindex checkpoints.

use dicom_db::test_fixtures::TestDatabase;
use dicom_db::{
    Error, ExtendedQueryTagStatus, ExtendedQueryTagStore, IndexStatus, InstanceIdentifier,
    InstanceStore, NewTagDefinition, OperationRuntimeStatus, QueryTagLevel, ReindexStateStore,
    ValueRepresentation, WatermarkRange,
};

async fn add_tag(test_db: &TestDatabase, path: &str) -> i32 {
    test_db
        .db
        .tags
        .add_tags(
            vec![NewTagDefinition {
                path: path.to_string(),
                vr: ValueRepresentation::CS,
                private_creator: None,
                level: QueryTagLevel::Instance,
            }],
            128,
        )
        .await
        .expect("add tag")[0]
        .key
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_batches_are_newest_first() {
    let test_db = TestDatabase::new().await.expect("test database");
    test_db.seed_instances(10).await.expect("seed");

    let batches = test_db
        .db
        .instances
        .get_instance_batches(4, 5, IndexStatus::Created, Some(10))
        .await
        .expect("batches");
    assert_eq!(
        batches,
        vec![
            WatermarkRange { start: 7, end: 10 },
            WatermarkRange { start: 3, end: 6 },
            WatermarkRange { start: 1, end: 2 },
        ]
    );

    let limited = test_db
        .db
        .instances
        .get_instance_batches(4, 1, IndexStatus::Created, Some(6))
        .await
        .expect("batches");
    assert_eq!(limited, vec![WatermarkRange { start: 3, end: 6 }]);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_batches_skip_instances_still_being_created() {
    let test_db = TestDatabase::new().await.expect("test database");
    test_db.seed_instances(3).await.expect("seed");
    test_db
        .insert_instance(
            &InstanceIdentifier::new("1.2", "1.2.3", "1.2.3.4"),
            4,
            IndexStatus::Creating,
        )
        .await
        .expect("insert");

    let batches = test_db
        .db
        .instances
        .get_instance_batches(10, 1, IndexStatus::Created, None)
        .await
        .expect("batches");
    assert_eq!(batches, vec![WatermarkRange { start: 1, end: 3 }]);

    let ids = test_db
        .db
        .instances
        .get_instance_identifiers_by_watermark_range(
            WatermarkRange { start: 1, end: 4 },
            IndexStatus::Created,
        )
        .await
        .expect("ids");
    let watermarks: Vec<i64> = ids.iter().map(|i| i.watermark).collect();
    assert_eq!(watermarks, vec![3, 2, 1]);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_prepare_captures_max_and_rejects_second_binding() {
    let test_db = TestDatabase::new().await.expect("test database");
    test_db.seed_instances(10).await.expect("seed");
    let key = add_tag(&test_db, "00100040").await;
    let reindex = &test_db.db.reindex;

    let op = reindex.prepare(&[key], "op-a").await.expect("prepare");
    assert_eq!(op.status, OperationRuntimeStatus::Running);
    assert_eq!(op.target, Some(WatermarkRange { start: 1, end: 10 }));
    assert_eq!(op.remaining, op.target);

    let resumed = reindex.prepare(&[key], "op-a").await.expect("resume");
    assert_eq!(resumed.remaining, op.remaining);

    let err = reindex.prepare(&[key], "op-b").await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    assert_eq!(
        reindex.list_active_operations().await.expect("active"),
        vec!["op-a".to_string()]
    );

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_resume_with_extra_tag_is_conflict() {
    let test_db = TestDatabase::new().await.expect("test database");
    test_db.seed_instances(4).await.expect("seed");
    let sex = add_tag(&test_db, "00100040").await;
    let modality = add_tag(&test_db, "00080060").await;
    let reindex = &test_db.db.reindex;

    reindex.prepare(&[sex], "op-a").await.expect("prepare");
    let err = reindex.prepare(&[sex, modality], "op-a").await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let resumed = reindex.prepare(&[sex], "op-a").await.expect("resume");
    assert_eq!(resumed.tags.len(), 1);
    let fresh = reindex.prepare(&[modality], "op-b").await.expect("other op");
    assert_eq!(fresh.tags[0].key, modality);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_progress_is_monotonic_and_complete_marks_ready() {
    let test_db = TestDatabase::new().await.expect("test database");
    test_db.seed_instances(10).await.expect("seed");
    let key = add_tag(&test_db, "00100040").await;
    let reindex = &test_db.db.reindex;
    reindex.prepare(&[key], "op-a").await.expect("prepare");

    let op = reindex.update_progress("op-a", 6).await.expect("progress");
    assert_eq!(op.remaining, Some(WatermarkRange { start: 1, end: 6 }));
    assert_eq!(op.completed(), Some(WatermarkRange { start: 7, end: 10 }));

    let err = reindex.update_progress("op-a", 8).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let err = reindex.complete("op-a").await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let op = reindex.update_progress("op-a", 0).await.expect("progress");
    assert!(op.is_fully_covered());

    let ready = reindex.complete("op-a").await.expect("complete");
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].status, ExtendedQueryTagStatus::Ready);

    let op = reindex.get_operation("op-a").await.expect("operation");
    assert_eq!(op.status, OperationRuntimeStatus::Completed);
    assert!(reindex.list_active_operations().await.expect("active").is_empty());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_pausing_every_tag_cancels_operation() {
    let test_db = TestDatabase::new().await.expect("test database");
    test_db.seed_instances(2).await.expect("seed");
    let key = add_tag(&test_db, "00100040").await;
    let reindex = &test_db.db.reindex;
    reindex.prepare(&[key], "op-a").await.expect("prepare");

    reindex.pause_tag("op-a", key).await.expect("pause");
    let op = reindex.get_operation("op-a").await.expect("operation");
    assert_eq!(op.status, OperationRuntimeStatus::Cancelled);
    assert!(op.tags.is_empty());

    let err = reindex.pause_tag("op-a", key).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let tag = test_db.db.tags.get_tag("00100040").await.expect("tag");
    assert_eq!(tag.definition.status, ExtendedQueryTagStatus::Adding);
    assert_eq!(tag.operation_id, None);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_prepare_without_instances_is_immediately_covered() {
    let test_db = TestDatabase::new().await.expect("test database");
    let key = add_tag(&test_db, "00100040").await;

    let op = test_db
        .db
        .reindex
        .prepare(&[key], "op-empty")
        .await
        .expect("prepare");
    assert_eq!(op.target, None);
    assert!(op.is_fully_covered());

    test_db.cleanup().await;
}
