//! Integration tests for the extended query tag store.

use dicom_db::test_fixtures::TestDatabase;
use dicom_db::{
    Error, ExtendedQueryTagStatus, ExtendedQueryTagStore, NewTagDefinition, QueryStatus,
    QueryTagLevel, ReindexStateStore, SchemaVersion, ValueRepresentation,
};

fn new_tag(path: &str, vr: ValueRepresentation) -> NewTagDefinition {
    NewTagDefinition {
        path: path.to_string(),
        vr,
        private_creator: None,
        level: QueryTagLevel::Instance,
    }
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_add_tags_returns_adding_tags_with_versions() {
    let test_db = TestDatabase::new().await.expect("test database");

    let added = test_db
        .db
        .tags
        .add_tags(
            vec![
                new_tag("00101010", ValueRepresentation::AS),
                new_tag("00100040", ValueRepresentation::CS),
            ],
            128,
        )
        .await
        .expect("add tags");

    assert_eq!(added.len(), 2);
    assert!(added
        .iter()
        .all(|t| t.status == ExtendedQueryTagStatus::Adding));
    assert!(added.iter().all(|t| t.version.is_some()));
    assert_eq!(added[0].query_status, QueryStatus::Enabled);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_add_existing_path_is_rejected_and_adds_nothing() {
    let test_db = TestDatabase::new().await.expect("test database");
    let tags = &test_db.db.tags;

    tags.add_tags(vec![new_tag("00101010", ValueRepresentation::AS)], 128)
        .await
        .expect("first add");

    let err = tags
        .add_tags(
            vec![
                new_tag("00100040", ValueRepresentation::CS),
                new_tag("00101010", ValueRepresentation::AS),
            ],
            128,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(ref p) if p == "00101010"));

    let listed = tags.list_tags(100, 0).await.expect("list");
    assert_eq!(listed.len(), 1, "rejected batch must not leave partial rows");

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_add_beyond_limit_is_rejected() {
    let test_db = TestDatabase::new().await.expect("test database");
    let tags = &test_db.db.tags;

    tags.add_tags(vec![new_tag("00101010", ValueRepresentation::AS)], 2)
        .await
        .expect("first add");

    let err = tags
        .add_tags(
            vec![
                new_tag("00100040", ValueRepresentation::CS),
                new_tag("00100020", ValueRepresentation::LO),
            ],
            2,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { max: 2 }));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_update_query_status_bumps_version() {
    let test_db = TestDatabase::new().await.expect("test database");
    let tags = &test_db.db.tags;

    let added = tags
        .add_tags(vec![new_tag("00101010", ValueRepresentation::AS)], 128)
        .await
        .expect("add");
    let before = added[0].version.expect("version");

    let entry = tags
        .update_query_status("00101010", QueryStatus::Disabled)
        .await
        .expect("update");
    assert_eq!(entry.definition.query_status, QueryStatus::Disabled);
    assert!(entry.definition.version.expect("version") > before);

    let err = tags
        .update_query_status("00990099", QueryStatus::Enabled)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExtendedQueryTagNotFound(_)));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_delete_tag_bound_to_running_operation_is_busy() {
    let test_db = TestDatabase::new().await.expect("test database");
    test_db.seed_instances(3).await.expect("seed");
    let tags = &test_db.db.tags;

    let added = tags
        .add_tags(vec![new_tag("00101010", ValueRepresentation::AS)], 128)
        .await
        .expect("add");
    test_db
        .db
        .reindex
        .prepare(&[added[0].key], "op-busy")
        .await
        .expect("prepare");

    let err = tags
        .delete_tag("00101010", ValueRepresentation::AS)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Busy(_)));

    test_db
        .db
        .reindex
        .pause_tag("op-busy", added[0].key)
        .await
        .expect("pause");
    tags.delete_tag("00101010", ValueRepresentation::AS)
        .await
        .expect("delete after pause");

    let err = tags.get_tag("00101010").await.unwrap_err();
    assert!(matches!(err, Error::ExtendedQueryTagNotFound(_)));

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_delete_with_wrong_vr_is_not_found() {
    let test_db = TestDatabase::new().await.expect("test database");
    let tags = &test_db.db.tags;

    tags.add_tags(vec![new_tag("00101010", ValueRepresentation::AS)], 128)
        .await
        .expect("add");

    let err = tags
        .delete_tag("00101010", ValueRepresentation::CS)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ExtendedQueryTagNotFound(_)));
    assert!(tags.get_tag("00101010").await.is_ok());

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_legacy_schema_adds_ready_tags_without_keys() {
    let test_db = TestDatabase::with_version(SchemaVersion::V2)
        .await
        .expect("test database");
    let tags = &test_db.db.tags;

    let added = tags
        .add_tags(vec![new_tag("00101010", ValueRepresentation::AS)], 128)
        .await
        .expect("add");
    assert!(added.is_empty());

    let entry = tags.get_tag("00101010").await.expect("get");
    assert_eq!(entry.definition.status, ExtendedQueryTagStatus::Ready);
    assert_eq!(entry.definition.version, None);
    assert_eq!(entry.error_count, 0);

    test_db.cleanup().await;
}
