//! Integration tests for index table upserts.

use dicom_db::test_fixtures::TestDatabase;
use dicom_db::{
    ExtendedQueryTagStore, IndexDataStore, IndexRow, IndexValue, InstanceIdentifier,
    NewTagDefinition, QueryTagLevel, ValueRepresentation, VersionedInstanceIdentifier,
};

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_older_instance_does_not_overwrite_study_value() {
    let test_db = TestDatabase::new().await.expect("test database");
    let store = &test_db.db.index_data;
    let tag_key = test_db
        .db
        .tags
        .add_tags(
            vec![NewTagDefinition {
                path: "00100040".to_string(),
                vr: ValueRepresentation::CS,
                private_creator: None,
                level: QueryTagLevel::Study,
            }],
            128,
        )
        .await
        .expect("add tag")[0]
        .key;

    let newer =
        VersionedInstanceIdentifier::new(InstanceIdentifier::new("1.2", "1.2.3", "1.2.3.9"), 9);
    let older =
        VersionedInstanceIdentifier::new(InstanceIdentifier::new("1.2", "1.2.4", "1.2.4.1"), 1);
    let row = |value: &str| IndexRow {
        tag_key,
        level: QueryTagLevel::Study,
        value: IndexValue::String(value.to_string()),
    };

    store.write_index_rows(&newer, &[row("NEW")]).await.expect("newer");
    store.write_index_rows(&older, &[row("OLD")]).await.expect("older");
    store.write_index_rows(&newer, &[row("NEW")]).await.expect("replay");

    let stored: Vec<(String, i64)> = sqlx::query_as(
        "SELECT tag_value, watermark FROM extended_query_tag_string WHERE tag_key = $1",
    )
    .bind(tag_key)
    .fetch_all(&test_db.pool)
    .await
    .expect("select");
    assert_eq!(stored, vec![("NEW".to_string(), 9)]);

    test_db.cleanup().await;
}

#[tokio::test]
#[ignore] // Requires DATABASE_URL with a reachable PostgreSQL server
async fn test_rows_for_deleted_tag_do_not_block_live_tag() {
    let test_db = TestDatabase::new().await.expect("test database");
    let tag = |path: &str| NewTagDefinition {
        path: path.to_string(),
        vr: ValueRepresentation::CS,
        private_creator: None,
        level: QueryTagLevel::Instance,
    };
    let tags = test_db
        .db
        .tags
        .add_tags(vec![tag("00100040"), tag("00080060")], 128)
        .await
        .expect("add tags");
    let (deleted, live) = (tags[0].key, tags[1].key);
    test_db
        .db
        .tags
        .delete_tag("00100040", ValueRepresentation::CS)
        .await
        .expect("delete");

    let instance =
        VersionedInstanceIdentifier::new(InstanceIdentifier::new("1.2", "1.2.3", "1.2.3.1"), 1);
    let row = |tag_key, value: &str| IndexRow {
        tag_key,
        level: QueryTagLevel::Instance,
        value: IndexValue::String(value.to_string()),
    };
    test_db
        .db
        .index_data
        .write_index_rows(
            &instance,
            &[row(deleted, "M"), row(live, "MR"), row(9_999, "X")],
        )
        .await
        .expect("write");

    let stored: Vec<(i32, String)> =
        sqlx::query_as("SELECT tag_key, tag_value FROM extended_query_tag_string ORDER BY tag_key")
            .fetch_all(&test_db.pool)
            .await
            .expect("select");
    assert_eq!(stored, vec![(live, "MR".to_string())]);

    test_db.cleanup().await;
}
