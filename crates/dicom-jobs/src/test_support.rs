//! Shared fixtures for unit tests over the in-memory stores.

use std::sync::Arc;

use serde_json::json;

use dicom_core::mock::InMemoryStore;
use dicom_core::{
    ExtendedQueryTagStore, IndexStatus, InstanceIdentifier, InstanceMetadata, NewTagDefinition,
    QueryTagLevel, TagKey, ValueRepresentation,
};

use crate::config::{ReindexConfig, RetryPolicy};
use crate::orchestrator::ReindexStores;
use crate::reindexer::MetadataReindexer;

/// Patient's Sex, a CS tag every seeded instance carries.
pub const SEX: &str = "00100040";

/// Patient's Age, absent from seeded metadata.
pub const AGE: &str = "00101010";

pub fn instance_id(watermark: i64) -> InstanceIdentifier {
    InstanceIdentifier::new(
        "1.2.840",
        format!("1.2.840.{}", watermark),
        format!("1.2.840.{}.1", watermark),
    )
}

/// Store `count` created instances with watermarks `1..=count`.
pub fn seed(store: &InMemoryStore, count: i64) {
    for w in 1..=count {
        store.add_instance(instance_id(w), w, IndexStatus::Created);
        let mut metadata = InstanceMetadata::default();
        metadata.insert(SEX, "CS", vec![json!(if w % 2 == 0 { "F" } else { "M" })]);
        store.put_metadata(w, metadata);
    }
}

pub async fn add_sex_tag(store: &InMemoryStore) -> TagKey {
    add_tag(store, SEX, ValueRepresentation::CS).await
}

pub async fn add_age_tag(store: &InMemoryStore) -> TagKey {
    add_tag(store, AGE, ValueRepresentation::AS).await
}

async fn add_tag(store: &InMemoryStore, path: &str, vr: ValueRepresentation) -> TagKey {
    store
        .add_tags(
            vec![NewTagDefinition {
                path: path.to_string(),
                vr,
                private_creator: None,
                level: QueryTagLevel::Instance,
            }],
            128,
        )
        .await
        .unwrap()[0]
        .key
}

pub fn stores(store: &InMemoryStore) -> ReindexStores {
    ReindexStores {
        errors: Arc::new(store.clone()),
        instances: Arc::new(store.clone()),
        reindex: Arc::new(store.clone()),
        reindexer: Arc::new(MetadataReindexer::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        )),
    }
}

pub fn config() -> ReindexConfig {
    ReindexConfig::default()
        .with_batch_size(4)
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 5,
        })
}
