//! Applies a tag set to one stored instance.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{trace, warn};

use dicom_core::{
    extract_index_value, Error, ExtendedQueryTagStatus, IndexDataStore, IndexRow,
    InstanceMetadataStore, InstanceReindexer, Result, TagDefinition, TagIndexFailure,
    VersionedInstanceIdentifier,
};

/// Reindexer that reads stored metadata and writes index rows.
#[derive(Clone)]
pub struct MetadataReindexer {
    metadata: Arc<dyn InstanceMetadataStore>,
    index: Arc<dyn IndexDataStore>,
}

impl MetadataReindexer {
    pub fn new(metadata: Arc<dyn InstanceMetadataStore>, index: Arc<dyn IndexDataStore>) -> Self {
        Self { metadata, index }
    }
}

#[async_trait]
impl InstanceReindexer for MetadataReindexer {
    async fn reindex_instance(
        &self,
        tags: &[TagDefinition],
        instance: &VersionedInstanceIdentifier,
    ) -> Result<Vec<TagIndexFailure>> {
        let metadata = match self.metadata.get_instance_metadata(instance).await {
            Ok(metadata) => metadata,
            Err(Error::NotFound(_)) => {
                warn!(
                    subsystem = "jobs",
                    component = "reindexer",
                    op = "reindex_instance",
                    watermark = instance.watermark,
                    "Instance metadata missing, skipping"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut rows = Vec::new();
        let mut failures = Vec::new();
        for tag in tags
            .iter()
            .filter(|t| t.status != ExtendedQueryTagStatus::Deleting)
        {
            let Some(element) = metadata.get(&tag.path) else {
                continue;
            };
            match extract_index_value(tag.vr, element) {
                Ok(Some(value)) => rows.push(IndexRow {
                    tag_key: tag.key,
                    level: tag.level,
                    value,
                }),
                Ok(None) => {}
                Err(e) => failures.push(TagIndexFailure {
                    tag_key: tag.key,
                    code: e.code,
                    detail: e.detail,
                }),
            }
        }

        self.index.write_index_rows(instance, &rows).await?;

        trace!(
            subsystem = "jobs",
            component = "reindexer",
            op = "reindex_instance",
            watermark = instance.watermark,
            row_count = rows.len(),
            failure_count = failures.len(),
            "Reindexed instance"
        );
        Ok(failures)
    }
}
