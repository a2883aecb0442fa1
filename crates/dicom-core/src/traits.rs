//! Core traits for the reindexing pipeline.
//!
//! These traits define the interfaces that concrete stores must satisfy,
//! enabling the PostgreSQL backend and the in-memory test doubles to be
//! swapped behind the orchestrator.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::*;
use crate::validation::ValidationErrorCode;
use crate::vr::ValueRepresentation;

// =============================================================================
// TAG STORE
// =============================================================================

/// Versioned persistence of extended query tag definitions.
#[async_trait]
pub trait ExtendedQueryTagStore: Send + Sync {
    /// Insert tags atomically.
    ///
    /// Fails with `AlreadyExists` when any path collides with an existing tag
    /// and with `LimitExceeded` when the total would exceed `max_allowed_count`.
    /// Schemas that cannot return assigned keys return an empty list.
    async fn add_tags(
        &self,
        tags: Vec<NewTagDefinition>,
        max_allowed_count: usize,
    ) -> Result<Vec<TagDefinition>>;

    /// Fetch one tag with its error count and active operation.
    async fn get_tag(&self, path: &str) -> Result<TagEntry>;

    /// List tags ordered by key ascending.
    async fn list_tags(&self, limit: i64, offset: i64) -> Result<Vec<TagEntry>>;

    /// Fetch definitions by key; missing keys are omitted.
    async fn get_tags_by_keys(&self, keys: &[TagKey]) -> Result<Vec<TagDefinition>>;

    /// Toggle whether the tag may be used in queries.
    async fn update_query_status(&self, path: &str, status: QueryStatus) -> Result<TagEntry>;

    /// Delete a tag together with its index rows, errors and reindex bindings.
    ///
    /// Fails with `Busy` while the tag is bound to a processing operation.
    async fn delete_tag(&self, path: &str, vr: ValueRepresentation) -> Result<()>;
}

// =============================================================================
// TAG ERROR STORE
// =============================================================================

/// Per-tag, per-instance ledger of indexing failures.
#[async_trait]
pub trait ExtendedQueryTagErrorStore: Send + Sync {
    /// Record a failure and return the assigned id.
    ///
    /// Fails with `ExtendedQueryTagNotFound` for an unknown tag and with
    /// `AlreadyExists` when the (tag, instance) pair already has an error.
    async fn add_error(
        &self,
        tag_key: TagKey,
        instance: &VersionedInstanceIdentifier,
        error_code: ValidationErrorCode,
        created_time: DateTime<Utc>,
    ) -> Result<i64>;

    /// Errors for a tag ordered by creation time ascending.
    async fn get_errors(&self, path: &str) -> Result<Vec<TagError>>;

    /// Remove every error for a tag, returning the number removed.
    async fn delete_errors(&self, path: &str) -> Result<u64>;
}

// =============================================================================
// INSTANCE STORE
// =============================================================================

/// Read-only, watermark-ordered view of stored instances.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Partition `[1, max_watermark or current max]` into at most `batch_count`
    /// contiguous ranges of at most `batch_size` instances, highest first.
    async fn get_instance_batches(
        &self,
        batch_size: i32,
        batch_count: i32,
        status: IndexStatus,
        max_watermark: Option<i64>,
    ) -> Result<Vec<WatermarkRange>>;

    /// Instances whose watermark falls within `range`, highest first.
    async fn get_instance_identifiers_by_watermark_range(
        &self,
        range: WatermarkRange,
        status: IndexStatus,
    ) -> Result<Vec<VersionedInstanceIdentifier>>;
}

// =============================================================================
// REINDEX STATE STORE
// =============================================================================

/// Durable tag-to-operation bindings and their uncovered ranges.
#[async_trait]
pub trait ReindexStateStore: Send + Sync {
    /// Bind tags to an operation and return its uncovered range.
    ///
    /// Re-preparing the same operation resumes it, provided every requested
    /// tag was part of the original binding. Fails with `Conflict` when a
    /// tag is bound to a different processing operation or is not in the
    /// `Adding` state.
    async fn prepare(&self, tag_keys: &[TagKey], operation_id: &str) -> Result<ReindexOperation>;

    /// Load the current snapshot of an operation.
    async fn get_operation(&self, operation_id: &str) -> Result<ReindexOperation>;

    /// Lower the uncovered end of every processing tag to `new_end`.
    ///
    /// An equal end is a no-op; a higher end is rejected with `Conflict`.
    async fn update_progress(&self, operation_id: &str, new_end: i64) -> Result<ReindexOperation>;

    /// Promote processing tags to `Ready` and release their bindings.
    ///
    /// Fails with `Conflict` while any watermark remains uncovered.
    async fn complete(&self, operation_id: &str) -> Result<Vec<TagDefinition>>;

    /// Release one tag from an operation, leaving it in `Adding`.
    async fn pause_tag(&self, operation_id: &str, tag_key: TagKey) -> Result<()>;

    /// Operation ids that still have processing tags.
    async fn list_active_operations(&self) -> Result<Vec<String>>;
}

// =============================================================================
// INDEX DATA AND METADATA
// =============================================================================

/// Writes extracted values into the per-type index tables.
#[async_trait]
pub trait IndexDataStore: Send + Sync {
    /// Upsert rows for one instance; re-writing the same rows is a no-op.
    ///
    /// Rows for tags that are gone or being deleted are dropped.
    async fn write_index_rows(
        &self,
        instance: &VersionedInstanceIdentifier,
        rows: &[IndexRow],
    ) -> Result<()>;
}

/// Source of the already-persisted attribute set of an instance.
#[async_trait]
pub trait InstanceMetadataStore: Send + Sync {
    /// Fails with `NotFound` when the instance has no stored metadata.
    async fn get_instance_metadata(
        &self,
        instance: &VersionedInstanceIdentifier,
    ) -> Result<InstanceMetadata>;
}

/// Applies a tag set to one instance.
#[async_trait]
pub trait InstanceReindexer: Send + Sync {
    /// Index the instance for `tags`, returning per-tag value failures.
    ///
    /// An `Err` means a storage fault; invalid values are never errors.
    async fn reindex_instance(
        &self,
        tags: &[TagDefinition],
        instance: &VersionedInstanceIdentifier,
    ) -> Result<Vec<TagIndexFailure>>;
}
