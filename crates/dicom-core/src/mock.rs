//! In-memory stores for deterministic testing.
//!
//! [`InMemoryStore`] implements every store trait over one shared state, so a
//! test can drive the orchestrator end to end without a database.
//!
//! ## Usage
//!
//! ```rust
//! use dicom_core::mock::InMemoryStore;
//! use dicom_core::{IndexStatus, InstanceIdentifier};
//!
//! let store = InMemoryStore::new();
//! store.add_instance(InstanceIdentifier::new("1.2", "1.2.3", "1.2.3.4"), 1, IndexStatus::Created);
//! assert_eq!(store.instance_count(), 1);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::models::*;
use crate::traits::*;
use crate::validation::ValidationErrorCode;
use crate::vr::ValueRepresentation;

type IndexKey = (TagKey, String, String, String);

#[derive(Default)]
struct State {
    next_tag_key: TagKey,
    next_version: i64,
    tags: BTreeMap<TagKey, TagDefinition>,
    next_error_id: i64,
    errors: Vec<TagError>,
    instances: BTreeMap<i64, (InstanceIdentifier, IndexStatus)>,
    metadata: HashMap<i64, InstanceMetadata>,
    reindex: Vec<ReindexEntry>,
    index_rows: HashMap<IndexKey, (i64, IndexValue)>,
    index_writes: u64,
    injected_failures: HashMap<String, u32>,
}

impl State {
    fn bump_version(&mut self) -> TagVersion {
        self.next_version += 1;
        TagVersion(self.next_version)
    }

    fn tag_by_path(&self, path: &str) -> Result<&TagDefinition> {
        self.tags
            .values()
            .find(|t| t.path == path)
            .ok_or_else(|| Error::ExtendedQueryTagNotFound(path.to_string()))
    }

    fn active_operation(&self, key: TagKey) -> Option<&str> {
        self.reindex
            .iter()
            .find(|r| r.tag_key == key && r.status == ReindexStatus::Processing)
            .map(|r| r.operation_id.as_str())
    }

    fn entry(&self, tag: &TagDefinition) -> TagEntry {
        TagEntry {
            definition: tag.clone(),
            error_count: self.errors.iter().filter(|e| e.tag_key == tag.key).count() as i64,
            operation_id: self.active_operation(tag.key).map(str::to_string),
        }
    }

    fn operation(&self, operation_id: &str) -> Result<ReindexOperation> {
        let entries: Vec<ReindexEntry> = self
            .reindex
            .iter()
            .filter(|r| r.operation_id == operation_id)
            .cloned()
            .collect();
        let tags = entries
            .iter()
            .filter(|r| r.status == ReindexStatus::Processing)
            .filter_map(|r| self.tags.get(&r.tag_key).cloned())
            .collect();
        ReindexOperation::from_entries(operation_id, &entries, tags)
            .ok_or_else(|| Error::OperationNotFound(operation_id.to_string()))
    }

    fn take_failure(&mut self, op: &str) -> Result<()> {
        if let Some(remaining) = self.injected_failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::Database(sqlx::Error::PoolTimedOut));
            }
        }
        Ok(())
    }
}

/// Shared in-memory implementation of every store trait.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `times` calls of `op` fail with a transient database error.
    ///
    /// `op` is the trait method name, e.g. `"update_progress"`.
    pub fn fail_next(&self, op: &str, times: u32) {
        self.state().injected_failures.insert(op.to_string(), times);
    }

    pub fn add_instance(&self, identifier: InstanceIdentifier, watermark: i64, status: IndexStatus) {
        self.state().instances.insert(watermark, (identifier, status));
    }

    pub fn put_metadata(&self, watermark: i64, metadata: InstanceMetadata) {
        self.state().metadata.insert(watermark, metadata);
    }

    pub fn instance_count(&self) -> usize {
        self.state().instances.len()
    }

    /// Force a tag into a status, bypassing lifecycle checks.
    pub fn set_tag_status(&self, key: TagKey, status: ExtendedQueryTagStatus) {
        if let Some(tag) = self.state().tags.get_mut(&key) {
            tag.status = status;
        }
    }

    pub fn tag(&self, key: TagKey) -> Option<TagDefinition> {
        self.state().tags.get(&key).cloned()
    }

    /// Values currently indexed for a tag, ordered by watermark.
    pub fn index_values(&self, tag_key: TagKey) -> Vec<IndexValue> {
        let state = self.state();
        let mut rows: Vec<&(i64, IndexValue)> = state
            .index_rows
            .iter()
            .filter(|(k, _)| k.0 == tag_key)
            .map(|(_, v)| v)
            .collect();
        rows.sort_by_key(|(watermark, _)| *watermark);
        rows.into_iter().map(|(_, v)| v.clone()).collect()
    }

    /// Total number of index row writes, including rewrites.
    pub fn index_write_count(&self) -> u64 {
        self.state().index_writes
    }

    pub fn reindex_entries(&self, operation_id: &str) -> Vec<ReindexEntry> {
        self.state()
            .reindex
            .iter()
            .filter(|r| r.operation_id == operation_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExtendedQueryTagStore for InMemoryStore {
    async fn add_tags(
        &self,
        tags: Vec<NewTagDefinition>,
        max_allowed_count: usize,
    ) -> Result<Vec<TagDefinition>> {
        let mut state = self.state();
        state.take_failure("add_tags")?;

        for (i, tag) in tags.iter().enumerate() {
            let collides = state.tags.values().any(|t| t.path == tag.path)
                || tags[..i].iter().any(|t| t.path == tag.path);
            if collides {
                return Err(Error::AlreadyExists(tag.path.clone()));
            }
        }
        if state.tags.len() + tags.len() > max_allowed_count {
            return Err(Error::LimitExceeded {
                max: max_allowed_count,
            });
        }

        let mut added = Vec::with_capacity(tags.len());
        for tag in tags {
            state.next_tag_key += 1;
            let version = state.bump_version();
            let def = TagDefinition {
                key: state.next_tag_key,
                path: tag.path,
                vr: tag.vr,
                private_creator: tag.private_creator,
                level: tag.level,
                status: ExtendedQueryTagStatus::Adding,
                query_status: QueryStatus::Enabled,
                version: Some(version),
            };
            state.tags.insert(def.key, def.clone());
            added.push(def);
        }
        Ok(added)
    }

    async fn get_tag(&self, path: &str) -> Result<TagEntry> {
        let mut state = self.state();
        state.take_failure("get_tag")?;
        let tag = state.tag_by_path(path)?;
        Ok(state.entry(tag))
    }

    async fn list_tags(&self, limit: i64, offset: i64) -> Result<Vec<TagEntry>> {
        if limit < 0 || offset < 0 {
            return Err(Error::InvalidInput(
                "limit and offset must not be negative".to_string(),
            ));
        }
        let state = self.state();
        Ok(state
            .tags
            .values()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|t| state.entry(t))
            .collect())
    }

    async fn get_tags_by_keys(&self, keys: &[TagKey]) -> Result<Vec<TagDefinition>> {
        let mut state = self.state();
        state.take_failure("get_tags_by_keys")?;
        Ok(keys
            .iter()
            .filter_map(|k| state.tags.get(k).cloned())
            .collect())
    }

    async fn update_query_status(&self, path: &str, status: QueryStatus) -> Result<TagEntry> {
        let mut state = self.state();
        let key = state.tag_by_path(path)?.key;
        let version = state.bump_version();
        if let Some(tag) = state.tags.get_mut(&key) {
            tag.query_status = status;
            tag.version = Some(version);
        }
        let tag = state.tag_by_path(path)?;
        Ok(state.entry(tag))
    }

    async fn delete_tag(&self, path: &str, vr: ValueRepresentation) -> Result<()> {
        let mut state = self.state();
        state.take_failure("delete_tag")?;
        let tag = state.tag_by_path(path)?;
        if tag.vr != vr {
            return Err(Error::ExtendedQueryTagNotFound(path.to_string()));
        }
        let key = tag.key;
        if state.active_operation(key).is_some() {
            return Err(Error::Busy(path.to_string()));
        }

        state.index_rows.retain(|k, _| k.0 != key);
        state.errors.retain(|e| e.tag_key != key);
        state.reindex.retain(|r| r.tag_key != key);
        state.tags.remove(&key);
        Ok(())
    }
}

#[async_trait]
impl ExtendedQueryTagErrorStore for InMemoryStore {
    async fn add_error(
        &self,
        tag_key: TagKey,
        instance: &VersionedInstanceIdentifier,
        error_code: ValidationErrorCode,
        created_time: DateTime<Utc>,
    ) -> Result<i64> {
        let mut state = self.state();
        state.take_failure("add_error")?;
        if !state.tags.contains_key(&tag_key) {
            return Err(Error::ExtendedQueryTagNotFound(tag_key.to_string()));
        }
        let duplicate = state
            .errors
            .iter()
            .any(|e| e.tag_key == tag_key && e.instance == instance.identifier);
        if duplicate {
            return Err(Error::AlreadyExists(format!(
                "error for tag {} on {}",
                tag_key, instance
            )));
        }

        state.next_error_id += 1;
        let id = state.next_error_id;
        state.errors.push(TagError {
            id,
            tag_key,
            instance: instance.identifier.clone(),
            error_code,
            created_time,
            message: error_code.message().to_string(),
        });
        Ok(id)
    }

    async fn get_errors(&self, path: &str) -> Result<Vec<TagError>> {
        let state = self.state();
        let key = state.tag_by_path(path)?.key;
        let mut errors: Vec<TagError> = state
            .errors
            .iter()
            .filter(|e| e.tag_key == key)
            .cloned()
            .collect();
        errors.sort_by_key(|e| (e.created_time, e.id));
        Ok(errors)
    }

    async fn delete_errors(&self, path: &str) -> Result<u64> {
        let mut state = self.state();
        let key = state.tag_by_path(path)?.key;
        let before = state.errors.len();
        state.errors.retain(|e| e.tag_key != key);
        Ok((before - state.errors.len()) as u64)
    }
}

#[async_trait]
impl InstanceStore for InMemoryStore {
    async fn get_instance_batches(
        &self,
        batch_size: i32,
        batch_count: i32,
        status: IndexStatus,
        max_watermark: Option<i64>,
    ) -> Result<Vec<WatermarkRange>> {
        if batch_size <= 0 || batch_count <= 0 {
            return Err(Error::InvalidInput(format!(
                "batch_size ({}) and batch_count ({}) must be positive",
                batch_size, batch_count
            )));
        }
        let mut state = self.state();
        state.take_failure("get_instance_batches")?;

        let watermarks: Vec<i64> = state
            .instances
            .iter()
            .rev()
            .filter(|(w, (_, s))| *s == status && max_watermark.map_or(true, |m| **w <= m))
            .map(|(w, _)| *w)
            .collect();

        Ok(watermarks
            .chunks(batch_size as usize)
            .take(batch_count as usize)
            .filter_map(|chunk| {
                let end = *chunk.first()?;
                let start = *chunk.last()?;
                Some(WatermarkRange { start, end })
            })
            .collect())
    }

    async fn get_instance_identifiers_by_watermark_range(
        &self,
        range: WatermarkRange,
        status: IndexStatus,
    ) -> Result<Vec<VersionedInstanceIdentifier>> {
        let mut state = self.state();
        state.take_failure("get_instance_identifiers_by_watermark_range")?;
        Ok(state
            .instances
            .range(range.start..=range.end)
            .rev()
            .filter(|(_, (_, s))| *s == status)
            .map(|(w, (id, _))| VersionedInstanceIdentifier::new(id.clone(), *w))
            .collect())
    }
}

#[async_trait]
impl ReindexStateStore for InMemoryStore {
    async fn prepare(&self, tag_keys: &[TagKey], operation_id: &str) -> Result<ReindexOperation> {
        if tag_keys.is_empty() {
            return Err(Error::InvalidInput("no tags to reindex".to_string()));
        }
        let mut state = self.state();
        state.take_failure("prepare")?;

        if state.reindex.iter().any(|r| r.operation_id == operation_id) {
            let extra = tag_keys.iter().find(|k| {
                !state
                    .reindex
                    .iter()
                    .any(|r| r.operation_id == operation_id && r.tag_key == **k)
            });
            if let Some(extra) = extra {
                return Err(Error::Conflict(format!(
                    "operation {} was prepared without tag {}",
                    operation_id, extra
                )));
            }
            return state.operation(operation_id);
        }

        for key in tag_keys {
            let tag = state
                .tags
                .get(key)
                .ok_or_else(|| Error::ExtendedQueryTagNotFound(key.to_string()))?;
            if tag.status != ExtendedQueryTagStatus::Adding {
                return Err(Error::Conflict(format!(
                    "tag {} is {:?}, not Adding",
                    tag.path, tag.status
                )));
            }
            if let Some(other) = state.active_operation(*key) {
                return Err(Error::Conflict(format!(
                    "tag {} is already bound to operation {}",
                    tag.path, other
                )));
            }
        }

        let max = state
            .instances
            .iter()
            .rev()
            .find(|(_, (_, s))| *s == IndexStatus::Created)
            .map(|(w, _)| *w);
        for key in tag_keys {
            state.reindex.push(ReindexEntry {
                operation_id: operation_id.to_string(),
                tag_key: *key,
                status: ReindexStatus::Processing,
                start_watermark: MIN_WATERMARK,
                end_watermark: max.unwrap_or(MIN_WATERMARK - 1),
                max_watermark: max,
            });
        }
        state.operation(operation_id)
    }

    async fn get_operation(&self, operation_id: &str) -> Result<ReindexOperation> {
        let mut state = self.state();
        state.take_failure("get_operation")?;
        state.operation(operation_id)
    }

    async fn update_progress(&self, operation_id: &str, new_end: i64) -> Result<ReindexOperation> {
        let mut state = self.state();
        state.take_failure("update_progress")?;
        state.operation(operation_id)?;

        for row in state
            .reindex
            .iter()
            .filter(|r| r.operation_id == operation_id && r.status == ReindexStatus::Processing)
        {
            if new_end > row.end_watermark {
                return Err(Error::Conflict(format!(
                    "progress for {} cannot move from {} back to {}",
                    operation_id, row.end_watermark, new_end
                )));
            }
            if new_end < row.start_watermark - 1 {
                return Err(Error::InvalidInput(format!(
                    "end watermark {} is below the floor {}",
                    new_end, row.start_watermark
                )));
            }
        }
        for row in state
            .reindex
            .iter_mut()
            .filter(|r| r.operation_id == operation_id && r.status == ReindexStatus::Processing)
        {
            row.end_watermark = new_end;
        }
        state.operation(operation_id)
    }

    async fn complete(&self, operation_id: &str) -> Result<Vec<TagDefinition>> {
        let mut state = self.state();
        state.take_failure("complete")?;
        state.operation(operation_id)?;

        let keys: Vec<TagKey> = state
            .reindex
            .iter()
            .filter(|r| r.operation_id == operation_id && r.status == ReindexStatus::Processing)
            .map(|r| {
                if r.end_watermark >= r.start_watermark {
                    Err(Error::Conflict(format!(
                        "operation {} still has watermarks [{}, {}] to cover",
                        operation_id, r.start_watermark, r.end_watermark
                    )))
                } else {
                    Ok(r.tag_key)
                }
            })
            .collect::<Result<_>>()?;

        let mut promoted = Vec::with_capacity(keys.len());
        for key in &keys {
            let version = state.bump_version();
            if let Some(tag) = state.tags.get_mut(key) {
                if tag.status == ExtendedQueryTagStatus::Adding {
                    tag.status = ExtendedQueryTagStatus::Ready;
                    tag.version = Some(version);
                }
                promoted.push(tag.clone());
            }
        }
        for row in state
            .reindex
            .iter_mut()
            .filter(|r| r.operation_id == operation_id && r.status == ReindexStatus::Processing)
        {
            row.status = ReindexStatus::Completed;
        }
        Ok(promoted)
    }

    async fn pause_tag(&self, operation_id: &str, tag_key: TagKey) -> Result<()> {
        let mut state = self.state();
        let row = state
            .reindex
            .iter_mut()
            .find(|r| {
                r.operation_id == operation_id
                    && r.tag_key == tag_key
                    && r.status == ReindexStatus::Processing
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "tag {} is not processing in operation {}",
                    tag_key, operation_id
                ))
            })?;
        row.status = ReindexStatus::Paused;
        Ok(())
    }

    async fn list_active_operations(&self) -> Result<Vec<String>> {
        let state = self.state();
        let mut ids: Vec<String> = state
            .reindex
            .iter()
            .filter(|r| r.status == ReindexStatus::Processing)
            .map(|r| r.operation_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[async_trait]
impl IndexDataStore for InMemoryStore {
    async fn write_index_rows(
        &self,
        instance: &VersionedInstanceIdentifier,
        rows: &[IndexRow],
    ) -> Result<()> {
        let mut state = self.state();
        state.take_failure("write_index_rows")?;
        let id = &instance.identifier;
        for row in rows {
            let live = state
                .tags
                .get(&row.tag_key)
                .is_some_and(|t| t.status != ExtendedQueryTagStatus::Deleting);
            if !live {
                continue;
            }
            let (series, sop) = match row.level {
                QueryTagLevel::Study => (String::new(), String::new()),
                QueryTagLevel::Series => (id.series_instance_uid.clone(), String::new()),
                QueryTagLevel::Instance => {
                    (id.series_instance_uid.clone(), id.sop_instance_uid.clone())
                }
            };
            let key = (row.tag_key, id.study_instance_uid.clone(), series, sop);
            let newer_exists = state
                .index_rows
                .get(&key)
                .is_some_and(|(watermark, _)| *watermark > instance.watermark);
            if !newer_exists {
                state
                    .index_rows
                    .insert(key, (instance.watermark, row.value.clone()));
            }
            state.index_writes += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl InstanceMetadataStore for InMemoryStore {
    async fn get_instance_metadata(
        &self,
        instance: &VersionedInstanceIdentifier,
    ) -> Result<InstanceMetadata> {
        let mut state = self.state();
        state.take_failure("get_instance_metadata")?;
        state
            .metadata
            .get(&instance.watermark)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("metadata for {}", instance)))
    }
}
