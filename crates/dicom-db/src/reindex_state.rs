//! Reindex operation bindings and progress checkpoints.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};

use dicom_core::{
    Error, ExtendedQueryTagStatus, ExtendedQueryTagStore, IndexStatus, ReindexEntry,
    ReindexOperation, ReindexStateStore, ReindexStatus, Result, SchemaVersion, TagDefinition,
    TagKey, MIN_WATERMARK,
};

use crate::extended_query_tags::PgExtendedQueryTagStore;

/// PostgreSQL implementation of ReindexStateStore.
#[derive(Clone)]
pub struct PgReindexStateStore {
    pool: Pool<Postgres>,
    version: SchemaVersion,
    tags: PgExtendedQueryTagStore,
}

impl PgReindexStateStore {
    pub fn new(pool: Pool<Postgres>, version: SchemaVersion) -> Self {
        Self {
            tags: PgExtendedQueryTagStore::new(pool.clone(), version),
            pool,
            version,
        }
    }

    fn parse_entry_row(row: &PgRow) -> Result<ReindexEntry> {
        Ok(ReindexEntry {
            operation_id: row.get("operation_id"),
            tag_key: row.get("tag_key"),
            status: ReindexStatus::from_i16(row.get("status"))?,
            start_watermark: row.get("start_watermark"),
            end_watermark: row.get("end_watermark"),
            max_watermark: row.get("max_watermark"),
        })
    }

    async fn load_entries(&self, operation_id: &str) -> Result<Vec<ReindexEntry>> {
        let rows = sqlx::query(
            "SELECT operation_id, tag_key, status, start_watermark, end_watermark, max_watermark
             FROM extended_query_tag_operation
             WHERE operation_id = $1
             ORDER BY tag_key",
        )
        .bind(operation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        rows.iter().map(Self::parse_entry_row).collect()
    }
}

#[async_trait]
impl ReindexStateStore for PgReindexStateStore {
    async fn prepare(&self, tag_keys: &[TagKey], operation_id: &str) -> Result<ReindexOperation> {
        self.version.capabilities().require_reindex("prepare")?;
        if tag_keys.is_empty() {
            return Err(Error::InvalidInput("no tags to reindex".to_string()));
        }

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Lock the tag rows so concurrent prepares and deletes serialize here.
        let tags: Vec<(TagKey, String, i16)> = sqlx::query_as(
            "SELECT tag_key, tag_path, tag_status FROM extended_query_tag
             WHERE tag_key = ANY($1)
             ORDER BY tag_key
             FOR UPDATE",
        )
        .bind(tag_keys)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if let Some(missing) = tag_keys
            .iter()
            .find(|k| !tags.iter().any(|(key, _, _)| key == *k))
        {
            return Err(Error::ExtendedQueryTagNotFound(missing.to_string()));
        }

        let bound_keys: Vec<(TagKey,)> = sqlx::query_as(
            "SELECT tag_key FROM extended_query_tag_operation WHERE operation_id = $1",
        )
        .bind(operation_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if bound_keys.is_empty() {
            for (_, path, status) in &tags {
                let status = ExtendedQueryTagStatus::from_i16(*status)?;
                if status != ExtendedQueryTagStatus::Adding {
                    return Err(Error::Conflict(format!(
                        "tag {} is {:?}, not Adding",
                        path, status
                    )));
                }
            }

            let bound: Option<(TagKey, String)> = sqlx::query_as(
                "SELECT tag_key, operation_id FROM extended_query_tag_operation
                 WHERE tag_key = ANY($1) AND status = $2
                 LIMIT 1",
            )
            .bind(tag_keys)
            .bind(ReindexStatus::Processing.as_i16())
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;
            if let Some((key, other)) = bound {
                return Err(Error::Conflict(format!(
                    "tag {} is already bound to operation {}",
                    key, other
                )));
            }

            let max: (Option<i64>,) =
                sqlx::query_as("SELECT MAX(watermark) FROM instance WHERE status = $1")
                    .bind(IndexStatus::Created.as_i16())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(Error::Database)?;

            sqlx::query(
                "INSERT INTO extended_query_tag_operation
                     (operation_id, tag_key, status, start_watermark, end_watermark, max_watermark)
                 SELECT $1, k, $2, $3, $4, $5 FROM UNNEST($6::INTEGER[]) AS k",
            )
            .bind(operation_id)
            .bind(ReindexStatus::Processing.as_i16())
            .bind(MIN_WATERMARK)
            .bind(max.0.unwrap_or(MIN_WATERMARK - 1))
            .bind(max.0)
            .bind(tag_keys)
            .execute(&mut *tx)
            .await
            .map_err(|e| match crate::map_constraint_error(e, operation_id) {
                Error::AlreadyExists(_) => Error::Conflict(format!(
                    "a tag of operation {} was bound concurrently",
                    operation_id
                )),
                other => other,
            })?;

            info!(
                subsystem = "db",
                component = "reindex_store",
                op = "prepare",
                operation_id,
                tag_count = tag_keys.len(),
                max_watermark = ?max.0,
                "Bound tags to reindex operation"
            );
        } else {
            // A resumed operation keeps its original tag set.
            if let Some(extra) = tag_keys
                .iter()
                .find(|k| !bound_keys.iter().any(|(key,)| key == *k))
            {
                return Err(Error::Conflict(format!(
                    "operation {} was prepared without tag {}",
                    operation_id, extra
                )));
            }
            debug!(
                subsystem = "db",
                component = "reindex_store",
                op = "prepare",
                operation_id,
                "Resuming prepared reindex operation"
            );
        }

        tx.commit().await.map_err(Error::Database)?;
        self.get_operation(operation_id).await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<ReindexOperation> {
        self.version.capabilities().require_reindex("get_operation")?;
        let entries = self.load_entries(operation_id).await?;
        let processing: Vec<TagKey> = entries
            .iter()
            .filter(|e| e.status == ReindexStatus::Processing)
            .map(|e| e.tag_key)
            .collect();
        let tags = self.tags.get_tags_by_keys(&processing).await?;

        ReindexOperation::from_entries(operation_id, &entries, tags)
            .ok_or_else(|| Error::OperationNotFound(operation_id.to_string()))
    }

    async fn update_progress(&self, operation_id: &str, new_end: i64) -> Result<ReindexOperation> {
        self.version.capabilities().require_reindex("update_progress")?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let rows = sqlx::query(
            "SELECT operation_id, tag_key, status, start_watermark, end_watermark, max_watermark
             FROM extended_query_tag_operation
             WHERE operation_id = $1
             FOR UPDATE",
        )
        .bind(operation_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        if rows.is_empty() {
            return Err(Error::OperationNotFound(operation_id.to_string()));
        }

        let entries: Vec<ReindexEntry> = rows
            .iter()
            .map(Self::parse_entry_row)
            .collect::<Result<_>>()?;
        for entry in entries
            .iter()
            .filter(|e| e.status == ReindexStatus::Processing)
        {
            if new_end > entry.end_watermark {
                return Err(Error::Conflict(format!(
                    "progress for {} cannot move from {} back to {}",
                    operation_id, entry.end_watermark, new_end
                )));
            }
            if new_end < entry.start_watermark - 1 {
                return Err(Error::InvalidInput(format!(
                    "end watermark {} is below the floor {}",
                    new_end, entry.start_watermark
                )));
            }
        }

        let updated = sqlx::query(
            "UPDATE extended_query_tag_operation
             SET end_watermark = $2
             WHERE operation_id = $1 AND status = $3 AND end_watermark <> $2",
        )
        .bind(operation_id)
        .bind(new_end)
        .bind(ReindexStatus::Processing.as_i16())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "db",
            component = "reindex_store",
            op = "update_progress",
            operation_id,
            end_watermark = new_end,
            updated,
            "Checkpointed reindex progress"
        );
        self.get_operation(operation_id).await
    }

    async fn complete(&self, operation_id: &str) -> Result<Vec<TagDefinition>> {
        self.version.capabilities().require_reindex("complete")?;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let rows = sqlx::query(
            "SELECT operation_id, tag_key, status, start_watermark, end_watermark, max_watermark
             FROM extended_query_tag_operation
             WHERE operation_id = $1
             FOR UPDATE",
        )
        .bind(operation_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        if rows.is_empty() {
            return Err(Error::OperationNotFound(operation_id.to_string()));
        }

        let mut keys = Vec::new();
        for row in &rows {
            let entry = Self::parse_entry_row(row)?;
            if entry.status != ReindexStatus::Processing {
                continue;
            }
            if entry.end_watermark >= entry.start_watermark {
                return Err(Error::Conflict(format!(
                    "operation {} still has watermarks [{}, {}] to cover",
                    operation_id, entry.start_watermark, entry.end_watermark
                )));
            }
            keys.push(entry.tag_key);
        }

        sqlx::query(
            "UPDATE extended_query_tag
             SET tag_status = $2, tag_version = nextval('tag_version_sequence')
             WHERE tag_key = ANY($1) AND tag_status = $3",
        )
        .bind(&keys)
        .bind(ExtendedQueryTagStatus::Ready.as_i16())
        .bind(ExtendedQueryTagStatus::Adding.as_i16())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "UPDATE extended_query_tag_operation SET status = $2
             WHERE operation_id = $1 AND status = $3",
        )
        .bind(operation_id)
        .bind(ReindexStatus::Completed.as_i16())
        .bind(ReindexStatus::Processing.as_i16())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "reindex_store",
            op = "complete",
            operation_id,
            tag_count = keys.len(),
            "Completed reindex operation"
        );
        self.tags.get_tags_by_keys(&keys).await
    }

    async fn pause_tag(&self, operation_id: &str, tag_key: TagKey) -> Result<()> {
        self.version.capabilities().require_reindex("pause_tag")?;
        let result = sqlx::query(
            "UPDATE extended_query_tag_operation SET status = $3
             WHERE operation_id = $1 AND tag_key = $2 AND status = $4",
        )
        .bind(operation_id)
        .bind(tag_key)
        .bind(ReindexStatus::Paused.as_i16())
        .bind(ReindexStatus::Processing.as_i16())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!(
                "tag {} is not processing in operation {}",
                tag_key, operation_id
            )));
        }

        info!(
            subsystem = "db",
            component = "reindex_store",
            op = "pause_tag",
            operation_id,
            tag_key,
            "Paused tag in reindex operation"
        );
        Ok(())
    }

    async fn list_active_operations(&self) -> Result<Vec<String>> {
        self.version
            .capabilities()
            .require_reindex("list_active_operations")?;
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT operation_id FROM extended_query_tag_operation
             WHERE status = $1
             ORDER BY operation_id",
        )
        .bind(ReindexStatus::Processing.as_i16())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}
