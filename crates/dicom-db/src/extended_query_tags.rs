//! Extended query tag store implementation.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::{debug, info};

use dicom_core::{
    Error, ExtendedQueryTagStatus, ExtendedQueryTagStore, NewTagDefinition, QueryStatus,
    QueryTagLevel, Result, SchemaVersion, TagDefinition, TagEntry, TagKey, TagVersion,
    ValueRepresentation,
};

use crate::index_data::index_table;
use crate::map_constraint_error;
use crate::queries::{tag_queries, TagQueries};

/// PostgreSQL implementation of ExtendedQueryTagStore.
#[derive(Clone)]
pub struct PgExtendedQueryTagStore {
    pool: Pool<Postgres>,
    version: SchemaVersion,
}

impl PgExtendedQueryTagStore {
    pub fn new(pool: Pool<Postgres>, version: SchemaVersion) -> Self {
        Self { pool, version }
    }

    fn queries(&self) -> &'static TagQueries {
        tag_queries(self.version)
    }

    pub(crate) fn parse_entry_row(row: &PgRow) -> Result<TagEntry> {
        let vr: String = row.get("tag_vr");
        let definition = TagDefinition {
            key: row.get("tag_key"),
            path: row.get("tag_path"),
            vr: vr
                .parse::<ValueRepresentation>()
                .map_err(|e| Error::Internal(format!("Stored tag has invalid VR: {}", e)))?,
            private_creator: row.get("tag_private_creator"),
            level: QueryTagLevel::from_i16(row.get("tag_level"))?,
            status: ExtendedQueryTagStatus::from_i16(row.get("tag_status"))?,
            query_status: QueryStatus::from_i16(row.get("query_status")),
            version: row
                .get::<Option<i64>, _>("tag_version")
                .map(TagVersion),
        };
        Ok(TagEntry {
            definition,
            error_count: row.get("error_count"),
            operation_id: row.get("operation_id"),
        })
    }
}

#[async_trait]
impl ExtendedQueryTagStore for PgExtendedQueryTagStore {
    async fn add_tags(
        &self,
        tags: Vec<NewTagDefinition>,
        max_allowed_count: usize,
    ) -> Result<Vec<TagDefinition>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::new();
        for tag in &tags {
            if !seen.insert(tag.path.as_str()) {
                return Err(Error::AlreadyExists(tag.path.clone()));
            }
        }
        let paths: Vec<String> = tags.iter().map(|t| t.path.clone()).collect();

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Serialize concurrent adds so the limit check sees every committed tag.
        sqlx::query("LOCK TABLE extended_query_tag IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT tag_path FROM extended_query_tag WHERE tag_path = ANY($1) ORDER BY tag_path LIMIT 1",
        )
        .bind(&paths)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;
        if let Some((path,)) = existing {
            return Err(Error::AlreadyExists(path));
        }

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM extended_query_tag")
            .fetch_one(&mut *tx)
            .await
            .map_err(Error::Database)?;
        if count.0 as usize + tags.len() > max_allowed_count {
            return Err(Error::LimitExceeded {
                max: max_allowed_count,
            });
        }

        let initial_status = self.queries().initial_status;
        let mut keys: Vec<TagKey> = Vec::with_capacity(tags.len());
        for tag in &tags {
            let key: (TagKey,) = sqlx::query_as(
                "INSERT INTO extended_query_tag
                     (tag_path, tag_vr, tag_private_creator, tag_level, tag_status, query_status)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 RETURNING tag_key",
            )
            .bind(&tag.path)
            .bind(tag.vr.code())
            .bind(&tag.private_creator)
            .bind(tag.level.as_i16())
            .bind(initial_status)
            .bind(QueryStatus::Enabled.as_i16())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_constraint_error(e, &tag.path))?;
            keys.push(key.0);
        }

        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "tag_store",
            op = "add_tags",
            tag_count = keys.len(),
            schema_version = self.version.as_i32(),
            "Added extended query tags"
        );

        if !self.version.capabilities().add_returns_keys {
            return Ok(Vec::new());
        }
        self.get_tags_by_keys(&keys).await
    }

    async fn get_tag(&self, path: &str) -> Result<TagEntry> {
        let sql = format!("{} WHERE t.tag_path = $1", self.queries().select_entry);
        let row = sqlx::query(&sql)
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?
            .ok_or_else(|| Error::ExtendedQueryTagNotFound(path.to_string()))?;
        Self::parse_entry_row(&row)
    }

    async fn list_tags(&self, limit: i64, offset: i64) -> Result<Vec<TagEntry>> {
        if limit < 0 || offset < 0 {
            return Err(Error::InvalidInput(
                "limit and offset must not be negative".to_string(),
            ));
        }
        let sql = format!(
            "{} ORDER BY t.tag_key LIMIT $1 OFFSET $2",
            self.queries().select_entry
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter().map(Self::parse_entry_row).collect()
    }

    async fn get_tags_by_keys(&self, keys: &[TagKey]) -> Result<Vec<TagDefinition>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "{} WHERE t.tag_key = ANY($1) ORDER BY t.tag_key",
            self.queries().select_entry
        );
        let rows = sqlx::query(&sql)
            .bind(keys)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        rows.iter()
            .map(|row| Self::parse_entry_row(row).map(|e| e.definition))
            .collect()
    }

    async fn update_query_status(&self, path: &str, status: QueryStatus) -> Result<TagEntry> {
        let result = sqlx::query(
            "UPDATE extended_query_tag
             SET query_status = $2, tag_version = nextval('tag_version_sequence')
             WHERE tag_path = $1",
        )
        .bind(path)
        .bind(status.as_i16())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Err(Error::ExtendedQueryTagNotFound(path.to_string()));
        }

        debug!(
            subsystem = "db",
            component = "tag_store",
            op = "update_query_status",
            tag_path = path,
            query_status = ?status,
            "Updated tag query status"
        );
        self.get_tag(path).await
    }

    async fn delete_tag(&self, path: &str, vr: ValueRepresentation) -> Result<()> {
        let queries = self.queries();

        // Phase 1: mark Deleting under the row lock so prepare cannot bind it.
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let row: Option<(TagKey, String)> = sqlx::query_as(
            "SELECT tag_key, tag_vr FROM extended_query_tag WHERE tag_path = $1 FOR UPDATE",
        )
        .bind(path)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let key = match row {
            Some((key, stored_vr)) if stored_vr == vr.code() => key,
            _ => return Err(Error::ExtendedQueryTagNotFound(path.to_string())),
        };

        if let Some(busy_check) = queries.busy_check {
            let busy: (bool,) = sqlx::query_as(busy_check)
                .bind(key)
                .fetch_one(&mut *tx)
                .await
                .map_err(Error::Database)?;
            if busy.0 {
                return Err(Error::Busy(path.to_string()));
            }
        }

        sqlx::query("UPDATE extended_query_tag SET tag_status = $2 WHERE tag_key = $1")
            .bind(key)
            .bind(ExtendedQueryTagStatus::Deleting.as_i16())
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        // Phase 2: purge everything that references the tag.
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        let index_sql = format!("DELETE FROM {} WHERE tag_key = $1", index_table(vr.data_type()));
        let index_rows = sqlx::query(&index_sql)
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        if queries.purge_reindex_state {
            sqlx::query("DELETE FROM extended_query_tag_error WHERE tag_key = $1")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
            sqlx::query("DELETE FROM extended_query_tag_operation WHERE tag_key = $1")
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(Error::Database)?;
        }

        sqlx::query("DELETE FROM extended_query_tag WHERE tag_key = $1")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        info!(
            subsystem = "db",
            component = "tag_store",
            op = "delete_tag",
            tag_key = key,
            tag_path = path,
            index_rows,
            "Deleted extended query tag"
        );
        Ok(())
    }
}
