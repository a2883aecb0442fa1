//! Extended query tag error ledger.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, Row};
use tracing::debug;

use dicom_core::{
    Error, ExtendedQueryTagErrorStore, InstanceIdentifier, Result, SchemaVersion, TagError,
    TagKey, ValidationErrorCode, VersionedInstanceIdentifier,
};

use crate::map_constraint_error;

/// PostgreSQL implementation of ExtendedQueryTagErrorStore.
#[derive(Clone)]
pub struct PgExtendedQueryTagErrorStore {
    pool: Pool<Postgres>,
    version: SchemaVersion,
}

impl PgExtendedQueryTagErrorStore {
    pub fn new(pool: Pool<Postgres>, version: SchemaVersion) -> Self {
        Self { pool, version }
    }

    async fn tag_key_for_path(&self, path: &str) -> Result<TagKey> {
        let row: Option<(TagKey,)> =
            sqlx::query_as("SELECT tag_key FROM extended_query_tag WHERE tag_path = $1")
                .bind(path)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;
        row.map(|r| r.0)
            .ok_or_else(|| Error::ExtendedQueryTagNotFound(path.to_string()))
    }
}

#[async_trait]
impl ExtendedQueryTagErrorStore for PgExtendedQueryTagErrorStore {
    async fn add_error(
        &self,
        tag_key: TagKey,
        instance: &VersionedInstanceIdentifier,
        error_code: ValidationErrorCode,
        created_time: DateTime<Utc>,
    ) -> Result<i64> {
        self.version.capabilities().require_tag_errors("add_error")?;

        let id = &instance.identifier;
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO extended_query_tag_error
                 (tag_key, error_code, watermark, study_instance_uid, series_instance_uid,
                  sop_instance_uid, created_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(tag_key)
        .bind(error_code.code())
        .bind(instance.watermark)
        .bind(&id.study_instance_uid)
        .bind(&id.series_instance_uid)
        .bind(&id.sop_instance_uid)
        .bind(created_time)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match map_constraint_error(e, &format!("error for tag {} on {}", tag_key, instance)) {
            Error::NotFound(_) => Error::ExtendedQueryTagNotFound(tag_key.to_string()),
            other => other,
        })?;

        debug!(
            subsystem = "db",
            component = "tag_error_store",
            op = "add_error",
            tag_key,
            watermark = instance.watermark,
            error_code = error_code.code(),
            "Recorded tag error"
        );
        Ok(row.0)
    }

    async fn get_errors(&self, path: &str) -> Result<Vec<TagError>> {
        self.version.capabilities().require_tag_errors("get_errors")?;
        let tag_key = self.tag_key_for_path(path).await?;

        let rows = sqlx::query(
            "SELECT id, tag_key, error_code, study_instance_uid, series_instance_uid,
                    sop_instance_uid, created_time
             FROM extended_query_tag_error
             WHERE tag_key = $1
             ORDER BY created_time ASC, id ASC",
        )
        .bind(tag_key)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.into_iter()
            .map(|row| {
                let code: i16 = row.get("error_code");
                let error_code = ValidationErrorCode::from_code(code)
                    .ok_or_else(|| Error::Internal(format!("Unknown error code {}", code)))?;
                Ok(TagError {
                    id: row.get("id"),
                    tag_key: row.get("tag_key"),
                    instance: InstanceIdentifier {
                        study_instance_uid: row.get("study_instance_uid"),
                        series_instance_uid: row.get("series_instance_uid"),
                        sop_instance_uid: row.get("sop_instance_uid"),
                    },
                    error_code,
                    created_time: row.get("created_time"),
                    message: error_code.message().to_string(),
                })
            })
            .collect()
    }

    async fn delete_errors(&self, path: &str) -> Result<u64> {
        self.version.capabilities().require_tag_errors("delete_errors")?;
        let tag_key = self.tag_key_for_path(path).await?;

        let removed = sqlx::query("DELETE FROM extended_query_tag_error WHERE tag_key = $1")
            .bind(tag_key)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        debug!(
            subsystem = "db",
            component = "tag_error_store",
            op = "delete_errors",
            tag_key,
            tag_path = path,
            removed,
            "Cleared tag errors"
        );
        Ok(removed)
    }
}
