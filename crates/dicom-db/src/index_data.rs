//! Per-data-type index tables for extended query tag values.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::trace;

use dicom_core::{
    Error, ExtendedQueryTagStatus, IndexDataStore, IndexDataType, IndexRow, IndexValue,
    QueryTagLevel, Result, TagKey, VersionedInstanceIdentifier,
};

/// Table holding values of one data type.
pub(crate) fn index_table(data_type: IndexDataType) -> &'static str {
    match data_type {
        IndexDataType::String => "extended_query_tag_string",
        IndexDataType::Long => "extended_query_tag_long",
        IndexDataType::Double => "extended_query_tag_double",
        IndexDataType::DateTime => "extended_query_tag_datetime",
        IndexDataType::PersonName => "extended_query_tag_person_name",
    }
}

fn value_data_type(value: &IndexValue) -> IndexDataType {
    match value {
        IndexValue::String(_) => IndexDataType::String,
        IndexValue::Long(_) => IndexDataType::Long,
        IndexValue::Double(_) => IndexDataType::Double,
        IndexValue::DateTime(_) => IndexDataType::DateTime,
        IndexValue::PersonName(_) => IndexDataType::PersonName,
    }
}

/// Upsert statement for one table. A row written by a newer instance is
/// never overwritten by an older one at study or series level.
fn upsert_sql(table: &str) -> String {
    format!(
        "INSERT INTO {table}
             (tag_key, study_instance_uid, series_instance_uid, sop_instance_uid, watermark, tag_value)
         VALUES ($1, $2, $3, $4, $5, $6)
         ON CONFLICT (tag_key, study_instance_uid, series_instance_uid, sop_instance_uid)
         DO UPDATE SET tag_value = EXCLUDED.tag_value, watermark = EXCLUDED.watermark
         WHERE {table}.watermark <= EXCLUDED.watermark"
    )
}

/// PostgreSQL implementation of IndexDataStore.
#[derive(Clone)]
pub struct PgIndexDataStore {
    pool: Pool<Postgres>,
}

impl PgIndexDataStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IndexDataStore for PgIndexDataStore {
    async fn write_index_rows(
        &self,
        instance: &VersionedInstanceIdentifier,
        rows: &[IndexRow],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let id = &instance.identifier;
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Rows of deleted tags are dropped; a delete that starts now waits on
        // the share lock and purges these rows afterwards.
        let keys: Vec<TagKey> = rows.iter().map(|r| r.tag_key).collect();
        let live: Vec<(TagKey,)> = sqlx::query_as(
            "SELECT tag_key FROM extended_query_tag
             WHERE tag_key = ANY($1) AND tag_status <> $2
             FOR SHARE",
        )
        .bind(&keys)
        .bind(ExtendedQueryTagStatus::Deleting.as_i16())
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        let live: HashSet<TagKey> = live.into_iter().map(|r| r.0).collect();

        let mut written = 0usize;
        for row in rows.iter().filter(|r| live.contains(&r.tag_key)) {
            written += 1;
            let (series, sop) = match row.level {
                QueryTagLevel::Study => ("", ""),
                QueryTagLevel::Series => (id.series_instance_uid.as_str(), ""),
                QueryTagLevel::Instance => (
                    id.series_instance_uid.as_str(),
                    id.sop_instance_uid.as_str(),
                ),
            };
            let sql = upsert_sql(index_table(value_data_type(&row.value)));
            let query = sqlx::query(&sql)
                .bind(row.tag_key)
                .bind(&id.study_instance_uid)
                .bind(series)
                .bind(sop)
                .bind(instance.watermark);
            let query = match &row.value {
                IndexValue::String(v) | IndexValue::PersonName(v) => query.bind(v.as_str()),
                IndexValue::Long(v) => query.bind(*v),
                IndexValue::Double(v) => query.bind(*v),
                IndexValue::DateTime(v) => query.bind(*v),
            };
            query.execute(&mut *tx).await.map_err(Error::Database)?;
        }

        tx.commit().await.map_err(Error::Database)?;

        trace!(
            subsystem = "db",
            component = "index_store",
            op = "write_index_rows",
            watermark = instance.watermark,
            row_count = written,
            dropped = rows.len() - written,
            "Wrote index rows"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_data_type_has_a_table() {
        let tables: std::collections::HashSet<&str> = [
            IndexDataType::String,
            IndexDataType::Long,
            IndexDataType::Double,
            IndexDataType::DateTime,
            IndexDataType::PersonName,
        ]
        .into_iter()
        .map(index_table)
        .collect();
        assert_eq!(tables.len(), 5);
    }

    #[test]
    fn test_upsert_keeps_newest_value() {
        let sql = upsert_sql("extended_query_tag_long");
        assert!(sql.contains("ON CONFLICT"));
        assert!(sql.contains("extended_query_tag_long.watermark <= EXCLUDED.watermark"));
    }
}
