//! Watermark-ordered instance enumeration.

use async_trait::async_trait;
use sqlx::{Pool, Postgres, Row};
use tracing::trace;

use dicom_core::{
    Error, IndexStatus, InstanceIdentifier, InstanceStore, Result, VersionedInstanceIdentifier,
    WatermarkRange,
};

/// PostgreSQL implementation of InstanceStore.
#[derive(Clone)]
pub struct PgInstanceStore {
    pool: Pool<Postgres>,
}

impl PgInstanceStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
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

        // Number matching instances newest first, then group every
        // batch_size of them into one range.
        let rows = sqlx::query(
            "SELECT MIN(watermark) AS start_watermark, MAX(watermark) AS end_watermark
             FROM (
                 SELECT watermark,
                        (ROW_NUMBER() OVER (ORDER BY watermark DESC) - 1) / $1 AS batch
                 FROM instance
                 WHERE status = $3 AND ($4::BIGINT IS NULL OR watermark <= $4)
                 ORDER BY watermark DESC
                 LIMIT $1 * $2
             ) numbered
             GROUP BY batch
             ORDER BY batch",
        )
        .bind(batch_size as i64)
        .bind(batch_count as i64)
        .bind(status.as_i16())
        .bind(max_watermark)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let batches: Vec<WatermarkRange> = rows
            .iter()
            .map(|row| WatermarkRange {
                start: row.get("start_watermark"),
                end: row.get("end_watermark"),
            })
            .collect();

        trace!(
            subsystem = "db",
            component = "instance_store",
            op = "get_instance_batches",
            batch_count = batches.len(),
            max_watermark = ?max_watermark,
            "Planned instance batches"
        );
        Ok(batches)
    }

    async fn get_instance_identifiers_by_watermark_range(
        &self,
        range: WatermarkRange,
        status: IndexStatus,
    ) -> Result<Vec<VersionedInstanceIdentifier>> {
        let rows = sqlx::query(
            "SELECT study_instance_uid, series_instance_uid, sop_instance_uid, watermark
             FROM instance
             WHERE watermark BETWEEN $1 AND $2 AND status = $3
             ORDER BY watermark DESC",
        )
        .bind(range.start)
        .bind(range.end)
        .bind(status.as_i16())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .iter()
            .map(|row| {
                VersionedInstanceIdentifier::new(
                    InstanceIdentifier {
                        study_instance_uid: row.get("study_instance_uid"),
                        series_instance_uid: row.get("series_instance_uid"),
                        sop_instance_uid: row.get("sop_instance_uid"),
                    },
                    row.get("watermark"),
                )
            })
            .collect())
    }
}
