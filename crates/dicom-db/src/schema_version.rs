//! Resolution of the deployed schema version.

use sqlx::{Pool, Postgres};
use tracing::info;

use dicom_core::{Error, Result, SchemaVersion};

/// Read the highest applied schema version.
///
/// Fails with `Config` when no version is recorded or the recorded version
/// is outside the supported range.
pub async fn resolve_schema_version(pool: &Pool<Postgres>) -> Result<SchemaVersion> {
    let row: (Option<i32>,) = sqlx::query_as("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(Error::Database)?;

    let version = row
        .0
        .ok_or_else(|| Error::Config("No schema version has been applied".to_string()))
        .and_then(SchemaVersion::from_i32)?;

    info!(
        subsystem = "db",
        component = "schema",
        op = "resolve",
        schema_version = version.as_i32(),
        "Resolved deployed schema version"
    );
    Ok(version)
}
