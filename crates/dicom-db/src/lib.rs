//! # dicom-db
//!
//! PostgreSQL storage layer for extended query tag reindexing.
//!
//! This crate provides:
//! - Connection pool management
//! - Schema-version resolution and per-version query selection
//! - Store implementations for tags, tag errors, instances, reindex
//!   operations and index data
//!
//! ## Example
//!
//! ```rust,ignore
//! use dicom_db::{Database, ExtendedQueryTagStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/dicom").await?;
//!     for entry in db.tags.list_tags(100, 0).await? {
//!         println!("{}", entry.definition);
//!     }
//!     Ok(())
//! }
//! ```
pub mod extended_query_tags;
pub mod index_data;
pub mod instances;
pub mod pool;
mod queries;
pub mod reindex_state;
pub mod schema_version;
pub mod tag_errors;

// Test fixtures for integration tests
// Note: On by default so integration tests (in tests/) can use it
#[cfg(feature = "test-fixtures")]
pub mod test_fixtures;

// Re-export core types
pub use dicom_core::*;

pub use extended_query_tags::PgExtendedQueryTagStore;
pub use index_data::PgIndexDataStore;
pub use instances::PgInstanceStore;
pub use pool::{connect_pool, log_pool_metrics, PoolConfig};
pub use reindex_state::PgReindexStateStore;
pub use schema_version::resolve_schema_version;
pub use tag_errors::PgExtendedQueryTagErrorStore;

/// Map constraint violations to domain errors at the store boundary.
///
/// Unique violations become `AlreadyExists`, foreign-key violations become
/// `NotFound`; anything else stays a `Database` error.
pub(crate) fn map_constraint_error(e: sqlx::Error, subject: &str) -> Error {
    if let Some(db) = e.as_database_error() {
        match db.kind() {
            sqlx::error::ErrorKind::UniqueViolation => {
                return Error::AlreadyExists(subject.to_string())
            }
            sqlx::error::ErrorKind::ForeignKeyViolation => {
                return Error::NotFound(subject.to_string())
            }
            _ => {}
        }
    }
    Error::Database(e)
}

/// Combined database context with all stores.
#[derive(Clone)]
pub struct Database {
    /// The underlying connection pool.
    pub pool: sqlx::Pool<sqlx::Postgres>,
    /// Deployed schema version every store negotiates against.
    pub schema_version: SchemaVersion,
    /// Extended query tag definitions.
    pub tags: PgExtendedQueryTagStore,
    /// Per-tag, per-instance error ledger.
    pub tag_errors: PgExtendedQueryTagErrorStore,
    /// Watermark-ordered instance enumeration.
    pub instances: PgInstanceStore,
    /// Reindex operation bindings and checkpoints.
    pub reindex: PgReindexStateStore,
    /// Index tables for tag values.
    pub index_data: PgIndexDataStore,
}

impl Database {
    /// Create a new Database from a pool and a known schema version.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>, schema_version: SchemaVersion) -> Self {
        Self {
            tags: PgExtendedQueryTagStore::new(pool.clone(), schema_version),
            tag_errors: PgExtendedQueryTagErrorStore::new(pool.clone(), schema_version),
            instances: PgInstanceStore::new(pool.clone()),
            reindex: PgReindexStateStore::new(pool.clone(), schema_version),
            index_data: PgIndexDataStore::new(pool.clone()),
            schema_version,
            pool,
        }
    }

    /// Create a Database from a pool, resolving the deployed schema version.
    pub async fn from_pool(pool: sqlx::Pool<sqlx::Postgres>) -> Result<Self> {
        let version = resolve_schema_version(&pool).await?;
        Ok(Self::new(pool, version))
    }

    /// Connect to the given URL and resolve the schema version.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, PoolConfig::default()).await
    }

    /// Connect with custom pool configuration.
    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = connect_pool(url, &config).await?;
        Self::from_pool(pool).await
    }

    /// Run pending migrations on a pool.
    #[cfg(feature = "migrations")]
    pub async fn migrate(pool: &sqlx::Pool<sqlx::Postgres>) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(pool)
            .await
            .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }

    /// Capabilities of the deployed schema.
    pub fn capabilities(&self) -> SchemaCapabilities {
        self.schema_version.capabilities()
    }
}
