//! # dicom-jobs
//!
//! Reindex orchestration for extended query tags.
//!
//! This crate provides:
//! - The instance reindexer that turns stored metadata into index rows
//! - A checkpointing orchestrator that walks stored instances newest first
//! - A worker host that tracks orchestrations and resumes them on startup
//! - Operator services for registering, inspecting, pausing and deleting tags
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dicom_db::Database;
//! use dicom_jobs::{
//!     ExtendedQueryTagService, FilesystemMetadataStore, ReindexStores, WorkerBuilder,
//! };
//!
//! let db = Database::connect("postgres://...").await?;
//! let stores = ReindexStores::from_database(&db, Arc::new(FilesystemMetadataStore::new("/data")));
//!
//! let handle = WorkerBuilder::new(stores).build().start();
//! let service = ExtendedQueryTagService::new(
//!     Arc::new(db.tags.clone()),
//!     Arc::new(db.tag_errors.clone()),
//!     Arc::new(db.reindex.clone()),
//!     db.capabilities(),
//! )
//! .with_client(handle.client());
//!
//! let response = service.add_extended_query_tags(entries).await?;
//! if let Some(id) = response.operation_id {
//!     println!("{:?}", service.get_operation_status(&id).await?);
//! }
//!
//! handle.shutdown().await?;
//! ```

pub mod activity;
pub mod config;
pub mod metadata;
pub mod orchestrator;
pub mod reindexer;
pub mod services;
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-export core types
pub use dicom_core::*;

pub use activity::run_activity;
pub use config::{ReindexConfig, RetryPolicy};
pub use metadata::FilesystemMetadataStore;
pub use orchestrator::{OrchestratorState, ReindexOrchestrator, ReindexOutcome, ReindexStores};
pub use reindexer::MetadataReindexer;
pub use services::{AddTagsResponse, ExtendedQueryTagService};
pub use worker::{
    ReindexClient, ReindexWorker, WorkerBuilder, WorkerConfig, WorkerEvent, WorkerHandle,
};
