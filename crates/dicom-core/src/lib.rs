//! # dicom-core
//!
//! Core types, traits, and abstractions for extended query tag reindexing.
//!
//! This crate provides the domain model (tags, watermark ranges, reindex
//! operations, tag errors), value validation, and the store traits that the
//! database and job crates implement and drive.

pub mod defaults;
pub mod error;
pub mod logging;
pub mod mock;
pub mod models;
pub mod progress;
pub mod schema;
pub mod tag_path;
pub mod traits;
pub mod uuid_utils;
pub mod validation;
pub mod vr;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use models::*;
pub use progress::{operation_status, percent_complete};
pub use schema::{SchemaCapabilities, SchemaVersion};
pub use tag_path::{normalize_path, parse_tag_path, validate_new_tag, DicomTag};
pub use traits::*;
pub use uuid_utils::new_operation_id;
pub use validation::{extract_index_value, ValidationError, ValidationErrorCode};
pub use vr::{IndexDataType, ValueRepresentation};
