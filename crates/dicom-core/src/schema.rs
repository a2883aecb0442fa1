//! Schema versions and the capabilities each one exposes.
//!
//! Stores negotiate behavior against the deployed schema version through
//! [`SchemaCapabilities`] instead of per-version store types.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A deployed database schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SchemaVersion {
    V1,
    V2,
    V3,
    V4,
    V5,
}

impl SchemaVersion {
    pub const MIN: SchemaVersion = SchemaVersion::V1;
    pub const MAX: SchemaVersion = SchemaVersion::V5;

    pub fn as_i32(self) -> i32 {
        match self {
            SchemaVersion::V1 => 1,
            SchemaVersion::V2 => 2,
            SchemaVersion::V3 => 3,
            SchemaVersion::V4 => 4,
            SchemaVersion::V5 => 5,
        }
    }

    pub fn from_i32(v: i32) -> Result<Self> {
        match v {
            1 => Ok(SchemaVersion::V1),
            2 => Ok(SchemaVersion::V2),
            3 => Ok(SchemaVersion::V3),
            4 => Ok(SchemaVersion::V4),
            5 => Ok(SchemaVersion::V5),
            other => Err(Error::Config(format!(
                "Schema version {} is outside the supported range {}..={}",
                other,
                Self::MIN.as_i32(),
                Self::MAX.as_i32()
            ))),
        }
    }

    pub fn capabilities(self) -> SchemaCapabilities {
        SCHEMA_CAPABILITIES[(self.as_i32() - 1) as usize]
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.as_i32())
    }
}

/// Feature flags of one schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaCapabilities {
    pub version: SchemaVersion,
    /// Delete refuses tags bound to an active reindex operation.
    pub delete_reports_busy: bool,
    /// Add returns the stored rows with their assigned keys.
    pub add_returns_keys: bool,
    /// Reindex operation and tag error tables exist.
    pub reindex_operations: bool,
    pub tag_errors: bool,
    /// Tag rows carry a version stamp.
    pub tag_versions: bool,
}

/// Capability table indexed by `version - 1`.
pub const SCHEMA_CAPABILITIES: [SchemaCapabilities; 5] = [
    SchemaCapabilities {
        version: SchemaVersion::V1,
        delete_reports_busy: false,
        add_returns_keys: false,
        reindex_operations: false,
        tag_errors: false,
        tag_versions: false,
    },
    SchemaCapabilities {
        version: SchemaVersion::V2,
        delete_reports_busy: true,
        add_returns_keys: false,
        reindex_operations: false,
        tag_errors: false,
        tag_versions: false,
    },
    SchemaCapabilities {
        version: SchemaVersion::V3,
        delete_reports_busy: true,
        add_returns_keys: true,
        reindex_operations: false,
        tag_errors: false,
        tag_versions: false,
    },
    SchemaCapabilities {
        version: SchemaVersion::V4,
        delete_reports_busy: true,
        add_returns_keys: true,
        reindex_operations: true,
        tag_errors: true,
        tag_versions: false,
    },
    SchemaCapabilities {
        version: SchemaVersion::V5,
        delete_reports_busy: true,
        add_returns_keys: true,
        reindex_operations: true,
        tag_errors: true,
        tag_versions: true,
    },
];

impl SchemaCapabilities {
    /// Fail with `Config` when the reindex tables are unavailable.
    pub fn require_reindex(&self, operation: &str) -> Result<()> {
        if self.reindex_operations {
            Ok(())
        } else {
            Err(unsupported(self.version, operation))
        }
    }

    /// Fail with `Config` when the tag error table is unavailable.
    pub fn require_tag_errors(&self, operation: &str) -> Result<()> {
        if self.tag_errors {
            Ok(())
        } else {
            Err(unsupported(self.version, operation))
        }
    }
}

fn unsupported(version: SchemaVersion, operation: &str) -> Error {
    Error::Config(format!(
        "Operation '{}' is not supported by schema {}",
        operation, version
    ))
}
