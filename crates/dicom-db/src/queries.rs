//! Per-schema-version SQL for the tag store.
//!
//! Each schema version selects one [`TagQueries`] row; the store never
//! branches on the version itself.

use dicom_core::SchemaVersion;

/// Query text and flags used by the tag store for one schema version.
#[derive(Debug)]
pub(crate) struct TagQueries {
    /// Projection of a tag entry; callers append a WHERE/ORDER clause.
    pub select_entry: &'static str,
    /// Status a freshly added tag starts in.
    pub initial_status: i16,
    /// Busy check for delete, taking the tag key as `$1`.
    pub busy_check: Option<&'static str>,
    /// Whether delete also purges errors and reindex bindings.
    pub purge_reindex_state: bool,
}

const SELECT_ENTRY_BASE: &str = "
    SELECT t.tag_key, t.tag_path, t.tag_vr, t.tag_private_creator, t.tag_level,
           t.tag_status, t.query_status,
           NULL::BIGINT AS tag_version,
           0::BIGINT AS error_count,
           NULL::VARCHAR AS operation_id
    FROM extended_query_tag t";

const SELECT_ENTRY_WITH_OPERATIONS: &str = "
    SELECT t.tag_key, t.tag_path, t.tag_vr, t.tag_private_creator, t.tag_level,
           t.tag_status, t.query_status,
           NULL::BIGINT AS tag_version,
           (SELECT COUNT(*) FROM extended_query_tag_error e WHERE e.tag_key = t.tag_key) AS error_count,
           (SELECT o.operation_id FROM extended_query_tag_operation o
             WHERE o.tag_key = t.tag_key AND o.status = 0) AS operation_id
    FROM extended_query_tag t";

const SELECT_ENTRY_VERSIONED: &str = "
    SELECT t.tag_key, t.tag_path, t.tag_vr, t.tag_private_creator, t.tag_level,
           t.tag_status, t.query_status,
           t.tag_version,
           (SELECT COUNT(*) FROM extended_query_tag_error e WHERE e.tag_key = t.tag_key) AS error_count,
           (SELECT o.operation_id FROM extended_query_tag_operation o
             WHERE o.tag_key = t.tag_key AND o.status = 0) AS operation_id
    FROM extended_query_tag t";

const BUSY_WHILE_ADDING: &str =
    "SELECT EXISTS (SELECT 1 FROM extended_query_tag WHERE tag_key = $1 AND tag_status = 0)";

const BUSY_WHILE_BOUND: &str =
    "SELECT EXISTS (SELECT 1 FROM extended_query_tag_operation WHERE tag_key = $1 AND status = 0)";

// Before reindex operations existed, tags were indexed at ingest and
// became Ready immediately.
static TAG_QUERIES: [TagQueries; 5] = [
    TagQueries {
        select_entry: SELECT_ENTRY_BASE,
        initial_status: 1,
        busy_check: None,
        purge_reindex_state: false,
    },
    TagQueries {
        select_entry: SELECT_ENTRY_BASE,
        initial_status: 1,
        busy_check: Some(BUSY_WHILE_ADDING),
        purge_reindex_state: false,
    },
    TagQueries {
        select_entry: SELECT_ENTRY_BASE,
        initial_status: 1,
        busy_check: Some(BUSY_WHILE_ADDING),
        purge_reindex_state: false,
    },
    TagQueries {
        select_entry: SELECT_ENTRY_WITH_OPERATIONS,
        initial_status: 0,
        busy_check: Some(BUSY_WHILE_BOUND),
        purge_reindex_state: true,
    },
    TagQueries {
        select_entry: SELECT_ENTRY_VERSIONED,
        initial_status: 0,
        busy_check: Some(BUSY_WHILE_BOUND),
        purge_reindex_state: true,
    },
];

pub(crate) fn tag_queries(version: SchemaVersion) -> &'static TagQueries {
    &TAG_QUERIES[(version.as_i32() - 1) as usize]
}
