//! Operation progress reporting.

use crate::models::{OperationStatus, ReindexOperation};

/// Percentage of the target interval already covered.
///
/// With the completed range `[start, end]` this is
/// `floor(100 * (end - start + 1) / end)`, clamped to `0..=100`. An
/// operation with nothing left to cover, including one that found no
/// instances at prepare, is at 100.
pub fn percent_complete(operation: &ReindexOperation) -> u8 {
    if operation.is_fully_covered() {
        return 100;
    }
    let Some(completed) = operation.completed() else {
        return 0;
    };
    if completed.end <= 0 {
        return 0;
    }
    let covered = completed.count().max(0);
    let percent = (100 * covered) / completed.end;
    percent.clamp(0, 100) as u8
}

/// Tag paths still outstanding on the operation, or `None` when there are none.
pub fn resource_ids(operation: &ReindexOperation) -> Option<Vec<String>> {
    if operation.tags.is_empty() {
        None
    } else {
        Some(operation.tags.iter().map(|t| t.path.clone()).collect())
    }
}

/// Snapshot the operation for a polling caller.
pub fn operation_status(operation: &ReindexOperation) -> OperationStatus {
    OperationStatus {
        operation_id: operation.operation_id.clone(),
        status: operation.status,
        percent_complete: percent_complete(operation),
        resource_ids: resource_ids(operation),
    }
}
