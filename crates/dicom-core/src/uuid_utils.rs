//! Reindex operation identifiers.
//!
//! Operation ids are UUIDv7 strings in simple (unhyphenated) form, so they
//! sort by creation time and carry the moment the operation was requested.

use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

/// Generate a new time-ordered operation id.
///
/// # Example
///
/// ```
/// use dicom_core::uuid_utils::{new_operation_id, is_operation_id};
///
/// let id = new_operation_id();
/// assert!(is_operation_id(&id));
/// ```
pub fn new_operation_id() -> String {
    Uuid::now_v7().simple().to_string()
}

/// Whether `id` parses as a UUIDv7.
pub fn is_operation_id(id: &str) -> bool {
    Uuid::parse_str(id)
        .map(|u| u.get_version_num() == 7)
        .unwrap_or(false)
}

/// Creation time embedded in an operation id.
///
/// Returns `None` if the id is not a UUIDv7.
pub fn operation_created_at(id: &str) -> Option<DateTime<Utc>> {
    let uuid = Uuid::parse_str(id).ok()?;
    let bytes = uuid.as_bytes();
    if (bytes[6] >> 4) != 7 {
        return None;
    }

    let millis = ((bytes[0] as u64) << 40)
        | ((bytes[1] as u64) << 32)
        | ((bytes[2] as u64) << 24)
        | ((bytes[3] as u64) << 16)
        | ((bytes[4] as u64) << 8)
        | (bytes[5] as u64);

    Utc.timestamp_millis_opt(millis as i64).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_operation_id_is_simple_v7() {
        let id = new_operation_id();
        assert_eq!(id.len(), 32);
        assert!(!id.contains('-'));
        assert!(is_operation_id(&id));
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let a = new_operation_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_operation_id();
        assert!(a < b);
    }

    #[test]
    fn test_created_at_is_recent() {
        let before = Utc::now() - chrono::Duration::seconds(1);
        let ts = operation_created_at(&new_operation_id()).unwrap();
        assert!(ts >= before);
        assert!(ts <= Utc::now() + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_non_v7_ids_rejected() {
        let v4 = Uuid::new_v4().to_string();
        assert!(!is_operation_id(&v4));
        assert!(operation_created_at(&v4).is_none());
        assert!(!is_operation_id("not-a-uuid"));
    }
}
