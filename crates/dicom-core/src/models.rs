//! Core data models for extended query tags and reindex operations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::validation::ValidationErrorCode;
use crate::vr::ValueRepresentation;

/// Stable integer identity of an extended query tag.
pub type TagKey = i32;

/// Lowest watermark ever assigned to an instance.
pub const MIN_WATERMARK: i64 = 1;

// =============================================================================
// TAG DEFINITIONS
// =============================================================================

/// Level at which a tag's value is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryTagLevel {
    Study,
    Series,
    Instance,
}

impl QueryTagLevel {
    pub fn as_i16(self) -> i16 {
        match self {
            QueryTagLevel::Instance => 0,
            QueryTagLevel::Series => 1,
            QueryTagLevel::Study => 2,
        }
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(QueryTagLevel::Instance),
            1 => Ok(QueryTagLevel::Series),
            2 => Ok(QueryTagLevel::Study),
            other => Err(Error::Internal(format!("Unknown tag level {}", other))),
        }
    }
}

impl FromStr for QueryTagLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "study" => Ok(QueryTagLevel::Study),
            "series" => Ok(QueryTagLevel::Series),
            "instance" => Ok(QueryTagLevel::Instance),
            _ => Err(Error::InvalidInput(format!("Unknown tag level '{}'", s))),
        }
    }
}

impl fmt::Display for QueryTagLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueryTagLevel::Study => "Study",
            QueryTagLevel::Series => "Series",
            QueryTagLevel::Instance => "Instance",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of an extended query tag.
///
/// Transitions are `Adding -> Ready` and `Adding | Ready -> Deleting`;
/// a tag never returns to `Adding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtendedQueryTagStatus {
    Adding,
    Ready,
    Deleting,
}

impl ExtendedQueryTagStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            ExtendedQueryTagStatus::Adding => 0,
            ExtendedQueryTagStatus::Ready => 1,
            ExtendedQueryTagStatus::Deleting => 2,
        }
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(ExtendedQueryTagStatus::Adding),
            1 => Ok(ExtendedQueryTagStatus::Ready),
            2 => Ok(ExtendedQueryTagStatus::Deleting),
            other => Err(Error::Internal(format!("Unknown tag status {}", other))),
        }
    }
}

/// Whether a tag may be used in queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryStatus {
    Disabled,
    #[default]
    Enabled,
}

impl QueryStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            QueryStatus::Disabled => 0,
            QueryStatus::Enabled => 1,
        }
    }

    pub fn from_i16(v: i16) -> Self {
        if v == 0 {
            QueryStatus::Disabled
        } else {
            QueryStatus::Enabled
        }
    }
}

/// Opaque stamp of the last schema write to a tag row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TagVersion(pub i64);

/// A registered extended query tag as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDefinition {
    pub key: TagKey,
    /// Normalized eight-hex-digit attribute path.
    pub path: String,
    pub vr: ValueRepresentation,
    pub private_creator: Option<String>,
    pub level: QueryTagLevel,
    pub status: ExtendedQueryTagStatus,
    pub query_status: QueryStatus,
    /// Present only on schemas that stamp tag writes.
    pub version: Option<TagVersion>,
}

impl fmt::Display for TagDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Key: {}, Path: {}, VR: {}, PrivateCreator: {}, Level: {}, Status: {:?}",
            self.key,
            self.path,
            self.vr,
            self.private_creator.as_deref().unwrap_or(""),
            self.level,
            self.status
        )
    }
}

/// Operator input for registering a tag, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddExtendedQueryTagEntry {
    pub path: String,
    pub vr: String,
    pub private_creator: Option<String>,
    pub level: String,
}

/// A validated tag ready to be inserted by the tag store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTagDefinition {
    pub path: String,
    pub vr: ValueRepresentation,
    pub private_creator: Option<String>,
    pub level: QueryTagLevel,
}

/// Tag definition joined with its error count and active operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagEntry {
    #[serde(flatten)]
    pub definition: TagDefinition,
    pub error_count: i64,
    pub operation_id: Option<String>,
}

// =============================================================================
// INSTANCES AND WATERMARKS
// =============================================================================

/// Closed interval `[start, end]` over instance watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatermarkRange {
    pub start: i64,
    pub end: i64,
}

impl WatermarkRange {
    /// Create a range, rejecting `start > end`.
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(Error::InvalidInput(format!(
                "Watermark range start {} is greater than end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    /// A range covering exactly one watermark.
    pub fn single(watermark: i64) -> Self {
        Self {
            start: watermark,
            end: watermark,
        }
    }

    /// Number of watermarks covered.
    pub fn count(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn contains(&self, watermark: i64) -> bool {
        watermark >= self.start && watermark <= self.end
    }
}

impl fmt::Display for WatermarkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Index status of a stored instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexStatus {
    Creating,
    Created,
}

impl IndexStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            IndexStatus::Creating => 0,
            IndexStatus::Created => 1,
        }
    }
}

/// Study/Series/SOP instance UID triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceIdentifier {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub sop_instance_uid: String,
}

impl InstanceIdentifier {
    pub fn new(
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
        sop_instance_uid: impl Into<String>,
    ) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: series_instance_uid.into(),
            sop_instance_uid: sop_instance_uid.into(),
        }
    }
}

/// An instance identifier together with its watermark.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionedInstanceIdentifier {
    #[serde(flatten)]
    pub identifier: InstanceIdentifier,
    pub watermark: i64,
}

impl VersionedInstanceIdentifier {
    pub fn new(identifier: InstanceIdentifier, watermark: i64) -> Self {
        Self {
            identifier,
            watermark,
        }
    }
}

impl fmt::Display for VersionedInstanceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}@{}",
            self.identifier.study_instance_uid,
            self.identifier.series_instance_uid,
            self.identifier.sop_instance_uid,
            self.watermark
        )
    }
}

/// One attribute of a stored instance, in DICOM JSON shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DicomElement {
    pub vr: String,
    #[serde(rename = "Value", default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<JsonValue>,
}

/// Already-persisted attribute set of an instance, keyed by eight-digit tag path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceMetadata {
    pub elements: BTreeMap<String, DicomElement>,
}

impl InstanceMetadata {
    pub fn get(&self, path: &str) -> Option<&DicomElement> {
        self.elements.get(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, vr: &str, values: Vec<JsonValue>) {
        self.elements.insert(
            path.into(),
            DicomElement {
                vr: vr.to_string(),
                values,
            },
        );
    }
}

/// A typed value extracted for an index table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexValue {
    String(String),
    Long(i64),
    Double(f64),
    DateTime(NaiveDateTime),
    PersonName(String),
}

/// One index row produced by reindexing an instance for a tag.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    pub tag_key: TagKey,
    pub level: QueryTagLevel,
    pub value: IndexValue,
}

// =============================================================================
// TAG ERRORS
// =============================================================================

/// A recorded failure to index one instance for one tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagError {
    pub id: i64,
    pub tag_key: TagKey,
    #[serde(flatten)]
    pub instance: InstanceIdentifier,
    pub error_code: ValidationErrorCode,
    pub created_time: DateTime<Utc>,
    pub message: String,
}

/// A tag that could not be indexed for one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagIndexFailure {
    pub tag_key: TagKey,
    pub code: ValidationErrorCode,
    pub detail: String,
}

// =============================================================================
// REINDEX OPERATIONS
// =============================================================================

/// Binding status of one tag within a reindex operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReindexStatus {
    Processing,
    Paused,
    Completed,
}

impl ReindexStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            ReindexStatus::Processing => 0,
            ReindexStatus::Paused => 1,
            ReindexStatus::Completed => 2,
        }
    }

    pub fn from_i16(v: i16) -> Result<Self> {
        match v {
            0 => Ok(ReindexStatus::Processing),
            1 => Ok(ReindexStatus::Paused),
            2 => Ok(ReindexStatus::Completed),
            other => Err(Error::Internal(format!("Unknown reindex status {}", other))),
        }
    }
}

/// Overall runtime status of a reindex operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationRuntimeStatus {
    Running,
    Completed,
    Cancelled,
}

impl OperationRuntimeStatus {
    /// Derive the operation status from the statuses of its tag bindings.
    pub fn from_entries<I: IntoIterator<Item = ReindexStatus>>(statuses: I) -> Self {
        let mut any_completed = false;
        for status in statuses {
            match status {
                ReindexStatus::Processing => return OperationRuntimeStatus::Running,
                ReindexStatus::Completed => any_completed = true,
                ReindexStatus::Paused => {}
            }
        }
        if any_completed {
            OperationRuntimeStatus::Completed
        } else {
            OperationRuntimeStatus::Cancelled
        }
    }
}

/// A persisted tag-to-operation binding with its uncovered range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexEntry {
    pub operation_id: String,
    pub tag_key: TagKey,
    pub status: ReindexStatus,
    /// Floor of the range (inclusive).
    pub start_watermark: i64,
    /// Highest watermark not yet covered; below `start_watermark` once done.
    pub end_watermark: i64,
    /// Highest watermark captured when the operation was prepared.
    pub max_watermark: Option<i64>,
}

/// Snapshot of a reindex operation as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReindexOperation {
    pub operation_id: String,
    /// Tags still being processed by this operation.
    pub tags: Vec<TagDefinition>,
    pub status: OperationRuntimeStatus,
    /// Full interval `[floor, max]` captured at prepare; `None` when no instance existed.
    pub target: Option<WatermarkRange>,
    /// Uncovered interval; `None` once everything in `target` is covered.
    pub remaining: Option<WatermarkRange>,
}

impl ReindexOperation {
    /// Build an operation snapshot from its floor, remaining end and captured max.
    pub fn from_watermarks(
        operation_id: impl Into<String>,
        tags: Vec<TagDefinition>,
        status: OperationRuntimeStatus,
        start_watermark: i64,
        end_watermark: i64,
        max_watermark: Option<i64>,
    ) -> Self {
        let target = max_watermark
            .filter(|max| *max >= start_watermark)
            .map(|max| WatermarkRange {
                start: start_watermark,
                end: max,
            });
        let remaining = target.and_then(|_| {
            (end_watermark >= start_watermark).then_some(WatermarkRange {
                start: start_watermark,
                end: end_watermark,
            })
        });
        Self {
            operation_id: operation_id.into(),
            tags,
            status,
            target,
            remaining,
        }
    }

    /// Aggregate the persisted bindings of one operation.
    ///
    /// Processing bindings share one range; when none remain the range of all
    /// bindings is reported. `tags` should hold the processing tags.
    pub fn from_entries(
        operation_id: impl Into<String>,
        entries: &[ReindexEntry],
        tags: Vec<TagDefinition>,
    ) -> Option<Self> {
        if entries.is_empty() {
            return None;
        }
        let processing: Vec<&ReindexEntry> = entries
            .iter()
            .filter(|e| e.status == ReindexStatus::Processing)
            .collect();
        let basis: Vec<&ReindexEntry> = if processing.is_empty() {
            entries.iter().collect()
        } else {
            processing
        };

        let start = basis
            .iter()
            .map(|e| e.start_watermark)
            .min()
            .unwrap_or(MIN_WATERMARK);
        let end = basis.iter().map(|e| e.end_watermark).max().unwrap_or(start - 1);
        let max = basis.iter().filter_map(|e| e.max_watermark).max();
        let status = OperationRuntimeStatus::from_entries(entries.iter().map(|e| e.status));

        Some(Self::from_watermarks(operation_id, tags, status, start, end, max))
    }

    /// Cumulative covered interval `[lowest processed, max]`.
    pub fn completed(&self) -> Option<WatermarkRange> {
        let target = self.target?;
        match self.remaining {
            None => Some(target),
            Some(remaining) if remaining.end >= target.end => None,
            Some(remaining) => Some(WatermarkRange {
                start: remaining.end + 1,
                end: target.end,
            }),
        }
    }

    /// Whether every watermark down to the floor has been covered.
    pub fn is_fully_covered(&self) -> bool {
        self.remaining.is_none()
    }

    pub fn tag_keys(&self) -> Vec<TagKey> {
        self.tags.iter().map(|t| t.key).collect()
    }
}

/// Point-in-time status of an operation for polling callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub operation_id: String,
    pub status: OperationRuntimeStatus,
    pub percent_complete: u8,
    pub resource_ids: Option<Vec<String>>,
}
