//! Per-VR validation of attribute values and conversion into index values.
//!
//! Validation failures are data, not faults: they are returned as
//! [`ValidationError`] and recorded in the tag error ledger by the caller.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::{DicomElement, IndexValue};
use crate::vr::{IndexDataType, ValueRepresentation};

/// Maximum number of component groups in a person name.
pub const PERSON_NAME_MAX_GROUPS: usize = 3;
/// Maximum length of one person name component group.
pub const PERSON_NAME_GROUP_MAX_LENGTH: usize = 64;
/// Maximum number of components in one person name group.
pub const PERSON_NAME_MAX_COMPONENTS: usize = 5;

static UID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(0|[1-9][0-9]*)(\.(0|[1-9][0-9]*))*$").expect("valid uid regex"));

static AGE_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{3}[DWMY]$").expect("valid age regex"));

static CODE_STRING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z0-9_ ]*$").expect("valid code string regex"));

static DECIMAL_STRING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[+-]?([0-9]+\.?[0-9]*|\.[0-9]+)([eE][+-]?[0-9]+)?$").expect("valid ds regex")
});

static DATE_TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]{4})([0-9]{2})?([0-9]{2})?([0-9]{2})?([0-9]{2})?([0-9]{2})?(\.[0-9]{1,6})?([+-][0-9]{4})?$")
        .expect("valid datetime regex")
});

static TIME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]{2})([0-9]{2})?([0-9]{2})?(\.[0-9]{1,6})?$").expect("valid time regex")
});

/// Why a value could not be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationErrorCode {
    None,
    MultiValues,
    ExceedMaxLength,
    UnexpectedLength,
    InvalidCharacters,
    UnexpectedVR,
    PersonNameExceedMaxGroups,
    PersonNameGroupExceedMaxLength,
    PersonNameExceedMaxComponents,
    DateIsInvalid,
    DateTimeIsInvalid,
    TimeIsInvalid,
    UidIsInvalid,
    /// The instance as a whole could not be reindexed.
    InstanceReindexFailed,
}

impl ValidationErrorCode {
    pub const ALL: [ValidationErrorCode; 14] = [
        Self::None,
        Self::MultiValues,
        Self::ExceedMaxLength,
        Self::UnexpectedLength,
        Self::InvalidCharacters,
        Self::UnexpectedVR,
        Self::PersonNameExceedMaxGroups,
        Self::PersonNameGroupExceedMaxLength,
        Self::PersonNameExceedMaxComponents,
        Self::DateIsInvalid,
        Self::DateTimeIsInvalid,
        Self::TimeIsInvalid,
        Self::UidIsInvalid,
        Self::InstanceReindexFailed,
    ];

    /// Stable numeric code persisted in the error ledger.
    pub fn code(self) -> i16 {
        match self {
            Self::None => 0,
            Self::MultiValues => 1,
            Self::ExceedMaxLength => 2,
            Self::UnexpectedLength => 3,
            Self::InvalidCharacters => 4,
            Self::UnexpectedVR => 5,
            Self::PersonNameExceedMaxGroups => 1001,
            Self::PersonNameGroupExceedMaxLength => 1002,
            Self::PersonNameExceedMaxComponents => 1003,
            Self::DateIsInvalid => 1101,
            Self::DateTimeIsInvalid => 1201,
            Self::TimeIsInvalid => 1301,
            Self::UidIsInvalid => 1401,
            Self::InstanceReindexFailed => 2001,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Operator-facing message for the code.
    pub fn message(self) -> &'static str {
        match self {
            Self::None => "",
            Self::MultiValues => "Dicom element has multiple values. We only index single value.",
            Self::ExceedMaxLength => "Value exceeds maximum length.",
            Self::UnexpectedLength => "Value length is not expected.",
            Self::InvalidCharacters => "Value contains invalid character.",
            Self::UnexpectedVR => "Value representation is not expected.",
            Self::PersonNameExceedMaxGroups => "Value contains more than 3 groups.",
            Self::PersonNameGroupExceedMaxLength => "One or more group of person name exceeds maximum length of 64.",
            Self::PersonNameExceedMaxComponents => "One or more group of person name contains more than 5 components.",
            Self::DateIsInvalid => "Value is not a valid date.",
            Self::DateTimeIsInvalid => "Value is not a valid date time.",
            Self::TimeIsInvalid => "Value is not a valid time.",
            Self::UidIsInvalid => "Value is not a valid UID.",
            Self::InstanceReindexFailed => "Instance could not be reindexed.",
        }
    }
}

impl fmt::Display for ValidationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A value that failed validation for its tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub code: ValidationErrorCode,
    pub detail: String,
}

impl ValidationError {
    fn new(code: ValidationErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code.message(), self.detail)
    }
}

impl std::error::Error for ValidationError {}

/// Validate an element against the expected VR and extract its index value.
///
/// Returns `Ok(None)` for an absent or empty value.
pub fn extract_index_value(
    expected: ValueRepresentation,
    element: &DicomElement,
) -> Result<Option<IndexValue>, ValidationError> {
    if !element.vr.eq_ignore_ascii_case(expected.code()) {
        return Err(ValidationError::new(
            ValidationErrorCode::UnexpectedVR,
            format!("expected {}, found {}", expected, element.vr),
        ));
    }

    let value = match element.values.as_slice() {
        [] => return Ok(None),
        [single] => single,
        _ => {
            return Err(ValidationError::new(
                ValidationErrorCode::MultiValues,
                format!("{} values", element.values.len()),
            ))
        }
    };
    if value.is_null() {
        return Ok(None);
    }

    match expected.data_type() {
        IndexDataType::String => validate_string(expected, value),
        IndexDataType::Long => validate_long(expected, value),
        IndexDataType::Double => validate_double(value),
        IndexDataType::DateTime => validate_date_time(expected, value),
        IndexDataType::PersonName => validate_person_name(value),
    }
}

fn text_of(value: &JsonValue) -> Result<String, ValidationError> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        other => Err(ValidationError::new(
            ValidationErrorCode::InvalidCharacters,
            format!("unexpected JSON value {}", other),
        )),
    }
}

fn has_control_or_backslash(s: &str) -> bool {
    s.chars()
        .any(|c| c == '\\' || (c.is_control() && c != '\u{1b}'))
}

fn check_max_length(vr: ValueRepresentation, s: &str) -> Result<(), ValidationError> {
    if let Some(max) = vr.max_length() {
        let len = s.chars().count();
        if len > max {
            return Err(ValidationError::new(
                ValidationErrorCode::ExceedMaxLength,
                format!("length {} exceeds {}", len, max),
            ));
        }
    }
    Ok(())
}

fn validate_string(
    vr: ValueRepresentation,
    value: &JsonValue,
) -> Result<Option<IndexValue>, ValidationError> {
    let raw = text_of(value)?;
    let s = raw.trim_end_matches([' ', '\0']);
    let s = if vr == ValueRepresentation::UI { s } else { s.trim_start() };
    if s.is_empty() {
        return Ok(None);
    }

    check_max_length(vr, s)?;

    let invalid_chars = || ValidationError::new(ValidationErrorCode::InvalidCharacters, s.to_string());
    match vr {
        ValueRepresentation::AS => {
            if s.len() != 4 {
                return Err(ValidationError::new(
                    ValidationErrorCode::UnexpectedLength,
                    format!("length {} is not 4", s.len()),
                ));
            }
            if !AGE_STRING.is_match(s) {
                return Err(invalid_chars());
            }
        }
        ValueRepresentation::CS => {
            if !CODE_STRING.is_match(s) {
                return Err(invalid_chars());
            }
        }
        ValueRepresentation::DS => {
            if !DECIMAL_STRING.is_match(s) {
                return Err(invalid_chars());
            }
        }
        ValueRepresentation::UI => {
            if !UID.is_match(s) {
                return Err(ValidationError::new(
                    ValidationErrorCode::UidIsInvalid,
                    s.to_string(),
                ));
            }
        }
        _ => {
            if has_control_or_backslash(s) {
                return Err(invalid_chars());
            }
        }
    }

    Ok(Some(IndexValue::String(s.to_string())))
}

fn validate_long(
    vr: ValueRepresentation,
    value: &JsonValue,
) -> Result<Option<IndexValue>, ValidationError> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Ok(None);
            }
            check_max_length(vr, s)?;
            s.parse::<i64>().ok()
        }
        _ => None,
    };
    let n = parsed.ok_or_else(|| {
        ValidationError::new(ValidationErrorCode::InvalidCharacters, value.to_string())
    })?;

    let (min, max) = match vr {
        ValueRepresentation::SS => (i16::MIN as i64, i16::MAX as i64),
        ValueRepresentation::US => (0, u16::MAX as i64),
        ValueRepresentation::SL => (i32::MIN as i64, i32::MAX as i64),
        ValueRepresentation::UL => (0, u32::MAX as i64),
        ValueRepresentation::IS => (i32::MIN as i64, i32::MAX as i64),
        _ => (i64::MIN, i64::MAX),
    };
    if n < min || n > max {
        return Err(ValidationError::new(
            ValidationErrorCode::UnexpectedLength,
            format!("{} is out of range for {}", n, vr),
        ));
    }
    Ok(Some(IndexValue::Long(n)))
}

fn validate_double(value: &JsonValue) -> Result<Option<IndexValue>, ValidationError> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(f) if f.is_finite() => Ok(Some(IndexValue::Double(f))),
        _ => Err(ValidationError::new(
            ValidationErrorCode::InvalidCharacters,
            value.to_string(),
        )),
    }
}

fn validate_date_time(
    vr: ValueRepresentation,
    value: &JsonValue,
) -> Result<Option<IndexValue>, ValidationError> {
    let raw = text_of(value)?;
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }
    check_max_length(vr, s)?;

    let parsed = match vr {
        ValueRepresentation::DA => parse_date(s)
            .map(|d| d.and_time(NaiveTime::MIN))
            .ok_or(ValidationErrorCode::DateIsInvalid),
        ValueRepresentation::DT => parse_dicom_date_time(s).ok_or(ValidationErrorCode::DateTimeIsInvalid),
        _ => parse_time(s)
            .map(|t| time_only_date().and_time(t))
            .ok_or(ValidationErrorCode::TimeIsInvalid),
    };
    parsed
        .map(|dt| Some(IndexValue::DateTime(dt)))
        .map_err(|code| ValidationError::new(code, s.to_string()))
}

/// Date component used when indexing a bare TM value.
fn time_only_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1, 1, 1).unwrap_or(NaiveDate::MIN)
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    NaiveDate::parse_from_str(s, "%Y%m%d").ok()
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    let caps = TIME.captures(s)?;
    let num = |i: usize| -> Option<u32> {
        caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok())
    };
    let micros = fraction_micros(caps.get(4).map(|m| m.as_str()))?;
    NaiveTime::from_hms_micro_opt(num(1)?, num(2)?, num(3)?, micros)
}

/// Parse `YYYY[MM[DD[HH[MM[SS[.F{1,6}]]]]]][&ZZXX]`, ignoring the offset.
fn parse_dicom_date_time(s: &str) -> Option<NaiveDateTime> {
    let caps = DATE_TIME.captures(s)?;
    let num = |i: usize, default: u32| -> Option<u32> {
        caps.get(i).map_or(Some(default), |m| m.as_str().parse().ok())
    };
    let year: i32 = caps.get(1)?.as_str().parse().ok()?;
    let date = NaiveDate::from_ymd_opt(year, num(2, 1)?, num(3, 1)?)?;
    let micros = fraction_micros(caps.get(7).map(|m| m.as_str()))?;
    let time = NaiveTime::from_hms_micro_opt(num(4, 0)?, num(5, 0)?, num(6, 0)?, micros)?;
    Some(date.and_time(time))
}

fn fraction_micros(fraction: Option<&str>) -> Option<u32> {
    match fraction {
        None => Some(0),
        Some(f) => {
            let digits = f.trim_start_matches('.');
            let padded = format!("{:0<6}", digits);
            padded.parse().ok()
        }
    }
}

fn validate_person_name(value: &JsonValue) -> Result<Option<IndexValue>, ValidationError> {
    let raw = match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Object(map) => {
            let group = |key: &str| {
                map.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string()
            };
            let groups = [group("Alphabetic"), group("Ideographic"), group("Phonetic")];
            let used = groups.iter().rposition(|g| !g.is_empty()).map_or(0, |i| i + 1);
            groups[..used].join("=")
        }
        other => {
            return Err(ValidationError::new(
                ValidationErrorCode::InvalidCharacters,
                other.to_string(),
            ))
        }
    };
    let s = raw.trim();
    if s.is_empty() {
        return Ok(None);
    }
    if has_control_or_backslash(s) {
        return Err(ValidationError::new(
            ValidationErrorCode::InvalidCharacters,
            s.to_string(),
        ));
    }

    let groups: Vec<&str> = s.split('=').collect();
    if groups.len() > PERSON_NAME_MAX_GROUPS {
        return Err(ValidationError::new(
            ValidationErrorCode::PersonNameExceedMaxGroups,
            format!("{} groups", groups.len()),
        ));
    }
    for group in &groups {
        if group.chars().count() > PERSON_NAME_GROUP_MAX_LENGTH {
            return Err(ValidationError::new(
                ValidationErrorCode::PersonNameGroupExceedMaxLength,
                group.to_string(),
            ));
        }
        if group.split('^').count() > PERSON_NAME_MAX_COMPONENTS {
            return Err(ValidationError::new(
                ValidationErrorCode::PersonNameExceedMaxComponents,
                group.to_string(),
            ));
        }
    }

    Ok(Some(IndexValue::PersonName(s.to_string())))
}
