//! Parsing and normalization of extended query tag paths.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::models::{AddExtendedQueryTagEntry, NewTagDefinition};
use crate::vr::ValueRepresentation;

/// Maximum length of a private creator identifier (LO).
pub const MAX_PRIVATE_CREATOR_LENGTH: usize = 64;

static COMPACT_PATH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{8}$").expect("valid compact path regex"));

static GROUPED_PATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\(([0-9A-Fa-f]{4}),([0-9A-Fa-f]{4})\)$").expect("valid grouped path regex")
});

/// A parsed DICOM attribute tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DicomTag {
    pub group: u16,
    pub element: u16,
}

impl DicomTag {
    /// Private tags live in odd groups.
    pub fn is_private(&self) -> bool {
        self.group % 2 == 1
    }

    /// Upper-case eight-hex-digit form, e.g. `00101010`.
    pub fn path(&self) -> String {
        format!("{:04X}{:04X}", self.group, self.element)
    }
}

/// Parse a tag path written as `GGGGEEEE` or `(GGGG,EEEE)`.
pub fn parse_tag_path(path: &str) -> Result<DicomTag> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("Tag path must not be empty".to_string()));
    }
    if trimmed.contains('.') {
        return Err(Error::InvalidInput(format!(
            "Sequence tag path '{}' is not supported",
            path
        )));
    }

    let (group, element) = if COMPACT_PATH.is_match(trimmed) {
        (&trimmed[0..4], &trimmed[4..8])
    } else if let Some(caps) = GROUPED_PATH.captures(trimmed) {
        match (caps.get(1), caps.get(2)) {
            (Some(g), Some(e)) => (g.as_str(), e.as_str()),
            _ => return Err(invalid_path(path)),
        }
    } else {
        return Err(invalid_path(path));
    };

    let group = u16::from_str_radix(group, 16).map_err(|_| invalid_path(path))?;
    let element = u16::from_str_radix(element, 16).map_err(|_| invalid_path(path))?;
    Ok(DicomTag { group, element })
}

/// Normalize a path to its upper-case eight-digit form.
pub fn normalize_path(path: &str) -> Result<String> {
    parse_tag_path(path).map(|tag| tag.path())
}

/// Validate an operator-supplied entry and turn it into an insertable definition.
pub fn validate_new_tag(entry: &AddExtendedQueryTagEntry) -> Result<NewTagDefinition> {
    let tag = parse_tag_path(&entry.path)?;
    let vr: ValueRepresentation = entry.vr.parse()?;
    let level = entry.level.parse()?;

    let private_creator = entry
        .private_creator
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    match (&private_creator, tag.is_private()) {
        (None, true) => {
            return Err(Error::InvalidInput(format!(
                "Private tag '{}' requires a private creator",
                entry.path
            )))
        }
        (Some(_), false) => {
            return Err(Error::InvalidInput(format!(
                "Standard tag '{}' must not specify a private creator",
                entry.path
            )))
        }
        (Some(pc), true) if pc.chars().count() > MAX_PRIVATE_CREATOR_LENGTH => {
            return Err(Error::InvalidInput(format!(
                "Private creator for '{}' exceeds {} characters",
                entry.path, MAX_PRIVATE_CREATOR_LENGTH
            )))
        }
        _ => {}
    }

    Ok(NewTagDefinition {
        path: tag.path(),
        vr,
        private_creator,
        level,
    })
}

fn invalid_path(path: &str) -> Error {
    Error::InvalidInput(format!("Tag path '{}' is invalid", path))
}
