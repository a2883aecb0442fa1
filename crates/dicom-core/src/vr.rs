//! Value representations supported by extended query tags.
//!
//! Every supported VR maps to exactly one [`IndexDataType`], which in turn
//! selects the index table its values are written to.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Storage family of an indexed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexDataType {
    String,
    Long,
    Double,
    DateTime,
    PersonName,
}

impl IndexDataType {
    /// Numeric discriminator persisted alongside index rows.
    pub fn as_i16(self) -> i16 {
        match self {
            IndexDataType::String => 0,
            IndexDataType::Long => 1,
            IndexDataType::Double => 2,
            IndexDataType::DateTime => 3,
            IndexDataType::PersonName => 4,
        }
    }
}

/// A DICOM value representation that can back an extended query tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValueRepresentation {
    AE,
    AS,
    CS,
    DA,
    DS,
    DT,
    FD,
    FL,
    IS,
    LO,
    PN,
    SH,
    SL,
    SS,
    TM,
    UI,
    UL,
    US,
}

impl ValueRepresentation {
    /// All supported VRs, in code order.
    pub const ALL: [ValueRepresentation; 18] = [
        Self::AE,
        Self::AS,
        Self::CS,
        Self::DA,
        Self::DS,
        Self::DT,
        Self::FD,
        Self::FL,
        Self::IS,
        Self::LO,
        Self::PN,
        Self::SH,
        Self::SL,
        Self::SS,
        Self::TM,
        Self::UI,
        Self::UL,
        Self::US,
    ];

    /// Two-letter VR code.
    pub fn code(self) -> &'static str {
        match self {
            Self::AE => "AE",
            Self::AS => "AS",
            Self::CS => "CS",
            Self::DA => "DA",
            Self::DS => "DS",
            Self::DT => "DT",
            Self::FD => "FD",
            Self::FL => "FL",
            Self::IS => "IS",
            Self::LO => "LO",
            Self::PN => "PN",
            Self::SH => "SH",
            Self::SL => "SL",
            Self::SS => "SS",
            Self::TM => "TM",
            Self::UI => "UI",
            Self::UL => "UL",
            Self::US => "US",
        }
    }

    /// Index table family for this VR.
    pub fn data_type(self) -> IndexDataType {
        match self {
            Self::AE | Self::AS | Self::CS | Self::DS | Self::LO | Self::SH | Self::UI => {
                IndexDataType::String
            }
            Self::IS | Self::SL | Self::SS | Self::UL | Self::US => IndexDataType::Long,
            Self::FD | Self::FL => IndexDataType::Double,
            Self::DA | Self::DT | Self::TM => IndexDataType::DateTime,
            Self::PN => IndexDataType::PersonName,
        }
    }

    /// Maximum character length of a single value, when the VR bounds it.
    pub fn max_length(self) -> Option<usize> {
        match self {
            Self::AE => Some(16),
            Self::AS => Some(4),
            Self::CS => Some(16),
            Self::DA => Some(8),
            Self::DS => Some(16),
            Self::DT => Some(26),
            Self::IS => Some(12),
            Self::LO => Some(64),
            Self::SH => Some(16),
            Self::TM => Some(14),
            Self::UI => Some(64),
            Self::FD | Self::FL | Self::PN | Self::SL | Self::SS | Self::UL | Self::US => None,
        }
    }
}

impl fmt::Display for ValueRepresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ValueRepresentation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|vr| vr.code() == upper)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Value representation '{}' is not supported for extended query tags",
                    s
                ))
            })
    }
}

impl TryFrom<String> for ValueRepresentation {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ValueRepresentation> for String {
    fn from(vr: ValueRepresentation) -> Self {
        vr.code().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("pn".parse::<ValueRepresentation>().unwrap(), ValueRepresentation::PN);
        assert_eq!(" DA ".parse::<ValueRepresentation>().unwrap(), ValueRepresentation::DA);
    }

    #[test]
    fn test_parse_rejects_unsupported_vr() {
        let err = "OB".parse::<ValueRepresentation>().unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_data_type_mapping() {
        assert_eq!(ValueRepresentation::LO.data_type(), IndexDataType::String);
        assert_eq!(ValueRepresentation::US.data_type(), IndexDataType::Long);
        assert_eq!(ValueRepresentation::FD.data_type(), IndexDataType::Double);
        assert_eq!(ValueRepresentation::DA.data_type(), IndexDataType::DateTime);
        assert_eq!(ValueRepresentation::PN.data_type(), IndexDataType::PersonName);
    }

    #[test]
    fn test_code_round_trips_through_parse() {
        for vr in ValueRepresentation::ALL {
            assert_eq!(vr.code().parse::<ValueRepresentation>().unwrap(), vr);
        }
    }

    #[test]
    fn test_serde_uses_code() {
        let json = serde_json::to_string(&ValueRepresentation::CS).unwrap();
        assert_eq!(json, "\"CS\"");
        let vr: ValueRepresentation = serde_json::from_str("\"ui\"").unwrap();
        assert_eq!(vr, ValueRepresentation::UI);
    }
}
