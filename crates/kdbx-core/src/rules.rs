//! Version-dependent processing rules
//!
//! Computed once from the header version and passed down to every stage;
//! stages ask the rules instead of re-inspecting version numbers.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Container format version as stored in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FormatVersion {
    pub major: u16,
    pub minor: u16,
}

impl FormatVersion {
    pub const V3_1: FormatVersion = FormatVersion { major: 3, minor: 1 };
    pub const V4_0: FormatVersion = FormatVersion { major: 4, minor: 0 };
    pub const V4_1: FormatVersion = FormatVersion { major: 4, minor: 1 };

    pub fn from_u32(raw: u32) -> Self {
        Self {
            major: (raw >> 16) as u16,
            minor: (raw & 0xFFFF) as u16,
        }
    }

    pub fn to_u32(self) -> u32 {
        (u32::from(self.major) << 16) | u32::from(self.minor)
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Parses `"4.1"`-style version strings
impl FromStr for FormatVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPolicy(format!("invalid format version {:?}", s));
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(FormatVersion {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// How each stage processes a given format generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatRules {
    /// KDBX 3.x: hashed block stream, textual dates, Salsa20 inner stream,
    /// attachments pooled in `Meta/Binaries`
    V3 { minor: u16 },
    /// KDBX 4.x: HMAC block stream, binary dates, ChaCha20 inner stream,
    /// inner header carrying the attachment pool
    V4 { minor: u16 },
}

impl FormatRules {
    pub fn for_version(version: FormatVersion) -> Result<Self> {
        match version.major {
            3 => Ok(FormatRules::V3 {
                minor: version.minor,
            }),
            4 => Ok(FormatRules::V4 {
                minor: version.minor,
            }),
            _ => Err(Error::UnsupportedVersion {
                major: version.major,
                minor: version.minor,
            }),
        }
    }

    pub fn version(self) -> FormatVersion {
        match self {
            FormatRules::V3 { minor } => FormatVersion { major: 3, minor },
            FormatRules::V4 { minor } => FormatVersion { major: 4, minor },
        }
    }

    pub fn is_v4(self) -> bool {
        matches!(self, FormatRules::V4 { .. })
    }

    /// Width of the header field length prefix
    pub fn header_length_width(self) -> usize {
        match self {
            FormatRules::V3 { .. } => 2,
            FormatRules::V4 { .. } => 4,
        }
    }

    /// Dates are written as base64 seconds instead of ISO-8601 text
    pub fn binary_dates(self) -> bool {
        self.is_v4()
    }

    /// Inner header (stream key, attachments) precedes the XML
    pub fn has_inner_header(self) -> bool {
        self.is_v4()
    }

    /// Attachments are pooled in `Meta/Binaries` rather than the inner header
    pub fn binaries_in_meta(self) -> bool {
        !self.is_v4()
    }

    /// `Meta/HeaderHash` carries the header digest
    pub fn header_hash_in_meta(self) -> bool {
        !self.is_v4()
    }

    /// Group tags, custom-data timestamps and similar 4.1 additions
    pub fn has_v41_fields(self) -> bool {
        matches!(self, FormatRules::V4 { minor } if minor >= 1)
    }
}
