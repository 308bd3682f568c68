//! Text encodings of scalar values inside the XML document

use crate::error::{Error, Result};
use crate::rules::FormatRules;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use std::str::FromStr;
use uuid::Uuid;

/// Seconds between 0001-01-01 and the Unix epoch
const KDBX4_TIME_OFFSET: i64 = 62_135_596_800;

pub fn encode_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub fn decode_bool(text: &str, path: &str) -> Result<bool> {
    match text.trim() {
        t if t.eq_ignore_ascii_case("true") => Ok(true),
        t if t.eq_ignore_ascii_case("false") || t.is_empty() => Ok(false),
        other => Err(Error::document(path, format!("invalid boolean {:?}", other))),
    }
}

/// Tri-state used by `EnableAutoType` / `EnableSearching`
pub fn decode_optional_bool(text: &str, path: &str) -> Result<Option<bool>> {
    if text.trim().eq_ignore_ascii_case("null") {
        Ok(None)
    } else {
        decode_bool(text, path).map(Some)
    }
}

pub fn encode_optional_bool(value: Option<bool>) -> &'static str {
    match value {
        Some(value) => encode_bool(value),
        None => "null",
    }
}

pub fn encode_uuid(uuid: &Uuid) -> String {
    BASE64.encode(uuid.as_bytes())
}

pub fn decode_uuid(text: &str, path: &str) -> Result<Uuid> {
    let bytes = decode_base64(text, path)?;
    Uuid::from_slice(&bytes)
        .map_err(|_| Error::document(path, format!("UUID has {} bytes", bytes.len())))
}

pub fn decode_base64(text: &str, path: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(text.trim())
        .map_err(|e| Error::document(path, format!("invalid base64: {}", e)))
}

pub fn encode_base64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_number<T: FromStr>(text: &str, path: &str) -> Result<T> {
    text.trim()
        .parse()
        .map_err(|_| Error::document(path, format!("invalid number {:?}", text)))
}

pub fn encode_datetime(value: &DateTime<Utc>, rules: FormatRules) -> String {
    if rules.binary_dates() {
        let seconds = value.timestamp() + KDBX4_TIME_OFFSET;
        BASE64.encode(seconds.to_le_bytes())
    } else {
        value.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

/// Parse a date. KDBX 4 readers also accept the textual form, which some
/// writers still emit.
pub fn decode_datetime(text: &str, rules: FormatRules, path: &str) -> Result<DateTime<Utc>> {
    let text = text.trim();

    if rules.binary_dates() {
        if let Ok(bytes) = BASE64.decode(text) {
            let seconds: [u8; 8] = bytes
                .try_into()
                .map_err(|_| Error::document(path, "binary date is not 8 bytes"))?;
            return i64::from_le_bytes(seconds)
                .checked_sub(KDBX4_TIME_OFFSET)
                .and_then(|unix| Utc.timestamp_opt(unix, 0).single())
                .ok_or_else(|| Error::document(path, "date out of range"));
        }
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| Error::document(path, format!("invalid date {:?}", text)))
}
