//! VariantDictionary: the typed key/value encoding used for KDF parameters
//! and public custom data in KDBX 4 headers
//!
//! Layout:
//! - u16 version (0x0100, major byte must be <= 1)
//! - entries until a 0x00 type byte
//! - entry: u8 type, u32 key_len, [key], u32 value_len, [value]

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

const VERSION: u16 = 0x0100;
const VERSION_CRITICAL_MASK: u16 = 0xFF00;

const TYPE_END: u8 = 0x00;
const TYPE_UINT32: u8 = 0x04;
const TYPE_UINT64: u8 = 0x05;
const TYPE_BOOL: u8 = 0x08;
const TYPE_INT32: u8 = 0x0C;
const TYPE_INT64: u8 = 0x0D;
const TYPE_STRING: u8 = 0x18;
const TYPE_BYTES: u8 = 0x42;

/// A typed value stored in a [`VariantDictionary`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Variant {
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    Bytes(Vec<u8>),
}

impl Variant {
    fn type_tag(&self) -> u8 {
        match self {
            Variant::UInt32(_) => TYPE_UINT32,
            Variant::UInt64(_) => TYPE_UINT64,
            Variant::Bool(_) => TYPE_BOOL,
            Variant::Int32(_) => TYPE_INT32,
            Variant::Int64(_) => TYPE_INT64,
            Variant::String(_) => TYPE_STRING,
            Variant::Bytes(_) => TYPE_BYTES,
        }
    }

    fn encode_value(&self) -> Vec<u8> {
        match self {
            Variant::UInt32(v) => v.to_le_bytes().to_vec(),
            Variant::UInt64(v) => v.to_le_bytes().to_vec(),
            Variant::Bool(v) => vec![u8::from(*v)],
            Variant::Int32(v) => v.to_le_bytes().to_vec(),
            Variant::Int64(v) => v.to_le_bytes().to_vec(),
            Variant::String(v) => v.as_bytes().to_vec(),
            Variant::Bytes(v) => v.clone(),
        }
    }

    fn decode_value(tag: u8, key: &str, value: &[u8]) -> Result<Self> {
        let expect_len = |len: usize| {
            if value.len() == len {
                Ok(())
            } else {
                Err(Error::MalformedVariantDictionary(format!(
                    "value of {:?} has length {}, expected {}",
                    key,
                    value.len(),
                    len
                )))
            }
        };

        Ok(match tag {
            TYPE_UINT32 => {
                expect_len(4)?;
                Variant::UInt32(LittleEndian::read_u32(value))
            }
            TYPE_UINT64 => {
                expect_len(8)?;
                Variant::UInt64(LittleEndian::read_u64(value))
            }
            TYPE_BOOL => {
                expect_len(1)?;
                Variant::Bool(value[0] != 0)
            }
            TYPE_INT32 => {
                expect_len(4)?;
                Variant::Int32(LittleEndian::read_i32(value))
            }
            TYPE_INT64 => {
                expect_len(8)?;
                Variant::Int64(LittleEndian::read_i64(value))
            }
            TYPE_STRING => Variant::String(String::from_utf8(value.to_vec()).map_err(|_| {
                Error::MalformedVariantDictionary(format!("value of {:?} is not UTF-8", key))
            })?),
            TYPE_BYTES => Variant::Bytes(value.to_vec()),
            other => {
                return Err(Error::MalformedVariantDictionary(format!(
                    "unknown type tag 0x{:02x} for {:?}",
                    other, key
                )))
            }
        })
    }
}

/// Ordered key/value mapping; order is kept so re-encoding an unmodified
/// dictionary reproduces its bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariantDictionary {
    items: Vec<(String, Variant)>,
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Variant> {
        self.items.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Insert or replace a value; a replaced key keeps its position
    pub fn insert(&mut self, key: impl Into<String>, value: Variant) {
        let key = key.into();
        match self.items.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.items.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variant)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key) {
            Some(Variant::UInt32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key) {
            Some(Variant::UInt64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.get(key) {
            Some(Variant::Bytes(v)) => Some(v),
            _ => None,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let truncated = |what: &str| {
            Error::MalformedVariantDictionary(format!("truncated {}", what))
        };

        if data.len() < 2 {
            return Err(truncated("version"));
        }
        let version = LittleEndian::read_u16(&data[0..2]);
        if version & VERSION_CRITICAL_MASK > VERSION & VERSION_CRITICAL_MASK {
            return Err(Error::MalformedVariantDictionary(format!(
                "unsupported version 0x{:04x}",
                version
            )));
        }

        let mut pos = 2;
        let mut items = Vec::new();

        loop {
            let Some(&tag) = data.get(pos) else {
                return Err(Error::MalformedVariantDictionary(
                    "missing terminator".to_string(),
                ));
            };
            pos += 1;

            if tag == TYPE_END {
                break;
            }

            if pos + 4 > data.len() {
                return Err(truncated("key length"));
            }
            let key_len = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
            pos += 4;
            if key_len > data.len() - pos {
                return Err(truncated("key"));
            }
            let key = std::str::from_utf8(&data[pos..pos + key_len])
                .map_err(|_| Error::MalformedVariantDictionary("key is not UTF-8".to_string()))?
                .to_string();
            pos += key_len;

            if pos + 4 > data.len() {
                return Err(truncated("value length"));
            }
            let value_len = LittleEndian::read_u32(&data[pos..pos + 4]) as usize;
            pos += 4;
            if value_len > data.len() - pos {
                return Err(truncated("value"));
            }
            let value = Variant::decode_value(tag, &key, &data[pos..pos + value_len])?;
            pos += value_len;

            items.push((key, value));
        }

        Ok(Self { items })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&VERSION.to_le_bytes());
        for (key, value) in &self.items {
            let encoded = value.encode_value();
            out.push(value.type_tag());
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            out.extend_from_slice(&encoded);
        }
        out.push(TYPE_END);
        out
    }
}
