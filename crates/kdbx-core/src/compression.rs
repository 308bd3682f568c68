//! Gzip stage between the block stream and the document

use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::io::{Read, Write};

/// Body compression declared in the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_flags(flags: u32) -> Result<Self> {
        match flags {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(Error::malformed(
                "CompressionFlags",
                format!("unknown compression {}", other),
            )),
        }
    }

    pub fn flags(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
        }
    }

    /// Undo the compression, refusing output larger than `limit` bytes
    pub fn decompress(self, data: Vec<u8>, limit: usize) -> Result<Vec<u8>> {
        match self {
            Compression::None => {
                if data.len() > limit {
                    return Err(Error::BodyTooLarge { limit });
                }
                Ok(data)
            }
            Compression::Gzip => gunzip(&data, limit),
        }
    }

    pub fn compress(self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data),
            Compression::Gzip => gzip(&data),
        }
    }
}

pub(crate) fn gunzip(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data).take(limit as u64 + 1);
    let mut result = Vec::new();
    decoder
        .read_to_end(&mut result)
        .map_err(|e| Error::CorruptBody(format!("Decompression failed: {}", e)))?;
    if result.len() > limit {
        return Err(Error::BodyTooLarge { limit });
    }
    Ok(result)
}

pub(crate) fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}
