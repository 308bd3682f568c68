//! Block framing of the encrypted body
//!
//! KDBX 4 wraps the ciphertext in HMAC-authenticated blocks; KDBX 3 wraps
//! the plaintext in SHA-256 hashed blocks.

use crate::crypto::{block_hmac, sha256, verify_block_hmac, HEADER_HMAC_INDEX};
use crate::error::{Error, Result};
use crate::progress::{checkpoint, Progress, ProgressEvent};
use byteorder::{ByteOrder, LittleEndian};

/// Check the HMAC stored after a KDBX 4 header. A mismatch means the key is
/// wrong or the header was altered; the two are not told apart.
pub(crate) fn verify_header_hmac(raw_header: &[u8], stored: &[u8; 32], base_key: &[u8; 64]) -> Result<()> {
    if verify_block_hmac(HEADER_HMAC_INDEX, base_key, &[raw_header], stored)? {
        Ok(())
    } else {
        Err(Error::WrongCredentialsOrCorrupt)
    }
}

pub(crate) fn header_hmac(raw_header: &[u8], base_key: &[u8; 64]) -> Result<[u8; 32]> {
    block_hmac(HEADER_HMAC_INDEX, base_key, &[raw_header])
}

/// Verify every block of a KDBX 4 HMAC block stream, terminator included,
/// and return the concatenated ciphertext.
///
/// Layout per block: `hmac[32] ‖ size u32 ‖ data`, ending with a zero-size
/// block. Nothing is returned unless every block verified.
pub(crate) fn read_hmac_blocks(
    data: &[u8],
    base_key: &[u8; 64],
    progress: &dyn Progress,
) -> Result<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len());
    let mut pos = 0;
    let mut index: u64 = 0;

    loop {
        if data.len() - pos < 36 {
            return Err(Error::BlockIntegrityFailure { index });
        }
        let stored_hmac = &data[pos..pos + 32];
        let size_bytes = &data[pos + 32..pos + 36];
        let block_size = LittleEndian::read_u32(size_bytes) as usize;
        pos += 36;

        if block_size > data.len() - pos {
            return Err(Error::BlockIntegrityFailure { index });
        }
        let block = &data[pos..pos + block_size];
        pos += block_size;

        let index_bytes = index.to_le_bytes();
        if !verify_block_hmac(index, base_key, &[&index_bytes, size_bytes, block], stored_hmac)? {
            tracing::debug!("HMAC mismatch on block {}", index);
            return Err(Error::BlockIntegrityFailure { index });
        }
        checkpoint(progress, ProgressEvent::BlockVerified { index })?;

        if block_size == 0 {
            break;
        }
        result.extend_from_slice(block);
        index += 1;
    }

    if pos != data.len() {
        tracing::debug!("Ignoring {} trailing bytes after block stream", data.len() - pos);
    }
    Ok(result)
}

pub(crate) fn write_hmac_blocks(data: &[u8], base_key: &[u8; 64], block_size: usize) -> Result<Vec<u8>> {
    let block_size = block_size.max(1);
    let mut out = Vec::with_capacity(data.len() + (data.len() / block_size + 2) * 36);
    let mut index: u64 = 0;

    for block in data.chunks(block_size).chain(std::iter::once(&[][..])) {
        let size_bytes = (block.len() as u32).to_le_bytes();
        let hmac = block_hmac(index, base_key, &[&index.to_le_bytes(), &size_bytes, block])?;
        out.extend_from_slice(&hmac);
        out.extend_from_slice(&size_bytes);
        out.extend_from_slice(block);
        index += 1;
    }
    Ok(out)
}

/// Unwrap a KDBX 3 hashed block stream.
///
/// Layout per block: `index u32 ‖ sha256[32] ‖ size u32 ‖ data`, ending with a
/// zero-size block whose hash is all zeros.
pub(crate) fn read_hashed_blocks(data: &[u8], progress: &dyn Progress) -> Result<Vec<u8>> {
    let mut result = Vec::with_capacity(data.len());
    let mut pos = 0;
    let mut expected_index: u64 = 0;

    loop {
        if data.len() - pos < 40 {
            return Err(Error::BlockIntegrityFailure {
                index: expected_index,
            });
        }
        let index = u64::from(LittleEndian::read_u32(&data[pos..pos + 4]));
        let stored_hash = &data[pos + 4..pos + 36];
        let block_size = LittleEndian::read_u32(&data[pos + 36..pos + 40]) as usize;
        pos += 40;

        if index != expected_index || block_size > data.len() - pos {
            return Err(Error::BlockIntegrityFailure {
                index: expected_index,
            });
        }

        if block_size == 0 {
            if stored_hash.iter().any(|&b| b != 0) {
                return Err(Error::BlockIntegrityFailure { index });
            }
            break;
        }

        let block = &data[pos..pos + block_size];
        pos += block_size;
        if sha256(&[block]) != stored_hash {
            tracing::debug!("Hash mismatch on block {}", index);
            return Err(Error::BlockIntegrityFailure { index });
        }
        checkpoint(progress, ProgressEvent::BlockVerified { index })?;

        result.extend_from_slice(block);
        expected_index += 1;
    }

    Ok(result)
}

pub(crate) fn write_hashed_blocks(data: &[u8], block_size: usize) -> Vec<u8> {
    let block_size = block_size.max(1);
    let mut out = Vec::with_capacity(data.len() + (data.len() / block_size + 2) * 40);
    let mut index: u32 = 0;

    for block in data.chunks(block_size) {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&sha256(&[block]));
        out.extend_from_slice(&(block.len() as u32).to_le_bytes());
        out.extend_from_slice(block);
        index += 1;
    }
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&[0u8; 32]);
    out.extend_from_slice(&0u32.to_le_bytes());
    out
}
