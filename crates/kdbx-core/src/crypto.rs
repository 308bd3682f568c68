//! Primitive crypto: hashing, block HMAC keys, body ciphers and randomness
//!
//! Every function here is a pure function of its inputs. Ciphers are built
//! fresh for each call so no keystream or chaining state survives between
//! calls.

use crate::error::{Error, Result};
use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use chacha20::ChaCha20;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use uuid::{uuid, Uuid};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Block index whose HMAC key authenticates the v4 outer header
pub const HEADER_HMAC_INDEX: u64 = u64::MAX;

pub const CIPHER_AES256: Uuid = uuid!("31c1f2e6-bf71-4350-be58-05216afc5aff");
pub const CIPHER_CHACHA20: Uuid = uuid!("d6038a2b-8b6f-4cb5-a524-339a31dbb59a");

/// Body cipher declared by the outer header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherId {
    Aes256Cbc,
    ChaCha20,
}

impl CipherId {
    pub fn from_uuid(uuid: Uuid) -> Result<Self> {
        match uuid {
            CIPHER_AES256 => Ok(CipherId::Aes256Cbc),
            CIPHER_CHACHA20 => Ok(CipherId::ChaCha20),
            other => Err(Error::UnsupportedCipher(other)),
        }
    }

    pub fn uuid(self) -> Uuid {
        match self {
            CipherId::Aes256Cbc => CIPHER_AES256,
            CipherId::ChaCha20 => CIPHER_CHACHA20,
        }
    }

    /// Length of the encryption IV this cipher expects
    pub fn iv_len(self) -> usize {
        match self {
            CipherId::Aes256Cbc => 16,
            CipherId::ChaCha20 => 12,
        }
    }

    /// Encrypt a whole body. AES uses PKCS#7 padding, ChaCha20 none.
    pub fn encrypt(self, key: &[u8; 32], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CipherId::Aes256Cbc => {
                let cipher = Aes256CbcEnc::new_from_slices(key, iv)
                    .map_err(|_| Error::Crypto("AES init failed".to_string()))?;
                Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
            }
            CipherId::ChaCha20 => {
                let mut cipher = ChaCha20::new_from_slices(key, iv)
                    .map_err(|_| Error::Crypto("ChaCha20 init failed".to_string()))?;
                let mut buffer = data.to_vec();
                cipher.apply_keystream(&mut buffer);
                Ok(buffer)
            }
        }
    }

    /// Decrypt a whole body. A padding failure surfaces as [`Error::Crypto`];
    /// callers decide whether that means wrong credentials or corruption.
    pub fn decrypt(self, key: &[u8; 32], iv: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CipherId::Aes256Cbc => {
                let cipher = Aes256CbcDec::new_from_slices(key, iv)
                    .map_err(|_| Error::Crypto("AES init failed".to_string()))?;
                cipher
                    .decrypt_padded_vec_mut::<Pkcs7>(data)
                    .map_err(|_| Error::Crypto("AES decryption failed".to_string()))
            }
            CipherId::ChaCha20 => self.encrypt(key, iv, data),
        }
    }
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn sha512(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Final symmetric key: SHA-256(master seed ‖ transformed key)
pub fn master_key(master_seed: &[u8], transformed_key: &[u8; 32]) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(sha256(&[master_seed, transformed_key]))
}

/// Base key for the v4 HMAC block stream: SHA-512(master seed ‖ transformed key ‖ 0x01)
pub fn hmac_base_key(master_seed: &[u8], transformed_key: &[u8; 32]) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(sha512(&[master_seed, transformed_key, &[0x01]]))
}

fn hmac_block_key(block_index: u64, base_key: &[u8; 64]) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(sha512(&[&block_index.to_le_bytes(), base_key]))
}

fn block_mac(block_index: u64, base_key: &[u8; 64], parts: &[&[u8]]) -> Result<HmacSha256> {
    let key = hmac_block_key(block_index, base_key);
    let mut mac = HmacSha256::new_from_slice(key.as_slice())
        .map_err(|_| Error::Crypto("HMAC init failed".to_string()))?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac)
}

/// HMAC-SHA-256 of `parts` under the key for `block_index`
pub fn block_hmac(block_index: u64, base_key: &[u8; 64], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let tag = block_mac(block_index, base_key, parts)?.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&tag);
    Ok(out)
}

/// Constant-time check of a stored block HMAC
pub fn verify_block_hmac(
    block_index: u64,
    base_key: &[u8; 64],
    parts: &[&[u8]],
    expected: &[u8],
) -> Result<bool> {
    Ok(block_mac(block_index, base_key, parts)?
        .verify_slice(expected)
        .is_ok())
}

pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}

pub fn random_vec(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_roundtrip_pads() {
        let key = [7u8; 32];
        let iv = [1u8; 16];
        let ciphertext = CipherId::Aes256Cbc.encrypt(&key, &iv, b"hello").unwrap();
        assert_eq!(ciphertext.len(), 16);
        let plaintext = CipherId::Aes256Cbc.decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_aes_wrong_key_fails_or_differs() {
        let iv = [1u8; 16];
        let ciphertext = CipherId::Aes256Cbc
            .encrypt(&[7u8; 32], &iv, b"some longer plaintext")
            .unwrap();
        match CipherId::Aes256Cbc.decrypt(&[8u8; 32], &iv, &ciphertext) {
            Ok(plaintext) => assert_ne!(plaintext, b"some longer plaintext"),
            Err(err) => assert!(matches!(err, Error::Crypto(_))),
        }
    }

    #[test]
    fn test_chacha20_is_deterministic() {
        let key = [3u8; 32];
        let iv = [9u8; 12];
        let a = CipherId::ChaCha20.encrypt(&key, &iv, b"payload").unwrap();
        let b = CipherId::ChaCha20.encrypt(&key, &iv, b"payload").unwrap();
        assert_eq!(a, b);
        assert_eq!(CipherId::ChaCha20.decrypt(&key, &iv, &a).unwrap(), b"payload");
    }

    #[test]
    fn test_block_hmac_depends_on_index() {
        let base = [5u8; 64];
        let a = block_hmac(0, &base, &[b"data"]).unwrap();
        let b = block_hmac(1, &base, &[b"data"]).unwrap();
        assert_ne!(a, b);
        assert!(verify_block_hmac(0, &base, &[b"da", b"ta"], &a).unwrap());
        assert!(!verify_block_hmac(1, &base, &[b"data"], &a).unwrap());
    }

    #[test]
    fn test_cipher_uuid_roundtrip() {
        for id in [CipherId::Aes256Cbc, CipherId::ChaCha20] {
            assert_eq!(CipherId::from_uuid(id.uuid()).unwrap(), id);
        }
        let twofish = uuid!("ad68f29f-576f-4bb9-a36a-d47af965346c");
        assert!(matches!(
            CipherId::from_uuid(twofish),
            Err(Error::UnsupportedCipher(_))
        ));
    }
}
