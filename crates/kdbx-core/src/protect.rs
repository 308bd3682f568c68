//! In-memory protection of sensitive field values
//!
//! Protected values stay XOR-obfuscated with the document's inner keystream.
//! Each value remembers where in the keystream it starts, so revealing it is
//! a seek plus XOR: no cipher state is shared between calls.

use crate::crypto::{random_vec, sha256, sha512};
use crate::error::{Error, Result};
use chacha20::ChaCha20;
use cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use salsa20::Salsa20;
use zeroize::Zeroizing;

const SALSA20_NONCE: [u8; 8] = [0xE8, 0x30, 0x09, 0x4B, 0x97, 0x20, 0x5D, 0x2A];

/// Inner stream algorithm ids as stored in the file
const STREAM_ID_ARCFOUR: u32 = 1;
const STREAM_ID_SALSA20: u32 = 2;
const STREAM_ID_CHACHA20: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InnerStreamAlgorithm {
    Salsa20,
    ChaCha20,
}

impl InnerStreamAlgorithm {
    pub fn from_id(id: u32) -> Result<Self> {
        match id {
            STREAM_ID_SALSA20 => Ok(InnerStreamAlgorithm::Salsa20),
            STREAM_ID_CHACHA20 => Ok(InnerStreamAlgorithm::ChaCha20),
            STREAM_ID_ARCFOUR => Err(Error::malformed(
                "InnerRandomStreamID",
                "ArcFour inner stream is not supported",
            )),
            other => Err(Error::malformed(
                "InnerRandomStreamID",
                format!("unknown inner stream {}", other),
            )),
        }
    }

    pub fn id(self) -> u32 {
        match self {
            InnerStreamAlgorithm::Salsa20 => STREAM_ID_SALSA20,
            InnerStreamAlgorithm::ChaCha20 => STREAM_ID_CHACHA20,
        }
    }

    /// Length of freshly generated keys
    fn key_len(self) -> usize {
        match self {
            InnerStreamAlgorithm::Salsa20 => 32,
            InnerStreamAlgorithm::ChaCha20 => 64,
        }
    }
}

/// A protected value: its keystream offset plus the obfuscated bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedValue {
    pub offset: u64,
    pub ciphertext: Vec<u8>,
}

impl ProtectedValue {
    pub fn len(&self) -> usize {
        self.ciphertext.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphertext.is_empty()
    }

    /// First keystream position after this value
    pub fn end(&self) -> u64 {
        self.offset + self.ciphertext.len() as u64
    }
}

/// Per-document inner stream key
#[derive(Clone)]
pub struct ProtectionKey {
    algorithm: InnerStreamAlgorithm,
    key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for ProtectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

enum Keystream {
    Salsa20(Salsa20),
    ChaCha20(ChaCha20),
}

impl Keystream {
    fn apply_at(&mut self, offset: u64, data: &mut [u8]) -> Result<()> {
        let result = match self {
            Keystream::Salsa20(cipher) => cipher
                .try_seek(offset)
                .and_then(|_| cipher.try_apply_keystream(data)),
            Keystream::ChaCha20(cipher) => cipher
                .try_seek(offset)
                .and_then(|_| cipher.try_apply_keystream(data)),
        };
        result.map_err(|_| Error::Crypto("inner keystream exhausted".to_string()))
    }
}

impl ProtectionKey {
    pub fn new(algorithm: InnerStreamAlgorithm, key: Vec<u8>) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::malformed("ProtectedStreamKey", "empty key"));
        }
        Ok(Self {
            algorithm,
            key: Zeroizing::new(key),
        })
    }

    pub fn generate(algorithm: InnerStreamAlgorithm) -> Self {
        Self {
            algorithm,
            key: Zeroizing::new(random_vec(algorithm.key_len())),
        }
    }

    pub fn algorithm(&self) -> InnerStreamAlgorithm {
        self.algorithm
    }

    pub(crate) fn key_bytes(&self) -> &[u8] {
        &self.key
    }

    fn keystream(&self) -> Keystream {
        match self.algorithm {
            InnerStreamAlgorithm::Salsa20 => {
                let key = Zeroizing::new(sha256(&[self.key.as_slice()]));
                Keystream::Salsa20(Salsa20::new(
                    key.as_slice().into(),
                    SALSA20_NONCE.as_slice().into(),
                ))
            }
            InnerStreamAlgorithm::ChaCha20 => {
                let hash = Zeroizing::new(sha512(&[self.key.as_slice()]));
                Keystream::ChaCha20(ChaCha20::new(
                    (&hash[..32]).into(),
                    (&hash[32..44]).into(),
                ))
            }
        }
    }

    /// Obfuscate `plaintext` at a given keystream offset
    pub fn protect_at(&self, offset: u64, plaintext: &[u8]) -> Result<ProtectedValue> {
        let mut ciphertext = plaintext.to_vec();
        self.keystream().apply_at(offset, &mut ciphertext)?;
        Ok(ProtectedValue { offset, ciphertext })
    }

    /// Recover the plaintext bytes of `value`
    pub fn reveal(&self, value: &ProtectedValue) -> Result<Zeroizing<Vec<u8>>> {
        let mut plain = Zeroizing::new(value.ciphertext.clone());
        self.keystream().apply_at(value.offset, &mut plain)?;
        Ok(plain)
    }

    pub fn reveal_string(&self, value: &ProtectedValue) -> Result<Zeroizing<String>> {
        let bytes = self.reveal(value)?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| Error::CorruptBody("protected value is not UTF-8".to_string()))?;
        Ok(Zeroizing::new(text.to_string()))
    }

    /// Sequential cursor over the keystream, starting at offset zero
    pub fn stream(&self) -> ProtectionStream<'_> {
        ProtectionStream {
            key: self,
            position: 0,
        }
    }
}

/// Walks the keystream in document order while reading or writing
pub struct ProtectionStream<'a> {
    key: &'a ProtectionKey,
    position: u64,
}

impl ProtectionStream<'_> {
    /// Record an already obfuscated value read from the document
    pub fn take(&mut self, ciphertext: Vec<u8>) -> ProtectedValue {
        let value = ProtectedValue {
            offset: self.position,
            ciphertext,
        };
        self.position = value.end();
        value
    }

    /// Obfuscate the next value to be written
    pub fn protect(&mut self, plaintext: &[u8]) -> Result<ProtectedValue> {
        let value = self.key.protect_at(self.position, plaintext)?;
        self.position = value.end();
        Ok(value)
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reveal_is_repeatable() {
        for algorithm in [InnerStreamAlgorithm::Salsa20, InnerStreamAlgorithm::ChaCha20] {
            let key = ProtectionKey::generate(algorithm);
            let value = key.protect_at(100, b"hunter2").unwrap();
            assert_ne!(value.ciphertext, b"hunter2");
            assert_eq!(key.reveal(&value).unwrap().as_slice(), b"hunter2");
            assert_eq!(key.reveal(&value).unwrap().as_slice(), b"hunter2");
        }
    }

    #[test]
    fn test_stream_matches_seek() {
        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let mut stream = key.stream();
        let first = stream.protect(b"first value").unwrap();
        let second = stream.protect(b"second").unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 11);
        assert_eq!(stream.position(), 17);

        // Reading back in order yields the same offsets
        let mut reader = key.stream();
        let read_first = reader.take(first.ciphertext.clone());
        let read_second = reader.take(second.ciphertext.clone());
        assert_eq!(key.reveal_string(&read_first).unwrap().as_str(), "first value");
        assert_eq!(key.reveal_string(&read_second).unwrap().as_str(), "second");
    }

    #[test]
    fn test_salsa20_known_key() {
        // Same key and offset always produce the same ciphertext
        let key = ProtectionKey::new(InnerStreamAlgorithm::Salsa20, vec![1u8; 32]).unwrap();
        let a = key.protect_at(0, b"abc").unwrap();
        let b = key.protect_at(0, b"abc").unwrap();
        assert_eq!(a, b);
        let shifted = key.protect_at(3, b"abc").unwrap();
        assert_ne!(a.ciphertext, shifted.ciphertext);
    }

    #[test]
    fn test_stream_ids() {
        assert_eq!(InnerStreamAlgorithm::from_id(2).unwrap(), InnerStreamAlgorithm::Salsa20);
        assert_eq!(InnerStreamAlgorithm::ChaCha20.id(), 3);
        assert!(matches!(
            InnerStreamAlgorithm::from_id(1),
            Err(Error::MalformedField { .. })
        ));
    }
}
