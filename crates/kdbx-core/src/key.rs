//! Credentials and composite key derivation

use crate::crypto::sha256;
use crate::document::node::XmlNode;
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use zeroize::Zeroizing;

/// The sources a database key is built from
///
/// Any combination of password and key file may be supplied. Alternatively a
/// caller that ran the KDF itself can hand over the transformed key directly.
#[derive(Default)]
pub struct Credentials {
    password_hash: Option<Zeroizing<[u8; 32]>>,
    key_file_key: Option<Zeroizing<[u8; 32]>>,
    transformed_key: Option<Zeroizing<[u8; 32]>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &self.password_hash.is_some())
            .field("key_file", &self.key_file_key.is_some())
            .field("transformed_key", &self.transformed_key.is_some())
            .finish()
    }
}

impl Credentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credentials consisting of a password only
    pub fn from_password(password: &str) -> Self {
        Self::new().with_password(password)
    }

    /// Use pre-computed KDF output and skip key derivation
    pub fn from_transformed_key(key: [u8; 32]) -> Self {
        Self {
            transformed_key: Some(Zeroizing::new(key)),
            ..Self::default()
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password_hash = Some(Zeroizing::new(sha256(&[password.as_bytes()])));
        self
    }

    /// Add a key file given its raw contents
    pub fn with_key_file(mut self, contents: &[u8]) -> Result<Self> {
        self.key_file_key = Some(key_file_key(contents)?);
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.password_hash.is_none() && self.key_file_key.is_none() && self.transformed_key.is_none()
    }

    pub(crate) fn transformed_key(&self) -> Option<&[u8; 32]> {
        self.transformed_key.as_deref()
    }

    /// SHA-256 over every supplied source, password first
    pub(crate) fn composite_key(&self) -> Result<Zeroizing<[u8; 32]>> {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(2);
        if let Some(hash) = &self.password_hash {
            parts.push(hash.as_slice());
        }
        if let Some(key) = &self.key_file_key {
            parts.push(key.as_slice());
        }
        if parts.is_empty() {
            return Err(Error::MissingCredentials);
        }
        Ok(Zeroizing::new(sha256(&parts)))
    }
}

/// Interpret key file contents the way KeePass does
fn key_file_key(contents: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    if let Some(key) = xml_key_file(contents)? {
        return Ok(key);
    }

    if contents.len() == 32 {
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(contents);
        return Ok(key);
    }

    if contents.len() == 64 {
        let mut key = Zeroizing::new([0u8; 32]);
        if hex::decode_to_slice(contents, key.as_mut_slice()).is_ok() {
            return Ok(key);
        }
    }

    Ok(Zeroizing::new(sha256(&[contents])))
}

/// `Ok(None)` when the contents are not an XML key file at all
fn xml_key_file(contents: &[u8]) -> Result<Option<Zeroizing<[u8; 32]>>> {
    let body = contents.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(contents);
    let first = body.iter().find(|b| !b.is_ascii_whitespace());
    if first != Some(&b'<') {
        return Ok(None);
    }
    let root = match XmlNode::parse(contents) {
        Ok(root) if root.name == "KeyFile" => root,
        _ => return Ok(None),
    };

    let version = root
        .child("Meta")
        .and_then(|meta| meta.child("Version"))
        .map(|v| v.text.trim().to_string())
        .ok_or_else(|| Error::InvalidKeyFile("missing Meta/Version".to_string()))?;
    let data = root
        .child("Key")
        .and_then(|key| key.child("Data"))
        .ok_or_else(|| Error::InvalidKeyFile("missing Key/Data".to_string()))?;

    let key = if version.starts_with("1.") {
        let decoded = Zeroizing::new(
            BASE64
                .decode(data.text.trim())
                .map_err(|e| Error::InvalidKeyFile(format!("bad base64 key: {}", e)))?,
        );
        if decoded.len() == 32 {
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(&decoded);
            key
        } else {
            Zeroizing::new(sha256(&[&decoded]))
        }
    } else if version.starts_with("2.") {
        let digits: String = data.text.chars().filter(|c| !c.is_whitespace()).collect();
        let mut key = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(&digits, key.as_mut_slice())
            .map_err(|e| Error::InvalidKeyFile(format!("bad hex key: {}", e)))?;

        if let Some(expected) = data.attr("Hash") {
            let digest = sha256(&[key.as_slice()]);
            if !hex::encode_upper(&digest[..4]).eq_ignore_ascii_case(expected.trim()) {
                return Err(Error::InvalidKeyFile("key hash mismatch".to_string()));
            }
        }
        key
    } else {
        return Err(Error::InvalidKeyFile(format!(
            "unsupported key file version {}",
            version
        )));
    };

    Ok(Some(key))
}
