//! Outer container header
//!
//! Layout: two signature words, a packed version word, then typed fields
//! `id: u8, len: u16|u32, data` until the End field. KDBX 4 follows the
//! header with its SHA-256 and HMAC-SHA-256.

use crate::compression::Compression;
use crate::crypto::{random_array, random_vec, sha256, CipherId};
use crate::error::{Error, Result};
use crate::kdf::KdfParams;
use crate::protect::{InnerStreamAlgorithm, ProtectionKey};
use crate::rules::{FormatRules, FormatVersion};
use crate::variant::VariantDictionary;
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use uuid::Uuid;

pub const SIGNATURE_1: u32 = 0x9AA2_D903;
pub const SIGNATURE_2: u32 = 0xB54B_FB67;
/// KeePass 1.x
const SIGNATURE_2_KDB: u32 = 0xB54B_FB65;
/// KeePass 2.x pre-release
const SIGNATURE_2_PRE: u32 = 0xB54B_FB66;

// Outer header field ids
const FIELD_END: u8 = 0;
const FIELD_COMMENT: u8 = 1;
const FIELD_CIPHER_ID: u8 = 2;
const FIELD_COMPRESSION_FLAGS: u8 = 3;
const FIELD_MASTER_SEED: u8 = 4;
const FIELD_TRANSFORM_SEED: u8 = 5;
const FIELD_TRANSFORM_ROUNDS: u8 = 6;
const FIELD_ENCRYPTION_IV: u8 = 7;
const FIELD_PROTECTED_STREAM_KEY: u8 = 8;
const FIELD_STREAM_START_BYTES: u8 = 9;
const FIELD_INNER_RANDOM_STREAM_ID: u8 = 10;
const FIELD_KDF_PARAMETERS: u8 = 11;
const FIELD_PUBLIC_CUSTOM_DATA: u8 = 12;

const END_OF_HEADER: &[u8] = b"\r\n\r\n";

/// The parsed outer header. Immutable once read; every save builds a new one
/// with [`Header::generate`].
#[derive(Debug, Clone)]
pub struct Header {
    pub version: FormatVersion,
    pub cipher: CipherId,
    pub compression: Compression,
    pub master_seed: [u8; 32],
    pub iv: Vec<u8>,
    pub kdf: KdfParams,
    pub comment: Option<Vec<u8>>,
    /// KDBX 4 only
    pub public_custom_data: Option<VariantDictionary>,
    /// KDBX 3 only: the inner stream lives in the outer header
    pub protected_stream_key: Option<Vec<u8>>,
    /// KDBX 3 only
    pub stream_start_bytes: Option<[u8; 32]>,
    /// KDBX 3 only
    pub inner_stream: Option<InnerStreamAlgorithm>,
    rules: FormatRules,
    raw: Vec<u8>,
    stored_hmac: Option<[u8; 32]>,
}

#[derive(Default)]
struct Fields {
    comment: Option<Vec<u8>>,
    cipher: Option<CipherId>,
    compression: Option<Compression>,
    master_seed: Option<[u8; 32]>,
    transform_seed: Option<[u8; 32]>,
    transform_rounds: Option<u64>,
    iv: Option<Vec<u8>>,
    protected_stream_key: Option<Vec<u8>>,
    stream_start_bytes: Option<[u8; 32]>,
    inner_stream: Option<InnerStreamAlgorithm>,
    kdf: Option<KdfParams>,
    public_custom_data: Option<VariantDictionary>,
}

impl Header {
    /// Parse the header at the start of `data` without any credentials.
    ///
    /// For KDBX 4 the stored header hash is checked here; the HMAC that
    /// follows needs the key and is left to the decryptor.
    pub fn read(data: &[u8]) -> Result<Header> {
        let version = read_signature(data)?;
        let rules = FormatRules::for_version(version)?;
        let width = rules.header_length_width();

        let mut pos = 12;
        let mut fields = Fields::default();

        loop {
            if pos + 1 + width > data.len() {
                return Err(Error::malformed("Header", "truncated header"));
            }
            let field_id = data[pos];
            let field_len = if width == 2 {
                LittleEndian::read_u16(&data[pos + 1..]) as usize
            } else {
                LittleEndian::read_u32(&data[pos + 1..]) as usize
            };
            pos += 1 + width;

            if field_len > data.len() - pos {
                return Err(Error::malformed("Header", "truncated header field"));
            }
            let field = &data[pos..pos + field_len];
            pos += field_len;

            if field_id == FIELD_END {
                break;
            }
            fields.apply(rules, field_id, field)?;
        }

        let raw = data[..pos].to_vec();
        let mut stored_hmac = None;
        if rules.is_v4() {
            if data.len() < pos + 64 {
                return Err(Error::malformed("HeaderHash", "truncated header hash"));
            }
            if data[pos..pos + 32] != sha256(&[raw.as_slice()]) {
                return Err(Error::IntegrityMismatch);
            }
            let mut hmac = [0u8; 32];
            hmac.copy_from_slice(&data[pos + 32..pos + 64]);
            stored_hmac = Some(hmac);
        }

        let header = fields.finish(version, rules, raw, stored_hmac)?;
        tracing::debug!(
            "Read KDBX {} header: {:?}, {:?}, KDF {}",
            header.version,
            header.cipher,
            header.compression,
            header.kdf.uuid()
        );
        Ok(header)
    }

    /// Build a header for a new save with fresh seeds, IV and KDF salt.
    ///
    /// `protection` is stored in the outer header for KDBX 3 and ignored for
    /// KDBX 4, which carries it in the inner header instead.
    pub fn generate(policy: &SavePolicy, protection: &ProtectionKey) -> Result<Header> {
        let rules = policy.validate()?;

        let kdf = if policy.keep_kdf_salt {
            policy.kdf.clone()
        } else {
            policy.kdf.with_fresh_salt()
        };

        let mut header = Header {
            version: policy.version,
            cipher: policy.cipher,
            compression: policy.compression,
            master_seed: random_array(),
            iv: random_vec(policy.cipher.iv_len()),
            kdf,
            comment: policy.comment.clone(),
            public_custom_data: None,
            protected_stream_key: None,
            stream_start_bytes: None,
            inner_stream: None,
            rules,
            raw: Vec::new(),
            stored_hmac: None,
        };

        if rules.is_v4() {
            header.public_custom_data = policy.public_custom_data.clone();
        } else {
            header.protected_stream_key = Some(protection.key_bytes().to_vec());
            header.stream_start_bytes = Some(random_array());
            header.inner_stream = Some(protection.algorithm());
        }

        header.raw = header.to_bytes(rules)?;
        Ok(header)
    }

    pub fn rules(&self) -> FormatRules {
        self.rules
    }

    /// Header bytes from the signature through the End field
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Where the encrypted body starts
    pub fn body_offset(&self) -> usize {
        if self.rules().is_v4() {
            self.raw.len() + 64
        } else {
            self.raw.len()
        }
    }

    pub(crate) fn stored_hmac(&self) -> Option<&[u8; 32]> {
        self.stored_hmac.as_ref()
    }

    /// KDBX 3 inner stream key from the outer header
    pub(crate) fn protection_key(&self) -> Result<Option<ProtectionKey>> {
        match (&self.inner_stream, &self.protected_stream_key) {
            (Some(algorithm), Some(key)) => Ok(Some(ProtectionKey::new(*algorithm, key.clone())?)),
            _ => Ok(None),
        }
    }

    fn to_bytes(&self, rules: FormatRules) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.write_u32::<LittleEndian>(SIGNATURE_1)?;
        out.write_u32::<LittleEndian>(SIGNATURE_2)?;
        out.write_u32::<LittleEndian>(self.version.to_u32())?;

        let mut field = |id: u8, data: &[u8]| -> Result<()> {
            out.push(id);
            if rules.header_length_width() == 2 {
                let len = u16::try_from(data.len())
                    .map_err(|_| Error::InvalidPolicy(format!("header field {} too long", id)))?;
                out.write_u16::<LittleEndian>(len)?;
            } else {
                out.write_u32::<LittleEndian>(data.len() as u32)?;
            }
            out.extend_from_slice(data);
            Ok(())
        };

        if let Some(comment) = &self.comment {
            field(FIELD_COMMENT, comment)?;
        }
        field(FIELD_CIPHER_ID, self.cipher.uuid().as_bytes())?;
        field(
            FIELD_COMPRESSION_FLAGS,
            &self.compression.flags().to_le_bytes(),
        )?;
        field(FIELD_MASTER_SEED, &self.master_seed)?;

        if rules.is_v4() {
            field(FIELD_ENCRYPTION_IV, &self.iv)?;
            field(FIELD_KDF_PARAMETERS, &self.kdf.to_dictionary().to_bytes())?;
            if let Some(custom) = &self.public_custom_data {
                field(FIELD_PUBLIC_CUSTOM_DATA, &custom.to_bytes())?;
            }
        } else {
            let KdfParams::Aes { rounds, seed } = &self.kdf else {
                return Err(Error::InvalidPolicy(
                    "KDBX 3 only supports AES-KDF".to_string(),
                ));
            };
            field(FIELD_TRANSFORM_SEED, seed)?;
            field(FIELD_TRANSFORM_ROUNDS, &rounds.to_le_bytes())?;
            field(FIELD_ENCRYPTION_IV, &self.iv)?;
            if let Some(key) = &self.protected_stream_key {
                field(FIELD_PROTECTED_STREAM_KEY, key)?;
            }
            if let Some(start) = &self.stream_start_bytes {
                field(FIELD_STREAM_START_BYTES, start)?;
            }
            if let Some(stream) = self.inner_stream {
                field(FIELD_INNER_RANDOM_STREAM_ID, &stream.id().to_le_bytes())?;
            }
        }
        field(FIELD_END, END_OF_HEADER)?;

        Ok(out)
    }
}

fn read_signature(data: &[u8]) -> Result<FormatVersion> {
    if data.len() < 12 {
        return Err(Error::BadSignature);
    }
    let sig1 = LittleEndian::read_u32(&data[0..4]);
    let sig2 = LittleEndian::read_u32(&data[4..8]);
    let version = FormatVersion::from_u32(LittleEndian::read_u32(&data[8..12]));

    if sig1 != SIGNATURE_1 {
        return Err(Error::BadSignature);
    }
    match sig2 {
        SIGNATURE_2 => Ok(version),
        SIGNATURE_2_KDB => Err(Error::UnsupportedVersion { major: 1, minor: 0 }),
        SIGNATURE_2_PRE => Err(Error::UnsupportedVersion {
            major: version.major,
            minor: version.minor,
        }),
        _ => Err(Error::BadSignature),
    }
}

fn fixed<const N: usize>(name: &'static str, data: &[u8]) -> Result<[u8; N]> {
    data.try_into()
        .map_err(|_| Error::malformed(name, format!("expected {} bytes, got {}", N, data.len())))
}

impl Fields {
    fn apply(&mut self, rules: FormatRules, id: u8, data: &[u8]) -> Result<()> {
        let v3_only = |name: &'static str| -> Result<()> {
            if rules.is_v4() {
                Err(Error::malformed(name, "field is not valid in a KDBX 4 header"))
            } else {
                Ok(())
            }
        };
        let v4_only = |name: &'static str| -> Result<()> {
            if rules.is_v4() {
                Ok(())
            } else {
                Err(Error::malformed(name, "field is not valid in a KDBX 3 header"))
            }
        };

        match id {
            FIELD_COMMENT => self.comment = Some(data.to_vec()),
            FIELD_CIPHER_ID => {
                let uuid = Uuid::from_bytes(fixed("CipherID", data)?);
                self.cipher = Some(CipherId::from_uuid(uuid)?);
            }
            FIELD_COMPRESSION_FLAGS => {
                let flags = u32::from_le_bytes(fixed("CompressionFlags", data)?);
                self.compression = Some(Compression::from_flags(flags)?);
            }
            FIELD_MASTER_SEED => self.master_seed = Some(fixed("MasterSeed", data)?),
            FIELD_TRANSFORM_SEED => {
                v3_only("TransformSeed")?;
                self.transform_seed = Some(fixed("TransformSeed", data)?);
            }
            FIELD_TRANSFORM_ROUNDS => {
                v3_only("TransformRounds")?;
                self.transform_rounds = Some(u64::from_le_bytes(fixed("TransformRounds", data)?));
            }
            FIELD_ENCRYPTION_IV => self.iv = Some(data.to_vec()),
            FIELD_PROTECTED_STREAM_KEY => {
                v3_only("ProtectedStreamKey")?;
                self.protected_stream_key = Some(data.to_vec());
            }
            FIELD_STREAM_START_BYTES => {
                v3_only("StreamStartBytes")?;
                self.stream_start_bytes = Some(fixed("StreamStartBytes", data)?);
            }
            FIELD_INNER_RANDOM_STREAM_ID => {
                v3_only("InnerRandomStreamID")?;
                let id = u32::from_le_bytes(fixed("InnerRandomStreamID", data)?);
                self.inner_stream = Some(InnerStreamAlgorithm::from_id(id)?);
            }
            FIELD_KDF_PARAMETERS => {
                v4_only("KdfParameters")?;
                let dict = VariantDictionary::parse(data)?;
                self.kdf = Some(KdfParams::from_dictionary(&dict)?);
            }
            FIELD_PUBLIC_CUSTOM_DATA => {
                v4_only("PublicCustomData")?;
                self.public_custom_data = Some(VariantDictionary::parse(data)?);
            }
            other => {
                tracing::debug!("Skipping unknown header field {}", other);
            }
        }
        Ok(())
    }

    fn finish(
        self,
        version: FormatVersion,
        rules: FormatRules,
        raw: Vec<u8>,
        stored_hmac: Option<[u8; 32]>,
    ) -> Result<Header> {
        let cipher = self
            .cipher
            .ok_or_else(|| Error::malformed("CipherID", "missing"))?;
        let master_seed = self
            .master_seed
            .ok_or_else(|| Error::malformed("MasterSeed", "missing"))?;
        let iv = self
            .iv
            .ok_or_else(|| Error::malformed("EncryptionIV", "missing"))?;
        if iv.len() != cipher.iv_len() {
            return Err(Error::malformed(
                "EncryptionIV",
                format!("expected {} bytes, got {}", cipher.iv_len(), iv.len()),
            ));
        }

        let kdf = if rules.is_v4() {
            self.kdf
                .ok_or_else(|| Error::malformed("KdfParameters", "missing"))?
        } else {
            KdfParams::Aes {
                rounds: self
                    .transform_rounds
                    .ok_or_else(|| Error::malformed("TransformRounds", "missing"))?,
                seed: self
                    .transform_seed
                    .ok_or_else(|| Error::malformed("TransformSeed", "missing"))?,
            }
        };

        if !rules.is_v4() {
            if self.protected_stream_key.is_none() {
                return Err(Error::malformed("ProtectedStreamKey", "missing"));
            }
            if self.stream_start_bytes.is_none() {
                return Err(Error::malformed("StreamStartBytes", "missing"));
            }
            if self.inner_stream.is_none() {
                return Err(Error::malformed("InnerRandomStreamID", "missing"));
            }
        }

        Ok(Header {
            version,
            cipher,
            compression: self.compression.unwrap_or(Compression::None),
            master_seed,
            iv,
            kdf,
            comment: self.comment,
            public_custom_data: self.public_custom_data,
            protected_stream_key: self.protected_stream_key,
            stream_start_bytes: self.stream_start_bytes,
            inner_stream: self.inner_stream,
            rules,
            raw,
            stored_hmac,
        })
    }
}

/// What a save should produce: format generation, cipher, compression and KDF.
///
/// Seeds, IVs and keys are never part of the policy; they are regenerated on
/// every save.
#[derive(Debug, Clone)]
pub struct SavePolicy {
    pub version: FormatVersion,
    pub cipher: CipherId,
    pub compression: Compression,
    pub kdf: KdfParams,
    /// Reuse the KDF salt/seed instead of generating a new one. Required when
    /// saving with a pre-computed transformed key.
    pub keep_kdf_salt: bool,
    pub public_custom_data: Option<VariantDictionary>,
    /// Opaque header comment, written back unchanged
    pub comment: Option<Vec<u8>>,
}

impl SavePolicy {
    /// KDBX 4.0 with AES-256, gzip and Argon2d
    pub fn kdbx4() -> Self {
        Self {
            version: FormatVersion::V4_0,
            cipher: CipherId::Aes256Cbc,
            compression: Compression::Gzip,
            kdf: KdfParams::default_argon2(),
            keep_kdf_salt: false,
            public_custom_data: None,
            comment: None,
        }
    }

    /// KDBX 3.1 with AES-256, gzip and AES-KDF
    pub fn kdbx3() -> Self {
        Self {
            version: FormatVersion::V3_1,
            cipher: CipherId::Aes256Cbc,
            compression: Compression::Gzip,
            kdf: KdfParams::default_aes(),
            keep_kdf_salt: false,
            public_custom_data: None,
            comment: None,
        }
    }

    /// Keep everything the opened file declared
    pub fn from_header(header: &Header) -> Self {
        Self {
            version: header.version,
            cipher: header.cipher,
            compression: header.compression,
            kdf: header.kdf.clone(),
            keep_kdf_salt: false,
            public_custom_data: header.public_custom_data.clone(),
            comment: header.comment.clone(),
        }
    }

    pub fn validate(&self) -> Result<FormatRules> {
        let rules = FormatRules::for_version(self.version)
            .map_err(|_| Error::InvalidPolicy(format!("cannot write KDBX {}", self.version)))?;
        if !rules.is_v4() {
            if !matches!(self.kdf, KdfParams::Aes { .. }) {
                return Err(Error::InvalidPolicy(
                    "KDBX 3 only supports AES-KDF".to_string(),
                ));
            }
            if self.public_custom_data.is_some() {
                return Err(Error::InvalidPolicy(
                    "KDBX 3 has no public custom data".to_string(),
                ));
            }
        }
        Ok(rules)
    }

    /// Inner stream used to protect values in files written under this policy
    pub fn inner_stream(&self) -> InnerStreamAlgorithm {
        if self.version.major >= 4 {
            InnerStreamAlgorithm::ChaCha20
        } else {
            InnerStreamAlgorithm::Salsa20
        }
    }
}

impl Default for SavePolicy {
    fn default() -> Self {
        Self::kdbx4()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kdf::fast_argon2;

    fn v4_policy() -> SavePolicy {
        SavePolicy {
            kdf: fast_argon2(),
            ..SavePolicy::kdbx4()
        }
    }

    /// Raw header plus the trailing hash and an arbitrary HMAC
    fn v4_file(header: &Header) -> Vec<u8> {
        let mut data = header.raw_bytes().to_vec();
        data.extend_from_slice(&sha256(&[header.raw_bytes()]));
        data.extend_from_slice(&[0u8; 32]);
        data
    }

    #[test]
    fn test_v4_header_cycle() {
        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let header = Header::generate(&v4_policy(), &key).unwrap();
        let data = v4_file(&header);

        let parsed = Header::read(&data).unwrap();
        assert_eq!(parsed.version, FormatVersion::V4_0);
        assert_eq!(parsed.cipher, CipherId::Aes256Cbc);
        assert_eq!(parsed.compression, Compression::Gzip);
        assert_eq!(parsed.master_seed, header.master_seed);
        assert_eq!(parsed.iv, header.iv);
        assert_eq!(parsed.kdf, header.kdf);
        assert_eq!(parsed.body_offset(), data.len());
        assert!(parsed.protection_key().unwrap().is_none());
    }

    #[test]
    fn test_v3_header_cycle() {
        let key = ProtectionKey::generate(InnerStreamAlgorithm::Salsa20);
        let policy = SavePolicy {
            kdf: KdfParams::Aes {
                rounds: 10,
                seed: [0u8; 32],
            },
            ..SavePolicy::kdbx3()
        };
        let header = Header::generate(&policy, &key).unwrap();
        let parsed = Header::read(header.raw_bytes()).unwrap();

        assert_eq!(parsed.version, FormatVersion::V3_1);
        assert!(matches!(parsed.kdf, KdfParams::Aes { rounds: 10, .. }));
        assert_eq!(parsed.stream_start_bytes, header.stream_start_bytes);
        assert_eq!(parsed.inner_stream, Some(InnerStreamAlgorithm::Salsa20));
        assert_eq!(
            parsed.protection_key().unwrap().unwrap().key_bytes(),
            key.key_bytes()
        );
        assert_eq!(parsed.body_offset(), header.raw_bytes().len());
    }

    #[test]
    fn test_comment_and_rules_carry_over() {
        let key = ProtectionKey::generate(InnerStreamAlgorithm::Salsa20);
        let policy = SavePolicy {
            kdf: KdfParams::Aes {
                rounds: 10,
                seed: [0u8; 32],
            },
            comment: Some(b"made by hand".to_vec()),
            ..SavePolicy::kdbx3()
        };
        let parsed = Header::read(Header::generate(&policy, &key).unwrap().raw_bytes()).unwrap();
        assert_eq!(parsed.comment.as_deref(), Some(&b"made by hand"[..]));
        assert_eq!(parsed.rules(), FormatRules::V3 { minor: 1 });

        let again = Header::generate(&SavePolicy::from_header(&parsed), &key).unwrap();
        assert_eq!(again.comment, parsed.comment);
        assert_eq!(again.rules(), parsed.rules());
    }

    #[test]
    fn test_fresh_randomness_per_save() {
        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let a = Header::generate(&v4_policy(), &key).unwrap();
        let b = Header::generate(&v4_policy(), &key).unwrap();
        assert_ne!(a.master_seed, b.master_seed);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.kdf, b.kdf);

        let kept = Header::generate(
            &SavePolicy {
                keep_kdf_salt: true,
                ..v4_policy()
            },
            &key,
        )
        .unwrap();
        assert_eq!(kept.kdf, fast_argon2());
    }

    #[test]
    fn test_signatures() {
        assert!(matches!(Header::read(b"short"), Err(Error::BadSignature)));

        let mut data = vec![0u8; 16];
        assert!(matches!(Header::read(&data), Err(Error::BadSignature)));

        LittleEndian::write_u32(&mut data[0..4], SIGNATURE_1);
        LittleEndian::write_u32(&mut data[4..8], SIGNATURE_2_KDB);
        assert!(matches!(
            Header::read(&data),
            Err(Error::UnsupportedVersion { major: 1, .. })
        ));

        LittleEndian::write_u32(&mut data[4..8], SIGNATURE_2);
        LittleEndian::write_u32(&mut data[8..12], 0x0002_0000);
        assert!(matches!(
            Header::read(&data),
            Err(Error::UnsupportedVersion { major: 2, .. })
        ));
    }

    #[test]
    fn test_tampered_v4_header_hash() {
        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let header = Header::generate(&v4_policy(), &key).unwrap();
        let mut data = v4_file(&header);
        // Flip a byte of the master seed
        let seed_at = data
            .windows(32)
            .position(|w| w == header.master_seed)
            .unwrap();
        data[seed_at] ^= 0xFF;
        assert!(matches!(Header::read(&data), Err(Error::IntegrityMismatch)));
    }

    #[test]
    fn test_v3_field_in_v4_header() {
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(SIGNATURE_1).unwrap();
        data.write_u32::<LittleEndian>(SIGNATURE_2).unwrap();
        data.write_u32::<LittleEndian>(FormatVersion::V4_0.to_u32()).unwrap();
        data.push(FIELD_TRANSFORM_ROUNDS);
        data.write_u32::<LittleEndian>(8).unwrap();
        data.extend_from_slice(&6000u64.to_le_bytes());

        assert!(matches!(
            Header::read(&data),
            Err(Error::MalformedField {
                field: "TransformRounds",
                ..
            })
        ));
    }

    #[test]
    fn test_unsupported_cipher() {
        let twofish = uuid::uuid!("ad68f29f-576f-4bb9-a36a-d47af965346c");
        let mut data = Vec::new();
        data.write_u32::<LittleEndian>(SIGNATURE_1).unwrap();
        data.write_u32::<LittleEndian>(SIGNATURE_2).unwrap();
        data.write_u32::<LittleEndian>(FormatVersion::V3_1.to_u32()).unwrap();
        data.push(FIELD_CIPHER_ID);
        data.write_u16::<LittleEndian>(16).unwrap();
        data.extend_from_slice(twofish.as_bytes());

        assert!(matches!(
            Header::read(&data),
            Err(Error::UnsupportedCipher(id)) if id == twofish
        ));
    }

    #[test]
    fn test_truncated_header() {
        let key = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let header = Header::generate(&v4_policy(), &key).unwrap();
        let raw = header.raw_bytes();
        assert!(matches!(
            Header::read(&raw[..raw.len() - 3]),
            Err(Error::MalformedField { .. })
        ));
        // End field present but the hash is missing
        assert!(matches!(
            Header::read(raw),
            Err(Error::MalformedField {
                field: "HeaderHash",
                ..
            })
        ));
    }

    #[test]
    fn test_policy_validation() {
        let bad = SavePolicy {
            kdf: fast_argon2(),
            ..SavePolicy::kdbx3()
        };
        assert!(matches!(bad.validate(), Err(Error::InvalidPolicy(_))));
        assert_eq!(SavePolicy::kdbx3().inner_stream(), InnerStreamAlgorithm::Salsa20);
        assert_eq!(SavePolicy::kdbx4().inner_stream(), InnerStreamAlgorithm::ChaCha20);
    }
}
