//! KDBX container pipeline: bytes ⇄ [`Database`]
//!
//! Open: header → key derivation → authenticated decryption → decompression
//! → (KDBX 4 inner header) → XML document. Save runs the same stages in
//! reverse with fresh seeds and keys, then decodes its own output before
//! returning it.

use crate::binary::Binary;
use crate::compression::Compression;
use crate::config::CodecConfig;
use crate::crypto::{hmac_base_key, master_key, sha256};
use crate::database::Database;
use crate::document::reader::{read_document, ReadContext, ReadOutcome};
use crate::document::writer::{canonical_xml, write_document, Protection, WriteOptions};
use crate::error::{Error, Result};
use crate::header::{Header, SavePolicy};
use crate::kdf::KdfParams;
use crate::key::Credentials;
use crate::progress::{checkpoint, NoProgress, Progress, ProgressEvent, Stage};
use crate::protect::{InnerStreamAlgorithm, ProtectionKey};
use crate::rules::FormatRules;
use crate::stream::{
    header_hmac, read_hashed_blocks, read_hmac_blocks, verify_header_hmac, write_hashed_blocks,
    write_hmac_blocks,
};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use zeroize::Zeroizing;

const INNER_HEADER_END: u8 = 0;
const INNER_HEADER_STREAM_ID: u8 = 1;
const INNER_HEADER_STREAM_KEY: u8 = 2;
const INNER_HEADER_BINARY: u8 = 3;

const BINARY_FLAG_PROTECTED: u8 = 0x01;

impl Database {
    /// Decode a KDBX 3.1 / 4.x file with default limits
    pub fn open(data: &[u8], credentials: &Credentials) -> Result<Database> {
        Self::open_with(data, credentials, &CodecConfig::default(), &NoProgress)
    }

    pub fn open_with(
        data: &[u8],
        credentials: &Credentials,
        config: &CodecConfig,
        progress: &dyn Progress,
    ) -> Result<Database> {
        checkpoint(progress, ProgressEvent::Stage(Stage::ReadHeader))?;
        let header = Header::read(data)?;
        let rules = header.rules();

        checkpoint(progress, ProgressEvent::Stage(Stage::DeriveKey))?;
        let transformed_key = derive_key(&header.kdf, credentials, progress)?;

        let outcome = decode_body(data, &header, rules, &transformed_key, config, progress)?;
        let db = Database::from_parts(outcome.parts, SavePolicy::from_header(&header));
        tracing::info!(
            "Opened KDBX {} database with {} groups and {} entries",
            header.version,
            db.groups().count(),
            db.entries().count()
        );
        Ok(db)
    }

    /// Encode with this database's policy and default limits
    pub fn save(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        self.save_with(self.policy(), credentials, &CodecConfig::default(), &NoProgress)
    }

    pub fn save_with(
        &self,
        policy: &SavePolicy,
        credentials: &Credentials,
        config: &CodecConfig,
        progress: &dyn Progress,
    ) -> Result<Vec<u8>> {
        let rules = policy.validate()?;
        if credentials.transformed_key().is_some() && !policy.keep_kdf_salt {
            return Err(Error::InvalidPolicy(
                "a derived key can only be reused when the KDF salt is kept".to_string(),
            ));
        }
        self.validate()?;

        let protection = ProtectionKey::generate(policy.inner_stream());
        let header = Header::generate(policy, &protection)?;

        checkpoint(progress, ProgressEvent::Stage(Stage::DeriveKey))?;
        let transformed_key = derive_key(&header.kdf, credentials, progress)?;

        checkpoint(progress, ProgressEvent::Stage(Stage::SerializeDocument))?;
        let output = write_document(
            self,
            WriteOptions {
                rules,
                header_hash: Some(sha256(&[header.raw_bytes()])),
                compress_binaries: matches!(policy.compression, Compression::Gzip),
                protection: Protection::Stream(protection.stream()),
            },
        )?;

        let mut payload = if rules.has_inner_header() {
            write_inner_header(&protection, &output.binaries)?
        } else {
            Vec::new()
        };
        payload.extend_from_slice(&output.xml);
        tracing::debug!(
            "Serialized {} bytes of XML and {} attachments",
            output.xml.len(),
            output.binaries.len()
        );

        checkpoint(progress, ProgressEvent::Stage(Stage::Compress))?;
        let payload = policy.compression.compress(payload)?;

        checkpoint(progress, ProgressEvent::Stage(Stage::Encrypt))?;
        let data = encrypt_body(&header, rules, &transformed_key, payload, config)?;

        if config.verify_after_save {
            checkpoint(progress, ProgressEvent::Stage(Stage::Verify))?;
            self.verify_saved(&data, rules, &transformed_key, config)?;
        }

        tracing::info!("Saved KDBX {} database ({} bytes)", policy.version, data.len());
        Ok(data)
    }

    /// Decode `data` again and compare it with `self`
    fn verify_saved(
        &self,
        data: &[u8],
        rules: FormatRules,
        transformed_key: &[u8; 32],
        config: &CodecConfig,
    ) -> Result<()> {
        let reread = Header::read(data)
            .and_then(|header| {
                let outcome =
                    decode_body(data, &header, rules, transformed_key, config, &NoProgress)?;
                Ok(Database::from_parts(outcome.parts, SavePolicy::from_header(&header)))
            })
            .map_err(|e| Error::VerificationFailed(e.to_string()))?;

        if canonical_xml(self, rules)? != canonical_xml(&reread, rules)? {
            return Err(Error::VerificationFailed(
                "re-read document differs from the saved one".to_string(),
            ));
        }
        tracing::debug!("Verified saved database");
        Ok(())
    }
}

/// Transformed key from the credentials, running the KDF unless it was supplied
fn derive_key(
    kdf: &KdfParams,
    credentials: &Credentials,
    progress: &dyn Progress,
) -> Result<Zeroizing<[u8; 32]>> {
    if let Some(key) = credentials.transformed_key() {
        tracing::debug!("Using supplied transformed key");
        return Ok(Zeroizing::new(*key));
    }
    let composite = credentials.composite_key()?;
    kdf.transform(&composite, progress)
}

/// Everything after the outer header, up to the parsed document
fn decode_body(
    data: &[u8],
    header: &Header,
    rules: FormatRules,
    transformed_key: &[u8; 32],
    config: &CodecConfig,
    progress: &dyn Progress,
) -> Result<ReadOutcome> {
    let body = data
        .get(header.body_offset()..)
        .ok_or_else(|| Error::malformed("Header", "file ends inside the header"))?;
    let master = master_key(&header.master_seed, transformed_key);

    checkpoint(progress, ProgressEvent::Stage(Stage::Decrypt))?;
    let payload = if rules.is_v4() {
        let hmac_base = hmac_base_key(&header.master_seed, transformed_key);
        let stored = header
            .stored_hmac()
            .ok_or_else(|| Error::malformed("HeaderHmac", "missing"))?;
        verify_header_hmac(header.raw_bytes(), stored, &hmac_base)?;
        let ciphertext = read_hmac_blocks(body, &hmac_base, progress)?;
        header
            .cipher
            .decrypt(&master, &header.iv, &ciphertext)
            .map_err(|e| Error::CorruptBody(format!("decryption failed: {}", e)))?
    } else {
        let plain = header
            .cipher
            .decrypt(&master, &header.iv, body)
            .map_err(|_| Error::WrongCredentialsOrCorrupt)?;
        let start = header
            .stream_start_bytes
            .ok_or_else(|| Error::malformed("StreamStartBytes", "missing"))?;
        if plain.len() < start.len() || plain[..start.len()] != start {
            return Err(Error::WrongCredentialsOrCorrupt);
        }
        read_hashed_blocks(&plain[start.len()..], progress)?
    };

    checkpoint(progress, ProgressEvent::Stage(Stage::Decompress))?;
    let payload = header.compression.decompress(payload, config.max_body_size)?;

    checkpoint(progress, ProgressEvent::Stage(Stage::ParseDocument))?;
    let (protection, inner_binaries, xml_start) = if rules.has_inner_header() {
        read_inner_header(&payload)?
    } else {
        let protection = header
            .protection_key()?
            .ok_or_else(|| Error::malformed("ProtectedStreamKey", "missing"))?;
        (protection, Vec::new(), 0)
    };

    let outcome = read_document(
        &payload[xml_start..],
        ReadContext {
            rules,
            protection,
            inner_binaries,
            max_binary_size: config.max_body_size,
        },
    )?;

    if let Some(stored) = &outcome.header_hash {
        if stored.as_slice() != sha256(&[header.raw_bytes()]) {
            tracing::debug!("Meta/HeaderHash does not match the outer header");
            return Err(Error::IntegrityMismatch);
        }
    }
    Ok(outcome)
}

fn encrypt_body(
    header: &Header,
    rules: FormatRules,
    transformed_key: &[u8; 32],
    payload: Vec<u8>,
    config: &CodecConfig,
) -> Result<Vec<u8>> {
    let master = master_key(&header.master_seed, transformed_key);
    let raw = header.raw_bytes();
    let mut out = raw.to_vec();

    if rules.is_v4() {
        let hmac_base = hmac_base_key(&header.master_seed, transformed_key);
        out.extend_from_slice(&sha256(&[raw]));
        out.extend_from_slice(&header_hmac(raw, &hmac_base)?);
        let ciphertext = header.cipher.encrypt(&master, &header.iv, &payload)?;
        out.extend_from_slice(&write_hmac_blocks(&ciphertext, &hmac_base, config.block_size)?);
    } else {
        let start = header
            .stream_start_bytes
            .ok_or_else(|| Error::malformed("StreamStartBytes", "missing"))?;
        let mut plain = Vec::with_capacity(start.len() + payload.len() + 80);
        plain.extend_from_slice(&start);
        plain.extend_from_slice(&write_hashed_blocks(&payload, config.block_size));
        out.extend_from_slice(&header.cipher.encrypt(&master, &header.iv, &plain)?);
    }
    Ok(out)
}

/// KDBX 4 inner header: `id u8 ‖ len u32 ‖ data` fields up to the end marker.
/// Returns the protection key, the attachment pool and where the XML starts.
fn read_inner_header(payload: &[u8]) -> Result<(ProtectionKey, Vec<Binary>, usize)> {
    let mut pos = 0;
    let mut stream_id = None;
    let mut stream_key = None;
    let mut binaries = Vec::new();

    loop {
        if payload.len() - pos < 5 {
            return Err(Error::CorruptBody("truncated inner header".to_string()));
        }
        let field_id = payload[pos];
        let field_len = LittleEndian::read_u32(&payload[pos + 1..pos + 5]) as usize;
        pos += 5;
        if field_len > payload.len() - pos {
            return Err(Error::CorruptBody(format!(
                "inner header field {} overruns the payload",
                field_id
            )));
        }
        let field = &payload[pos..pos + field_len];
        pos += field_len;

        match field_id {
            INNER_HEADER_END => break,
            INNER_HEADER_STREAM_ID => {
                if field.len() != 4 {
                    return Err(Error::CorruptBody("inner stream id must be 4 bytes".to_string()));
                }
                stream_id = Some(InnerStreamAlgorithm::from_id(LittleEndian::read_u32(field))?);
            }
            INNER_HEADER_STREAM_KEY => stream_key = Some(field.to_vec()),
            INNER_HEADER_BINARY => {
                let (flags, data) = field
                    .split_first()
                    .ok_or_else(|| Error::CorruptBody("empty inner binary field".to_string()))?;
                binaries.push(Binary {
                    data: data.to_vec(),
                    protected: flags & BINARY_FLAG_PROTECTED != 0,
                });
            }
            other => tracing::debug!("Skipping unknown inner header field {}", other),
        }
    }

    let algorithm =
        stream_id.ok_or_else(|| Error::CorruptBody("missing inner stream id".to_string()))?;
    let key = stream_key.ok_or_else(|| Error::CorruptBody("missing inner stream key".to_string()))?;
    Ok((ProtectionKey::new(algorithm, key)?, binaries, pos))
}

fn write_inner_header(protection: &ProtectionKey, binaries: &[Binary]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut field = |id: u8, parts: &[&[u8]]| -> Result<()> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let len = u32::try_from(len)
            .map_err(|_| Error::InvalidPolicy("inner header field exceeds 4 GiB".to_string()))?;
        out.push(id);
        out.write_u32::<LittleEndian>(len)?;
        for part in parts {
            out.extend_from_slice(part);
        }
        Ok(())
    };

    field(
        INNER_HEADER_STREAM_ID,
        &[protection.algorithm().id().to_le_bytes().as_slice()],
    )?;
    field(INNER_HEADER_STREAM_KEY, &[protection.key_bytes()])?;
    for binary in binaries {
        let flags = if binary.protected { BINARY_FLAG_PROTECTED } else { 0 };
        field(INNER_HEADER_BINARY, &[[flags].as_slice(), binary.data.as_slice()])?;
    }
    field(INNER_HEADER_END, &[])?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::node::XmlNode;
    use crate::entry::{EntryBuilder, FieldValue, PASSWORD};
    use crate::error::ErrorKind;
    use crate::group::GroupBuilder;
    use crate::kdf::fast_argon2;
    use crate::rules::FormatVersion;
    use std::cell::RefCell;
    use std::ops::ControlFlow;

    fn fast_v4() -> SavePolicy {
        SavePolicy {
            kdf: fast_argon2(),
            ..SavePolicy::kdbx4()
        }
    }

    fn fast_v3() -> SavePolicy {
        SavePolicy {
            kdf: KdfParams::Aes {
                rounds: 100,
                seed: [7u8; 32],
            },
            ..SavePolicy::kdbx3()
        }
    }

    fn sample(policy: SavePolicy) -> Database {
        let mut db = Database::with_policy("Vault", policy);
        let work = db.add_group(GroupBuilder::new("Work").build()).unwrap();
        db.add_entry(
            EntryBuilder::new("GitHub")
                .username("octocat")
                .password("correct horse battery staple")
                .url("https://github.com")
                .notes("line one\nline two")
                .custom_field("Recovery", "  spaced  ")
                .tag("dev")
                .parent_group(work)
                .build(),
        )
        .unwrap();
        db.add_entry(EntryBuilder::new("Mail").password("").build()).unwrap();
        db
    }

    fn password_of(db: &Database, title: &str) -> String {
        let entry = db.entries().find(|e| e.title() == title).unwrap();
        db.field_text(&entry.uuid, PASSWORD)
            .unwrap()
            .unwrap()
            .as_str()
            .to_string()
    }

    #[test]
    fn test_kdbx4_round_trip() {
        let db = sample(fast_v4());
        let credentials = Credentials::from_password("correct horse");
        let data = db.save(&credentials).unwrap();

        let reopened = Database::open(&data, &credentials).unwrap();
        assert_eq!(reopened.format_version(), FormatVersion::V4_0);
        assert_eq!(reopened.entries().count(), 2);
        assert_eq!(password_of(&reopened, "GitHub"), "correct horse battery staple");
        assert_eq!(password_of(&reopened, "Mail"), "");

        let github = reopened.entries().find(|e| e.title() == "GitHub").unwrap();
        assert_eq!(github.get_plain("Recovery"), Some("  spaced  "));
        assert_eq!(github.notes(), "line one\nline two");
        assert_eq!(github.tags, vec!["dev"]);
        assert_eq!(
            reopened.group_path(&github.parent_group.unwrap()),
            vec!["Vault", "Work"]
        );
    }

    #[test]
    fn test_kdbx3_round_trip() {
        let db = sample(fast_v3());
        let credentials = Credentials::from_password("correct horse");
        let data = db.save(&credentials).unwrap();

        let header = Header::read(&data).unwrap();
        assert_eq!(header.version, FormatVersion::V3_1);
        assert_eq!(header.inner_stream, Some(InnerStreamAlgorithm::Salsa20));

        let reopened = Database::open(&data, &credentials).unwrap();
        assert_eq!(reopened.format_version(), FormatVersion::V3_1);
        assert_eq!(password_of(&reopened, "GitHub"), "correct horse battery staple");
    }

    #[test]
    fn test_wrong_password() {
        for policy in [fast_v4(), fast_v3()] {
            let db = sample(policy);
            let data = db.save(&Credentials::from_password("correct horse")).unwrap();
            let err = Database::open(&data, &Credentials::from_password("wrong horse")).unwrap_err();
            assert!(matches!(err, Error::WrongCredentialsOrCorrupt), "{:?}", err);
            assert_eq!(err.kind(), ErrorKind::Credential);
        }
    }

    #[test]
    fn test_minimal_document_opens_only_with_its_password() {
        let mut db = Database::with_policy("Root", fast_v4());
        db.add_entry(EntryBuilder::new("Test").password("s3cret").build())
            .unwrap();
        let data = db.save(&Credentials::from_password("correct-horse")).unwrap();
        assert_eq!(Header::read(&data).unwrap().compression, Compression::Gzip);

        let opened = Database::open(&data, &Credentials::from_password("correct-horse")).unwrap();
        assert_eq!(opened.root_group().name, "Root");
        assert_eq!(opened.groups().count(), 1);
        let entries: Vec<_> = opened.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title(), "Test");
        assert!(entries[0].attachments.is_empty());
        assert!(entries[0].get(PASSWORD).unwrap().is_protected());
        assert_eq!(password_of(&opened, "Test"), "s3cret");

        let err = Database::open(&data, &Credentials::from_password("wrong-horse")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Credential);
    }

    #[test]
    fn test_missing_credentials() {
        let data = sample(fast_v4())
            .save(&Credentials::from_password("pw"))
            .unwrap();
        let err = Database::open(&data, &Credentials::new()).unwrap_err();
        assert!(matches!(err, Error::MissingCredentials));
    }

    #[test]
    fn test_password_and_key_file() {
        let db = sample(fast_v4());
        let credentials = Credentials::from_password("pw")
            .with_key_file(&[0x5a; 32])
            .unwrap();
        let data = db.save(&credentials).unwrap();

        assert!(Database::open(&data, &credentials).is_ok());
        let err = Database::open(&data, &Credentials::from_password("pw")).unwrap_err();
        assert!(matches!(err, Error::WrongCredentialsOrCorrupt));
    }

    #[test]
    fn test_tampered_block_is_detected() {
        let credentials = Credentials::from_password("pw");
        let mut data = sample(fast_v4()).save(&credentials).unwrap();
        let offset = Header::read(&data).unwrap().body_offset();
        data[offset + 36 + 10] ^= 0x01;

        let err = Database::open(&data, &credentials).unwrap_err();
        assert!(matches!(err, Error::BlockIntegrityFailure { index: 0 }), "{:?}", err);
    }

    #[test]
    fn test_tampered_header_hash() {
        let credentials = Credentials::from_password("pw");
        let mut data = sample(fast_v4()).save(&credentials).unwrap();
        let raw_len = Header::read(&data).unwrap().raw_bytes().len();
        data[raw_len] ^= 0x80;

        let err = Database::open(&data, &credentials).unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch));
    }

    #[test]
    fn test_tampered_kdbx3_body() {
        let credentials = Credentials::from_password("pw");
        let mut data = sample(fast_v3()).save(&credentials).unwrap();
        let last = data.len() - 20;
        data[last] ^= 0x01;

        let err = Database::open(&data, &credentials).unwrap_err();
        assert!(
            matches!(
                err,
                Error::WrongCredentialsOrCorrupt | Error::BlockIntegrityFailure { .. }
            ),
            "{:?}",
            err
        );
    }

    #[test]
    fn test_attachments_round_trip() {
        for policy in [fast_v4(), fast_v3()] {
            let mut db = sample(policy);
            let uuid = db.entries().find(|e| e.title() == "Mail").unwrap().uuid;
            db.add_attachment(&uuid, "key.pem", b"-----BEGIN KEY-----".to_vec())
                .unwrap();
            db.add_attachment(&uuid, "copy.pem", b"-----BEGIN KEY-----".to_vec())
                .unwrap();
            db.add_attachment(&uuid, "notes.txt", b"hello".to_vec()).unwrap();

            let credentials = Credentials::from_password("pw");
            let reopened = Database::open(&db.save(&credentials).unwrap(), &credentials).unwrap();
            assert_eq!(reopened.binaries().len(), 2);

            let entry = reopened.get_entry(&uuid).unwrap();
            let pem = entry.attachment("copy.pem").unwrap();
            assert_eq!(
                reopened.attachment_data(&pem.binary),
                Some(&b"-----BEGIN KEY-----"[..])
            );
            assert_eq!(pem.binary, entry.attachment("key.pem").unwrap().binary);
        }
    }

    #[test]
    fn test_replaced_attachments_are_not_counted() {
        let mut db = sample(fast_v4());
        let uuid = db.entries().find(|e| e.title() == "Mail").unwrap().uuid;
        for i in 0..5u8 {
            db.add_attachment(&uuid, "a.bin", vec![i; 16]).unwrap();
        }
        assert_eq!(db.metadata().attachment_count, 1);

        let credentials = Credentials::from_password("pw");
        let reopened = Database::open(&db.save(&credentials).unwrap(), &credentials).unwrap();
        assert_eq!(reopened.metadata().attachment_count, 1);
        assert_eq!(reopened.binaries().len(), db.binaries().len());
    }

    #[test]
    fn test_history_round_trip() {
        let mut db = sample(fast_v4());
        let uuid = db.entries().find(|e| e.title() == "GitHub").unwrap().uuid;
        db.edit_entry(&uuid, |editor| editor.set_field(PASSWORD, "second"))
            .unwrap();
        db.edit_entry(&uuid, |editor| editor.set_field(PASSWORD, "third"))
            .unwrap();

        let credentials = Credentials::from_password("pw");
        let reopened = Database::open(&db.save(&credentials).unwrap(), &credentials).unwrap();
        let entry = reopened.get_entry(&uuid).unwrap();
        assert_eq!(entry.history.len(), 2);
        assert_eq!(password_of(&reopened, "GitHub"), "third");

        let FieldValue::Protected(old) = entry.history[0].get(PASSWORD).unwrap() else {
            panic!("history password should stay protected");
        };
        assert_eq!(
            reopened.reveal(old).unwrap().as_str(),
            "correct horse battery staple"
        );
    }

    #[test]
    fn test_history_limit_applies_on_save() {
        let mut db = sample(fast_v4());
        let uuid = db.entries().find(|e| e.title() == "GitHub").unwrap().uuid;
        for i in 0..4 {
            db.edit_entry(&uuid, |editor| editor.set_field(PASSWORD, &format!("pw{}", i)))
                .unwrap();
        }
        db.meta.history_max_items = 2;

        let credentials = Credentials::from_password("pw");
        let reopened = Database::open(&db.save(&credentials).unwrap(), &credentials).unwrap();
        assert_eq!(reopened.get_entry(&uuid).unwrap().history.len(), 2);
    }

    #[test]
    fn test_unknown_elements_survive() {
        let mut db = sample(fast_v4());
        db.meta
            .unknown
            .push(XmlNode::text("FuturePluginSetting", "42"));
        let uuid = db.entries().find(|e| e.title() == "Mail").unwrap().uuid;
        db.get_entry_mut(&uuid)
            .unwrap()
            .unknown
            .push(XmlNode::new("QualityCheck").with_attr("Level", "high"));

        let credentials = Credentials::from_password("pw");
        let reopened = Database::open(&db.save(&credentials).unwrap(), &credentials).unwrap();
        assert_eq!(
            reopened.meta.unknown,
            vec![XmlNode::text("FuturePluginSetting", "42")]
        );
        assert_eq!(reopened.get_entry(&uuid).unwrap().unknown[0].attr("Level"), Some("high"));
    }

    #[test]
    fn test_group_tags_need_kdbx41() {
        let mut policy = fast_v4();
        policy.version = FormatVersion::V4_1;
        let mut db = Database::with_policy("Vault", policy);
        let tagged = db
            .add_group(GroupBuilder::new("Tagged").tag("infra").build())
            .unwrap();

        let credentials = Credentials::from_password("pw");
        let reopened = Database::open(&db.save(&credentials).unwrap(), &credentials).unwrap();
        assert_eq!(reopened.get_group(&tagged).unwrap().tags, vec!["infra"]);

        let data = db
            .save_with(&fast_v4(), &credentials, &CodecConfig::default(), &NoProgress)
            .unwrap();
        let downgraded = Database::open(&data, &credentials).unwrap();
        assert!(downgraded.get_group(&tagged).unwrap().tags.is_empty());
    }

    #[test]
    fn test_each_save_is_fresh() {
        let db = sample(fast_v4());
        let credentials = Credentials::from_password("pw");
        let first = db.save(&credentials).unwrap();
        let second = db.save(&credentials).unwrap();
        assert_ne!(first, second);

        let a = Header::read(&first).unwrap();
        let b = Header::read(&second).unwrap();
        assert_ne!(a.master_seed, b.master_seed);
        assert_ne!(a.kdf, b.kdf);
    }

    #[test]
    fn test_transformed_key() {
        let mut policy = fast_v4();
        policy.keep_kdf_salt = true;
        let db = sample(policy.clone());
        let data = db.save(&Credentials::from_password("pw")).unwrap();

        let header = Header::read(&data).unwrap();
        let composite = Credentials::from_password("pw").composite_key().unwrap();
        let key = header.kdf.transform(&composite, &NoProgress).unwrap();

        let derived = Credentials::from_transformed_key(*key);
        let reopened = Database::open(&data, &derived).unwrap();
        assert_eq!(password_of(&reopened, "GitHub"), "correct horse battery staple");

        // Same KDF parameters, so the derived key still opens the re-save
        let resaved = reopened
            .save_with(&policy, &derived, &CodecConfig::default(), &NoProgress)
            .unwrap();
        assert!(Database::open(&resaved, &Credentials::from_password("pw")).is_ok());

        let err = reopened.save(&derived).unwrap_err();
        assert!(matches!(err, Error::InvalidPolicy(_)));
    }

    #[test]
    fn test_cancel_during_decrypt() {
        let credentials = Credentials::from_password("pw");
        let data = sample(fast_v4()).save(&credentials).unwrap();

        let seen = RefCell::new(Vec::new());
        let observer = |event: ProgressEvent| {
            seen.borrow_mut().push(event);
            if event == ProgressEvent::Stage(Stage::Decrypt) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        };
        let err = Database::open_with(&data, &credentials, &CodecConfig::default(), &observer)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(
            seen.borrow().first(),
            Some(&ProgressEvent::Stage(Stage::ReadHeader))
        );
    }

    #[test]
    fn test_progress_reports_blocks() {
        let credentials = Credentials::from_password("pw");
        let data = sample(fast_v4()).save(&credentials).unwrap();

        let blocks = RefCell::new(Vec::new());
        let observer = |event: ProgressEvent| {
            if let ProgressEvent::BlockVerified { index } = event {
                blocks.borrow_mut().push(index);
            }
            ControlFlow::Continue(())
        };
        Database::open_with(&data, &credentials, &CodecConfig::default(), &observer).unwrap();
        // One data block plus the terminator
        assert_eq!(*blocks.borrow(), vec![0, 1]);
    }

    #[test]
    fn test_small_blocks() {
        let db = sample(fast_v3());
        let credentials = Credentials::from_password("pw");
        let config = CodecConfig {
            block_size: 64,
            ..CodecConfig::default()
        };
        let data = db
            .save_with(db.policy(), &credentials, &config, &NoProgress)
            .unwrap();
        let reopened = Database::open(&data, &credentials).unwrap();
        assert_eq!(reopened.entries().count(), 2);
    }

    #[test]
    fn test_body_too_large() {
        let credentials = Credentials::from_password("pw");
        let data = sample(fast_v4()).save(&credentials).unwrap();
        let config = CodecConfig {
            max_body_size: 128,
            ..CodecConfig::default()
        };
        let err = Database::open_with(&data, &credentials, &config, &NoProgress).unwrap_err();
        assert!(matches!(err, Error::BodyTooLarge { limit: 128 }));
        assert_eq!(err.kind(), ErrorKind::ResourceLimit);
    }

    #[test]
    fn test_save_to_other_format() {
        let db = sample(fast_v4());
        let credentials = Credentials::from_password("pw");
        let data = db
            .save_with(&fast_v3(), &credentials, &CodecConfig::default(), &NoProgress)
            .unwrap();
        let reopened = Database::open(&data, &credentials).unwrap();
        assert_eq!(reopened.format_version(), FormatVersion::V3_1);
        assert_eq!(password_of(&reopened, "GitHub"), "correct horse battery staple");
    }

    #[test]
    fn test_inner_header_cycle() {
        let protection = ProtectionKey::generate(InnerStreamAlgorithm::ChaCha20);
        let binaries = vec![
            Binary {
                data: b"abc".to_vec(),
                protected: true,
            },
            Binary {
                data: Vec::new(),
                protected: false,
            },
        ];
        let mut payload = write_inner_header(&protection, &binaries).unwrap();
        payload.extend_from_slice(b"<KeePassFile/>");

        let (key, read, start) = read_inner_header(&payload).unwrap();
        assert_eq!(key.algorithm(), InnerStreamAlgorithm::ChaCha20);
        assert_eq!(key.key_bytes(), protection.key_bytes());
        assert_eq!(read, binaries);
        assert_eq!(&payload[start..], b"<KeePassFile/>");
    }
}
