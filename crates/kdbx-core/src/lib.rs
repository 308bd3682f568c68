//! kdbx-core - KeePass database container codec and document model
//!
//! Reads and writes KDBX 3.1 and 4.x files: the outer header, key
//! derivation (AES-KDF, Argon2d/id), authenticated block streams, AES-256 or
//! ChaCha20 body encryption, gzip, the inner header and the XML document.
//! The decoded [`Database`] is an arena of groups and entries that can be
//! edited and saved again.
//!
//! ```no_run
//! use kdbx_core::{Credentials, Database};
//!
//! # fn main() -> kdbx_core::Result<()> {
//! let bytes = std::fs::read("vault.kdbx")?;
//! let credentials = Credentials::from_password("correct horse battery staple");
//! let db = Database::open(&bytes, &credentials)?;
//! for entry in db.entries_in_order() {
//!     println!("{}", entry.title());
//! }
//! let saved = db.save(&credentials)?;
//! # let _ = saved;
//! # Ok(())
//! # }
//! ```

mod binary;
mod compression;
mod config;
mod crypto;
mod database;
pub mod document;
mod entry;
mod error;
mod group;
mod header;
mod kdbx;
mod kdf;
mod key;
mod meta;
mod progress;
mod protect;
mod rules;
mod stream;
mod times;
mod variant;

/// Written to `Meta/Generator` for databases created by this crate
pub const GENERATOR: &str = "kdbx-core";

pub use binary::{Binary, BinaryId, BinaryPool};
pub use compression::Compression;
pub use config::CodecConfig;
pub use crypto::CipherId;
pub use database::{Database, DatabaseMetadata, DeletedObject, EntryEditor, GroupTreeNode};
pub use entry::{
    Attachment, Entry, EntryBuilder, Field, FieldValue, SecureString, NOTES, PASSWORD,
    STANDARD_FIELDS, TITLE, URL, USER_NAME,
};
pub use error::{Error, ErrorKind, Result};
pub use group::{Group, GroupBuilder};
pub use header::{Header, SavePolicy};
pub use kdf::{Argon2Variant, KdfParams};
pub use key::Credentials;
pub use meta::{CustomDataItem, CustomIcon, MemoryProtection, Meta};
pub use progress::{NoProgress, Progress, ProgressEvent, Stage};
pub use protect::{InnerStreamAlgorithm, ProtectedValue, ProtectionKey, ProtectionStream};
pub use rules::{FormatRules, FormatVersion};
pub use times::Times;
pub use variant::{Variant, VariantDictionary};

// Re-export types that users might need
pub use uuid::Uuid;
