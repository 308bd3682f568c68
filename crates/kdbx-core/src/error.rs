//! Error types for kdbx-core

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for kdbx-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding, encoding or editing a database
#[derive(Error, Debug)]
pub enum Error {
    /// The file does not start with the KDBX signature
    #[error("Not a KDBX file: bad signature")]
    BadSignature,

    /// The container uses a format generation this crate does not handle
    #[error("Unsupported KDBX version: {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },

    /// A header field has the wrong length, type or value
    #[error("Malformed header field {field}: {reason}")]
    MalformedField { field: &'static str, reason: String },

    /// The stored header hash does not match the header bytes
    #[error("Header integrity check failed")]
    IntegrityMismatch,

    /// KDF parameters or public custom data could not be decoded
    #[error("Malformed variant dictionary: {0}")]
    MalformedVariantDictionary(String),

    /// The body cipher is not supported
    #[error("Unsupported cipher: {0}")]
    UnsupportedCipher(Uuid),

    /// The key derivation function is not supported
    #[error("Unsupported key derivation function: {0}")]
    UnsupportedKdf(Uuid),

    /// Wrong password/key file, or a corrupted body; the two are not distinguishable
    #[error("Invalid credentials: incorrect password or key file, or the file is corrupted")]
    WrongCredentialsOrCorrupt,

    /// No password, key file or derived key was supplied
    #[error("No credentials supplied")]
    MissingCredentials,

    /// The key file could not be interpreted
    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    /// An authenticated block failed verification
    #[error("Block {index} failed integrity verification")]
    BlockIntegrityFailure { index: u64 },

    /// The body could not be decompressed or decoded after the credentials were verified
    #[error("Corrupt database body: {0}")]
    CorruptBody(String),

    /// The XML document is structurally invalid
    #[error("Malformed document at {path}: {reason}")]
    MalformedDocument { path: String, reason: String },

    /// The decompressed body exceeds the configured limit
    #[error("Database body exceeds the limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    /// A progress observer asked to stop
    #[error("Operation cancelled")]
    Cancelled,

    /// The save policy cannot be written in the requested format
    #[error("Invalid save policy: {0}")]
    InvalidPolicy(String),

    /// Decoding the freshly encoded bytes did not reproduce the database
    #[error("Save verification failed: {0}")]
    VerificationFailed(String),

    /// Entry not found
    #[error("Entry not found: {0}")]
    EntryNotFound(Uuid),

    /// Group not found
    #[error("Group not found: {0}")]
    GroupNotFound(Uuid),

    /// Invalid group operation
    #[error("Invalid group operation: {0}")]
    InvalidGroup(String),

    /// Moving a node would break the tree
    #[error("Invalid move: {0}")]
    InvalidMove(String),

    /// A UUID is already used by another group or entry
    #[error("Duplicate identifier: {0}")]
    DuplicateUuid(Uuid),

    /// A cipher or KDF primitive rejected its inputs
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),
}

/// Coarse classification of [`Error`] for callers deciding how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Signature, version, header field or variant dictionary problems
    Format,
    /// Wrong credentials (or corruption indistinguishable from them)
    Credential,
    /// Authenticated block or header hash failure
    Integrity,
    /// Decompression or document failure after the credentials were proven
    CorruptBody,
    /// A configured resource bound was exceeded
    ResourceLimit,
    /// Cancelled through a progress observer
    Cancelled,
    /// Invalid in-memory tree operation
    Model,
    /// Anything else
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadSignature
            | Error::UnsupportedVersion { .. }
            | Error::MalformedField { .. }
            | Error::MalformedVariantDictionary(_)
            | Error::UnsupportedCipher(_)
            | Error::UnsupportedKdf(_) => ErrorKind::Format,
            Error::WrongCredentialsOrCorrupt
            | Error::MissingCredentials
            | Error::InvalidKeyFile(_) => ErrorKind::Credential,
            Error::IntegrityMismatch | Error::BlockIntegrityFailure { .. } => ErrorKind::Integrity,
            Error::CorruptBody(_) | Error::MalformedDocument { .. } => ErrorKind::CorruptBody,
            Error::BodyTooLarge { .. } => ErrorKind::ResourceLimit,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::EntryNotFound(_)
            | Error::GroupNotFound(_)
            | Error::InvalidGroup(_)
            | Error::InvalidMove(_)
            | Error::DuplicateUuid(_) => ErrorKind::Model,
            Error::InvalidPolicy(_)
            | Error::VerificationFailed(_)
            | Error::Crypto(_)
            | Error::SerializationError(_)
            | Error::IoError(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn malformed(field: &'static str, reason: impl Into<String>) -> Self {
        Error::MalformedField {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn document(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedDocument {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<xml::writer::Error> for Error {
    fn from(err: xml::writer::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::BadSignature.kind(), ErrorKind::Format);
        assert_eq!(Error::WrongCredentialsOrCorrupt.kind(), ErrorKind::Credential);
        assert_eq!(
            Error::BlockIntegrityFailure { index: 3 }.kind(),
            ErrorKind::Integrity
        );
        assert_eq!(
            Error::document("KeePassFile/Root", "bad").kind(),
            ErrorKind::CorruptBody
        );
        assert_eq!(
            Error::BodyTooLarge { limit: 1 }.kind(),
            ErrorKind::ResourceLimit
        );
    }

    #[test]
    fn test_block_index_in_message() {
        let err = Error::BlockIntegrityFailure { index: 7 };
        assert!(err.to_string().contains('7'));
    }
}
