//! Key derivation: AES-KDF and Argon2
//!
//! Both take the 32-byte composite key and produce the 32-byte transformed
//! key that is later mixed with the master seed.

use crate::crypto::{random_array, random_vec, sha256};
use crate::error::{Error, Result};
use crate::progress::{checkpoint, Progress, ProgressEvent};
use crate::variant::{Variant, VariantDictionary};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use argon2::{Algorithm, Argon2, Params, Version};
use uuid::{uuid, Uuid};
use zeroize::Zeroizing;

pub const KDF_AES_KDBX3: Uuid = uuid!("c9d9f39a-628a-4460-bf74-0d08c18a4fea");
pub const KDF_AES_KDBX4: Uuid = uuid!("7c02bb82-79a7-4ac0-927d-114a00648238");
pub const KDF_ARGON2D: Uuid = uuid!("ef636ddf-8c29-444b-91f7-a9a403e30a0c");
pub const KDF_ARGON2ID: Uuid = uuid!("9e298b19-56db-4773-b23d-fc3ec6f0a1e6");

// VariantDictionary keys
const PARAM_UUID: &str = "$UUID";
const PARAM_AES_ROUNDS: &str = "R";
const PARAM_AES_SEED: &str = "S";
const PARAM_ARGON2_SALT: &str = "S";
const PARAM_ARGON2_PARALLELISM: &str = "P";
const PARAM_ARGON2_MEMORY: &str = "M";
const PARAM_ARGON2_ITERATIONS: &str = "I";
const PARAM_ARGON2_VERSION: &str = "V";
const PARAM_ARGON2_SECRET: &str = "K";
const PARAM_ARGON2_ASSOC_DATA: &str = "A";

const ARGON2_VERSION_10: u32 = 0x10;
const ARGON2_VERSION_13: u32 = 0x13;

/// AES-KDF rounds between progress reports
const AES_KDF_CHUNK: u64 = 10_000;

pub const TRANSFORMED_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Argon2Variant {
    Argon2d,
    Argon2id,
}

impl Argon2Variant {
    fn uuid(self) -> Uuid {
        match self {
            Argon2Variant::Argon2d => KDF_ARGON2D,
            Argon2Variant::Argon2id => KDF_ARGON2ID,
        }
    }

    fn algorithm(self) -> Algorithm {
        match self {
            Argon2Variant::Argon2d => Algorithm::Argon2d,
            Argon2Variant::Argon2id => Algorithm::Argon2id,
        }
    }
}

/// KDF parameters declared by the header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfParams {
    /// Iterated AES-256-ECB over the composite key
    Aes { rounds: u64, seed: [u8; 32] },
    /// Memory-hard Argon2; `memory` is in bytes as stored in the file
    Argon2 {
        variant: Argon2Variant,
        salt: Vec<u8>,
        memory: u64,
        iterations: u64,
        parallelism: u32,
        version: u32,
        secret: Option<Vec<u8>>,
    },
}

impl KdfParams {
    /// AES-KDF with KeePass's default round count and a random seed
    pub fn default_aes() -> Self {
        KdfParams::Aes {
            rounds: 60_000,
            seed: random_array(),
        }
    }

    /// Argon2d with KeePass's defaults (64 MiB, 2 iterations, 2 lanes)
    pub fn default_argon2() -> Self {
        KdfParams::Argon2 {
            variant: Argon2Variant::Argon2d,
            salt: random_vec(32),
            memory: 64 * 1024 * 1024,
            iterations: 2,
            parallelism: 2,
            version: ARGON2_VERSION_13,
            secret: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            KdfParams::Aes { .. } => KDF_AES_KDBX3,
            KdfParams::Argon2 { variant, .. } => variant.uuid(),
        }
    }

    /// Same costs, fresh seed/salt
    pub fn with_fresh_salt(&self) -> Self {
        match self {
            KdfParams::Aes { rounds, .. } => KdfParams::Aes {
                rounds: *rounds,
                seed: random_array(),
            },
            KdfParams::Argon2 {
                variant,
                salt,
                memory,
                iterations,
                parallelism,
                version,
                secret,
            } => KdfParams::Argon2 {
                variant: *variant,
                salt: random_vec(salt.len().max(16)),
                memory: *memory,
                iterations: *iterations,
                parallelism: *parallelism,
                version: *version,
                secret: secret.clone(),
            },
        }
    }

    /// Interpret a KDBX 4 `KdfParameters` dictionary. The parameters must
    /// match the algorithm named by `$UUID`.
    pub fn from_dictionary(dict: &VariantDictionary) -> Result<Self> {
        let uuid_bytes = dict
            .get_bytes(PARAM_UUID)
            .ok_or_else(|| Error::malformed("KdfParameters", "missing $UUID"))?;
        let uuid = Uuid::from_slice(uuid_bytes)
            .map_err(|_| Error::malformed("KdfParameters", "$UUID is not 16 bytes"))?;

        let missing = |key: &str| {
            Error::malformed(
                "KdfParameters",
                format!("{} parameter {:?} missing or mistyped", uuid, key),
            )
        };

        if uuid == KDF_AES_KDBX3 || uuid == KDF_AES_KDBX4 {
            let rounds = dict
                .get_u64(PARAM_AES_ROUNDS)
                .ok_or_else(|| missing(PARAM_AES_ROUNDS))?;
            let seed: [u8; 32] = dict
                .get_bytes(PARAM_AES_SEED)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| missing(PARAM_AES_SEED))?;
            return Ok(KdfParams::Aes { rounds, seed });
        }

        let variant = if uuid == KDF_ARGON2D {
            Argon2Variant::Argon2d
        } else if uuid == KDF_ARGON2ID {
            Argon2Variant::Argon2id
        } else {
            return Err(Error::UnsupportedKdf(uuid));
        };

        if dict.get(PARAM_ARGON2_ASSOC_DATA).is_some() {
            return Err(Error::malformed(
                "KdfParameters",
                "Argon2 associated data is not supported",
            ));
        }

        let secret = match dict.get(PARAM_ARGON2_SECRET) {
            None => None,
            Some(Variant::Bytes(secret)) => Some(secret.clone()),
            Some(_) => return Err(missing(PARAM_ARGON2_SECRET)),
        };

        let version = dict
            .get_u32(PARAM_ARGON2_VERSION)
            .ok_or_else(|| missing(PARAM_ARGON2_VERSION))?;
        if version != ARGON2_VERSION_10 && version != ARGON2_VERSION_13 {
            return Err(Error::malformed(
                "KdfParameters",
                format!("unknown Argon2 version 0x{:x}", version),
            ));
        }

        Ok(KdfParams::Argon2 {
            variant,
            salt: dict
                .get_bytes(PARAM_ARGON2_SALT)
                .ok_or_else(|| missing(PARAM_ARGON2_SALT))?
                .to_vec(),
            memory: dict
                .get_u64(PARAM_ARGON2_MEMORY)
                .ok_or_else(|| missing(PARAM_ARGON2_MEMORY))?,
            iterations: dict
                .get_u64(PARAM_ARGON2_ITERATIONS)
                .ok_or_else(|| missing(PARAM_ARGON2_ITERATIONS))?,
            parallelism: dict
                .get_u32(PARAM_ARGON2_PARALLELISM)
                .ok_or_else(|| missing(PARAM_ARGON2_PARALLELISM))?,
            version,
            secret,
        })
    }

    pub fn to_dictionary(&self) -> VariantDictionary {
        let mut dict = VariantDictionary::new();
        dict.insert(PARAM_UUID, Variant::Bytes(self.uuid().as_bytes().to_vec()));
        match self {
            KdfParams::Aes { rounds, seed } => {
                dict.insert(PARAM_AES_ROUNDS, Variant::UInt64(*rounds));
                dict.insert(PARAM_AES_SEED, Variant::Bytes(seed.to_vec()));
            }
            KdfParams::Argon2 {
                salt,
                memory,
                iterations,
                parallelism,
                version,
                secret,
                ..
            } => {
                dict.insert(PARAM_ARGON2_SALT, Variant::Bytes(salt.clone()));
                dict.insert(PARAM_ARGON2_PARALLELISM, Variant::UInt32(*parallelism));
                dict.insert(PARAM_ARGON2_MEMORY, Variant::UInt64(*memory));
                dict.insert(PARAM_ARGON2_ITERATIONS, Variant::UInt64(*iterations));
                dict.insert(PARAM_ARGON2_VERSION, Variant::UInt32(*version));
                if let Some(secret) = secret {
                    dict.insert(PARAM_ARGON2_SECRET, Variant::Bytes(secret.clone()));
                }
            }
        }
        dict
    }

    /// Run the KDF over the composite key
    pub fn transform(
        &self,
        composite_key: &[u8; 32],
        progress: &dyn Progress,
    ) -> Result<Zeroizing<[u8; TRANSFORMED_KEY_LEN]>> {
        match self {
            KdfParams::Aes { rounds, seed } => {
                tracing::debug!("AES-KDF: {} rounds", rounds);
                transform_aes(composite_key, seed, *rounds, progress)
            }
            KdfParams::Argon2 {
                variant,
                salt,
                memory,
                iterations,
                parallelism,
                version,
                secret,
            } => {
                tracing::debug!(
                    "Argon2: variant={:?}, memory={}KiB, iterations={}, parallelism={}, version=0x{:x}",
                    variant,
                    memory / 1024,
                    iterations,
                    parallelism,
                    version
                );
                checkpoint(
                    progress,
                    ProgressEvent::Kdf {
                        completed: 0,
                        total: *iterations,
                    },
                )?;
                let key = transform_argon2(
                    composite_key,
                    *variant,
                    salt,
                    *memory,
                    *iterations,
                    *parallelism,
                    *version,
                    secret.as_deref(),
                )?;
                checkpoint(
                    progress,
                    ProgressEvent::Kdf {
                        completed: *iterations,
                        total: *iterations,
                    },
                )?;
                Ok(key)
            }
        }
    }
}

fn transform_aes(
    composite_key: &[u8; 32],
    seed: &[u8; 32],
    rounds: u64,
    progress: &dyn Progress,
) -> Result<Zeroizing<[u8; 32]>> {
    let cipher = Aes256::new(GenericArray::from_slice(seed));
    let mut blocks = [
        GenericArray::clone_from_slice(&composite_key[..16]),
        GenericArray::clone_from_slice(&composite_key[16..]),
    ];

    let mut completed = 0;
    while completed < rounds {
        let step = AES_KDF_CHUNK.min(rounds - completed);
        for _ in 0..step {
            cipher.encrypt_blocks(&mut blocks);
        }
        completed += step;
        checkpoint(
            progress,
            ProgressEvent::Kdf {
                completed,
                total: rounds,
            },
        )?;
    }

    let mut transformed = Zeroizing::new([0u8; 32]);
    transformed[..16].copy_from_slice(&blocks[0]);
    transformed[16..].copy_from_slice(&blocks[1]);
    let hashed = sha256(&[transformed.as_slice()]);
    transformed.copy_from_slice(&hashed);
    Ok(transformed)
}

#[allow(clippy::too_many_arguments)]
fn transform_argon2(
    composite_key: &[u8; 32],
    variant: Argon2Variant,
    salt: &[u8],
    memory: u64,
    iterations: u64,
    parallelism: u32,
    version: u32,
    secret: Option<&[u8]>,
) -> Result<Zeroizing<[u8; 32]>> {
    let memory_kib = u32::try_from(memory / 1024)
        .map_err(|_| Error::malformed("KdfParameters", "Argon2 memory out of range"))?;
    let iterations = u32::try_from(iterations)
        .map_err(|_| Error::malformed("KdfParameters", "Argon2 iterations out of range"))?;

    let params = Params::new(
        memory_kib,
        iterations,
        parallelism,
        Some(TRANSFORMED_KEY_LEN),
    )
    .map_err(|e| Error::malformed("KdfParameters", format!("invalid Argon2 parameters: {}", e)))?;

    let version = match version {
        ARGON2_VERSION_10 => Version::V0x10,
        _ => Version::V0x13,
    };

    let argon2 = match secret {
        Some(secret) => Argon2::new_with_secret(secret, variant.algorithm(), version, params)
            .map_err(|e| Error::Crypto(format!("Argon2 secret rejected: {}", e)))?,
        None => Argon2::new(variant.algorithm(), version, params),
    };

    let mut output = Zeroizing::new([0u8; TRANSFORMED_KEY_LEN]);
    argon2
        .hash_password_into(composite_key, salt, output.as_mut_slice())
        .map_err(|e| Error::Crypto(format!("Argon2 computation failed: {}", e)))?;
    Ok(output)
}

/// Cheap Argon2id parameters for tests
#[cfg(test)]
pub(crate) fn fast_argon2() -> KdfParams {
    KdfParams::Argon2 {
        variant: Argon2Variant::Argon2id,
        salt: vec![42u8; 32],
        memory: 64 * 1024,
        iterations: 1,
        parallelism: 1,
        version: ARGON2_VERSION_13,
        secret: None,
    }
}
