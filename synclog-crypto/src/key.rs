//! Journal key material.
//!
//! A journal key is either random (stored by the host platform's keychain)
//! or derived from a passphrase with Argon2id.

use crate::error::{CryptoError, CryptoResult};
use argon2::{Argon2, Params, Version};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of journal keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// Size of salt in bytes.
pub const SALT_SIZE: usize = 16;

/// A 256-bit journal key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct JournalKey {
    bytes: [u8; KEY_SIZE],
}

impl JournalKey {
    /// Generates a fresh random key.
    pub fn random() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copies a key out of a slice, checking its length.
    pub fn from_slice(slice: &[u8]) -> CryptoResult<Self> {
        let bytes: [u8; KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self { bytes })
    }

    /// Derives a key from a passphrase using Argon2id.
    pub fn derive(passphrase: &str, salt: &Salt, params: &KdfParams) -> CryptoResult<Self> {
        let argon2_params = Params::new(
            params.memory_cost,
            params.time_cost,
            params.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        let mut bytes = [0u8; KEY_SIZE];
        Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, argon2_params)
            .hash_password_into(passphrase.as_bytes(), &salt.bytes, &mut bytes)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;

        Ok(Self { bytes })
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for JournalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Salt for passphrase derivation. Stored next to the journal; not secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Salt {
    bytes: [u8; SALT_SIZE],
}

impl Salt {
    /// Generates a random salt.
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a salt from raw bytes.
    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Self { bytes }
    }

    /// Returns the salt bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.bytes
    }
}

/// Argon2id cost parameters.
#[derive(Clone, Debug)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_cost: u32,
    /// Iterations.
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP Argon2id baseline: 19 MiB, 2 passes.
        Self {
            memory_cost: 19 * 1024,
            time_cost: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests. Never use for real journals.
    pub fn insecure_fast() -> Self {
        Self {
            memory_cost: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }
}
