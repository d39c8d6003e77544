//! Abstract payload encryption for the journal.
//!
//! The journal depends on `Arc<dyn PayloadEncryptor>` and never sees key
//! bytes. Tests and unencrypted deployments use [`PlaintextEncryptor`].

use crate::cipher;
use crate::error::CryptoError;
use crate::key::JournalKey;
use thiserror::Error;

/// Errors from the encryption layer.
#[derive(Debug, Error)]
pub enum EncryptorError {
    /// No key is loaded.
    #[error("encryptor unavailable (journal locked)")]
    Unavailable,
    /// Underlying crypto failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

pub type EncryptorResult<T> = Result<T, EncryptorError>;

/// Seals and opens entry payloads.
///
/// `aad` is the entry id; implementations must authenticate it.
pub trait PayloadEncryptor: Send + Sync {
    /// Encrypts a payload before it is written to storage.
    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> EncryptorResult<Vec<u8>>;

    /// Decrypts a payload read back from storage.
    fn open(&self, aad: &[u8], sealed: &[u8]) -> EncryptorResult<Vec<u8>>;

    /// Whether a key is loaded.
    fn is_available(&self) -> bool;
}

/// Stores payloads unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextEncryptor;

impl PayloadEncryptor for PlaintextEncryptor {
    fn seal(&self, _aad: &[u8], plaintext: &[u8]) -> EncryptorResult<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, _aad: &[u8], sealed: &[u8]) -> EncryptorResult<Vec<u8>> {
        Ok(sealed.to_vec())
    }

    fn is_available(&self) -> bool {
        true
    }
}

/// ChaCha20-Poly1305 encryptor holding a single journal key.
#[derive(Debug)]
pub struct KeyEncryptor {
    key: JournalKey,
}

impl KeyEncryptor {
    pub fn new(key: JournalKey) -> Self {
        Self { key }
    }
}

impl PayloadEncryptor for KeyEncryptor {
    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> EncryptorResult<Vec<u8>> {
        Ok(cipher::seal(&self.key, aad, plaintext)?)
    }

    fn open(&self, aad: &[u8], sealed: &[u8]) -> EncryptorResult<Vec<u8>> {
        Ok(cipher::open(&self.key, aad, sealed)?)
    }

    fn is_available(&self) -> bool {
        true
    }
}
