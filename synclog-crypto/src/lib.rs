//! Encryption layer for the synclog journal.
//!
//! Entry payloads are sealed with ChaCha20-Poly1305 before they reach disk.
//! The entry id is bound to every ciphertext as associated data, so a sealed
//! payload cannot be moved onto a different entry without failing
//! authentication.
//!
//! The journal only ever sees an `Arc<dyn PayloadEncryptor>`; key material
//! stays inside the encryptor.

mod cipher;
mod encryptor;
mod error;
mod key;

pub use cipher::{open, seal, NONCE_SIZE, SEALED_OVERHEAD, TAG_SIZE};
pub use encryptor::{
    EncryptorError, EncryptorResult, KeyEncryptor, PayloadEncryptor, PlaintextEncryptor,
};
pub use error::{CryptoError, CryptoResult};
pub use key::{JournalKey, KdfParams, Salt, KEY_SIZE, SALT_SIZE};
