//! Payload sealing using ChaCha20-Poly1305.
//!
//! Sealed layout: `nonce (12) || ciphertext || tag (16)`.

use crate::error::{CryptoError, CryptoResult};
use crate::key::JournalKey;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;

/// Size of nonce in bytes (96 bits for ChaCha20-Poly1305).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Bytes added to every plaintext by [`seal`].
pub const SEALED_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Encrypts `plaintext` under `key`, authenticating `aad` alongside it.
pub fn seal(key: &JournalKey, aad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypts a blob produced by [`seal`] with the same key and `aad`.
pub fn open(key: &JournalKey, aad: &[u8], sealed: &[u8]) -> CryptoResult<Vec<u8>> {
    if sealed.len() < SEALED_OVERHEAD {
        return Err(CryptoError::Truncated {
            minimum: SEALED_OVERHEAD,
            actual: sealed.len(),
        });
    }

    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());

    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            CryptoError::Decryption("authentication failed (wrong key or tampered data)".into())
        })
}
