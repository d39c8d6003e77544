use synclog_crypto::{open, seal, CryptoError, JournalKey, NONCE_SIZE, SEALED_OVERHEAD};

const AAD: &[u8] = b"entry-0001";

#[test]
fn seal_open_roundtrip() {
    let key = JournalKey::random();
    let sealed = seal(&key, AAD, b"Hello, World!").unwrap();
    assert_eq!(open(&key, AAD, &sealed).unwrap(), b"Hello, World!");
}

#[test]
fn seal_open_empty() {
    let key = JournalKey::random();
    let sealed = seal(&key, AAD, b"").unwrap();
    assert_eq!(sealed.len(), SEALED_OVERHEAD);
    assert!(open(&key, AAD, &sealed).unwrap().is_empty());
}

#[test]
fn seal_open_large_payload() {
    let key = JournalKey::random();
    let plaintext: Vec<u8> = (0..10_000).map(|i| (i % 256) as u8).collect();
    let sealed = seal(&key, AAD, &plaintext).unwrap();
    assert_eq!(sealed.len(), plaintext.len() + SEALED_OVERHEAD);
    assert_eq!(open(&key, AAD, &sealed).unwrap(), plaintext);
}

#[test]
fn wrong_key_fails() {
    let sealed = seal(&JournalKey::random(), AAD, b"Secret").unwrap();
    let err = open(&JournalKey::random(), AAD, &sealed).unwrap_err();
    assert!(matches!(err, CryptoError::Decryption(_)));
}

#[test]
fn wrong_aad_fails() {
    let key = JournalKey::random();
    let sealed = seal(&key, AAD, b"Secret").unwrap();
    assert!(open(&key, b"entry-0002", &sealed).is_err());
}

#[test]
fn tampered_ciphertext_fails() {
    let key = JournalKey::random();
    let mut sealed = seal(&key, AAD, b"Secret").unwrap();
    sealed[NONCE_SIZE] ^= 0xFF;
    assert!(open(&key, AAD, &sealed).is_err());
}

#[test]
fn truncated_blob_fails() {
    let key = JournalKey::random();
    let err = open(&key, AAD, &[0u8; 10]).unwrap_err();
    assert!(matches!(
        err,
        CryptoError::Truncated {
            minimum: SEALED_OVERHEAD,
            actual: 10
        }
    ));
}

#[test]
fn same_plaintext_uses_fresh_nonces() {
    let key = JournalKey::random();
    let a = seal(&key, AAD, b"Same").unwrap();
    let b = seal(&key, AAD, b"Same").unwrap();
    assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    assert_ne!(a, b);
}
