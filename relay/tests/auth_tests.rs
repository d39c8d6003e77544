use axum::http::{HeaderMap, HeaderValue};
use synclog_relay::auth::{
    authenticate, is_valid_identity, remote_id, token_for, IDENTITY_HEADER, REMOTE_ID_HEADER,
    TOKEN_HEADER,
};
use synclog_relay::RelayError;
use synclog_types::RemoteId;

fn headers(identity: &str, token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(IDENTITY_HEADER, HeaderValue::from_str(identity).unwrap());
    headers.insert(TOKEN_HEADER, HeaderValue::from_str(token).unwrap());
    headers
}

#[test]
fn token_is_hex_sha256_and_deterministic() {
    let token = token_for("secret", "alice");
    assert_eq!(token.len(), 64);
    assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
    assert_eq!(token, token_for("secret", "alice"));
    assert_ne!(token, token_for("secret", "bob"));
    assert_ne!(token, token_for("other", "alice"));
}

#[test]
fn authenticate_accepts_matching_token() {
    let identity = authenticate(&headers("alice", &token_for("s", "alice")), "s").unwrap();
    assert_eq!(identity, "alice");
}

#[test]
fn authenticate_rejects_bad_token_and_missing_headers() {
    let err = authenticate(&headers("alice", "deadbeef"), "s").unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized(_)));

    let err = authenticate(&HeaderMap::new(), "s").unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized(_)));
}

#[test]
fn identities_are_restricted() {
    assert!(is_valid_identity("alice_01-x"));
    assert!(!is_valid_identity(""));
    assert!(!is_valid_identity("../etc"));
    assert!(!is_valid_identity("a b"));
    assert!(!is_valid_identity(&"a".repeat(65)));

    let err = authenticate(&headers("../etc", &token_for("s", "../etc")), "s").unwrap_err();
    assert!(matches!(err, RelayError::Unauthorized(_)));
}

#[test]
fn remote_id_header_is_optional() {
    assert_eq!(remote_id(&HeaderMap::new()).unwrap(), None);

    let id = RemoteId::new();
    let mut headers = HeaderMap::new();
    headers.insert(
        REMOTE_ID_HEADER,
        HeaderValue::from_str(&id.as_uuid().to_string()).unwrap(),
    );
    assert_eq!(remote_id(&headers).unwrap(), Some(id));

    headers.insert(REMOTE_ID_HEADER, HeaderValue::from_static("nope"));
    assert!(matches!(remote_id(&headers), Err(RelayError::Session(_))));
}
