//! Client credentials.
//!
//! A client names its identity and proves it with
//! `hex(sha256(secret || identity))`, where `secret` is shared between the
//! relay and whoever provisions clients.

use crate::error::{RelayError, RelayResult};
use axum::http::HeaderMap;
use sha2::{Digest, Sha256};
use synclog_sync::WsConnector;
use synclog_types::RemoteId;

pub const IDENTITY_HEADER: &str = "x-synclog-identity";
pub const TOKEN_HEADER: &str = "x-synclog-token";
/// Optional: the client's replica id, recorded with its session.
pub const REMOTE_ID_HEADER: &str = "x-synclog-remote-id";

const MAX_IDENTITY_LEN: usize = 64;

/// The token a client must present for `identity`.
pub fn token_for(secret: &str, identity: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(identity.as_bytes());
    hex::encode(hasher.finalize())
}

/// A WebSocket connector presenting `identity`'s credentials, for clients
/// dialing a relay's `/sync` endpoint (e.g. `ws://relay:4010/sync`).
pub fn connector(url: impl Into<String>, identity: &str, token: &str, remote_id: RemoteId) -> WsConnector {
    WsConnector::new(url)
        .with_header(IDENTITY_HEADER, identity)
        .with_header(TOKEN_HEADER, token)
        .with_header(REMOTE_ID_HEADER, remote_id.to_string())
}

/// Identities double as file names, so only `[A-Za-z0-9_-]` is allowed.
pub fn is_valid_identity(identity: &str) -> bool {
    !identity.is_empty()
        && identity.len() <= MAX_IDENTITY_LEN
        && identity
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Checks the credential headers and returns the identity.
pub fn authenticate(headers: &HeaderMap, secret: &str) -> RelayResult<String> {
    let identity = header(headers, IDENTITY_HEADER)?;
    if !is_valid_identity(identity) {
        return Err(RelayError::Unauthorized("invalid identity".into()));
    }
    let token = header(headers, TOKEN_HEADER)?;
    if !constant_time_eq(token.as_bytes(), token_for(secret, identity).as_bytes()) {
        return Err(RelayError::Unauthorized("bad token".into()));
    }
    Ok(identity.to_string())
}

/// The client's replica id, if it sent one.
pub fn remote_id(headers: &HeaderMap) -> RelayResult<Option<RemoteId>> {
    match headers.get(REMOTE_ID_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| RemoteId::parse(s).ok())
            .map(Some)
            .ok_or_else(|| RelayError::Session(format!("malformed {REMOTE_ID_HEADER} header"))),
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> RelayResult<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::Unauthorized(format!("missing {name} header")))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
