//! Binary codec for entry batches.
//!
//! Every encoded batch starts with a one-byte format version followed by
//! the postcard encoding of the batch. Unknown versions and malformed
//! bodies are rejected with [`Error::Decode`].

use crate::{Entry, Error, RemoteEntry, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Current on-disk and on-wire format version.
pub const FORMAT_VERSION: u8 = 1;

/// Encodes a batch of entries.
pub fn encode(entries: &[Entry]) -> Result<Vec<u8>> {
    encode_versioned(entries)
}

/// Decodes a batch produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Vec<Entry>> {
    decode_versioned(bytes)
}

/// Encodes a batch of remote-sequenced entries.
pub fn encode_remote(entries: &[RemoteEntry]) -> Result<Vec<u8>> {
    encode_versioned(entries)
}

/// Decodes a batch produced by [`encode_remote`].
pub fn decode_remote(bytes: &[u8]) -> Result<Vec<RemoteEntry>> {
    decode_versioned(bytes)
}

/// Encodes any serializable value with the version prefix.
pub fn encode_versioned<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut out = vec![FORMAT_VERSION];
    let body = postcard::to_allocvec(value)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decodes a value written by [`encode_versioned`].
pub fn decode_versioned<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (version, body) = bytes
        .split_first()
        .ok_or_else(|| Error::Decode("empty input".to_string()))?;

    if *version != FORMAT_VERSION {
        return Err(Error::Decode(format!(
            "unsupported format version {version}, expected {FORMAT_VERSION}"
        )));
    }

    let (value, rest) =
        postcard::take_from_bytes(body).map_err(|e| Error::Decode(e.to_string()))?;
    if !rest.is_empty() {
        return Err(Error::Decode(format!("{} trailing bytes", rest.len())));
    }
    Ok(value)
}
