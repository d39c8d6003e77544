//! Core type definitions for synclog.
//!
//! This crate defines the data model shared by every other crate in the
//! workspace:
//! - Entry and remote identifiers (128-bit, time-ordered for entries)
//! - The immutable journal [`Entry`] and its remote-sequenced wrapper
//! - The compact binary codec used on disk and on the wire
//!
//! Application event schemas are not defined here. Payloads are opaque
//! bytes produced by the per-event codecs registered in `synclog-model`.

pub mod codec;
mod entry;
mod ids;

pub use codec::{decode, decode_remote, encode, encode_remote, FORMAT_VERSION};
pub use entry::{Entry, RemoteEntry};
pub use ids::{now_millis, EntryId, IdGenerator, RemoteId};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(#[from] postcard::Error),

    #[error("invalid id: {0}")]
    InvalidId(#[from] uuid::Error),
}
