//! Journal entries.
//!
//! An entry is the unit of replication: an immutable record naming the
//! application event, the aggregate it belongs to, and an opaque payload.

use crate::EntryId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// An immutable journal record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    /// Time-ordered unique id. Also the entry's ordering clock.
    pub id: EntryId,

    /// Tag of the application event (e.g. `"UserRenamed"`).
    pub event: String,

    /// Groups entries describing the same aggregate for conflict detection
    /// and compaction.
    pub primary_key: String,

    /// Payload encoded by the event's codec.
    pub payload: Vec<u8>,
}

impl Entry {
    /// Creates a new entry stamped with a fresh id.
    #[must_use]
    pub fn new(
        event: impl Into<String>,
        primary_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_id(EntryId::new(), event, primary_key, payload)
    }

    /// Creates an entry with an explicit id.
    #[must_use]
    pub fn with_id(
        id: EntryId,
        event: impl Into<String>,
        primary_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            event: event.into(),
            primary_key: primary_key.into(),
            payload: payload.into(),
        }
    }

    /// Creation time in milliseconds, decoded from the id.
    #[must_use]
    pub fn created_at(&self) -> u64 {
        self.id.millis()
    }

    /// Total order used wherever entries from several writers are sorted:
    /// by id, which embeds the timestamp and breaks ties on the random bits.
    #[must_use]
    pub fn cmp_by_id(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

/// An entry as delivered by a remote, tagged with the remote's sequence
/// number. The sequence is the resumption cursor for that remote only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub remote_sequence: u64,
    pub entry: Entry,
}

impl RemoteEntry {
    /// Wraps an entry with the sequence assigned by its remote.
    #[must_use]
    pub fn new(remote_sequence: u64, entry: Entry) -> Self {
        Self {
            remote_sequence,
            entry,
        }
    }
}
