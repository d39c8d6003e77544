//! Typed event kinds.

use crate::error::{HandlerError, HandlerResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use synclog_types::{Entry, RemoteId};

/// Describes one application event: its tag, payload type and the
/// aggregate a payload belongs to.
///
/// ```ignore
/// struct UserRenamed;
///
/// impl EventKind for UserRenamed {
///     const TAG: &'static str = "UserRenamed";
///     type Payload = Rename;
///
///     fn primary_key(payload: &Rename) -> String {
///         payload.user_id.clone()
///     }
/// }
/// ```
pub trait EventKind: Send + Sync + 'static {
    /// Tag stored in [`Entry::event`]. Must be unique per deployment.
    const TAG: &'static str;

    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Primary key of the aggregate this payload describes.
    fn primary_key(payload: &Self::Payload) -> String;

    /// Encodes a payload. JSON unless overridden.
    fn encode(payload: &Self::Payload) -> HandlerResult<Vec<u8>> {
        serde_json::to_vec(payload).map_err(|e| HandlerError::Payload {
            tag: Self::TAG.to_string(),
            message: e.to_string(),
        })
    }

    /// Decodes a payload. JSON unless overridden.
    fn decode(bytes: &[u8]) -> HandlerResult<Self::Payload> {
        serde_json::from_slice(bytes).map_err(|e| HandlerError::Payload {
            tag: Self::TAG.to_string(),
            message: e.to_string(),
        })
    }
}

/// An already-committed entry that shares the primary key of the entry
/// being applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub entry: Entry,
}

impl Conflict {
    /// Decodes the conflicting payload as `K`, or `None` if the conflict is
    /// a different kind of event.
    pub fn payload<K: EventKind>(&self) -> HandlerResult<Option<K::Payload>> {
        if self.entry.event != K::TAG {
            return Ok(None);
        }
        K::decode(&self.entry.payload).map(Some)
    }

    pub fn is<K: EventKind>(&self) -> bool {
        self.entry.event == K::TAG
    }
}

/// Everything a handler sees when an event is applied.
pub struct Applied<E: EventKind> {
    pub entry: Entry,
    pub payload: E::Payload,
    /// Committed entries with the same primary key, oldest commit first.
    /// Always empty for local writes.
    pub conflicts: Vec<Conflict>,
    /// Remote the entry came from, or `None` for a local write.
    pub origin: Option<RemoteId>,
}

impl<E: EventKind> Applied<E> {
    /// Whether the entry was written on this replica.
    pub fn is_local(&self) -> bool {
        self.origin.is_none()
    }

    pub fn primary_key(&self) -> &str {
        &self.entry.primary_key
    }
}
