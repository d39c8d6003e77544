//! Wire protocol between a replica and a remote.
//!
//! The protocol is request/response keyed by `request_id`, plus unsolicited
//! `Notify` frames telling the client the remote's head moved:
//! 1. The client pulls `Changes` from a remote sequence onwards
//! 2. The client pushes local entries and gets a `PushAck`
//! 3. The remote sends `Notify` whenever its head advances
//!
//! A connection that multiplexes several logs (a relay dialing its upstream)
//! opens with a `Hello` naming the log it wants.
//!
//! Frames are postcard-encoded behind a one-byte protocol version.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use synclog_types::{Entry, RemoteEntry};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum number of entries to send in a single batch.
pub const MAX_BATCH_SIZE: usize = 100;

/// A sync protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncFrame {
    /// Ask for entries with `remote_sequence >= since`.
    Pull {
        request_id: u64,
        since: u64,
        limit: u32,
    },

    /// Answer to `Pull`.
    Changes {
        request_id: u64,
        entries: Vec<RemoteEntry>,
        /// More entries are available right away.
        has_more: bool,
    },

    /// Push local entries to the remote.
    Push {
        request_id: u64,
        entries: Vec<Entry>,
    },

    /// Answer to `Push`.
    PushAck {
        request_id: u64,
        /// Entries the remote did not already have.
        accepted: u32,
        head_sequence: u64,
    },

    /// Unsolicited: the remote's head moved.
    Notify { head_sequence: u64 },

    /// Error answer to a request, or a connection-level error.
    Error(ErrorFrame),

    /// First frame on an upstream connection: selects the identity's log.
    Hello { identity: String },
}

/// Error frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    /// Request this answers, if any.
    pub request_id: Option<u64>,
    pub message: String,
}

impl ErrorFrame {
    pub fn new(request_id: Option<u64>, message: impl Into<String>) -> Self {
        Self {
            request_id,
            message: message.into(),
        }
    }
}

impl SyncFrame {
    /// The request this frame belongs to. `None` for unsolicited frames.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            SyncFrame::Pull { request_id, .. }
            | SyncFrame::Changes { request_id, .. }
            | SyncFrame::Push { request_id, .. }
            | SyncFrame::PushAck { request_id, .. } => Some(*request_id),
            SyncFrame::Notify { .. } | SyncFrame::Hello { .. } => None,
            SyncFrame::Error(err) => err.request_id,
        }
    }

    /// Encodes the frame with its protocol version byte.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let mut out = vec![PROTOCOL_VERSION];
        let body = postcard::to_allocvec(self)
            .map_err(|e| SyncError::Protocol(format!("frame encode error: {e}")))?;
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decodes a frame, rejecting unknown protocol versions.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| SyncError::Protocol("empty frame".into()))?;
        if version != PROTOCOL_VERSION {
            return Err(SyncError::Protocol(format!(
                "version mismatch: expected {PROTOCOL_VERSION}, got {version}"
            )));
        }
        postcard::from_bytes(body).map_err(|e| SyncError::Protocol(format!("frame decode error: {e}")))
    }
}
