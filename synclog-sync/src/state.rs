//! Per-remote sync state and the events observers see.

use synclog_storage::MergeReport;
use synclog_types::RemoteId;

/// Lifecycle of one registered remote.
///
/// `Idle -> Syncing -> Idle` for every cycle; `Stopped` once the remote is
/// removed or the log shuts down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    Idle,
    Syncing,
    Stopped,
}

/// Snapshot of a remote's sync progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStatus {
    pub remote_id: RemoteId,
    pub state: RemoteState,
    /// Inbound watermark after the last merge.
    pub next_sequence: u64,
    /// Completed cycles since registration.
    pub cycles: u64,
    /// Wall-clock millis of the last successful cycle.
    pub last_synced_at: Option<u64>,
    /// Most recent transport or storage failure, cleared by a successful
    /// cycle.
    pub last_error: Option<String>,
}

impl RemoteStatus {
    pub fn new(remote_id: RemoteId, next_sequence: u64) -> Self {
        Self {
            remote_id,
            state: RemoteState::Idle,
            next_sequence,
            cycles: 0,
            last_synced_at: None,
            last_error: None,
        }
    }
}

/// What one sync cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Offline writes committed before merging.
    pub flushed: usize,
    /// Remote merge result. Default when the cycle merged nothing.
    pub merge: MergeReport,
    /// Local entries pushed to the remote.
    pub pushed: usize,
}

/// Result of a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Success(CycleReport),
    Failure(String),
}

/// Sync lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Start { remote_id: RemoteId },
    /// Sent a short delay after the cycle finished.
    End {
        remote_id: RemoteId,
        outcome: SyncOutcome,
    },
}

impl SyncEvent {
    pub fn remote_id(&self) -> RemoteId {
        match self {
            SyncEvent::Start { remote_id } | SyncEvent::End { remote_id, .. } => *remote_id,
        }
    }
}

/// A reactivity key fired by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Invalidation {
    pub key: String,
    pub primary_key: String,
}
