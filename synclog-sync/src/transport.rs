//! Transport layer abstraction.
//!
//! A [`RemoteTransport`] is what the event log talks to for one remote: a
//! resumable stream of remote batches and a way to push local entries.
//! A [`SyncBackend`] is the remote's side of the same contract (pull a page,
//! accept a push, announce head changes). [`pull_stream`] turns any backend
//! into a change stream, so both the in-memory hub and the network client
//! share one implementation.

use crate::error::SyncResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use synclog_types::{Entry, RemoteEntry, RemoteId};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::trace;

/// Stream of remote batches. Ends when the connection goes away; the caller
/// reopens it from its watermark.
pub type ChangeStream = BoxStream<'static, SyncResult<Vec<RemoteEntry>>>;

/// Acknowledgement of a push.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteAck {
    /// Entries the remote did not already have.
    pub accepted: usize,
    /// The remote's head sequence after the push.
    pub head_sequence: u64,
}

/// One page of a pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangePage {
    pub entries: Vec<RemoteEntry>,
    pub has_more: bool,
}

/// The event log's view of one remote.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Identity of the remote. Keys its cursors in the journal.
    fn remote_id(&self) -> RemoteId;

    /// Opens a stream of batches starting at `start_sequence`.
    async fn changes(&self, start_sequence: u64) -> SyncResult<ChangeStream>;

    /// Pushes local entries.
    async fn write(&self, entries: Vec<Entry>) -> SyncResult<WriteAck>;
}

/// A remote's side of the sync contract.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Entries with `remote_sequence >= since`, at most `limit`.
    async fn pull(&self, since: u64, limit: usize) -> SyncResult<ChangePage>;

    /// Stores entries not seen before.
    async fn push(&self, entries: Vec<Entry>) -> SyncResult<WriteAck>;

    /// Head sequence notifications.
    fn subscribe(&self) -> broadcast::Receiver<u64>;
}

/// Builds a change stream over a backend.
///
/// Pages are pulled until the backend runs dry; the stream then waits for a
/// head notification or `idle_poll`, whichever comes first. A pull error is
/// yielded once and ends the stream. Empty pages are never yielded.
pub fn pull_stream(
    backend: Arc<dyn SyncBackend>,
    start_sequence: u64,
    limit: usize,
    idle_poll: Duration,
) -> ChangeStream {
    struct PullState {
        backend: Arc<dyn SyncBackend>,
        cursor: u64,
        limit: usize,
        idle_poll: Duration,
        notify: broadcast::Receiver<u64>,
        failed: bool,
    }

    // Subscribe before the first pull so a head change in between is seen.
    let state = PullState {
        notify: backend.subscribe(),
        backend,
        cursor: start_sequence,
        limit: limit.max(1),
        idle_poll,
        failed: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        if state.failed {
            return None;
        }
        loop {
            match state.backend.pull(state.cursor, state.limit).await {
                Err(e) => {
                    state.failed = true;
                    return Some((Err(e), state));
                }
                Ok(page) => {
                    if let Some(last) = page.entries.last() {
                        state.cursor = state.cursor.max(last.remote_sequence + 1);
                        return Some((Ok(page.entries), state));
                    }
                }
            }

            trace!(cursor = state.cursor, "caught up, waiting for remote head");
            tokio::select! {
                received = state.notify.recv() => match received {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    // No more notifications; fall back to polling.
                    Err(RecvError::Closed) => tokio::time::sleep(state.idle_poll).await,
                },
                _ = tokio::time::sleep(state.idle_poll) => {}
            }
        }
    }))
}

/// In-memory remote for tests and single-process setups.
pub mod memory {
    use super::*;
    use crate::protocol::MAX_BATCH_SIZE;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use synclog_types::EntryId;

    const NOTIFY_CAPACITY: usize = 64;

    /// A shared append-only hub. Sequence numbers start at 1.
    pub struct MemoryRemote {
        state: Mutex<HubState>,
        notify: broadcast::Sender<u64>,
    }

    #[derive(Default)]
    struct HubState {
        log: Vec<Entry>,
        ids: HashSet<EntryId>,
    }

    impl MemoryRemote {
        pub fn new() -> Arc<Self> {
            let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
            Arc::new(Self {
                state: Mutex::new(HubState::default()),
                notify,
            })
        }

        /// A transport onto this hub, identified as `remote_id`.
        pub fn transport(self: &Arc<Self>, remote_id: RemoteId) -> MemoryTransport {
            MemoryTransport::new(remote_id, self.clone())
        }

        /// Everything stored, in arrival order.
        pub fn entries(&self) -> Vec<Entry> {
            self.lock().log.clone()
        }

        pub fn head_sequence(&self) -> u64 {
            self.lock().log.len() as u64
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl SyncBackend for MemoryRemote {
        async fn pull(&self, since: u64, limit: usize) -> SyncResult<ChangePage> {
            let state = self.lock();
            let skip = since.saturating_sub(1) as usize;
            let entries: Vec<RemoteEntry> = state
                .log
                .iter()
                .enumerate()
                .skip(skip)
                .take(limit)
                .map(|(index, entry)| RemoteEntry::new(index as u64 + 1, entry.clone()))
                .collect();
            let has_more = skip + entries.len() < state.log.len();
            Ok(ChangePage { entries, has_more })
        }

        async fn push(&self, entries: Vec<Entry>) -> SyncResult<WriteAck> {
            let (accepted, head) = {
                let mut state = self.lock();
                let mut accepted = 0;
                for entry in entries {
                    if state.ids.insert(entry.id) {
                        state.log.push(entry);
                        accepted += 1;
                    }
                }
                (accepted, state.log.len() as u64)
            };
            if accepted > 0 {
                let _ = self.notify.send(head);
            }
            Ok(WriteAck {
                accepted,
                head_sequence: head,
            })
        }

        fn subscribe(&self) -> broadcast::Receiver<u64> {
            self.notify.subscribe()
        }
    }

    /// [`RemoteTransport`] over a shared [`MemoryRemote`].
    #[derive(Clone)]
    pub struct MemoryTransport {
        remote_id: RemoteId,
        hub: Arc<MemoryRemote>,
        batch_size: usize,
        idle_poll: Duration,
    }

    impl MemoryTransport {
        pub fn new(remote_id: RemoteId, hub: Arc<MemoryRemote>) -> Self {
            Self {
                remote_id,
                hub,
                batch_size: MAX_BATCH_SIZE,
                idle_poll: Duration::from_secs(1),
            }
        }

        /// Overrides the page size used when pulling.
        pub fn with_batch_size(mut self, batch_size: usize) -> Self {
            self.batch_size = batch_size;
            self
        }

        pub fn hub(&self) -> &Arc<MemoryRemote> {
            &self.hub
        }
    }

    #[async_trait]
    impl RemoteTransport for MemoryTransport {
        fn remote_id(&self) -> RemoteId {
            self.remote_id
        }

        async fn changes(&self, start_sequence: u64) -> SyncResult<ChangeStream> {
            Ok(pull_stream(
                self.hub.clone(),
                start_sequence,
                self.batch_size,
                self.idle_poll,
            ))
        }

        async fn write(&self, entries: Vec<Entry>) -> SyncResult<WriteAck> {
            self.hub.push(entries).await
        }
    }
}
