//! The event log: a journal, a registry and the per-remote sync loops.
//!
//! Local writes go through [`EventLog::write`]. Each registered remote gets
//! two background tasks under one cancellation scope:
//! - inbound: streams remote batches from the persisted watermark and merges
//!   each one in a sync cycle
//! - outbound: wakes on journal commits (coalesced) or the poll interval and
//!   pushes whatever the remote has not accepted yet
//!
//! A per-remote one-permit gate keeps cycles for the same remote from
//! overlapping. [`EventLog::sync_now`] only tries the gate and reports
//! `false` when a cycle is already running.

use crate::error::{SyncError, SyncResult};
use crate::protocol::MAX_BATCH_SIZE;
use crate::state::{
    CycleReport, Invalidation, RemoteState, RemoteStatus, SyncEvent, SyncOutcome,
};
use crate::transport::RemoteTransport;
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use synclog_model::{EventKind, HandlerError, HandlerOutput, Registry};
use synclog_storage::{Compaction, Journal, RemoteMerge};
use synclog_types::{now_millis, Entry, RemoteEntry, RemoteId};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the event log.
#[derive(Debug, Clone)]
pub struct EventLogConfig {
    /// Delay before reopening a failed or finished change stream, and the
    /// outbound loop's wake-up interval when nothing is committed.
    pub poll_interval: Duration,
    /// Minimum spacing between outbound pushes.
    pub push_interval: Duration,
    /// Delay between the end of a cycle and its `SyncEvent::End`.
    pub sync_end_delay: Duration,
    /// Maximum entries per push.
    pub batch_size: usize,
    /// Capacity of the sync event and invalidation channels.
    pub event_capacity: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            push_interval: Duration::from_millis(250),
            sync_end_delay: Duration::from_millis(100),
            batch_size: MAX_BATCH_SIZE,
            event_capacity: 256,
        }
    }
}

/// A write queued while offline.
#[derive(Clone)]
struct PendingWrite {
    event: &'static str,
    primary_key: String,
    payload: Vec<u8>,
}

/// State shared by the public handle and the background loops.
struct Core {
    journal: Journal,
    registry: Registry,
    config: EventLogConfig,
    pending: Mutex<VecDeque<PendingWrite>>,
    flush_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    invalidations: broadcast::Sender<Invalidation>,
}

/// One registered remote, shared with its loops.
struct RemoteShared {
    remote_id: RemoteId,
    transport: Arc<dyn RemoteTransport>,
    gate: Semaphore,
    push_lock: tokio::sync::Mutex<()>,
    status: Mutex<RemoteStatus>,
}

struct RemoteHandle {
    shared: Arc<RemoteShared>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    core: Arc<Core>,
    remotes: tokio::sync::Mutex<HashMap<RemoteId, RemoteHandle>>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to an event log. Cloning shares it; dropping the last handle
/// stops all sync loops.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

impl EventLog {
    pub fn new(journal: Journal, registry: Registry, config: EventLogConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (invalidations, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                core: Arc::new(Core {
                    journal,
                    registry,
                    config,
                    pending: Mutex::new(VecDeque::new()),
                    flush_lock: tokio::sync::Mutex::new(()),
                    events,
                    invalidations,
                }),
                remotes: tokio::sync::Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.inner.core.journal
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.core.registry
    }

    // ── Local writes ─────────────────────────────────────────────

    /// Commits `payload` as an `E` entry and returns the handler's output.
    ///
    /// Nothing is committed if the handler fails.
    pub async fn write<E: EventKind>(&self, payload: E::Payload) -> SyncResult<HandlerOutput> {
        let core = &self.inner.core;
        let primary_key = E::primary_key(&payload);
        let bytes = E::encode(&payload)?;
        core.commit_local(E::TAG, primary_key, bytes).await
    }

    /// Queues an `E` entry for the next sync cycle.
    pub fn enqueue<E: EventKind>(&self, payload: E::Payload) -> SyncResult<()> {
        let primary_key = E::primary_key(&payload);
        let payload = E::encode(&payload)?;
        lock(&self.inner.core.pending).push_back(PendingWrite {
            event: E::TAG,
            primary_key,
            payload,
        });
        Ok(())
    }

    /// Writes queued with [`EventLog::enqueue`] that have not been committed.
    pub fn pending_len(&self) -> usize {
        lock(&self.inner.core.pending).len()
    }

    /// Commits every queued write in order. Returns how many committed.
    pub async fn flush_pending(&self) -> SyncResult<usize> {
        self.inner.core.flush_pending().await
    }

    // ── Remotes ──────────────────────────────────────────────────

    /// Starts syncing with a remote.
    pub async fn register_remote(&self, transport: Arc<dyn RemoteTransport>) -> SyncResult<()> {
        let core = &self.inner.core;
        let remote_id = transport.remote_id();
        let mut remotes = self.inner.remotes.lock().await;
        if remotes.contains_key(&remote_id) {
            return Err(SyncError::RemoteExists(remote_id));
        }

        core.journal.track_remote(remote_id).await?;
        let next = core.journal.next_remote_sequence(remote_id).await?;
        let shared = Arc::new(RemoteShared {
            remote_id,
            transport,
            gate: Semaphore::new(1),
            push_lock: tokio::sync::Mutex::new(()),
            status: Mutex::new(RemoteStatus::new(remote_id, next)),
        });

        // Subscribe before spawning so no commit slips past the outbound loop.
        let changes = core.journal.changes();
        let cancel = self.inner.shutdown.child_token();
        let tasks = vec![
            tokio::spawn(inbound_loop(core.clone(), shared.clone(), cancel.clone())),
            tokio::spawn(outbound_loop(
                core.clone(),
                shared.clone(),
                changes,
                cancel.clone(),
            )),
        ];
        info!(remote = %remote_id, next_sequence = next, "registered remote");

        remotes.insert(
            remote_id,
            RemoteHandle {
                shared,
                cancel,
                tasks,
            },
        );
        Ok(())
    }

    /// Stops syncing with a remote and waits for its loops to finish.
    /// Cursors stay in the journal, so registering it again resumes.
    pub async fn remove_remote(&self, remote_id: RemoteId) -> SyncResult<()> {
        let handle = self
            .inner
            .remotes
            .lock()
            .await
            .remove(&remote_id)
            .ok_or(SyncError::RemoteNotFound(remote_id))?;
        stop_remote(handle).await;
        info!(remote = %remote_id, "removed remote");
        Ok(())
    }

    /// Runs a cycle for `remote_id` now: flush queued writes, push.
    /// Returns `false` without doing anything if a cycle is in progress.
    pub async fn sync_now(&self, remote_id: RemoteId) -> SyncResult<bool> {
        let shared = self
            .inner
            .remotes
            .lock()
            .await
            .get(&remote_id)
            .map(|handle| handle.shared.clone())
            .ok_or(SyncError::RemoteNotFound(remote_id))?;

        let Ok(_permit) = shared.gate.try_acquire() else {
            debug!(remote = %remote_id, "sync already in progress");
            return Ok(false);
        };
        run_cycle(&self.inner.core, &shared, Vec::new(), true).await?;
        Ok(true)
    }

    pub async fn remote_status(&self, remote_id: RemoteId) -> Option<RemoteStatus> {
        self.inner
            .remotes
            .lock()
            .await
            .get(&remote_id)
            .map(|handle| lock(&handle.shared.status).clone())
    }

    /// Registered remotes.
    pub async fn remotes(&self) -> Vec<RemoteId> {
        self.inner.remotes.lock().await.keys().copied().collect()
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.core.events.subscribe()
    }

    pub fn invalidations(&self) -> broadcast::Receiver<Invalidation> {
        self.inner.core.invalidations.subscribe()
    }

    /// All entries ordered by id.
    pub async fn entries(&self) -> SyncResult<Vec<Entry>> {
        Ok(self.inner.core.journal.entries().await?)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Flushes queued writes, stops every remote (each pushes one last
    /// time) and closes the journal.
    pub async fn shutdown(&self) -> SyncResult<()> {
        if let Err(e) = self.flush_pending().await {
            warn!("flushing queued writes on shutdown failed: {e}");
        }
        self.stop_all().await;
        self.inner.core.journal.close();
        info!("event log shut down");
        Ok(())
    }

    /// Stops every remote and erases the journal and the write queue.
    pub async fn destroy(&self) -> SyncResult<()> {
        self.stop_all().await;
        lock(&self.inner.core.pending).clear();
        self.inner.core.journal.destroy().await?;
        info!("event log destroyed");
        Ok(())
    }

    async fn stop_all(&self) {
        let handles: Vec<RemoteHandle> = self
            .inner
            .remotes
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for handle in handles {
            stop_remote(handle).await;
        }
    }
}

async fn stop_remote(handle: RemoteHandle) {
    handle.cancel.cancel();
    for task in handle.tasks {
        if let Err(e) = task.await {
            warn!(remote = %handle.shared.remote_id, "sync task failed: {e}");
        }
    }
    handle.shared.update(|status| status.state = RemoteState::Stopped);
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Core {
    async fn commit_local(
        &self,
        event: &'static str,
        primary_key: String,
        payload: Vec<u8>,
    ) -> SyncResult<HandlerOutput> {
        self.registry.resolve().await?;
        let registry = self.registry.clone();
        let output = self
            .journal
            .write(event, primary_key.clone(), payload, |entry| async move {
                registry
                    .dispatch(entry, Vec::new(), None)
                    .await
                    .map_err(SyncError::from)
            })
            .await?;
        self.invalidate(event, &primary_key);
        Ok(output)
    }

    async fn flush_pending(&self) -> SyncResult<usize> {
        let _guard = self.flush_lock.lock().await;
        let mut committed = 0;
        loop {
            let Some(write) = lock(&self.pending).front().cloned() else {
                break;
            };
            let event = write.event;
            match self
                .commit_local(write.event, write.primary_key, write.payload)
                .await
            {
                Ok(_) => committed += 1,
                // Storage is failing; leave the queue for a later cycle.
                Err(SyncError::Journal(e)) => return Err(e.into()),
                Err(e) => warn!(event, "dropping queued write: {e}"),
            }
            lock(&self.pending).pop_front();
        }
        if committed > 0 {
            debug!(committed, "flushed queued writes");
        }
        Ok(committed)
    }

    fn invalidate(&self, event: &str, primary_key: &str) {
        for key in self.registry.reactivity_keys(event) {
            let _ = self.invalidations.send(Invalidation {
                key,
                primary_key: primary_key.to_string(),
            });
        }
    }

    /// Sends `End` after the configured delay.
    fn end_later(&self, remote_id: RemoteId, outcome: SyncOutcome) {
        let events = self.events.clone();
        let delay = self.config.sync_end_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SyncEvent::End { remote_id, outcome });
        });
    }
}

impl RemoteShared {
    fn update(&self, f: impl FnOnce(&mut RemoteStatus)) {
        f(&mut lock(&self.status));
    }

    fn record_error(&self, error: &SyncError) {
        let message = error.to_string();
        self.update(|status| status.last_error = Some(message));
    }
}

// ── Sync cycle ───────────────────────────────────────────────────

/// One cycle. The caller holds the remote's gate.
async fn run_cycle(
    core: &Arc<Core>,
    remote: &Arc<RemoteShared>,
    batch: Vec<RemoteEntry>,
    push: bool,
) -> SyncResult<CycleReport> {
    let remote_id = remote.remote_id;
    remote.update(|status| status.state = RemoteState::Syncing);
    let _ = core.events.send(SyncEvent::Start { remote_id });

    let result = cycle_body(core, remote, batch, push).await;
    let next = core.journal.next_remote_sequence(remote_id).await.ok();

    let outcome = match &result {
        Ok(report) => {
            info!(
                remote = %remote_id,
                flushed = report.flushed,
                committed = report.merge.committed,
                skipped = report.merge.skipped,
                pushed = report.pushed,
                "sync cycle complete"
            );
            remote.update(|status| {
                status.cycles += 1;
                status.last_synced_at = Some(now_millis());
                status.last_error = None;
            });
            SyncOutcome::Success(report.clone())
        }
        Err(e) => {
            warn!(remote = %remote_id, "sync cycle failed: {e}");
            remote.record_error(e);
            SyncOutcome::Failure(e.to_string())
        }
    };
    remote.update(|status| {
        if let Some(next) = next {
            status.next_sequence = next;
        }
        if status.state == RemoteState::Syncing {
            status.state = RemoteState::Idle;
        }
    });
    core.end_later(remote_id, outcome);
    result
}

async fn cycle_body(
    core: &Arc<Core>,
    remote: &Arc<RemoteShared>,
    batch: Vec<RemoteEntry>,
    push: bool,
) -> SyncResult<CycleReport> {
    let mut report = CycleReport {
        flushed: core.flush_pending().await?,
        ..CycleReport::default()
    };

    if !batch.is_empty() {
        core.registry.resolve().await?;
        let touched: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let registry = core.registry.clone();
        let compaction: &dyn Compaction = &core.registry;

        report.merge = core
            .journal
            .write_from_remote(remote.remote_id, batch, Some(compaction), |merge: RemoteMerge| {
                let registry = registry.clone();
                let touched = touched.clone();
                async move {
                    let event = merge.entry.event.clone();
                    let primary_key = merge.entry.primary_key.clone();
                    registry
                        .dispatch(merge.entry, merge.conflicts, Some(merge.remote_id))
                        .await?;
                    lock(&touched).push((event, primary_key));
                    Ok::<(), HandlerError>(())
                }
            })
            .await?;

        let touched = std::mem::take(&mut *lock(&touched));
        for (event, primary_key) in touched {
            core.invalidate(&event, &primary_key);
        }
    }

    if push {
        report.pushed = push_outbound(core, remote).await?;
    }
    Ok(report)
}

/// Pushes everything `remote` has not accepted yet, a batch at a time.
async fn push_outbound(core: &Core, remote: &RemoteShared) -> SyncResult<usize> {
    let _guard = remote.push_lock.lock().await;
    let batch_size = core.config.batch_size.max(1);
    let mut pushed = 0;
    loop {
        let transport = remote.transport.clone();
        let sent = core
            .journal
            .with_remote_uncommitted_batch(remote.remote_id, batch_size, |entries| async move {
                if entries.is_empty() {
                    return Ok(0);
                }
                let count = entries.len();
                let ack = transport.write(entries).await?;
                debug!(
                    sent = count,
                    accepted = ack.accepted,
                    head = ack.head_sequence,
                    "pushed entries"
                );
                Ok::<usize, SyncError>(count)
            })
            .await?;
        pushed += sent;
        if sent < batch_size {
            return Ok(pushed);
        }
    }
}

// ── Background loops ─────────────────────────────────────────────

async fn inbound_loop(core: Arc<Core>, remote: Arc<RemoteShared>, cancel: CancellationToken) {
    let remote_id = remote.remote_id;
    while !cancel.is_cancelled() {
        match open_and_merge(&core, &remote, &cancel).await {
            Ok(()) => debug!(remote = %remote_id, "change stream ended"),
            Err(e) => {
                warn!(remote = %remote_id, "inbound sync failed: {e}");
                remote.record_error(&e);
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(core.config.poll_interval) => {}
        }
    }
    debug!(remote = %remote_id, "inbound loop stopped");
}

/// Opens a change stream at the watermark and merges batches until the
/// stream ends, fails or the remote is cancelled.
async fn open_and_merge(
    core: &Arc<Core>,
    remote: &Arc<RemoteShared>,
    cancel: &CancellationToken,
) -> SyncResult<()> {
    let start = core.journal.next_remote_sequence(remote.remote_id).await?;
    let mut stream = remote.transport.changes(start).await?;
    debug!(remote = %remote.remote_id, start, "opened change stream");

    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            item = stream.next() => match item {
                Some(batch) => batch?,
                None => return Ok(()),
            },
        };
        if batch.is_empty() {
            continue;
        }

        // Batches wait for the gate rather than being dropped.
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            permit = remote.gate.acquire() => permit.map_err(|_| SyncError::ChannelClosed)?,
        };
        // Reopen from the watermark so a partly merged batch is fetched again.
        run_cycle(core, remote, batch, false).await?;
    }
}

async fn outbound_loop(
    core: Arc<Core>,
    remote: Arc<RemoteShared>,
    mut changes: broadcast::Receiver<Entry>,
    cancel: CancellationToken,
) {
    let remote_id = remote.remote_id;
    loop {
        if let Err(e) = push_outbound(&core, &remote).await {
            warn!(remote = %remote_id, "outbound push failed: {e}");
            remote.record_error(&e);
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            received = changes.recv() => match received {
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            _ = tokio::time::sleep(core.config.poll_interval) => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(core.config.push_interval) => {}
        }

        // Coalesce everything committed while waiting into one push.
        loop {
            match changes.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    if let Err(e) = push_outbound(&core, &remote).await {
        debug!(remote = %remote_id, "final push failed: {e}");
    }
    debug!(remote = %remote_id, "outbound loop stopped");
}
