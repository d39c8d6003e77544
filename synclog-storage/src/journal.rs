//! The async journal: single-writer appends, remote merges and commit
//! notifications over an [`EntryStore`].
//!
//! Every mutation holds the write permit for its whole duration, including
//! the application effect. Effects therefore see a journal that nobody else
//! is writing to, and must not call back into the journal's write path.

use crate::compaction::{partition, Compaction, Segment};
use crate::entry_store::EntryStore;
use crate::error::{JournalError, JournalResult};
use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use synclog_crypto::{PayloadEncryptor, PlaintextEncryptor};
use synclog_types::{Entry, EntryId, RemoteEntry, RemoteId};
use tokio::sync::{broadcast, Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Default capacity of the commit notification channel.
pub const DEFAULT_NOTIFY_CAPACITY: usize = 1024;

/// Configuration for opening a journal.
#[derive(Clone)]
pub struct JournalConfig {
    /// Database file. `None` keeps the journal in memory.
    pub path: Option<PathBuf>,
    /// Seals payloads at rest.
    pub encryptor: Arc<dyn PayloadEncryptor>,
    /// Buffered commit notifications per subscriber before it lags.
    pub notify_capacity: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            path: None,
            encryptor: Arc::new(PlaintextEncryptor),
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl std::fmt::Debug for JournalConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalConfig")
            .field("path", &self.path)
            .field("notify_capacity", &self.notify_capacity)
            .finish_non_exhaustive()
    }
}

/// A remote entry about to be merged, handed to the merge effect.
#[derive(Debug, Clone)]
pub struct RemoteMerge {
    /// Remote the entry arrived from.
    pub remote_id: RemoteId,
    /// The entry, possibly produced by compaction.
    pub entry: Entry,
    /// Committed entries with the same primary key, in commit order.
    pub conflicts: Vec<Entry>,
}

/// Outcome of one [`Journal::write_from_remote`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Entries in the batch as received.
    pub received: usize,
    /// Entries below the remote's watermark, dropped unseen.
    pub discarded: usize,
    /// Entries already present locally.
    pub duplicates: usize,
    /// Entries applied and committed.
    pub committed: usize,
    /// Entries whose effect failed. They are never retried.
    pub skipped: usize,
    /// The remote's watermark after the merge.
    pub next_sequence: u64,
}

/// Handle to an append-only journal. Cloning shares the journal.
#[derive(Clone)]
pub struct Journal {
    inner: Arc<JournalInner>,
}

struct JournalInner {
    store: EntryStore,
    write_gate: Semaphore,
    changes: broadcast::Sender<Entry>,
}

impl Journal {
    /// Opens a journal as configured.
    pub fn open(config: JournalConfig) -> JournalResult<Self> {
        let store = match &config.path {
            Some(path) => EntryStore::open(path, config.encryptor.clone())?,
            None => EntryStore::open_in_memory_with(config.encryptor.clone())?,
        };
        Ok(Self::from_store(store, config.notify_capacity))
    }

    /// Opens an in-memory plaintext journal (for testing).
    pub fn open_in_memory() -> JournalResult<Self> {
        Self::open(JournalConfig::default())
    }

    /// Wraps an existing store.
    pub fn from_store(store: EntryStore, notify_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(notify_capacity.max(1));
        Self {
            inner: Arc::new(JournalInner {
                store,
                write_gate: Semaphore::new(1),
                changes,
            }),
        }
    }

    /// Runs a storage call on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> JournalResult<T>
    where
        F: FnOnce(&EntryStore) -> JournalResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| JournalError::Task(e.to_string()))?
    }

    async fn acquire(&self) -> JournalResult<SemaphorePermit<'_>> {
        self.inner
            .write_gate
            .acquire()
            .await
            .map_err(|_| JournalError::Closed)
    }

    fn notify(&self, entry: Entry) {
        // No subscribers is fine.
        let _ = self.inner.changes.send(entry);
    }

    // ── Writes ───────────────────────────────────────────────────

    /// Creates an entry, runs `effect` on it and commits it.
    ///
    /// The entry is committed only if `effect` succeeds; on failure the
    /// effect's error is returned and the journal is unchanged. Storage
    /// errors after a successful effect surface as `E::from(JournalError)`.
    pub async fn write<R, E, F, Fut>(
        &self,
        event: impl Into<String>,
        primary_key: impl Into<String>,
        payload: Vec<u8>,
        effect: F,
    ) -> Result<R, E>
    where
        F: FnOnce(Entry) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<JournalError>,
    {
        let _permit = self.acquire().await?;
        let entry = Entry::with_id(EntryId::new(), event, primary_key, payload);

        let output = effect(entry.clone()).await?;

        let stored = entry.clone();
        let seq = self
            .blocking(move |store| store.append(&stored, None, None))
            .await?;
        debug!(seq, id = %entry.id, event = %entry.event, "committed local entry");
        self.notify(entry);
        Ok(output)
    }

    /// Commits an entry with no effect.
    pub async fn append(
        &self,
        event: impl Into<String>,
        primary_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> JournalResult<Entry> {
        self.write(event, primary_key, payload, |entry| async move {
            Ok::<_, JournalError>(entry)
        })
        .await
    }

    /// Merges a batch received from `remote_id`.
    ///
    /// Entries below the remote's watermark are dropped. The rest are
    /// partitioned into compaction runs (when `compaction` is given), and
    /// each resulting entry not already present is handed to `effect` with
    /// its conflicts. Entries whose effect fails are logged and skipped; the
    /// watermark still moves past them.
    ///
    /// Accepted entries and the new watermark are committed in a single
    /// transaction once the whole batch has been processed. A storage fault
    /// aborts the whole batch: nothing is committed, the watermark stays
    /// where it was and the remote redelivers everything.
    pub async fn write_from_remote<F, Fut, E>(
        &self,
        remote_id: RemoteId,
        batch: Vec<RemoteEntry>,
        compaction: Option<&dyn Compaction>,
        mut effect: F,
    ) -> JournalResult<MergeReport>
    where
        F: FnMut(RemoteMerge) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let _permit = self.acquire().await?;

        let next = self
            .blocking(move |store| store.next_remote_sequence(&remote_id))
            .await?;
        let mut report = MergeReport {
            received: batch.len(),
            next_sequence: next,
            ..MergeReport::default()
        };

        let fresh: Vec<RemoteEntry> = batch
            .into_iter()
            .filter(|remote| remote.remote_sequence >= next)
            .collect();
        report.discarded = report.received - fresh.len();
        if fresh.is_empty() {
            return Ok(report);
        }

        let segments = match compaction {
            Some(compaction) => partition(compaction, fresh),
            None => fresh.into_iter().map(Segment::Single).collect(),
        };

        let mut staged = Staged::default();
        let mut watermark = next;
        for segment in segments {
            watermark = watermark.max(segment.max_sequence().saturating_add(1));
            let entries = match segment {
                Segment::Single(remote) => vec![remote.entry],
                Segment::Run { group, entries } => {
                    let run: Vec<Entry> = entries.into_iter().map(|r| r.entry).collect();
                    match compaction {
                        Some(compaction) => compact_or_keep(compaction, group, run).await,
                        None => run,
                    }
                }
            };
            for entry in entries {
                self.merge_one(remote_id, entry, &mut staged, &mut effect, &mut report)
                    .await?;
            }
        }

        let committed = staged.entries.clone();
        self.blocking(move |store| {
            store.append_batch(&committed, Some(remote_id), Some((remote_id, watermark)))
        })
        .await?;
        report.committed = staged.entries.len();
        report.next_sequence = watermark;
        for entry in staged.entries {
            self.notify(entry);
        }

        debug!(
            remote = %remote_id,
            committed = report.committed,
            duplicates = report.duplicates,
            skipped = report.skipped,
            next = report.next_sequence,
            "merged remote batch"
        );
        Ok(report)
    }

    async fn merge_one<F, Fut, E>(
        &self,
        remote_id: RemoteId,
        entry: Entry,
        staged: &mut Staged,
        effect: &mut F,
        report: &mut MergeReport,
    ) -> JournalResult<()>
    where
        F: FnMut(RemoteMerge) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let id = entry.id;
        if staged.ids.contains(&id) || self.blocking(move |store| store.contains(&id)).await? {
            report.duplicates += 1;
            return Ok(());
        }

        let key = entry.primary_key.clone();
        let mut conflicts = self
            .blocking(move |store| store.entries_for_key(&key))
            .await?;
        conflicts.extend(
            staged
                .entries
                .iter()
                .filter(|e| e.primary_key == entry.primary_key)
                .cloned(),
        );

        let merge = RemoteMerge {
            remote_id,
            entry: entry.clone(),
            conflicts,
        };
        match effect(merge).await {
            Ok(()) => staged.push(entry),
            Err(e) => {
                warn!(
                    remote = %remote_id,
                    id = %entry.id,
                    event = %entry.event,
                    error = %e,
                    "remote entry rejected by effect, skipping"
                );
                report.skipped += 1;
            }
        }
        Ok(())
    }

    // ── Outbound ─────────────────────────────────────────────────

    /// Hands every local entry `remote_id` has not accepted yet to `f`.
    /// The delivery cursor advances only if `f` succeeds.
    pub async fn with_remote_uncommitted<R, E, F, Fut>(
        &self,
        remote_id: RemoteId,
        f: F,
    ) -> Result<R, E>
    where
        F: FnOnce(Vec<Entry>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<JournalError>,
    {
        self.with_remote_uncommitted_batch(remote_id, usize::MAX, f)
            .await
    }

    /// Like [`Journal::with_remote_uncommitted`] but hands over at most
    /// `limit` entries.
    pub async fn with_remote_uncommitted_batch<R, E, F, Fut>(
        &self,
        remote_id: RemoteId,
        limit: usize,
        f: F,
    ) -> Result<R, E>
    where
        F: FnOnce(Vec<Entry>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<JournalError>,
    {
        let (entries, upto) = self
            .blocking(move |store| store.uncommitted_for(&remote_id, limit))
            .await?;
        let output = f(entries).await?;
        self.blocking(move |store| store.mark_delivered(&remote_id, upto))
            .await?;
        Ok(output)
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Lowest remote sequence not yet processed from `remote_id`.
    pub async fn next_remote_sequence(&self, remote_id: RemoteId) -> JournalResult<u64> {
        self.blocking(move |store| store.next_remote_sequence(&remote_id))
            .await
    }

    /// Local entries committed at or after commit sequence `since`.
    pub async fn changes_since(&self, since: u64, limit: usize) -> JournalResult<Vec<RemoteEntry>> {
        self.blocking(move |store| store.changes_since(since, limit))
            .await
    }

    /// All entries ordered by id.
    pub async fn entries(&self) -> JournalResult<Vec<Entry>> {
        self.blocking(|store| store.entries()).await
    }

    /// Committed entries for a primary key, in commit order.
    pub async fn entries_for_key(&self, primary_key: impl Into<String>) -> JournalResult<Vec<Entry>> {
        let key = primary_key.into();
        self.blocking(move |store| store.entries_for_key(&key))
            .await
    }

    pub async fn head_sequence(&self) -> JournalResult<u64> {
        self.blocking(|store| store.head_sequence()).await
    }

    pub async fn len(&self) -> JournalResult<usize> {
        self.blocking(|store| store.len()).await
    }

    pub async fn is_empty(&self) -> JournalResult<bool> {
        self.blocking(|store| store.is_empty()).await
    }

    /// Subscribes to entries as they are committed, local or remote.
    pub fn changes(&self) -> broadcast::Receiver<Entry> {
        self.inner.changes.subscribe()
    }

    // ── Remotes ──────────────────────────────────────────────────

    pub async fn track_remote(&self, remote_id: RemoteId) -> JournalResult<()> {
        self.blocking(move |store| store.track_remote(&remote_id))
            .await
    }

    pub async fn known_remotes(&self) -> JournalResult<Vec<RemoteId>> {
        self.blocking(|store| store.known_remotes()).await
    }

    /// Drops a remote's cursors. Waits for in-flight writes.
    pub async fn forget_remote(&self, remote_id: RemoteId) -> JournalResult<()> {
        let _permit = self.acquire().await?;
        self.blocking(move |store| store.forget_remote(&remote_id))
            .await
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Deletes all entries and cursors. Waits for in-flight writes.
    pub async fn destroy(&self) -> JournalResult<()> {
        let _permit = self.acquire().await?;
        self.blocking(|store| store.destroy()).await
    }

    /// Rejects all further writes with [`JournalError::Closed`]. Reads keep
    /// working.
    pub fn close(&self) {
        self.inner.write_gate.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.write_gate.is_closed()
    }
}

/// Entries accepted so far in a remote batch, awaiting the batch commit.
#[derive(Default)]
struct Staged {
    entries: Vec<Entry>,
    ids: HashSet<EntryId>,
}

impl Staged {
    fn push(&mut self, entry: Entry) {
        self.ids.insert(entry.id);
        self.entries.push(entry);
    }
}

async fn compact_or_keep(compaction: &dyn Compaction, group: usize, run: Vec<Entry>) -> Vec<Entry> {
    match compaction.compact(group, run.clone()).await {
        Ok(compacted) => compacted,
        Err(e) => {
            warn!(group, error = %e, "compaction failed, applying run unchanged");
            run
        }
    }
}
