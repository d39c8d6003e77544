//! A [`Journal`] acting as the remote end of the protocol.
//!
//! Pulls are answered from the journal's commit sequence. Pushed entries
//! are merged as if they came from `origin`, numbered from that origin's
//! current watermark so repeated pushes never fall below it.

use crate::error::SyncResult;
use crate::transport::{ChangePage, SyncBackend, WriteAck};
use async_trait::async_trait;
use std::convert::Infallible;
use synclog_storage::{Journal, RemoteMerge};
use synclog_types::{Entry, RemoteEntry, RemoteId};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

const NOTIFY_CAPACITY: usize = 64;

pub struct JournalBackend {
    journal: Journal,
    origin: RemoteId,
    // Held from numbering to merge so concurrent pushes get distinct sequences.
    push_lock: Mutex<()>,
    notify: broadcast::Sender<u64>,
}

impl JournalBackend {
    /// Serves `journal`, attributing pushes to `origin`.
    pub fn new(journal: Journal, origin: RemoteId) -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            journal,
            origin,
            push_lock: Mutex::new(()),
            notify,
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

#[async_trait]
impl SyncBackend for JournalBackend {
    async fn pull(&self, since: u64, limit: usize) -> SyncResult<ChangePage> {
        let entries = self.journal.changes_since(since, limit).await?;
        let head = self.journal.head_sequence().await?;
        let has_more = entries
            .last()
            .is_some_and(|last| last.remote_sequence < head);
        Ok(ChangePage { entries, has_more })
    }

    async fn push(&self, entries: Vec<Entry>) -> SyncResult<WriteAck> {
        let _guard = self.push_lock.lock().await;
        let start = self.journal.next_remote_sequence(self.origin).await?;
        let batch: Vec<RemoteEntry> = entries
            .into_iter()
            .enumerate()
            .map(|(offset, entry)| RemoteEntry::new(start + offset as u64, entry))
            .collect();

        let report = self
            .journal
            .write_from_remote(self.origin, batch, None, |_: RemoteMerge| async {
                Ok::<(), Infallible>(())
            })
            .await?;
        let head = self.journal.head_sequence().await?;
        debug!(
            committed = report.committed,
            duplicates = report.duplicates,
            head,
            "accepted push"
        );
        if report.committed > 0 {
            let _ = self.notify.send(head);
        }
        Ok(WriteAck {
            accepted: report.committed,
            head_sequence: head,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.notify.subscribe()
    }
}
