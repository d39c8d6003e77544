//! Bracketed compaction of remote batches.
//!
//! A remote batch is split into segments. Consecutive entries whose event
//! tags belong to the same compaction group form one run; everything else
//! stands alone. Runs never reach across an entry of another group, so the
//! relative order of unrelated events is preserved.

use async_trait::async_trait;
use synclog_types::{Entry, RemoteEntry};

/// Boxed error returned by application callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Folds runs of related remote entries before they are applied.
///
/// Implementations must be deterministic: given the same run they return the
/// same entries, including ids, so every replica compacts a batch the same
/// way and dedupe by id keeps working.
#[async_trait]
pub trait Compaction: Send + Sync {
    /// Compaction group of an event tag, or `None` if the tag is never
    /// compacted.
    fn group_of(&self, event: &str) -> Option<usize>;

    /// Rewrites one run of entries. May return fewer, more or zero entries.
    async fn compact(&self, group: usize, run: Vec<Entry>) -> Result<Vec<Entry>, BoxError>;
}

/// One unit of a partitioned batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// An entry with no compaction group.
    Single(RemoteEntry),
    /// A maximal run of consecutive entries in the same group.
    Run {
        group: usize,
        entries: Vec<RemoteEntry>,
    },
}

impl Segment {
    /// Highest remote sequence covered by this segment.
    pub fn max_sequence(&self) -> u64 {
        match self {
            Segment::Single(entry) => entry.remote_sequence,
            Segment::Run { entries, .. } => entries
                .iter()
                .map(|e| e.remote_sequence)
                .max()
                .unwrap_or(0),
        }
    }
}

/// Splits a batch into singles and maximal same-group runs, keeping batch
/// order.
pub fn partition(compaction: &dyn Compaction, batch: Vec<RemoteEntry>) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    for remote in batch {
        match compaction.group_of(&remote.entry.event) {
            None => segments.push(Segment::Single(remote)),
            Some(group) => match segments.last_mut() {
                Some(Segment::Run {
                    group: current,
                    entries,
                }) if *current == group => entries.push(remote),
                _ => segments.push(Segment::Run {
                    group,
                    entries: vec![remote],
                }),
            },
        }
    }
    segments
}
