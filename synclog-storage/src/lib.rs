//! SQLite journal storage for synclog.
//!
//! # Architecture
//!
//! - [`EntryStore`] is the synchronous storage layer: one SQLite connection
//!   holding the append-only `entries` table (commit order in `seq`) and the
//!   per-remote cursor table `remotes`.
//! - [`Journal`] is the async front door. It owns the single-writer permit,
//!   runs application effects around each append, merges remote batches with
//!   conflict lookup and bracketed compaction, and fans out commit
//!   notifications.
//!
//! Payloads are sealed by a [`synclog_crypto::PayloadEncryptor`] before they
//! are written; everything else (ids, tags, keys) stays queryable.

mod compaction;
mod entry_store;
mod error;
mod journal;

pub use compaction::{partition, BoxError, Compaction, Segment};
pub use entry_store::EntryStore;
pub use error::{JournalError, JournalResult};
pub use journal::{Journal, JournalConfig, MergeReport, RemoteMerge, DEFAULT_NOTIFY_CAPACITY};
