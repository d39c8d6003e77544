use pretty_assertions::assert_eq;
use std::sync::Arc;
use synclog_crypto::{JournalKey, KeyEncryptor};
use synclog_storage::{EntryStore, JournalError};
use synclog_types::{Entry, EntryId, RemoteId};

fn entry(event: &str, key: &str, payload: &[u8]) -> Entry {
    Entry::new(event, key, payload.to_vec())
}

// ── Entries ──────────────────────────────────────────────────────

#[test]
fn append_assigns_increasing_sequences() {
    let store = EntryStore::open_in_memory().unwrap();
    let a = store.append(&entry("Created", "u1", b"a"), None, None).unwrap();
    let b = store.append(&entry("Renamed", "u1", b"b"), None, None).unwrap();
    assert!(b > a);
    assert_eq!(store.head_sequence().unwrap(), b);
    assert_eq!(store.len().unwrap(), 2);
}

#[test]
fn duplicate_id_is_rejected() {
    let store = EntryStore::open_in_memory().unwrap();
    let e = entry("Created", "u1", b"a");
    store.append(&e, None, None).unwrap();
    let err = store.append(&e, None, None).unwrap_err();
    assert!(matches!(err, JournalError::Database(_)));
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn contains_reports_committed_ids() {
    let store = EntryStore::open_in_memory().unwrap();
    let e = entry("Created", "u1", b"a");
    assert!(!store.contains(&e.id).unwrap());
    store.append(&e, None, None).unwrap();
    assert!(store.contains(&e.id).unwrap());
}

#[test]
fn entries_are_ordered_by_id_not_commit_order() {
    let store = EntryStore::open_in_memory().unwrap();
    let early = Entry::with_id(EntryId::generate(1_000), "A", "k", vec![]);
    let late = Entry::with_id(EntryId::generate(2_000), "B", "k", vec![]);

    store.append(&late, None, None).unwrap();
    store.append(&early, None, None).unwrap();

    let ids: Vec<_> = store.entries().unwrap().into_iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
}

#[test]
fn entries_for_key_follow_commit_order() {
    let store = EntryStore::open_in_memory().unwrap();
    let late = Entry::with_id(EntryId::generate(2_000), "B", "k", vec![2]);
    let early = Entry::with_id(EntryId::generate(1_000), "A", "k", vec![1]);
    let other = entry("A", "other", b"x");

    store.append(&late, None, None).unwrap();
    store.append(&other, None, None).unwrap();
    store.append(&early, None, None).unwrap();

    let found = store.entries_for_key("k").unwrap();
    assert_eq!(found, vec![late, early]);
    assert!(store.entries_for_key("missing").unwrap().is_empty());
}

#[test]
fn changes_since_pages_by_commit_sequence() {
    let store = EntryStore::open_in_memory().unwrap();
    for i in 0..5u8 {
        store.append(&entry("E", "k", &[i]), None, None).unwrap();
    }

    let first = store.changes_since(0, 2).unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].entry.payload, vec![0]);

    let resume = first.last().unwrap().remote_sequence + 1;
    let rest = store.changes_since(resume, 100).unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(rest[0].entry.payload, vec![2]);
    assert!(rest.windows(2).all(|w| w[0].remote_sequence < w[1].remote_sequence));
}

// ── Remote cursors ───────────────────────────────────────────────

#[test]
fn unknown_remote_starts_at_zero() {
    let store = EntryStore::open_in_memory().unwrap();
    assert_eq!(store.next_remote_sequence(&RemoteId::new()).unwrap(), 0);
}

#[test]
fn watermark_never_moves_backwards() {
    let store = EntryStore::open_in_memory().unwrap();
    let remote = RemoteId::new();
    store.advance_remote_sequence(&remote, 10).unwrap();
    store.advance_remote_sequence(&remote, 4).unwrap();
    assert_eq!(store.next_remote_sequence(&remote).unwrap(), 10);
}

#[test]
fn append_with_watermark_moves_cursor_in_same_transaction() {
    let store = EntryStore::open_in_memory().unwrap();
    let remote = RemoteId::new();
    store
        .append(&entry("E", "k", b""), Some(remote), Some((remote, 7)))
        .unwrap();
    assert_eq!(store.next_remote_sequence(&remote).unwrap(), 7);
}

#[test]
fn failed_append_leaves_watermark_untouched() {
    let store = EntryStore::open_in_memory().unwrap();
    let remote = RemoteId::new();
    let e = entry("E", "k", b"");
    store.append(&e, None, None).unwrap();

    assert!(store.append(&e, Some(remote), Some((remote, 9))).is_err());
    assert_eq!(store.next_remote_sequence(&remote).unwrap(), 0);
}

#[test]
fn uncommitted_excludes_entries_from_that_remote() {
    let store = EntryStore::open_in_memory().unwrap();
    let remote = RemoteId::new();
    let other = RemoteId::new();

    let local = entry("E", "k", b"local");
    let echoed = entry("E", "k", b"from remote");
    let relayed = entry("E", "k", b"from other");
    store.append(&local, None, None).unwrap();
    store.append(&echoed, Some(remote), None).unwrap();
    store.append(&relayed, Some(other), None).unwrap();

    let (pending, upto) = store.uncommitted_for(&remote, usize::MAX).unwrap();
    assert_eq!(pending, vec![local, relayed]);
    assert_eq!(upto, store.head_sequence().unwrap());
}

#[test]
fn mark_delivered_hides_accepted_entries() {
    let store = EntryStore::open_in_memory().unwrap();
    let remote = RemoteId::new();
    store.append(&entry("E", "k", b"1"), None, None).unwrap();

    let (_, upto) = store.uncommitted_for(&remote, usize::MAX).unwrap();
    store.mark_delivered(&remote, upto).unwrap();
    assert!(store.uncommitted_for(&remote, usize::MAX).unwrap().0.is_empty());

    let newer = entry("E", "k", b"2");
    store.append(&newer, None, None).unwrap();
    assert_eq!(store.uncommitted_for(&remote, usize::MAX).unwrap().0, vec![newer]);
}

#[test]
fn uncommitted_batches_stop_at_last_row() {
    let store = EntryStore::open_in_memory().unwrap();
    let remote = RemoteId::new();
    for i in 0..3u8 {
        store.append(&entry("E", "k", &[i]), None, None).unwrap();
    }

    let (page, upto) = store.uncommitted_for(&remote, 2).unwrap();
    assert_eq!(page.len(), 2);
    store.mark_delivered(&remote, upto).unwrap();

    let (rest, _) = store.uncommitted_for(&remote, 2).unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].payload, vec![2]);
}

#[test]
fn known_and_forgotten_remotes() {
    let store = EntryStore::open_in_memory().unwrap();
    let a = RemoteId::new();
    let b = RemoteId::new();
    store.track_remote(&a).unwrap();
    store.advance_remote_sequence(&b, 3).unwrap();

    let mut known = store.known_remotes().unwrap();
    known.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(known, expected);

    store.forget_remote(&b).unwrap();
    assert_eq!(store.known_remotes().unwrap(), vec![a]);
    assert_eq!(store.next_remote_sequence(&b).unwrap(), 0);
}

// ── Persistence and encryption ───────────────────────────────────

#[test]
fn reopen_from_disk_keeps_entries_and_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.db");
    let remote = RemoteId::new();
    let e = entry("Created", "u1", b"hello");

    {
        let store =
            EntryStore::open(&path, Arc::new(synclog_crypto::PlaintextEncryptor)).unwrap();
        store.append(&e, None, Some((remote, 5))).unwrap();
    }

    let store = EntryStore::open(&path, Arc::new(synclog_crypto::PlaintextEncryptor)).unwrap();
    assert_eq!(store.entries().unwrap(), vec![e]);
    assert_eq!(store.next_remote_sequence(&remote).unwrap(), 5);
}

#[test]
fn payloads_are_sealed_at_rest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.db");
    let key = JournalKey::random();
    let secret = b"attack at dawn".to_vec();

    {
        let store =
            EntryStore::open(&path, Arc::new(KeyEncryptor::new(key.clone()))).unwrap();
        store.append(&entry("Note", "n1", &secret), None, None).unwrap();
        assert_eq!(store.entries().unwrap()[0].payload, secret);
    }

    let raw = rusqlite::Connection::open(&path).unwrap();
    let stored: Vec<u8> = raw
        .query_row("SELECT payload FROM entries", [], |row| row.get(0))
        .unwrap();
    assert_ne!(stored, secret);
    assert!(!stored.windows(secret.len()).any(|w| w == secret.as_slice()));
}

#[test]
fn wrong_key_fails_to_read() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("journal.db");

    {
        let store =
            EntryStore::open(&path, Arc::new(KeyEncryptor::new(JournalKey::random()))).unwrap();
        store.append(&entry("Note", "n1", b"secret"), None, None).unwrap();
    }

    let store =
        EntryStore::open(&path, Arc::new(KeyEncryptor::new(JournalKey::random()))).unwrap();
    assert!(matches!(
        store.entries().unwrap_err(),
        JournalError::Encryption(_)
    ));
}

#[test]
fn destroy_removes_everything() {
    let store = EntryStore::open_in_memory().unwrap();
    let remote = RemoteId::new();
    store.append(&entry("E", "k", b""), None, Some((remote, 2))).unwrap();

    store.destroy().unwrap();
    assert!(store.is_empty().unwrap());
    assert!(store.known_remotes().unwrap().is_empty());
    assert_eq!(store.next_remote_sequence(&remote).unwrap(), 0);
}
