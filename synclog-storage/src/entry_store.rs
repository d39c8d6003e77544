//! Synchronous SQLite storage for journal entries and remote cursors.
//!
//! `entries.seq` is the local commit order. It is what remotes page through
//! with [`EntryStore::changes_since`] and what the per-remote delivery cursor
//! points into. Entry ids carry the cross-writer ordering.

use crate::error::{JournalError, JournalResult};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use synclog_crypto::{EncryptorError, PayloadEncryptor, PlaintextEncryptor};
use synclog_types::{Entry, EntryId, RemoteEntry, RemoteId};

/// Persistent entry store backed by SQLite.
#[derive(Clone)]
pub struct EntryStore {
    conn: Arc<Mutex<Connection>>,
    encryptor: Arc<dyn PayloadEncryptor>,
}

impl EntryStore {
    /// Opens (or creates) a store at the given path.
    pub fn open(path: &Path, encryptor: Arc<dyn PayloadEncryptor>) -> JournalResult<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::with_connection(conn, encryptor)
    }

    /// Opens an in-memory store with plaintext payloads (for testing).
    pub fn open_in_memory() -> JournalResult<Self> {
        Self::open_in_memory_with(Arc::new(PlaintextEncryptor))
    }

    /// Opens an in-memory store with the given encryptor.
    pub fn open_in_memory_with(encryptor: Arc<dyn PayloadEncryptor>) -> JournalResult<Self> {
        Self::with_connection(Connection::open_in_memory()?, encryptor)
    }

    fn with_connection(conn: Connection, encryptor: Arc<dyn PayloadEncryptor>) -> JournalResult<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            encryptor,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> JournalResult<()> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS entries (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id BLOB NOT NULL UNIQUE,
                event TEXT NOT NULL,
                primary_key TEXT NOT NULL,
                payload BLOB NOT NULL,
                origin BLOB
            );

            CREATE INDEX IF NOT EXISTS idx_entries_primary_key
                ON entries(primary_key, seq);

            CREATE TABLE IF NOT EXISTS remotes (
                remote_id BLOB PRIMARY KEY,
                next_sequence INTEGER NOT NULL DEFAULT 0,
                delivered_seq INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Entries ──────────────────────────────────────────────────

    /// Appends an entry and, in the same transaction, optionally advances a
    /// remote's inbound watermark. Returns the commit sequence.
    ///
    /// `origin` records the remote the entry was received from so it is not
    /// echoed back to that remote.
    pub fn append(
        &self,
        entry: &Entry,
        origin: Option<RemoteId>,
        watermark: Option<(RemoteId, u64)>,
    ) -> JournalResult<u64> {
        self.append_batch(std::slice::from_ref(entry), origin, watermark)
    }

    /// Appends `entries` in order and optionally advances a watermark, all in
    /// one transaction. Either everything commits or nothing does. Returns
    /// the commit sequence of the last entry, or the head for an empty batch.
    pub fn append_batch(
        &self,
        entries: &[Entry],
        origin: Option<RemoteId>,
        watermark: Option<(RemoteId, u64)>,
    ) -> JournalResult<u64> {
        self.ensure_available()?;
        let sealed = entries
            .iter()
            .map(|entry| self.encryptor.seal(entry.id.as_bytes(), &entry.payload))
            .collect::<Result<Vec<_>, _>>()?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut seq = tx.query_row("SELECT COALESCE(MAX(seq), 0) FROM entries", [], |row| {
            row.get::<_, i64>(0)
        })?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO entries (id, event, primary_key, payload, origin)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (entry, payload) in entries.iter().zip(&sealed) {
                insert.execute(params![
                    entry.id.as_bytes().as_slice(),
                    entry.event,
                    entry.primary_key,
                    payload,
                    origin.as_ref().map(|r| r.as_bytes().as_slice()),
                ])?;
                seq = tx.last_insert_rowid();
            }
        }
        if let Some((remote_id, next)) = watermark {
            advance_in(&tx, &remote_id, next)?;
        }
        tx.commit()?;
        Ok(seq as u64)
    }

    /// Whether an entry with this id has been committed.
    pub fn contains(&self, id: &EntryId) -> JournalResult<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM entries WHERE id = ?1",
                params![id.as_bytes().as_slice()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// All entries ordered by id.
    pub fn entries(&self) -> JournalResult<Vec<Entry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event, primary_key, payload FROM entries ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    /// Committed entries sharing a primary key, in commit order.
    pub fn entries_for_key(&self, primary_key: &str) -> JournalResult<Vec<Entry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, event, primary_key, payload FROM entries
             WHERE primary_key = ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![primary_key], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter().map(|row| self.decode(row)).collect()
    }

    /// Entries committed at or after `since`, in commit order, each tagged
    /// with its commit sequence. At most `limit` entries are returned.
    pub fn changes_since(&self, since: u64, limit: usize) -> JournalResult<Vec<RemoteEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, id, event, primary_key, payload FROM entries
             WHERE seq >= ?1 ORDER BY seq LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![since as i64, clamp_limit(limit)], |row| {
                let seq: i64 = row.get(0)?;
                Ok((seq as u64, read_row_at(row, 1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);
        rows.into_iter()
            .map(|(seq, row)| Ok(RemoteEntry::new(seq, self.decode(row)?)))
            .collect()
    }

    /// Highest commit sequence, or 0 for an empty store.
    pub fn head_sequence(&self) -> JournalResult<u64> {
        let head: i64 = self
            .conn()
            .query_row("SELECT COALESCE(MAX(seq), 0) FROM entries", [], |row| row.get(0))?;
        Ok(head as u64)
    }

    /// Number of committed entries.
    pub fn len(&self) -> JournalResult<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> JournalResult<bool> {
        Ok(self.len()? == 0)
    }

    // ── Remote cursors ───────────────────────────────────────────

    /// Records a remote so it shows up in [`EntryStore::known_remotes`].
    pub fn track_remote(&self, remote_id: &RemoteId) -> JournalResult<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO remotes (remote_id) VALUES (?1)",
            params![remote_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Lowest remote sequence not yet processed from `remote_id`.
    pub fn next_remote_sequence(&self, remote_id: &RemoteId) -> JournalResult<u64> {
        let next: Option<i64> = self
            .conn()
            .query_row(
                "SELECT next_sequence FROM remotes WHERE remote_id = ?1",
                params![remote_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(next.unwrap_or(0) as u64)
    }

    /// Moves a remote's inbound watermark forward. Never moves it back.
    pub fn advance_remote_sequence(&self, remote_id: &RemoteId, next: u64) -> JournalResult<()> {
        advance_in(&self.conn(), remote_id, next)
    }

    /// Locally committed entries `remote_id` has not yet accepted, excluding
    /// entries received from that remote. Returns the entries (at most
    /// `limit`) and the commit sequence to mark delivered once they are.
    pub fn uncommitted_for(
        &self,
        remote_id: &RemoteId,
        limit: usize,
    ) -> JournalResult<(Vec<Entry>, u64)> {
        let conn = self.conn();
        let delivered: i64 = conn
            .query_row(
                "SELECT delivered_seq FROM remotes WHERE remote_id = ?1",
                params![remote_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        let mut stmt = conn.prepare(
            "SELECT seq, id, event, primary_key, payload FROM entries
             WHERE seq > ?1 AND (origin IS NULL OR origin != ?2)
             ORDER BY seq LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![delivered, remote_id.as_bytes().as_slice(), clamp_limit(limit)],
                |row| {
                    let seq: i64 = row.get(0)?;
                    Ok((seq, read_row_at(row, 1)?))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        // A full page ends at its last row. A short page covers everything up
        // to the head, including skipped echoes.
        let upto = if rows.len() as i64 == clamp_limit(limit) {
            rows.last().map(|(seq, _)| *seq).unwrap_or(delivered)
        } else {
            conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM entries", [], |row| {
                row.get::<_, i64>(0)
            })?
            .max(delivered)
        };
        drop(stmt);
        drop(conn);

        let entries = rows
            .into_iter()
            .map(|(_, row)| self.decode(row))
            .collect::<JournalResult<Vec<_>>>()?;
        Ok((entries, upto as u64))
    }

    /// Marks everything up to commit sequence `upto` as accepted by
    /// `remote_id`.
    pub fn mark_delivered(&self, remote_id: &RemoteId, upto: u64) -> JournalResult<()> {
        self.conn().execute(
            "INSERT INTO remotes (remote_id, delivered_seq) VALUES (?1, ?2)
             ON CONFLICT(remote_id) DO UPDATE
             SET delivered_seq = MAX(delivered_seq, excluded.delivered_seq)",
            params![remote_id.as_bytes().as_slice(), upto as i64],
        )?;
        Ok(())
    }

    /// Remotes this journal has ever tracked.
    pub fn known_remotes(&self) -> JournalResult<Vec<RemoteId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT remote_id FROM remotes ORDER BY remote_id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter()
            .map(|bytes| {
                let bytes: [u8; 16] = bytes
                    .try_into()
                    .map_err(|_| JournalError::InvalidData("remote id is not 16 bytes".into()))?;
                Ok(RemoteId::from_bytes(bytes))
            })
            .collect()
    }

    /// Drops both cursors for a remote. The next sync with it starts over.
    pub fn forget_remote(&self, remote_id: &RemoteId) -> JournalResult<()> {
        self.conn().execute(
            "DELETE FROM remotes WHERE remote_id = ?1",
            params![remote_id.as_bytes().as_slice()],
        )?;
        Ok(())
    }

    /// Deletes every entry and cursor.
    pub fn destroy(&self) -> JournalResult<()> {
        self.conn().execute_batch(
            "
            DELETE FROM entries;
            DELETE FROM remotes;
            ",
        )?;
        Ok(())
    }

    fn ensure_available(&self) -> JournalResult<()> {
        if self.encryptor.is_available() {
            Ok(())
        } else {
            Err(EncryptorError::Unavailable.into())
        }
    }

    fn decode(&self, row: StoredRow) -> JournalResult<Entry> {
        self.ensure_available()?;
        let id: [u8; 16] = row
            .id
            .try_into()
            .map_err(|_| JournalError::InvalidData("entry id is not 16 bytes".into()))?;
        let payload = self.encryptor.open(&id, &row.payload)?;
        Ok(Entry::with_id(
            EntryId::from_bytes(id),
            row.event,
            row.primary_key,
            payload,
        ))
    }
}

struct StoredRow {
    id: Vec<u8>,
    event: String,
    primary_key: String,
    payload: Vec<u8>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    read_row_at(row, 0)
}

fn read_row_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(offset)?,
        event: row.get(offset + 1)?,
        primary_key: row.get(offset + 2)?,
        payload: row.get(offset + 3)?,
    })
}

fn advance_in(conn: &Connection, remote_id: &RemoteId, next: u64) -> JournalResult<()> {
    conn.execute(
        "INSERT INTO remotes (remote_id, next_sequence) VALUES (?1, ?2)
         ON CONFLICT(remote_id) DO UPDATE
         SET next_sequence = MAX(next_sequence, excluded.next_sequence)",
        params![remote_id.as_bytes().as_slice(), next as i64],
    )?;
    Ok(())
}

fn clamp_limit(limit: usize) -> i64 {
    limit.min(i64::MAX as usize) as i64
}
