//! Durable per-identity actor state.
//!
//! An actor's state survives hibernation: which sessions were attached
//! and whether the next activation should start from scratch.

use crate::error::RelayResult;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use synclog_types::{now_millis, RemoteId};
use uuid::Uuid;

/// One attached client socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    /// Replica id the client announced, if any.
    pub remote_id: Option<RemoteId>,
    /// Milliseconds since the Unix epoch.
    pub connected_at: u64,
}

impl SessionRecord {
    pub fn new(session_id: Uuid, remote_id: Option<RemoteId>) -> Self {
        Self {
            session_id,
            remote_id,
            connected_at: now_millis(),
        }
    }
}

/// Everything an actor persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorState {
    pub identity: String,
    pub sessions: Vec<SessionRecord>,
    /// Wipe this state on the next activation.
    #[serde(default)]
    pub reset_on_startup: bool,
}

impl ActorState {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            sessions: Vec::new(),
            reset_on_startup: false,
        }
    }
}

/// Where actor state lives between activations.
pub trait ActorStorage: Send + Sync {
    fn load(&self, identity: &str) -> RelayResult<Option<ActorState>>;
    fn save(&self, state: &ActorState) -> RelayResult<()>;
    fn delete(&self, identity: &str) -> RelayResult<()>;
    /// Identities with stored state.
    fn identities(&self) -> RelayResult<Vec<String>>;
}

/// Actor state in a SQLite table, one JSON document per identity.
pub struct SqliteActorStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteActorStorage {
    pub fn open(path: impl AsRef<Path>) -> RelayResult<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> RelayResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> RelayResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS actor_state (
                identity   TEXT PRIMARY KEY,
                state      TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ActorStorage for SqliteActorStorage {
    fn load(&self, identity: &str) -> RelayResult<Option<ActorState>> {
        let json: Option<String> = self
            .conn()
            .query_row(
                "SELECT state FROM actor_state WHERE identity = ?1",
                params![identity],
                |row| row.get(0),
            )
            .optional()?;
        Ok(json.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    fn save(&self, state: &ActorState) -> RelayResult<()> {
        let json = serde_json::to_string(state)?;
        self.conn().execute(
            "INSERT INTO actor_state (identity, state, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(identity) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![state.identity, json, now_millis() as i64],
        )?;
        Ok(())
    }

    fn delete(&self, identity: &str) -> RelayResult<()> {
        self.conn()
            .execute("DELETE FROM actor_state WHERE identity = ?1", params![identity])?;
        Ok(())
    }

    fn identities(&self) -> RelayResult<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT identity FROM actor_state ORDER BY identity")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }
}

/// Volatile actor state, for tests and relays started without `--state`.
#[derive(Default)]
pub struct MemoryActorStorage {
    states: Mutex<HashMap<String, ActorState>>,
}

impl MemoryActorStorage {
    fn states(&self) -> MutexGuard<'_, HashMap<String, ActorState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ActorStorage for MemoryActorStorage {
    fn load(&self, identity: &str) -> RelayResult<Option<ActorState>> {
        Ok(self.states().get(identity).cloned())
    }

    fn save(&self, state: &ActorState) -> RelayResult<()> {
        self.states().insert(state.identity.clone(), state.clone());
        Ok(())
    }

    fn delete(&self, identity: &str) -> RelayResult<()> {
        self.states().remove(identity);
        Ok(())
    }

    fn identities(&self) -> RelayResult<Vec<String>> {
        let mut identities: Vec<String> = self.states().keys().cloned().collect();
        identities.sort();
        Ok(identities)
    }
}
