//! Per-identity sync backends.

use crate::error::RelayResult;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use synclog_storage::{Journal, JournalConfig};
use synclog_sync::memory::MemoryRemote;
use synclog_sync::{JournalBackend, SyncBackend};
use synclog_types::RemoteId;
use tracing::info;

/// Origin recorded for entries pushed through the relay.
const RELAY_ORIGIN: RemoteId = RemoteId::from_bytes([0; 16]);

/// Hands out the backend that holds one identity's log.
///
/// The same identity always maps to the same backend for the lifetime of
/// the provider.
pub trait BackendProvider: Send + Sync {
    fn backend(&self, identity: &str) -> RelayResult<Arc<dyn SyncBackend>>;
}

/// Logs kept in memory.
#[derive(Default)]
pub struct MemoryBackends {
    backends: Mutex<HashMap<String, Arc<MemoryRemote>>>,
}

impl BackendProvider for MemoryBackends {
    fn backend(&self, identity: &str) -> RelayResult<Arc<dyn SyncBackend>> {
        let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
        let hub = backends
            .entry(identity.to_string())
            .or_insert_with(MemoryRemote::new)
            .clone();
        Ok(hub)
    }
}

/// One journal file per identity under `dir`.
pub struct JournalBackends {
    dir: PathBuf,
    backends: Mutex<HashMap<String, Arc<JournalBackend>>>,
}

impl JournalBackends {
    pub fn new(dir: impl Into<PathBuf>) -> RelayResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            backends: Mutex::new(HashMap::new()),
        })
    }
}

impl BackendProvider for JournalBackends {
    fn backend(&self, identity: &str) -> RelayResult<Arc<dyn SyncBackend>> {
        let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(backend) = backends.get(identity) {
            return Ok(backend.clone());
        }

        let path = self.dir.join(format!("{identity}.db"));
        info!(identity, path = %path.display(), "opening journal");
        let journal = Journal::open(JournalConfig {
            path: Some(path),
            ..JournalConfig::default()
        })?;
        let backend = Arc::new(JournalBackend::new(journal, RELAY_ORIGIN));
        backends.insert(identity.to_string(), backend.clone());
        Ok(backend)
    }
}
