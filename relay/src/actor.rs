//! Per-identity actors and the host that activates them.
//!
//! Each authenticated identity gets one [`RelayActor`]. The actor owns the
//! identity's backend, persists which sessions are attached, and forwards
//! head notifications to every attached socket. Changes arriving from the
//! backend side ([`RelayHost::write`]) land in the same backend log, so
//! clients receive them through their ordinary pulls. Actors can be hibernated
//! and reactivated; live sockets are tracked in a [`SessionTable`] that
//! outlives them, so reactivation keeps the sessions still open and drops
//! the rest.

use crate::backend::BackendProvider;
use crate::error::{RelayError, RelayResult};
use crate::storage::{ActorState, ActorStorage, SessionRecord};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use synclog_sync::{handle_frame, SyncBackend, SyncFrame, WriteAck};
use synclog_types::RemoteId;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Frames buffered per socket before sends are dropped.
pub const SESSION_BUFFER: usize = 256;

/// Instructions for a socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send these bytes as a binary message.
    Frame(Vec<u8>),
    /// Close the socket.
    Close,
}

struct LiveSession {
    identity: String,
    tx: mpsc::Sender<Outbound>,
}

/// Open sockets, keyed by session id.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<Uuid, LiveSession>>,
}

impl SessionTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, LiveSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, session_id: Uuid, identity: &str) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        self.lock().insert(
            session_id,
            LiveSession {
                identity: identity.to_string(),
                tx,
            },
        );
        rx
    }

    fn remove(&self, session_id: &Uuid) {
        self.lock().remove(session_id);
    }

    /// The socket is registered and its task still holds the receiver.
    pub fn is_open(&self, session_id: &Uuid) -> bool {
        self.lock()
            .get(session_id)
            .is_some_and(|session| !session.tx.is_closed())
    }

    /// Sends `frame` to every open socket of `identity`. Returns how many
    /// sockets took it.
    fn send_to(&self, identity: &str, frame: &[u8]) -> usize {
        let sessions = self.lock();
        let mut sent = 0;
        for (session_id, session) in sessions.iter() {
            if session.identity != identity {
                continue;
            }
            match session.tx.try_send(Outbound::Frame(frame.to_vec())) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(%session_id, "session buffer full, dropping frame");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        sent
    }

    /// Closes and forgets every socket of `identity`.
    fn close_identity(&self, identity: &str) -> usize {
        let mut sessions = self.lock();
        let ids: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, s)| s.identity == identity)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(session) = sessions.remove(id) {
                let _ = session.tx.try_send(Outbound::Close);
            }
        }
        ids.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// The relay side of one identity.
pub struct RelayActor {
    identity: String,
    backend: Arc<dyn SyncBackend>,
    storage: Arc<dyn ActorStorage>,
    sessions: Arc<SessionTable>,
    state: Mutex<ActorState>,
    forwarder: Mutex<Option<CancellationToken>>,
}

impl RelayActor {
    fn activate(
        identity: &str,
        backend: Arc<dyn SyncBackend>,
        storage: Arc<dyn ActorStorage>,
        sessions: Arc<SessionTable>,
    ) -> RelayResult<Arc<Self>> {
        let state = match storage.load(identity)? {
            Some(state) if state.reset_on_startup => {
                info!(identity, "resetting actor state");
                storage.delete(identity)?;
                sessions.close_identity(identity);
                ActorState::new(identity)
            }
            Some(mut state) => {
                let before = state.sessions.len();
                state.sessions.retain(|s| sessions.is_open(&s.session_id));
                debug!(
                    identity,
                    kept = state.sessions.len(),
                    dropped = before - state.sessions.len(),
                    "rehydrated sessions"
                );
                state
            }
            None => ActorState::new(identity),
        };
        storage.save(&state)?;

        let resume = !state.sessions.is_empty();
        let actor = Arc::new(Self {
            identity: identity.to_string(),
            backend,
            storage,
            sessions,
            state: Mutex::new(state),
            forwarder: Mutex::new(None),
        });
        if resume {
            actor.start_forwarder();
        }
        Ok(actor)
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// A copy of the persisted state.
    pub fn state(&self) -> ActorState {
        self.lock_state().clone()
    }

    pub fn is_forwarding(&self) -> bool {
        self.forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, ActorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn update(&self, change: impl FnOnce(&mut ActorState)) -> RelayResult<()> {
        let mut state = self.lock_state();
        change(&mut state);
        self.storage.save(&state)
    }

    fn attach(self: &Arc<Self>, remote_id: Option<RemoteId>) -> RelayResult<(Uuid, mpsc::Receiver<Outbound>)> {
        let session_id = Uuid::new_v4();
        let rx = self.sessions.insert(session_id, &self.identity);
        if let Err(e) = self.update(|state| state.sessions.push(SessionRecord::new(session_id, remote_id))) {
            self.sessions.remove(&session_id);
            return Err(e);
        }
        self.start_forwarder();
        info!(identity = %self.identity, %session_id, "session attached");
        Ok((session_id, rx))
    }

    fn detach(&self, session_id: Uuid) -> RelayResult<()> {
        self.sessions.remove(&session_id);
        let mut idle = false;
        self.update(|state| {
            state.sessions.retain(|s| s.session_id != session_id);
            idle = state.sessions.is_empty();
        })?;
        if idle {
            self.stop_forwarder();
        }
        info!(identity = %self.identity, %session_id, "session detached");
        Ok(())
    }

    async fn handle(&self, bytes: &[u8]) -> RelayResult<Option<Vec<u8>>> {
        let frame = SyncFrame::decode(bytes).map_err(|e| RelayError::Session(e.to_string()))?;
        match handle_frame(self.backend.as_ref(), frame).await {
            Some(reply) => Ok(Some(reply.encode()?)),
            None => Ok(None),
        }
    }

    fn start_forwarder(self: &Arc<Self>) {
        let mut slot = self.forwarder.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let mut heads = self.backend.subscribe();
        let sessions = self.sessions.clone();
        let identity = self.identity.clone();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                let head_sequence = tokio::select! {
                    _ = token.cancelled() => break,
                    head = heads.recv() => match head {
                        Ok(head) => head,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                match (SyncFrame::Notify { head_sequence }).encode() {
                    Ok(bytes) => {
                        let sent = sessions.send_to(&identity, &bytes);
                        debug!(identity = %identity, head_sequence, sent, "forwarded notify");
                    }
                    Err(e) => warn!(identity = %identity, "failed to encode notify: {e}"),
                }
            }
            debug!(identity = %identity, "forwarder stopped");
        });
        *slot = Some(cancel);
    }

    fn stop_forwarder(&self) {
        let token = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }
}

impl Drop for RelayActor {
    fn drop(&mut self) {
        self.stop_forwarder();
    }
}

/// Counts reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostStatus {
    /// Active (not hibernated) actors.
    pub identities: usize,
    /// Open sockets across all identities.
    pub sessions: usize,
}

struct HostInner {
    storage: Arc<dyn ActorStorage>,
    backends: Arc<dyn BackendProvider>,
    sessions: Arc<SessionTable>,
    actors: Mutex<HashMap<String, Arc<RelayActor>>>,
}

/// Activates actors on demand and routes work to them.
#[derive(Clone)]
pub struct RelayHost {
    inner: Arc<HostInner>,
}

impl RelayHost {
    pub fn new(storage: Arc<dyn ActorStorage>, backends: Arc<dyn BackendProvider>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                storage,
                backends,
                sessions: Arc::new(SessionTable::default()),
                actors: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn actors(&self) -> MutexGuard<'_, HashMap<String, Arc<RelayActor>>> {
        self.inner.actors.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The actor for `identity`, activating it if needed.
    pub fn actor(&self, identity: &str) -> RelayResult<Arc<RelayActor>> {
        let mut actors = self.actors();
        if let Some(actor) = actors.get(identity) {
            return Ok(actor.clone());
        }
        let actor = RelayActor::activate(
            identity,
            self.inner.backends.backend(identity)?,
            self.inner.storage.clone(),
            self.inner.sessions.clone(),
        )?;
        actors.insert(identity.to_string(), actor.clone());
        Ok(actor)
    }

    /// Registers a socket. The receiver carries frames for it.
    pub fn attach(
        &self,
        identity: &str,
        remote_id: Option<RemoteId>,
    ) -> RelayResult<(Uuid, mpsc::Receiver<Outbound>)> {
        self.actor(identity)?.attach(remote_id)
    }

    /// Forgets a socket that closed or failed.
    ///
    /// A hibernated or destroyed identity is not reactivated for this.
    pub fn detach(&self, identity: &str, session_id: Uuid) -> RelayResult<()> {
        self.inner.sessions.remove(&session_id);
        let active = self.actors().get(identity).cloned();
        if let Some(actor) = active {
            return actor.detach(session_id);
        }
        if let Some(mut state) = self.inner.storage.load(identity)? {
            state.sessions.retain(|s| s.session_id != session_id);
            self.inner.storage.save(&state)?;
        }
        Ok(())
    }

    /// Answers one protocol frame from a client of `identity`.
    pub async fn handle(&self, identity: &str, bytes: &[u8]) -> RelayResult<Option<Vec<u8>>> {
        let actor = self.actor(identity)?;
        actor.handle(bytes).await
    }

    /// Delivers a change from the backend side to `identity`'s clients.
    ///
    /// `change` is an encoded entry batch ([`synclog_types::encode`]). It is
    /// stored in the identity's backend log; the forwarder then announces the
    /// new head to every attached session and their change streams pull it.
    /// Entries the log already holds are not counted as accepted.
    pub async fn write(&self, identity: &str, change: &[u8]) -> RelayResult<WriteAck> {
        let entries = synclog_types::decode(change)?;
        let actor = self.actor(identity)?;
        let received = entries.len();
        let ack = actor.backend.push(entries).await?;
        debug!(
            identity,
            received,
            accepted = ack.accepted,
            head = ack.head_sequence,
            "backend write"
        );
        Ok(ack)
    }

    /// Persists and drops the actor. Returns false if it was not active.
    pub fn hibernate(&self, identity: &str) -> RelayResult<bool> {
        let Some(actor) = self.actors().remove(identity) else {
            return Ok(false);
        };
        actor.stop_forwarder();
        self.inner.storage.save(&actor.state())?;
        info!(identity, "actor hibernated");
        Ok(true)
    }

    /// Closes every socket of `identity` and deletes its state.
    pub fn destroy(&self, identity: &str) -> RelayResult<()> {
        if let Some(actor) = self.actors().remove(identity) {
            actor.stop_forwarder();
        }
        let closed = self.inner.sessions.close_identity(identity);
        self.inner.storage.delete(identity)?;
        info!(identity, closed, "actor destroyed");
        Ok(())
    }

    /// Marks the identity's state to be wiped on its next activation.
    pub fn set_reset_on_startup(&self, identity: &str, reset: bool) -> RelayResult<()> {
        self.actor(identity)?
            .update(|state| state.reset_on_startup = reset)
    }

    pub fn status(&self) -> HostStatus {
        HostStatus {
            identities: self.actors().len(),
            sessions: self.inner.sessions.len(),
        }
    }
}
