//! The registry: tag-keyed handler table, compaction groups, reactivity
//! keys and deferred initialization.

use crate::error::{HandlerError, HandlerResult, RegistryError};
use crate::event::{Applied, Conflict, EventKind};
use crate::handler::{Compactor, EventHandler, HandlerOutput};
use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use synclog_storage::{BoxError, Compaction};
use synclog_types::{Entry, RemoteId};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

type Initializer =
    Box<dyn FnOnce(Registry) -> BoxFuture<'static, Result<(), RegistryError>> + Send>;

/// The single run of all initializers, shared by every resolver.
type Resolution = Shared<BoxFuture<'static, Result<(), RegistryError>>>;

/// Shared table of event behavior. Cloning shares the table.
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, HandlerSlot>>,
    compactions: RwLock<Vec<CompactionSlot>>,
    reactivity: RwLock<Vec<ReactivitySlot>>,
    deferred: Mutex<Deferred>,
    resolved: OnceCell<Result<(), RegistryError>>,
}

#[derive(Default)]
struct Deferred {
    pending: Vec<Initializer>,
    /// Set once resolution has started. A resolver that is dropped midway
    /// leaves it in place for the next one to finish.
    running: Option<Resolution>,
}

struct HandlerSlot {
    id: u64,
    handler: Arc<dyn ErasedHandler>,
}

struct CompactionSlot {
    id: u64,
    tags: HashSet<String>,
    compactor: Arc<dyn Compactor>,
}

struct ReactivitySlot {
    id: u64,
    tag: String,
    keys: Vec<String>,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn remove(&self, slot: SlotRef) {
        match slot {
            SlotRef::Handler { tag, id } => {
                let mut handlers = write(&self.handlers);
                if handlers.get(&tag).is_some_and(|h| h.id == id) {
                    handlers.remove(&tag);
                    debug!(tag = %tag, "handler unregistered");
                }
            }
            SlotRef::Compaction(id) => write(&self.compactions).retain(|s| s.id != id),
            SlotRef::Reactivity(id) => write(&self.reactivity).retain(|s| s.id != id),
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Registration ─────────────────────────────────────────────

    /// Registers the handler for `E`. A later registration for the same
    /// tag replaces this one.
    pub fn register_handler<E, H>(&self, handler: H) -> Registration
    where
        E: EventKind,
        H: EventHandler<E>,
    {
        let id = self.inner.next_id();
        let slot = HandlerSlot {
            id,
            handler: Arc::new(Typed {
                handler,
                _kind: PhantomData::<fn() -> E>,
            }),
        };
        if write(&self.inner.handlers)
            .insert(E::TAG.to_string(), slot)
            .is_some()
        {
            warn!(tag = E::TAG, "replacing existing handler");
        }
        self.registration(SlotRef::Handler {
            tag: E::TAG.to_string(),
            id,
        })
    }

    /// Registers a compaction group over a set of event tags.
    ///
    /// A tag belongs to at most one group; if several groups name it, the
    /// earliest registered one wins.
    pub fn register_compaction<I, S, C>(&self, tags: I, compactor: C) -> Registration
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        C: Compactor,
    {
        let id = self.inner.next_id();
        write(&self.inner.compactions).push(CompactionSlot {
            id,
            tags: tags.into_iter().map(Into::into).collect(),
            compactor: Arc::new(compactor),
        });
        self.registration(SlotRef::Compaction(id))
    }

    /// Registers reactivity keys invalidated whenever `tag` is committed.
    pub fn register_reactivity<I, S>(&self, tag: impl Into<String>, keys: I) -> Registration
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = self.inner.next_id();
        write(&self.inner.reactivity).push(ReactivitySlot {
            id,
            tag: tag.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        });
        self.registration(SlotRef::Reactivity(id))
    }

    fn registration(&self, slot: SlotRef) -> Registration {
        Registration {
            registry: Arc::downgrade(&self.inner),
            slot: Some(slot),
        }
    }

    // ── Lazy resolution ──────────────────────────────────────────

    /// Records an initializer to run on first [`Registry::resolve`].
    ///
    /// Initializers typically register handlers and `detach()` the guards.
    /// They must not dispatch through the registry.
    pub fn defer<F, Fut>(&self, init: F) -> Result<(), RegistryError>
    where
        F: FnOnce(Registry) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RegistryError>> + Send + 'static,
    {
        let mut deferred = self.inner.deferred.lock().unwrap_or_else(|e| e.into_inner());
        if deferred.running.is_some() {
            return Err(RegistryError::AlreadyResolved);
        }
        deferred
            .pending
            .push(Box::new(move |registry| init(registry).boxed()));
        Ok(())
    }

    /// Runs all deferred initializers exactly once. Concurrent callers wait
    /// for the first; the outcome is memoized.
    ///
    /// Cancel-safe: dropping the returned future does not lose initializers.
    /// The next call picks up the same run where it stopped.
    pub async fn resolve(&self) -> Result<(), RegistryError> {
        self.inner
            .resolved
            .get_or_init(|| self.resolution())
            .await
            .clone()
    }

    fn resolution(&self) -> Resolution {
        let mut deferred = self.inner.deferred.lock().unwrap_or_else(|e| e.into_inner());
        match &deferred.running {
            Some(run) => run.clone(),
            None => {
                let pending = std::mem::take(&mut deferred.pending);
                debug!(count = pending.len(), "resolving registry");
                let registry = self.clone();
                let run = async move {
                    for init in pending {
                        init(registry.clone()).await?;
                    }
                    Ok(())
                }
                .boxed()
                .shared();
                deferred.running = Some(run.clone());
                run
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.resolved.initialized()
    }

    // ── Lookup and dispatch ──────────────────────────────────────

    /// Whether a handler is registered for `tag`.
    pub fn handles(&self, tag: &str) -> bool {
        read(&self.inner.handlers).contains_key(tag)
    }

    /// Applies an entry through the handler registered for its tag.
    ///
    /// Resolves the registry first if needed. Entries with no handler fail
    /// with [`HandlerError::Unhandled`].
    pub async fn dispatch(
        &self,
        entry: Entry,
        conflicts: Vec<Entry>,
        origin: Option<RemoteId>,
    ) -> HandlerResult<HandlerOutput> {
        self.resolve().await?;
        let handler = read(&self.inner.handlers)
            .get(&entry.event)
            .map(|slot| slot.handler.clone());
        match handler {
            Some(handler) => handler.apply(entry, conflicts, origin).await,
            None => Err(HandlerError::Unhandled(entry.event)),
        }
    }

    /// Reactivity keys for `tag`, in registration order without repeats.
    pub fn reactivity_keys(&self, tag: &str) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for slot in read(&self.inner.reactivity).iter().filter(|s| s.tag == tag) {
            for key in &slot.keys {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    fn compactor(&self, group: usize) -> Option<Arc<dyn Compactor>> {
        read(&self.inner.compactions)
            .iter()
            .find(|s| s.id as usize == group)
            .map(|s| s.compactor.clone())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<String> = read(&self.inner.handlers).keys().cloned().collect();
        tags.sort();
        f.debug_struct("Registry")
            .field("handlers", &tags)
            .field("compactions", &read(&self.inner.compactions).len())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[async_trait]
impl Compaction for Registry {
    fn group_of(&self, event: &str) -> Option<usize> {
        read(&self.inner.compactions)
            .iter()
            .find(|s| s.tags.contains(event))
            .map(|s| s.id as usize)
    }

    async fn compact(&self, group: usize, run: Vec<Entry>) -> Result<Vec<Entry>, BoxError> {
        match self.compactor(group) {
            Some(compactor) => compactor.compact(run).await.map_err(Into::into),
            // Unregistered mid-merge.
            None => Ok(run),
        }
    }
}

// ── Registration guard ───────────────────────────────────────────

enum SlotRef {
    Handler { tag: String, id: u64 },
    Compaction(u64),
    Reactivity(u64),
}

/// Keeps a registration alive. Dropping it unregisters.
#[must_use = "dropping a Registration unregisters it; call detach() to keep it"]
pub struct Registration {
    registry: Weak<Inner>,
    slot: Option<SlotRef>,
}

impl Registration {
    /// Unregisters now. Same as dropping.
    pub fn remove(mut self) {
        self.unregister();
    }

    /// Keeps the registration for the registry's lifetime.
    pub fn detach(mut self) {
        self.slot = None;
    }

    fn unregister(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Some(inner) = self.registry.upgrade() {
                inner.remove(slot);
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("active", &self.slot.is_some())
            .finish()
    }
}

// ── Type erasure ─────────────────────────────────────────────────

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn apply(
        &self,
        entry: Entry,
        conflicts: Vec<Entry>,
        origin: Option<RemoteId>,
    ) -> HandlerResult<HandlerOutput>;
}

struct Typed<E, H> {
    handler: H,
    _kind: PhantomData<fn() -> E>,
}

#[async_trait]
impl<E, H> ErasedHandler for Typed<E, H>
where
    E: EventKind,
    H: EventHandler<E>,
{
    async fn apply(
        &self,
        entry: Entry,
        conflicts: Vec<Entry>,
        origin: Option<RemoteId>,
    ) -> HandlerResult<HandlerOutput> {
        let payload = E::decode(&entry.payload)?;
        let applied = Applied {
            entry,
            payload,
            conflicts: conflicts.into_iter().map(|entry| Conflict { entry }).collect(),
            origin,
        };
        self.handler.apply(applied).await.map(HandlerOutput::new)
    }
}
