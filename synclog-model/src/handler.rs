//! Handler and compactor traits plus closure adapters.

use crate::error::HandlerResult;
use crate::event::{Applied, EventKind};
use async_trait::async_trait;
use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use synclog_types::Entry;

/// Applies events of kind `E` to application state.
///
/// Handlers may await but must not write to the journal they are invoked
/// from.
#[async_trait]
pub trait EventHandler<E: EventKind>: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn apply(&self, applied: Applied<E>) -> HandlerResult<Self::Output>;
}

/// Rewrites a run of consecutive entries from one compaction group.
///
/// Must be a pure function of its input: every replica compacts the same
/// run to the same entries, ids included.
#[async_trait]
pub trait Compactor: Send + Sync + 'static {
    async fn compact(&self, run: Vec<Entry>) -> HandlerResult<Vec<Entry>>;
}

/// Type-erased handler output.
///
/// Handlers are stored behind one table, so their outputs come back boxed;
/// [`HandlerOutput::downcast`] recovers the concrete type.
pub struct HandlerOutput(Box<dyn Any + Send>);

impl HandlerOutput {
    pub fn new<T: Send + 'static>(value: T) -> Self {
        Self(Box::new(value))
    }

    /// Returns the output as `T`, or gives it back if it is another type.
    pub fn downcast<T: 'static>(self) -> Result<T, Self> {
        self.0.downcast::<T>().map(|b| *b).map_err(Self)
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.0.is::<T>()
    }
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerOutput").finish_non_exhaustive()
    }
}

// ── Closure adapters ─────────────────────────────────────────────

/// Handler backed by an async closure. See [`handler_fn`].
pub struct FnHandler<E, F> {
    f: F,
    _kind: PhantomData<fn() -> E>,
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<E, F, Fut, O>(f: F) -> FnHandler<E, F>
where
    E: EventKind,
    F: Fn(Applied<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<O>> + Send + 'static,
    O: Send + 'static,
{
    FnHandler {
        f,
        _kind: PhantomData,
    }
}

#[async_trait]
impl<E, F, Fut, O> EventHandler<E> for FnHandler<E, F>
where
    E: EventKind,
    F: Fn(Applied<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<O>> + Send + 'static,
    O: Send + 'static,
{
    type Output = O;

    async fn apply(&self, applied: Applied<E>) -> HandlerResult<O> {
        (self.f)(applied).await
    }
}

/// Compactor backed by an async closure. See [`compactor_fn`].
pub struct FnCompactor<F> {
    f: F,
}

/// Wraps an async closure as a [`Compactor`].
pub fn compactor_fn<F, Fut>(f: F) -> FnCompactor<F>
where
    F: Fn(Vec<Entry>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Vec<Entry>>> + Send + 'static,
{
    FnCompactor { f }
}

#[async_trait]
impl<F, Fut> Compactor for FnCompactor<F>
where
    F: Fn(Vec<Entry>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<Vec<Entry>>> + Send + 'static,
{
    async fn compact(&self, run: Vec<Entry>) -> HandlerResult<Vec<Entry>> {
        (self.f)(run).await
    }
}
