//! Event registry for synclog.
//!
//! Applications describe each event once as an [`EventKind`] (tag, payload
//! type, primary key) and attach behavior to it through the [`Registry`]:
//! - handlers that apply an event to derived state ([`EventHandler`])
//! - compaction groups that fold runs of related remote events
//!   ([`Compactor`])
//! - reactivity keys invalidated after a commit
//!
//! Every registration returns a [`Registration`] guard. Registries can be
//! populated lazily with [`Registry::defer`]; the first dispatch resolves
//! them.

mod error;
mod event;
mod handler;
mod registry;

pub use error::{HandlerError, HandlerResult, RegistryError};
pub use event::{Applied, Conflict, EventKind};
pub use handler::{compactor_fn, handler_fn, Compactor, EventHandler, FnCompactor, FnHandler, HandlerOutput};
pub use registry::{Registration, Registry};
