//! Relay for synclog clients.
//!
//! Clients connect over a WebSocket at `/sync`, authenticate with an
//! identity and a token derived from the relay's secret, and speak the
//! framed sync protocol from [`synclog_sync::protocol`] with one binary
//! message per frame. Every identity gets its own backend log and a
//! [`RelayActor`] that tracks attached sessions and pushes head
//! notifications to them. Logs live in memory, in per-identity journals,
//! or in an upstream sync service ([`UpstreamBackends`]).

mod actor;
pub mod auth;
mod backend;
mod config;
mod error;
mod server;
mod storage;
mod upstream;

pub use actor::{HostStatus, Outbound, RelayActor, RelayHost, SessionTable, SESSION_BUFFER};
pub use backend::{BackendProvider, JournalBackends, MemoryBackends};
pub use config::RelayConfig;
pub use error::{RelayError, RelayResult};
pub use server::{build_router, StatusResponse};
pub use storage::{ActorState, ActorStorage, MemoryActorStorage, SessionRecord, SqliteActorStorage};
pub use upstream::{serve_backends, UpstreamBackends};
