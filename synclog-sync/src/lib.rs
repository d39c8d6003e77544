//! Sync layer for synclog.
//!
//! Keeps a local journal converging with any number of remotes over
//! unreliable, resumable transports.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Protocol**: Frames exchanged between a replica and a remote
//! - **Transport**: The per-remote contract (change stream plus push), with
//!   an in-memory hub and a framed implementation over byte streams or
//!   relay WebSockets
//! - **Backend**: The remote side of the contract, including a journal-backed
//!   one for relays
//! - **Event log**: Local writes, the per-remote sync loops and the observer
//!   channels
//!
//! ## Sync Process
//!
//! 1. **Write**: A typed event is encoded, applied by its handler and
//!    committed to the journal
//! 2. **Push**: The outbound loop sends entries the remote has not accepted
//! 3. **Pull**: The inbound loop streams remote batches from the persisted
//!    watermark
//! 4. **Merge**: Each batch is compacted, deduplicated and applied with its
//!    conflicts, and the watermark moves past it
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use synclog_model::Registry;
//! use synclog_storage::Journal;
//! use synclog_sync::memory::MemoryRemote;
//! use synclog_sync::{EventLog, EventLogConfig};
//! use synclog_types::RemoteId;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let log = EventLog::new(Journal::open_in_memory()?, Registry::new(), EventLogConfig::default());
//! let hub = MemoryRemote::new();
//! log.register_remote(Arc::new(hub.transport(RemoteId::new()))).await?;
//! # Ok(())
//! # }
//! ```

mod backend;
pub mod codec;
mod error;
mod event_log;
pub mod protocol;
pub mod state;
pub mod stream;
pub mod transport;
pub mod ws;

pub use backend::JournalBackend;
pub use error::{SyncError, SyncResult};
pub use event_log::{EventLog, EventLogConfig};
pub use protocol::{ErrorFrame, SyncFrame, MAX_BATCH_SIZE, PROTOCOL_VERSION};
pub use state::{CycleReport, Invalidation, RemoteState, RemoteStatus, SyncEvent, SyncOutcome};
pub use stream::{
    handle_frame, serve_connection, Connect, StreamTransport, StreamTransportConfig, TcpConnector,
};
pub use transport::{
    memory, pull_stream, ChangePage, ChangeStream, RemoteTransport, SyncBackend, WriteAck,
};
pub use ws::WsConnector;
