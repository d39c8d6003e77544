//! Backends living in another process.
//!
//! [`UpstreamBackends`] dials a sync service over TCP, one connection per
//! identity, each opened with a `Hello` naming the identity. The service
//! side is [`serve_backends`], which answers every connection from the log
//! its `Hello` selects. A relay started with `--backend-listen` runs it over
//! its own backends, so relays can be chained.

use crate::auth::is_valid_identity;
use crate::backend::BackendProvider;
use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use synclog_sync::codec::{read_frame, write_frame};
use synclog_sync::{
    serve_connection, Connect, StreamTransport, StreamTransportConfig, SyncBackend, SyncFrame,
    TcpConnector,
};
use synclog_types::RemoteId;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Connects to the upstream service and selects one identity's log.
struct HelloConnector {
    tcp: TcpConnector,
    identity: String,
}

#[async_trait]
impl Connect for HelloConnector {
    async fn connect(&self) -> io::Result<synclog_sync::stream::BoxedIo> {
        let mut io = self.tcp.connect().await?;
        write_frame(
            &mut io,
            &SyncFrame::Hello {
                identity: self.identity.clone(),
            },
        )
        .await?;
        Ok(io)
    }
}

/// Per-identity backends reached through an upstream sync service.
pub struct UpstreamBackends {
    addr: String,
    config: StreamTransportConfig,
    backends: Mutex<HashMap<String, Arc<StreamTransport>>>,
}

impl UpstreamBackends {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_config(addr, StreamTransportConfig::default())
    }

    pub fn with_config(addr: impl Into<String>, config: StreamTransportConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            backends: Mutex::new(HashMap::new()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl BackendProvider for UpstreamBackends {
    fn backend(&self, identity: &str) -> RelayResult<Arc<dyn SyncBackend>> {
        let mut backends = self.backends.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(backend) = backends.get(identity) {
            return Ok(backend.clone());
        }
        debug!(identity, upstream = %self.addr, "new upstream backend");
        let connector = HelloConnector {
            tcp: TcpConnector::new(self.addr.clone()),
            identity: identity.to_string(),
        };
        // The upstream never sees this id; it only labels log lines.
        let backend = Arc::new(StreamTransport::with_config(
            RemoteId::new(),
            connector,
            self.config.clone(),
        ));
        backends.insert(identity.to_string(), backend.clone());
        Ok(backend)
    }
}

/// Serves `provider`'s backends to relays dialing in. Runs until the
/// listener fails.
pub async fn serve_backends(
    listener: TcpListener,
    provider: Arc<dyn BackendProvider>,
) -> io::Result<()> {
    info!(addr = ?listener.local_addr().ok(), "serving backends");
    loop {
        let (stream, peer) = listener.accept().await?;
        let provider = provider.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_upstream_connection(stream, provider.as_ref()).await {
                warn!(%peer, "upstream connection ended: {e}");
            }
        });
    }
}

async fn serve_upstream_connection(
    mut stream: TcpStream,
    provider: &dyn BackendProvider,
) -> RelayResult<()> {
    stream.set_nodelay(true)?;
    let identity = match read_frame(&mut stream).await? {
        Some(SyncFrame::Hello { identity }) => identity,
        Some(other) => {
            return Err(RelayError::Session(format!("expected Hello, got {other:?}")));
        }
        None => return Ok(()),
    };
    if !is_valid_identity(&identity) {
        return Err(RelayError::Session(format!("invalid identity {identity:?}")));
    }
    debug!(identity = %identity, "upstream connection opened");
    let backend = provider.backend(&identity)?;
    serve_connection(stream, backend).await?;
    Ok(())
}
