//! HTTP surface: the sync WebSocket and a status endpoint.

use crate::actor::{HostStatus, Outbound, RelayHost};
use crate::auth;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use synclog_sync::{ErrorFrame, SyncFrame, PROTOCOL_VERSION};
use synclog_types::RemoteId;
use tracing::{debug, warn};

#[derive(Clone)]
struct AppState {
    host: RelayHost,
    secret: Arc<str>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StatusResponse {
    pub identities: usize,
    pub sessions: usize,
    pub protocol_version: u8,
}

impl From<HostStatus> for StatusResponse {
    fn from(status: HostStatus) -> Self {
        Self {
            identities: status.identities,
            sessions: status.sessions,
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// Build the HTTP router around `host`. Clients authenticate against `secret`.
pub fn build_router(host: RelayHost, secret: impl Into<Arc<str>>) -> Router {
    Router::new()
        .route("/sync", get(sync_handler))
        .route("/api/v1/status", get(status_handler))
        .with_state(AppState {
            host,
            secret: secret.into(),
        })
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.host.status().into())
}

async fn sync_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match auth::authenticate(&headers, &state.secret) {
        Ok(identity) => identity,
        Err(e) => {
            debug!("rejected sync request: {e}");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    let remote_id = match auth::remote_id(&headers) {
        Ok(remote_id) => remote_id,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    upgrade.on_upgrade(move |socket| handle_socket(socket, state.host, identity, remote_id))
}

async fn handle_socket(
    socket: WebSocket,
    host: RelayHost,
    identity: String,
    remote_id: Option<RemoteId>,
) {
    let (session_id, mut outbound) = match host.attach(&identity, remote_id) {
        Ok(attached) => attached,
        Err(e) => {
            warn!(identity = %identity, "failed to attach session: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    let reply = match host.handle(&identity, &bytes).await {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(identity = %identity, %session_id, "bad frame: {e}");
                            SyncFrame::Error(ErrorFrame::new(None, e.to_string())).encode().ok()
                        }
                    };
                    if let Some(reply) = reply {
                        if sink.send(Message::Binary(reply.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(identity = %identity, %session_id, "socket error: {e}");
                    break;
                }
            },
            out = outbound.recv() => match out {
                Some(Outbound::Frame(bytes)) => {
                    if sink.send(Message::Binary(bytes.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }

    if let Err(e) = host.detach(&identity, session_id) {
        warn!(identity = %identity, %session_id, "failed to detach session: {e}");
    }
}
