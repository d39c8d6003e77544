use std::sync::Arc;
use synclog_relay::auth::{token_for, IDENTITY_HEADER, REMOTE_ID_HEADER, TOKEN_HEADER};
use synclog_relay::{build_router, MemoryActorStorage, MemoryBackends, RelayHost, StatusResponse};
use synclog_sync::PROTOCOL_VERSION;

const SECRET: &str = "test-secret";

async fn spawn_relay() -> (String, RelayHost) {
    let host = RelayHost::new(
        Arc::new(MemoryActorStorage::default()),
        Arc::new(MemoryBackends::default()),
    );
    let app = build_router(host.clone(), SECRET);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), host)
}

// ── Status ───────────────────────────────────────────────────────

#[tokio::test]
async fn status_endpoint_reports_counts() {
    let (base, host) = spawn_relay().await;
    let (_session, _rx) = host.attach("alice", None).unwrap();

    let resp = reqwest::get(format!("{base}/api/v1/status")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: StatusResponse = resp.json().await.unwrap();
    assert_eq!(
        body,
        StatusResponse {
            identities: 1,
            sessions: 1,
            protocol_version: PROTOCOL_VERSION,
        }
    );
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let (base, _host) = spawn_relay().await;
    let resp = reqwest::get(format!("{base}/api/v1/nonexistent")).await.unwrap();
    assert_eq!(resp.status(), 404);
}

// ── Sync endpoint auth ───────────────────────────────────────────

#[tokio::test]
async fn sync_without_credentials_is_unauthorized() {
    let (base, _host) = spawn_relay().await;
    let resp = reqwest::get(format!("{base}/sync")).await.unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn sync_with_wrong_token_is_unauthorized() {
    let (base, _host) = spawn_relay().await;
    let resp = reqwest::Client::new()
        .get(format!("{base}/sync"))
        .header(IDENTITY_HEADER, "alice")
        .header(TOKEN_HEADER, token_for("other-secret", "alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn sync_with_token_for_other_identity_is_unauthorized() {
    let (base, _host) = spawn_relay().await;
    let resp = reqwest::Client::new()
        .get(format!("{base}/sync"))
        .header(IDENTITY_HEADER, "alice")
        .header(TOKEN_HEADER, token_for(SECRET, "bob"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn authenticated_plain_request_is_not_upgraded() {
    let (base, host) = spawn_relay().await;
    let resp = reqwest::Client::new()
        .get(format!("{base}/sync"))
        .header(IDENTITY_HEADER, "alice")
        .header(TOKEN_HEADER, token_for(SECRET, "alice"))
        .send()
        .await
        .unwrap();
    assert_ne!(resp.status(), 401);
    assert!(resp.status().is_client_error());
    assert_eq!(host.status().sessions, 0);
}

#[tokio::test]
async fn malformed_remote_id_is_bad_request() {
    let (base, _host) = spawn_relay().await;
    let resp = reqwest::Client::new()
        .get(format!("{base}/sync"))
        .header(IDENTITY_HEADER, "alice")
        .header(TOKEN_HEADER, token_for(SECRET, "alice"))
        .header(REMOTE_ID_HEADER, "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
