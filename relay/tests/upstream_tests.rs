use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use synclog_relay::{
    serve_backends, BackendProvider, MemoryActorStorage, MemoryBackends, Outbound, RelayHost,
    UpstreamBackends,
};
use synclog_sync::{StreamTransportConfig, SyncBackend, SyncFrame};
use synclog_types::Entry;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Starts a backend service over fresh in-memory logs.
async fn spawn_upstream() -> (String, Arc<MemoryBackends>) {
    let logs = Arc::new(MemoryBackends::default());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let provider: Arc<dyn BackendProvider> = logs.clone();
    tokio::spawn(serve_backends(listener, provider));
    (addr, logs)
}

fn relay_over(addr: &str) -> RelayHost {
    let upstream = UpstreamBackends::with_config(
        addr,
        StreamTransportConfig {
            request_timeout: Duration::from_secs(2),
            ..StreamTransportConfig::default()
        },
    );
    RelayHost::new(Arc::new(MemoryActorStorage::default()), Arc::new(upstream))
}

async fn next_frame(rx: &mut mpsc::Receiver<Outbound>) -> SyncFrame {
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(Outbound::Frame(bytes))) => SyncFrame::decode(&bytes).unwrap(),
        other => panic!("expected a frame, got {other:?}"),
    }
}

#[tokio::test]
async fn pushes_land_in_the_upstream_log_and_notify_sessions() {
    let (addr, logs) = spawn_upstream().await;
    let host = relay_over(&addr);
    let (_session, mut rx) = host.attach("alice", None).unwrap();

    let entry = Entry::new("note_added", "n1", b"hi".to_vec());
    let push = SyncFrame::Push {
        request_id: 1,
        entries: vec![entry.clone()],
    }
    .encode()
    .unwrap();
    let reply = host.handle("alice", &push).await.unwrap().unwrap();
    assert_eq!(
        SyncFrame::decode(&reply).unwrap(),
        SyncFrame::PushAck {
            request_id: 1,
            accepted: 1,
            head_sequence: 1,
        }
    );

    let page = logs.backend("alice").unwrap().pull(0, 10).await.unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].entry, entry);
    assert!(logs.backend("bob").unwrap().pull(0, 10).await.unwrap().entries.is_empty());

    assert_eq!(next_frame(&mut rx).await, SyncFrame::Notify { head_sequence: 1 });
}

#[tokio::test]
async fn upstream_writes_by_another_relay_reach_sessions() {
    let (addr, _logs) = spawn_upstream().await;
    let first = relay_over(&addr);
    let second = relay_over(&addr);
    let (_session, mut rx) = second.attach("alice", None).unwrap();

    // Opens the second relay's upstream link so it hears notifications.
    let pull = SyncFrame::Pull {
        request_id: 1,
        since: 0,
        limit: 10,
    }
    .encode()
    .unwrap();
    second.handle("alice", &pull).await.unwrap();

    let entry = Entry::new("note_added", "n1", Vec::new());
    let ack = first
        .write("alice", &synclog_types::encode(&[entry]).unwrap())
        .await
        .unwrap();
    assert_eq!(ack.accepted, 1);

    assert_eq!(next_frame(&mut rx).await, SyncFrame::Notify { head_sequence: 1 });
}

#[tokio::test]
async fn invalid_identity_is_refused_upstream() {
    let (addr, _logs) = spawn_upstream().await;
    let upstream = UpstreamBackends::with_config(
        addr,
        StreamTransportConfig {
            request_timeout: Duration::from_millis(500),
            ..StreamTransportConfig::default()
        },
    );
    let backend = upstream.backend("../etc").unwrap();
    assert!(backend.push(vec![Entry::new("e", "k", Vec::new())]).await.is_err());
}

#[test]
fn backend_flags_parse() {
    use clap::Parser;
    use synclog_relay::RelayConfig;

    let config = RelayConfig::try_parse_from([
        "synclog-relay",
        "--secret",
        "s",
        "--backend",
        "upstream:4020",
        "--backend-listen",
        "0.0.0.0:4021",
    ])
    .unwrap();
    assert_eq!(config.backend.as_deref(), Some("upstream:4020"));
    assert_eq!(config.backend_listen.as_deref(), Some("0.0.0.0:4021"));

    let config = RelayConfig::try_parse_from(["synclog-relay", "--secret", "s"]).unwrap();
    assert_eq!(config.backend, None);
}
