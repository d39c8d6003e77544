use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use synclog_model::{handler_fn, Applied, EventKind, Registry};
use synclog_relay::auth::{connector, token_for};
use synclog_relay::{build_router, MemoryActorStorage, MemoryBackends, RelayHost};
use synclog_storage::Journal;
use synclog_sync::{
    EventLog, EventLogConfig, RemoteTransport, StreamTransport, StreamTransportConfig,
};
use synclog_types::{Entry, RemoteId};
use tokio::time::timeout;

const SECRET: &str = "ws-secret";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    id: String,
    text: String,
}

struct NoteAdded;

impl EventKind for NoteAdded {
    const TAG: &'static str = "NoteAdded";
    type Payload = Note;

    fn primary_key(payload: &Note) -> String {
        payload.id.clone()
    }
}

fn note(id: &str, text: &str) -> Note {
    Note {
        id: id.into(),
        text: text.into(),
    }
}

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
    (format!("ws://{addr}/sync"), host)
}

/// A replica of `identity`'s log, synced through the relay at `url`.
async fn replica(url: &str, identity: &str) -> EventLog {
    let registry = Registry::new();
    registry
        .register_handler(handler_fn(|_: Applied<NoteAdded>| async { Ok(()) }))
        .detach();
    let log = EventLog::new(
        Journal::open_in_memory().unwrap(),
        registry,
        EventLogConfig {
            poll_interval: Duration::from_millis(200),
            push_interval: Duration::from_millis(5),
            sync_end_delay: Duration::from_millis(5),
            ..EventLogConfig::default()
        },
    );
    let transport = StreamTransport::websocket_with_config(
        RemoteId::new(),
        connector(url, identity, &token_for(SECRET, identity), RemoteId::new()),
        StreamTransportConfig {
            request_timeout: Duration::from_secs(2),
            // Long enough that only Notify frames can explain a quick sync.
            poll_interval: Duration::from_secs(30),
            ..StreamTransportConfig::default()
        },
    );
    log.register_remote(Arc::new(transport)).await.unwrap();
    log
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(WAIT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn holds(log: &EventLog, id: &str) -> bool {
    log.entries()
        .await
        .unwrap()
        .iter()
        .any(|entry| entry.primary_key == id)
}

#[tokio::test]
async fn replicas_converge_through_the_relay() {
    let (url, host) = spawn_relay().await;
    let phone = replica(&url, "alice").await;
    let laptop = replica(&url, "alice").await;
    let host = &host;
    wait_until(|| async move { host.status().sessions == 2 }).await;

    phone.write::<NoteAdded>(note("n1", "from phone")).await.unwrap();
    laptop.write::<NoteAdded>(note("n2", "from laptop")).await.unwrap();

    let (phone_ref, laptop_ref) = (&phone, &laptop);
    wait_until(|| async move { holds(laptop_ref, "n1").await && holds(phone_ref, "n2").await })
        .await;
    assert_eq!(phone.entries().await.unwrap(), laptop.entries().await.unwrap());

    phone.shutdown().await.unwrap();
    laptop.shutdown().await.unwrap();
}

#[tokio::test]
async fn backend_write_reaches_every_replica_of_the_identity() {
    let (url, host) = spawn_relay().await;
    let alice = replica(&url, "alice").await;
    let bob = replica(&url, "bob").await;
    let host_ref = &host;
    wait_until(|| async move { host_ref.status().sessions == 2 }).await;

    let payload = note("n9", "pushed by the backend");
    let entry = Entry::new(
        NoteAdded::TAG,
        NoteAdded::primary_key(&payload),
        NoteAdded::encode(&payload).unwrap(),
    );
    let ack = host
        .write("alice", &synclog_types::encode(&[entry.clone()]).unwrap())
        .await
        .unwrap();
    assert_eq!(ack.accepted, 1);

    let alice_ref = &alice;
    wait_until(|| async move { holds(alice_ref, "n9").await }).await;
    assert_eq!(alice.entries().await.unwrap(), vec![entry]);
    assert!(bob.entries().await.unwrap().is_empty());

    alice.shutdown().await.unwrap();
    bob.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_token_fails_to_connect() {
    let (url, _host) = spawn_relay().await;
    let transport = StreamTransport::websocket(
        RemoteId::new(),
        connector(url, "alice", "not-the-token", RemoteId::new()),
    );
    assert!(transport.changes(0).await.is_err());
}
