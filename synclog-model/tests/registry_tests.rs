use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use synclog_model::{
    compactor_fn, handler_fn, Applied, EventHandler, EventKind, HandlerError, HandlerResult,
    Registry, RegistryError,
};
use synclog_storage::Compaction;
use synclog_types::{Entry, RemoteId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Rename {
    user: String,
    name: String,
}

struct UserRenamed;

impl EventKind for UserRenamed {
    const TAG: &'static str = "UserRenamed";
    type Payload = Rename;

    fn primary_key(payload: &Rename) -> String {
        payload.user.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Deleted {
    user: String,
}

struct UserDeleted;

impl EventKind for UserDeleted {
    const TAG: &'static str = "UserDeleted";
    type Payload = Deleted;

    fn primary_key(payload: &Deleted) -> String {
        payload.user.clone()
    }
}

fn rename_entry(user: &str, name: &str) -> Entry {
    let payload = Rename {
        user: user.into(),
        name: name.into(),
    };
    Entry::new(
        UserRenamed::TAG,
        UserRenamed::primary_key(&payload),
        UserRenamed::encode(&payload).unwrap(),
    )
}

/// Records every name it is asked to apply and returns its length.
struct NameRecorder {
    names: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl EventHandler<UserRenamed> for NameRecorder {
    type Output = usize;

    async fn apply(&self, applied: Applied<UserRenamed>) -> HandlerResult<usize> {
        let len = applied.payload.name.len();
        self.names.lock().unwrap().push(applied.payload.name);
        Ok(len)
    }
}

// ── Dispatch ─────────────────────────────────────────────────────

#[tokio::test]
async fn dispatch_decodes_payload_and_returns_output() {
    let registry = Registry::new();
    let names = Arc::new(Mutex::new(Vec::new()));
    let _guard = registry.register_handler(NameRecorder {
        names: names.clone(),
    });

    let output = registry
        .dispatch(rename_entry("u1", "Ann"), Vec::new(), None)
        .await
        .unwrap();

    assert_eq!(output.downcast::<usize>().unwrap(), 3);
    assert_eq!(*names.lock().unwrap(), vec!["Ann".to_string()]);
}

#[tokio::test]
async fn downcast_to_wrong_type_gives_output_back() {
    let registry = Registry::new();
    let _guard = registry.register_handler(handler_fn(|_: Applied<UserRenamed>| async {
        Ok("done")
    }));

    let output = registry
        .dispatch(rename_entry("u1", "Ann"), Vec::new(), None)
        .await
        .unwrap();
    let output = output.downcast::<usize>().unwrap_err();
    assert!(output.is::<&str>());
}

#[tokio::test]
async fn unhandled_tag_is_an_error() {
    let registry = Registry::new();
    let err = registry
        .dispatch(Entry::new("Mystery", "k", Vec::new()), Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Unhandled(tag) if tag == "Mystery"));
}

#[tokio::test]
async fn malformed_payload_is_a_payload_error() {
    let registry = Registry::new();
    let _guard = registry.register_handler(handler_fn(|_: Applied<UserRenamed>| async { Ok(()) }));

    let err = registry
        .dispatch(Entry::new(UserRenamed::TAG, "u1", b"not json".to_vec()), Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Payload { tag, .. } if tag == "UserRenamed"));
}

#[tokio::test]
async fn handler_sees_conflicts_and_origin() {
    let registry = Registry::new();
    let seen = Arc::new(Mutex::new(None));
    let seen_in = seen.clone();
    let _guard = registry.register_handler(handler_fn(move |applied: Applied<UserRenamed>| {
        let seen = seen_in.clone();
        async move {
            let previous: Vec<String> = applied
                .conflicts
                .iter()
                .filter_map(|c| c.payload::<UserRenamed>().unwrap())
                .map(|p| p.name)
                .collect();
            let deletions = applied.conflicts.iter().filter(|c| c.is::<UserDeleted>()).count();
            *seen.lock().unwrap() = Some((previous, deletions, applied.origin));
            Ok(())
        }
    }));

    let remote = RemoteId::new();
    let deleted = Entry::new(
        UserDeleted::TAG,
        "u1",
        UserDeleted::encode(&Deleted { user: "u1".into() }).unwrap(),
    );
    registry
        .dispatch(
            rename_entry("u1", "Bob"),
            vec![rename_entry("u1", "Ann"), deleted],
            Some(remote),
        )
        .await
        .unwrap();

    let (previous, deletions, origin) = seen.lock().unwrap().clone().unwrap();
    assert_eq!(previous, vec!["Ann".to_string()]);
    assert_eq!(deletions, 1);
    assert_eq!(origin, Some(remote));
}

#[tokio::test]
async fn handler_rejection_propagates() {
    let registry = Registry::new();
    let _guard = registry.register_handler(handler_fn(|applied: Applied<UserRenamed>| async move {
        if applied.payload.name.is_empty() {
            Err(HandlerError::rejected("name must not be empty"))
        } else {
            Ok(())
        }
    }));

    let err = registry
        .dispatch(rename_entry("u1", ""), Vec::new(), None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "event rejected: name must not be empty");
}

// ── Registration guards ──────────────────────────────────────────

#[tokio::test]
async fn dropping_guard_unregisters_handler() {
    let registry = Registry::new();
    {
        let _guard =
            registry.register_handler(handler_fn(|_: Applied<UserRenamed>| async { Ok(()) }));
        assert!(registry.handles(UserRenamed::TAG));
    }
    assert!(!registry.handles(UserRenamed::TAG));
}

#[tokio::test]
async fn detached_registration_survives() {
    let registry = Registry::new();
    registry
        .register_handler(handler_fn(|_: Applied<UserRenamed>| async { Ok(()) }))
        .detach();
    assert!(registry.handles(UserRenamed::TAG));
}

#[tokio::test]
async fn stale_guard_does_not_remove_replacement() {
    let registry = Registry::new();
    let first = registry.register_handler(handler_fn(|_: Applied<UserRenamed>| async { Ok(1u8) }));
    let _second =
        registry.register_handler(handler_fn(|_: Applied<UserRenamed>| async { Ok(2u8) }));

    first.remove();

    let output = registry
        .dispatch(rename_entry("u1", "Ann"), Vec::new(), None)
        .await
        .unwrap();
    assert_eq!(output.downcast::<u8>().unwrap(), 2);
}

#[test]
fn reactivity_keys_follow_registrations() {
    let registry = Registry::new();
    let users = registry.register_reactivity(UserRenamed::TAG, ["users", "profile"]);
    let _more = registry.register_reactivity(UserRenamed::TAG, ["profile", "search"]);

    assert_eq!(
        registry.reactivity_keys(UserRenamed::TAG),
        vec!["users", "profile", "search"]
    );
    assert!(registry.reactivity_keys("Other").is_empty());

    users.remove();
    assert_eq!(registry.reactivity_keys(UserRenamed::TAG), vec!["profile", "search"]);
}

#[test]
fn guard_outliving_registry_is_harmless() {
    let registry = Registry::new();
    let guard = registry.register_reactivity("Tag", ["k"]);
    drop(registry);
    guard.remove();
}

// ── Compaction ───────────────────────────────────────────────────

#[tokio::test]
async fn registry_compaction_groups_and_compacts() {
    let registry = Registry::new();
    let _guard = registry.register_compaction(
        [UserRenamed::TAG],
        compactor_fn(|mut run: Vec<Entry>| async move { Ok(run.pop().into_iter().collect()) }),
    );

    let group = registry.group_of(UserRenamed::TAG).unwrap();
    assert_eq!(registry.group_of(UserDeleted::TAG), None);

    let run = vec![rename_entry("u1", "A"), rename_entry("u1", "B")];
    let last = run[1].clone();
    let compacted = registry.compact(group, run).await.unwrap();
    assert_eq!(compacted, vec![last]);
}

#[tokio::test]
async fn removed_compaction_passes_runs_through() {
    let registry = Registry::new();
    let guard = registry.register_compaction(
        [UserRenamed::TAG],
        compactor_fn(|_: Vec<Entry>| async { Ok(Vec::new()) }),
    );
    let group = registry.group_of(UserRenamed::TAG).unwrap();
    guard.remove();

    assert_eq!(registry.group_of(UserRenamed::TAG), None);
    let run = vec![rename_entry("u1", "A")];
    assert_eq!(registry.compact(group, run.clone()).await.unwrap(), run);
}

// ── Lazy resolution ──────────────────────────────────────────────

#[tokio::test]
async fn deferred_initializers_run_once_on_first_dispatch() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in = runs.clone();
    registry
        .defer(move |registry| async move {
            runs_in.fetch_add(1, Ordering::SeqCst);
            registry
                .register_handler(handler_fn(|_: Applied<UserRenamed>| async { Ok(()) }))
                .detach();
            Ok(())
        })
        .unwrap();

    assert!(!registry.handles(UserRenamed::TAG));
    registry
        .dispatch(rename_entry("u1", "Ann"), Vec::new(), None)
        .await
        .unwrap();
    registry
        .dispatch(rename_entry("u1", "Bob"), Vec::new(), None)
        .await
        .unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(registry.is_resolved());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_resolvers_share_one_run() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in = runs.clone();
    registry
        .defer(move |_| async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            runs_in.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move { registry.resolve().await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_initializer_is_memoized() {
    let registry = Registry::new();
    registry
        .defer(|_| async { Err(RegistryError::Init("config missing".into())) })
        .unwrap();

    let first = registry.resolve().await.unwrap_err();
    let second = registry.resolve().await.unwrap_err();
    assert_eq!(first, second);

    let err = registry
        .dispatch(rename_entry("u1", "Ann"), Vec::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandlerError::Registry(RegistryError::Init(_))));
}

#[tokio::test]
async fn defer_after_resolve_is_rejected() {
    let registry = Registry::new();
    registry.resolve().await.unwrap();
    let err = registry.defer(|_| async { Ok(()) }).unwrap_err();
    assert_eq!(err, RegistryError::AlreadyResolved);
}

#[tokio::test]
async fn abandoned_resolve_is_finished_by_the_next_one() {
    let registry = Registry::new();
    let runs = Arc::new(AtomicUsize::new(0));
    let runs_in = runs.clone();
    registry
        .defer(move |registry| async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            runs_in.fetch_add(1, Ordering::SeqCst);
            registry
                .register_handler(handler_fn(|_: Applied<UserRenamed>| async { Ok(()) }))
                .detach();
            Ok(())
        })
        .unwrap();

    let abandoned =
        tokio::time::timeout(std::time::Duration::from_millis(5), registry.resolve()).await;
    assert!(abandoned.is_err());
    assert!(!registry.is_resolved());
    assert_eq!(
        registry.defer(|_| async { Ok(()) }).unwrap_err(),
        RegistryError::AlreadyResolved
    );

    registry.resolve().await.unwrap();
    assert!(registry.handles(UserRenamed::TAG));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
