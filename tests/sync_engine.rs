//! Sync engine tests against scripted remotes
//!
//! Covers retry behavior, exactly-once pushes across lost acknowledgements,
//! conflict resolution and delta replay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use proptest::prelude::*;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use tandem_cli::bus::{EventBus, EventSubscription};
use tandem_cli::domain::{
    Ack, Change, Delta, Entity, EntityId, EntityKind, Mutation, MutationRequest, Payload,
    SyncCursor,
};
use tandem_cli::storage::LocalStore;
use tandem_cli::sync::{
    ApiError, ErrorClass, MockRemote, RemoteApi, RetryPolicy, SyncEngine, SyncError,
};

fn fields(pairs: &[(&str, Value)]) -> Payload {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn engine_with(remote: Arc<dyn RemoteApi>, attempts: u32) -> (SyncEngine, EventSubscription) {
    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let bus = Arc::new(EventBus::new());
    let sub = bus.subscribe();
    let policy = RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(4));
    (SyncEngine::new(store, remote, bus, policy), sub)
}

fn setup() -> (SyncEngine, MockRemote, EventSubscription) {
    let remote = MockRemote::new();
    let (engine, sub) = engine_with(Arc::new(remote.clone()), 3);
    (engine, remote, sub)
}

// =============================================================================
// Retry Tests
// =============================================================================

#[tokio::test]
async fn test_retryable_pull_failures_recover() {
    let (engine, remote, _sub) = setup();
    remote
        .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
        .unwrap();
    remote.fail_pulls(ApiError::Network("connection reset".into()), 2);

    let outcome = engine.sync_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome.applied_count, 1);
    assert_eq!(remote.received_pulls().len(), 3);
    assert!(engine.state().is_idle());
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let (engine, remote, _sub) = setup();
    remote.fail_pulls(
        ApiError::RateLimited {
            retry_after: Some(Duration::from_millis(2)),
        },
        1,
    );

    assert!(engine.sync_once(&CancellationToken::new()).await.is_ok());
    assert_eq!(remote.received_pulls().len(), 2);
}

#[tokio::test]
async fn test_retries_exhausted_reports_last_error() {
    let (engine, remote, _sub) = setup();
    remote.fail_pulls(ApiError::Network("down".into()), 10);

    let err = engine.sync_once(&CancellationToken::new()).await.unwrap_err();

    match &err {
        SyncError::RetriesExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert_eq!(last, &ApiError::Network("down".into()));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    assert_eq!(err.class(), ErrorClass::Fatal);
    assert_eq!(err.label(), "retries_exhausted");
    assert_eq!(remote.received_pulls().len(), 3);
    assert!(engine.store().cursor().unwrap().is_initial());
    assert!(engine.last_synced_at().unwrap().is_none());
}

#[tokio::test]
async fn test_fatal_pull_failure_is_not_retried() {
    let (engine, remote, _sub) = setup();
    remote.fail_pulls(ApiError::Unauthorized("bad token".into()), 1);

    let err = engine.sync_once(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, SyncError::Api(ApiError::Unauthorized(_))));
    assert_eq!(err.label(), "unauthorized");
    assert_eq!(remote.received_pulls().len(), 1);
}

#[tokio::test]
async fn test_cancel_during_backoff_commits_nothing() {
    let remote = MockRemote::new();
    remote
        .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
        .unwrap();
    remote.fail_pulls(ApiError::Network("down".into()), 1);

    let store = Arc::new(LocalStore::open_in_memory().unwrap());
    let policy = RetryPolicy::new(5, Duration::from_secs(30), Duration::from_secs(30));
    let engine = SyncEngine::new(
        Arc::clone(&store),
        Arc::new(remote.clone()),
        Arc::new(EventBus::new()),
        policy,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = engine.sync_once(&cancel).await.unwrap_err();
    assert!(matches!(err, SyncError::Cancelled));
    assert_eq!(err.class(), ErrorClass::Retryable);
    assert!(store.cursor().unwrap().is_initial());
    assert!(store.list(None, true).unwrap().is_empty());
}

// =============================================================================
// Push Tests
// =============================================================================

#[tokio::test]
async fn test_lost_ack_is_retried_with_same_token() {
    let (engine, remote, _sub) = setup();
    engine
        .enqueue(MutationRequest::create(
            EntityKind::Item,
            fields(&[("content", json!("only once"))]),
        ))
        .unwrap();
    remote.lose_next_ack(ApiError::Network("timeout".into()));

    let outcome = engine.sync_once(&CancellationToken::new()).await.unwrap();

    let pushes = remote.received_pushes();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[0].token, pushes[1].token);
    assert_eq!(remote.applied_count(), 1);
    assert_eq!(remote.live_count(), 1);
    assert_eq!(outcome.pushed_count, 1);
    assert_eq!(engine.store().pending_count().unwrap(), 0);
}

#[tokio::test]
async fn test_push_order_follows_queue() {
    let (engine, remote, _sub) = setup();
    remote
        .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
        .unwrap();
    let cancel = CancellationToken::new();
    engine.sync_once(&cancel).await.unwrap();

    let id: EntityId = "1".parse().unwrap();
    let queued: Vec<Mutation> = vec![
        engine
            .enqueue(MutationRequest::update(
                id.clone(),
                EntityKind::Item,
                fields(&[("priority", json!(4))]),
            ))
            .unwrap(),
        engine
            .enqueue(MutationRequest::update(
                id.clone(),
                EntityKind::Item,
                fields(&[("checked", json!(true))]),
            ))
            .unwrap(),
        engine
            .enqueue(MutationRequest::delete(id, EntityKind::Item))
            .unwrap(),
    ];

    engine.sync_once(&cancel).await.unwrap();

    let pushed: Vec<u64> = remote.received_pushes().iter().map(|m| m.seq).collect();
    let expected: Vec<u64> = queued.iter().map(|m| m.seq).collect();
    assert_eq!(pushed, expected);
    assert!(remote.entity("1").unwrap().deleted);
}

#[tokio::test]
async fn test_retryable_push_failure_keeps_later_mutations() {
    let (engine, remote, _sub) = setup();
    let cancel = CancellationToken::new();
    for content in ["first", "second"] {
        engine
            .enqueue(MutationRequest::create(
                EntityKind::Item,
                fields(&[("content", json!(content))]),
            ))
            .unwrap();
    }
    remote.fail_next_push(ApiError::Network("flaky".into()));

    let outcome = engine.sync_once(&cancel).await.unwrap();

    assert_eq!(outcome.pushed_count, 2);
    assert_eq!(remote.received_pushes().len(), 3);
    assert_eq!(remote.live_count(), 2);
}

#[tokio::test]
async fn test_refused_mutation_does_not_block_queue() {
    let (engine, remote, _sub) = setup();
    let cancel = CancellationToken::new();
    engine
        .enqueue(MutationRequest::update(
            "404".parse().unwrap(),
            EntityKind::Item,
            fields(&[("priority", json!(2))]),
        ))
        .unwrap();
    engine
        .enqueue(MutationRequest::create(
            EntityKind::Item,
            fields(&[("content", json!("still pushed"))]),
        ))
        .unwrap();

    let outcome = engine.sync_once(&cancel).await.unwrap();

    assert_eq!(outcome.pushed_count, 1);
    assert_eq!(outcome.dead_letters.len(), 1);
    assert_eq!(outcome.dead_letters[0].entity_id.as_str(), "404");
    assert!(outcome.dead_letters[0].reason.contains("not found"));
    assert!(engine.store().pending().unwrap().is_empty());
    assert_eq!(remote.live_count(), 1);

    let again = engine.sync_once(&cancel).await.unwrap();
    assert_eq!(again.pushed_count, 0);
    assert!(again.dead_letters.is_empty());
    assert_eq!(remote.received_pushes().len(), 2);
}

#[tokio::test]
async fn test_refused_create_drops_later_edits_of_it() {
    let (engine, remote, _sub) = setup();
    let cancel = CancellationToken::new();
    let created = engine
        .enqueue(MutationRequest::create(
            EntityKind::Project,
            fields(&[("name", json!("Taken"))]),
        ))
        .unwrap();
    engine
        .enqueue(MutationRequest::update(
            created.entity_id.clone(),
            EntityKind::Project,
            fields(&[("color", json!(31))]),
        ))
        .unwrap();
    engine
        .enqueue(MutationRequest::create(
            EntityKind::Label,
            fields(&[("name", json!("home"))]),
        ))
        .unwrap();
    remote.fail_next_push(ApiError::CommandRejected("project limit reached".into()));

    let outcome = engine.sync_once(&cancel).await.unwrap();

    assert_eq!(outcome.pushed_count, 1);
    assert_eq!(outcome.discarded_count, 0);
    assert_eq!(outcome.dead_letters.len(), 1);
    assert_eq!(outcome.dead_letters[0].token, created.token);
    assert_eq!(outcome.dead_letters[0].dropped.len(), 1);
    assert_eq!(remote.received_pushes().len(), 2);
    assert!(engine.store().pending().unwrap().is_empty());
}

#[tokio::test]
async fn test_request_level_rejection_keeps_queue() {
    let (engine, remote, _sub) = setup();
    engine
        .enqueue(MutationRequest::create(
            EntityKind::Item,
            fields(&[("content", json!("kept"))]),
        ))
        .unwrap();
    remote.fail_next_push(ApiError::Rejected("HTTP 404 Not Found".into()));

    let err = engine.sync_once(&CancellationToken::new()).await.unwrap_err();

    assert_eq!(err.label(), "rejected");
    assert_eq!(engine.store().pending().unwrap().len(), 1);
}

// =============================================================================
// Conflict Tests
// =============================================================================

#[tokio::test]
async fn test_disjoint_newer_local_edit_is_merged() {
    let (engine, remote, _sub) = setup();
    let cancel = CancellationToken::new();
    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    remote
        .upsert_at(
            EntityKind::Item,
            "1",
            fields(&[("content", json!("a")), ("priority", json!(1))]),
            an_hour_ago,
        )
        .unwrap();
    engine.sync_once(&cancel).await.unwrap();

    engine
        .enqueue(MutationRequest::update(
            "1".parse().unwrap(),
            EntityKind::Item,
            fields(&[("priority", json!(4))]),
        ))
        .unwrap();
    remote
        .upsert_at(
            EntityKind::Item,
            "1",
            fields(&[("content", json!("renamed remotely"))]),
            an_hour_ago,
        )
        .unwrap();

    let outcome = engine.sync_once(&cancel).await.unwrap();

    assert!(outcome.conflicts.is_empty());
    assert_eq!(outcome.pushed_count, 1);
    let remote_entity = remote.entity("1").unwrap();
    assert_eq!(remote_entity.payload["content"], json!("renamed remotely"));
    assert_eq!(remote_entity.payload["priority"], json!(4));
}

#[tokio::test]
async fn test_overlapping_remote_edit_supersedes_local() {
    let (engine, remote, _sub) = setup();
    let cancel = CancellationToken::new();
    remote
        .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
        .unwrap();
    engine.sync_once(&cancel).await.unwrap();

    let mine = engine
        .enqueue(MutationRequest::update(
            "1".parse().unwrap(),
            EntityKind::Item,
            fields(&[("content", json!("mine"))]),
        ))
        .unwrap();
    remote
        .upsert_at(
            EntityKind::Item,
            "1",
            fields(&[("content", json!("theirs"))]),
            Utc::now() + chrono::Duration::hours(1),
        )
        .unwrap();

    let outcome = engine.sync_once(&cancel).await.unwrap();

    assert_eq!(outcome.conflicts.len(), 1);
    assert_eq!(outcome.conflicts[0].discarded, vec![mine.token]);
    assert_eq!(outcome.conflicts[0].remote_fields, vec!["content".to_string()]);
    assert_eq!(outcome.pushed_count, 0);
    assert!(remote.received_pushes().is_empty());

    let local = engine.store().get(&"1".parse().unwrap()).unwrap().unwrap();
    assert_eq!(local.payload["content"], json!("theirs"));
}

// =============================================================================
// Delta Replay
// =============================================================================

/// Serves the same delta on every pull
struct ReplayRemote {
    delta: Delta,
}

#[async_trait]
impl RemoteApi for ReplayRemote {
    async fn pull(&self, _cursor: &SyncCursor) -> Result<Delta, ApiError> {
        Ok(self.delta.clone())
    }

    async fn push(&self, _mutation: &Mutation) -> Result<Ack, ApiError> {
        Err(ApiError::Rejected("read-only".into()))
    }
}

/// Remote changes with revisions increasing in delta order
fn delta_strategy() -> impl Strategy<Value = Vec<Change>> {
    prop::collection::vec((1u8..5, any::<bool>(), "[a-z]{1,8}"), 0..12).prop_map(|entries| {
        entries
            .into_iter()
            .enumerate()
            .map(|(i, (id, remove, content))| {
                let id: EntityId = id.to_string().parse().unwrap();
                let revision = i as u64 + 1;
                if remove {
                    Change::Remove {
                        id,
                        kind: EntityKind::Item,
                        revision,
                    }
                } else {
                    let mut entity = Entity::new(id, EntityKind::Item, revision, Utc::now());
                    entity.payload.insert("content".into(), json!(content));
                    Change::Upsert(entity)
                }
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_replayed_delta_changes_nothing(changes in delta_strategy()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let remote = ReplayRemote { delta: Delta::new(changes, "42") };
            let (engine, mut sub) = engine_with(Arc::new(remote), 1);
            let cancel = CancellationToken::new();

            engine.sync_once(&cancel).await.unwrap();
            let once = engine.store().list(None, true).unwrap();
            sub.drain();

            let replay = engine.sync_once(&cancel).await.unwrap();
            let twice = engine.store().list(None, true).unwrap();

            prop_assert_eq!(replay.applied_count, 0);
            prop_assert!(sub.drain().is_empty());
            prop_assert_eq!(once, twice);
            prop_assert_eq!(engine.store().cursor().unwrap().token, "42");
            Ok(())
        })?;
    }
}
