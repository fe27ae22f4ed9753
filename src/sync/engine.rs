//! Sync engine
//!
//! Runs one sync round at a time against a local store:
//!
//! 1. **Pull** the delta since the stored cursor (retried with backoff)
//! 2. **Merge** it into a working set seeded from the store, resolving
//!    conflicts with pending local mutations, and publish one change event
//!    per applied change
//! 3. **Push** pending mutations in queue order, each with its idempotency token
//! 4. **Commit** entity writes, the new cursor, cleared mutations and
//!    temporary-ID rekeys in one transaction
//!
//! The sequencing decisions come from [`SyncState::on_event`]; this module
//! only performs the I/O the state machine asks for.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::api::{ApiError, ErrorClass, RemoteApi};
use super::state::{AbortReason, Action, Failure, RetryPolicy, SyncEvent, SyncState};
use crate::bus::{EventBus, EventKind};
use crate::domain::{
    merge_remote, Ack, Change, Delta, Entity, EntityId, EntityKind, Mutation, MutationOp,
    MutationRequest, MutationToken, Resolution, SyncCursor,
};
use crate::storage::{Commit, LocalStore, StorageError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local store error: {0}")]
    Storage(#[from] StorageError),

    #[error("remote error: {0}")]
    Api(ApiError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ApiError },

    #[error("sync cancelled")]
    Cancelled,

    #[error("invalid mutation: {0}")]
    InvalidMutation(String),

    #[error("sync stalled in state {0}")]
    Stalled(String),
}

impl SyncError {
    /// Classification reported to the user
    ///
    /// Everything that reaches the caller has already been retried as far as
    /// the policy allows, so only a cancelled round counts as retryable.
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Cancelled => ErrorClass::Retryable,
            _ => ErrorClass::Fatal,
        }
    }

    /// Short machine-readable name of the failure
    pub fn label(&self) -> &'static str {
        match self {
            SyncError::Storage(_) => "storage",
            SyncError::Api(ApiError::Unauthorized(_)) => "unauthorized",
            SyncError::Api(ApiError::Malformed(_)) => "malformed_response",
            SyncError::Api(ApiError::Rejected(_) | ApiError::CommandRejected(_)) => "rejected",
            SyncError::Api(_) => "remote",
            SyncError::RetriesExhausted { .. } => "retries_exhausted",
            SyncError::Cancelled => "cancelled",
            SyncError::InvalidMutation(_) => "invalid_mutation",
            SyncError::Stalled(_) => "stalled",
        }
    }
}

/// A remote change that superseded pending local work
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub entity_id: EntityId,
    pub kind: EntityKind,

    /// Fields the remote changed
    pub remote_fields: Vec<String>,

    /// Pending mutations discarded in favour of the remote version
    pub discarded: Vec<MutationToken>,
}

/// A pending mutation the remote refused for good
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub token: MutationToken,
    pub entity_id: EntityId,
    pub kind: EntityKind,
    pub op: MutationOp,
    pub reason: String,

    /// Later mutations on the same unsaved entity, dropped with it
    pub dropped: Vec<MutationToken>,
}

/// Result of a successful sync round
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Remote changes applied (skipped duplicates not counted)
    pub applied_count: usize,

    /// Local mutations acknowledged by the remote
    pub pushed_count: usize,

    /// Entities whose pending local work lost to the remote
    pub conflicts: Vec<Conflict>,

    /// Pending mutations discarded because of conflicts
    pub discarded_count: usize,

    /// Mutations the remote refused, removed from the queue
    pub dead_letters: Vec<DeadLetter>,

    /// Cursor committed by the round
    pub cursor: SyncCursor,
}

/// Working state of one round
struct Round {
    cursor: SyncCursor,
    pending: Vec<Mutation>,
    delta: Option<Delta>,

    /// Entities to write at commit, by ID
    writes: BTreeMap<EntityId, Entity>,
    events: Vec<(EventKind, Entity)>,
    discarded: HashSet<MutationToken>,
    conflicts: Vec<Conflict>,
    applied: usize,

    push_index: usize,
    acked: Vec<MutationToken>,
    dead_letters: Vec<DeadLetter>,
    rekeys: Vec<(EntityId, EntityId)>,

    last_api_error: Option<ApiError>,
    storage_error: Option<StorageError>,
}

impl Round {
    fn new(cursor: SyncCursor, pending: Vec<Mutation>) -> Self {
        Self {
            cursor,
            pending,
            delta: None,
            writes: BTreeMap::new(),
            events: Vec::new(),
            discarded: HashSet::new(),
            conflicts: Vec::new(),
            applied: 0,
            push_index: 0,
            acked: Vec::new(),
            dead_letters: Vec::new(),
            rekeys: Vec::new(),
            last_api_error: None,
            storage_error: None,
        }
    }

    /// Pending mutations for an entity that have not been discarded
    fn live_pending(&self, id: &EntityId) -> Vec<&Mutation> {
        self.pending
            .iter()
            .filter(|m| &m.entity_id == id && !self.discarded.contains(&m.token))
            .collect()
    }

    fn discard_pending(&mut self, id: &EntityId) -> Vec<MutationToken> {
        let tokens: Vec<MutationToken> = self
            .live_pending(id)
            .into_iter()
            .map(|m| m.token.clone())
            .collect();
        self.discarded.extend(tokens.iter().cloned());
        tokens
    }

    /// Next mutation to push, skipping discarded ones
    fn next_push(&mut self) -> Option<&Mutation> {
        while self.push_index < self.pending.len() {
            if self.discarded.contains(&self.pending[self.push_index].token) {
                self.push_index += 1;
            } else {
                return self.pending.get(self.push_index);
            }
        }
        None
    }

    fn acknowledge(&mut self, ack: Ack) {
        let index = self.push_index;
        self.push_index += 1;
        self.acked.push(ack.token);

        let Some(new_id) = ack.assigned_id else {
            return;
        };
        let old_id = self.pending[index].entity_id.clone();
        if old_id == new_id {
            return;
        }

        debug!(from = %old_id, to = %new_id, "Remote assigned permanent ID");
        for later in &mut self.pending[index + 1..] {
            later.rekey(&old_id, &new_id);
        }
        self.rekeys.push((old_id, new_id));
    }

    /// Drops the current mutation after a permanent refusal
    ///
    /// A refused create leaves later mutations on its temporary ID with
    /// nothing to apply to, so they are dropped too.
    fn dead_letter(&mut self, reason: String) {
        let index = self.push_index;
        self.push_index += 1;
        let mutation = self.pending[index].clone();

        let mut dropped = Vec::new();
        if mutation.op == MutationOp::Create && mutation.entity_id.is_temporary() {
            for later in &self.pending[index + 1..] {
                if later.entity_id == mutation.entity_id && !self.discarded.contains(&later.token) {
                    dropped.push(later.token.clone());
                }
            }
            self.discarded.extend(dropped.iter().cloned());
        }

        self.dead_letters.push(DeadLetter {
            token: mutation.token,
            entity_id: mutation.entity_id,
            kind: mutation.kind,
            op: mutation.op,
            reason,
            dropped,
        });
    }

    fn into_commit(self, committed_at: DateTime<Utc>) -> (Commit, SyncOutcome) {
        let cursor = match self.delta {
            Some(delta) => delta.next_cursor.committed(committed_at),
            None => self.cursor,
        };

        let mut cleared = self.acked.clone();
        cleared.extend(self.discarded.iter().cloned());
        cleared.extend(self.dead_letters.iter().map(|d| d.token.clone()));

        let dropped: usize = self.dead_letters.iter().map(|d| d.dropped.len()).sum();
        let outcome = SyncOutcome {
            applied_count: self.applied,
            pushed_count: self.acked.len(),
            discarded_count: self.discarded.len() - dropped,
            conflicts: self.conflicts,
            dead_letters: self.dead_letters,
            cursor: cursor.clone(),
        };

        let commit = Commit {
            entities: self.writes.into_values().collect(),
            cursor,
            cleared,
            rekeys: self.rekeys,
        };

        (commit, outcome)
    }
}

impl From<&ApiError> for Failure {
    fn from(error: &ApiError) -> Self {
        Failure {
            class: error.class(),
            reason: error.to_string(),
            retry_after: match error {
                ApiError::RateLimited { retry_after } => *retry_after,
                _ => None,
            },
        }
    }
}

/// Replicates remote state into a local store
pub struct SyncEngine {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteApi>,
    bus: Arc<EventBus>,
    policy: RetryPolicy,
    state: Mutex<SyncState>,
    /// Held for the whole of a round
    round_lock: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteApi>,
        bus: Arc<EventBus>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            remote,
            bus,
            policy,
            state: Mutex::new(SyncState::Idle),
            round_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Current state of the engine
    pub fn state(&self) -> SyncState {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn set_state(&self, state: &SyncState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state.clone();
    }

    /// When the last successful round committed, if ever
    pub fn last_synced_at(&self) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self.store.cursor()?.committed_at)
    }

    /// Queues a local mutation for the next push
    ///
    /// The only way the CLI and plugins change state.
    pub fn enqueue(&self, request: MutationRequest) -> Result<Mutation, SyncError> {
        if request.op != MutationOp::Create && request.entity_id.is_none() {
            return Err(SyncError::InvalidMutation(format!(
                "{} of a {} needs an entity ID",
                request.op, request.kind
            )));
        }
        if request.op == MutationOp::Create && request.fields.is_empty() {
            return Err(SyncError::InvalidMutation(format!(
                "a new {} needs at least one field",
                request.kind
            )));
        }
        request
            .validate()
            .map_err(|e| SyncError::InvalidMutation(e.to_string()))?;

        Ok(self.store.enqueue(request)?)
    }

    /// Runs one full sync round
    ///
    /// Rounds are serialized: a second caller waits for the running round to
    /// finish. A cancelled round commits nothing.
    pub async fn sync_once(&self, cancel: &CancellationToken) -> Result<SyncOutcome, SyncError> {
        let _round = self.round_lock.lock().await;

        let mut round = Round::new(self.store.cursor()?, self.store.pending()?);
        info!(
            cursor = %round.cursor.token,
            pending = round.pending.len(),
            "Sync round started"
        );

        let (mut state, mut action) = SyncState::Idle.on_event(SyncEvent::Start, &self.policy);

        loop {
            self.set_state(&state);
            debug!(state = %state, action = ?action, "Sync step");

            let event = match action {
                Action::Pull => self.pull(&mut round, cancel).await,
                Action::Merge => match self.merge(&mut round) {
                    Ok(()) => {
                        self.publish(&mut round);
                        SyncEvent::MergeCompleted
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        round.storage_error = Some(e);
                        SyncEvent::StorageFailed(reason)
                    }
                },
                Action::PushNext => self.push_next(&mut round, cancel).await,
                Action::Backoff { delay } => {
                    warn!(delay_ms = delay.as_millis() as u64, "Retrying after backoff");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => SyncEvent::Cancelled,
                        _ = tokio::time::sleep(delay) => SyncEvent::RetryTimer,
                    }
                }
                Action::Commit => {
                    let outcome = self.commit(round)?;
                    self.set_state(&SyncState::Idle);
                    info!(
                        applied = outcome.applied_count,
                        pushed = outcome.pushed_count,
                        conflicts = outcome.conflicts.len(),
                        dead_letters = outcome.dead_letters.len(),
                        cursor = %outcome.cursor.token,
                        "Sync round committed"
                    );
                    return Ok(outcome);
                }
                Action::Abort { reason, commit } => {
                    return Err(self.abort(round, reason, commit));
                }
                Action::None => return Err(SyncError::Stalled(state.to_string())),
            };

            (state, action) = state.on_event(event, &self.policy);
        }
    }

    async fn pull(&self, round: &mut Round, cancel: &CancellationToken) -> SyncEvent {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SyncEvent::Cancelled,
            result = self.remote.pull(&round.cursor) => result,
        };

        match result {
            Ok(delta) => {
                debug!(
                    changes = delta.changes.len(),
                    full_sync = delta.full_sync,
                    "Pulled delta"
                );
                round.delta = Some(delta);
                SyncEvent::PullSucceeded
            }
            Err(e) => {
                warn!(error = %e, class = %e.class(), "Pull failed");
                let failure = Failure::from(&e);
                round.last_api_error = Some(e);
                SyncEvent::PullFailed(failure)
            }
        }
    }

    /// Applies the pulled delta to the round's working set
    fn merge(&self, round: &mut Round) -> Result<(), StorageError> {
        let Some(delta) = round.delta.take() else {
            return Ok(());
        };
        let pulled_at = Utc::now();

        for change in &delta.changes {
            let id = change.id().clone();
            let base = match round.writes.get(&id) {
                Some(entity) => Some(entity.clone()),
                None => self.store.get(&id)?,
            };

            // Changes at or below the stored revision were already applied
            if base.as_ref().is_some_and(|b| b.revision >= change.revision()) {
                debug!(entity = %id, revision = change.revision(), "Skipping stale change");
                continue;
            }

            match change {
                Change::Upsert(incoming) => {
                    let mut remote = incoming.clone();
                    if !remote.has_known_update_time() {
                        remote.updated_at = base.as_ref().map_or(pulled_at, |b| b.updated_at);
                    }

                    let pending = round.live_pending(&id);
                    let result = merge_remote(base.as_ref(), &remote, &pending);

                    if result.resolution == Resolution::RemoteWins && !pending.is_empty() {
                        let discarded = round.discard_pending(&id);
                        warn!(
                            entity = %id,
                            discarded = discarded.len(),
                            "Remote change supersedes local edits"
                        );
                        round.conflicts.push(Conflict {
                            entity_id: id.clone(),
                            kind: remote.kind,
                            remote_fields: result.remote_fields.clone(),
                            discarded,
                        });
                    }

                    let kind = match (&base, result.entity.deleted) {
                        (_, true) => EventKind::EntityDeleted,
                        (Some(b), false) if !b.deleted => EventKind::EntityUpdated,
                        _ => EventKind::EntityCreated,
                    };
                    round.events.push((kind, result.entity.clone()));
                    round.writes.insert(id, result.entity);
                }
                Change::Remove { kind, revision, .. } => {
                    // Nothing local to remove
                    let Some(mut tombstone) = base else {
                        continue;
                    };

                    let discarded = round.discard_pending(&id);
                    if !discarded.is_empty() {
                        warn!(entity = %id, "Remote removal supersedes local edits");
                        round.conflicts.push(Conflict {
                            entity_id: id.clone(),
                            kind: *kind,
                            remote_fields: Vec::new(),
                            discarded,
                        });
                    }

                    tombstone.deleted = true;
                    tombstone.revision = *revision;
                    tombstone.updated_at = Utc::now();
                    round.events.push((EventKind::EntityDeleted, tombstone.clone()));
                    round.writes.insert(id, tombstone);
                }
            }

            round.applied += 1;
        }

        round.delta = Some(delta);
        Ok(())
    }

    fn publish(&self, round: &mut Round) {
        for (kind, entity) in round.events.drain(..) {
            self.bus.publish(kind, entity);
        }
    }

    async fn push_next(&self, round: &mut Round, cancel: &CancellationToken) -> SyncEvent {
        let Some(mutation) = round.next_push() else {
            return SyncEvent::PushDrained;
        };
        let mutation = mutation.clone();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SyncEvent::Cancelled,
            result = self.remote.push(&mutation) => result,
        };

        match result {
            Ok(ack) => {
                debug!(token = %mutation.token, entity = %mutation.entity_id, "Mutation acknowledged");
                round.acknowledge(ack);
                SyncEvent::PushAcked
            }
            Err(ApiError::CommandRejected(reason)) => {
                warn!(
                    token = %mutation.token,
                    entity = %mutation.entity_id,
                    reason = %reason,
                    "Remote refused mutation, dropping it"
                );
                round.dead_letter(reason);
                SyncEvent::PushRejected
            }
            Err(e) => {
                warn!(
                    token = %mutation.token,
                    error = %e,
                    class = %e.class(),
                    "Push failed"
                );
                let failure = Failure::from(&e);
                round.last_api_error = Some(e);
                SyncEvent::PushFailed(failure)
            }
        }
    }

    fn commit(&self, round: Round) -> Result<SyncOutcome, SyncError> {
        let (commit, outcome) = round.into_commit(Utc::now());
        self.store.commit(&commit)?;
        Ok(outcome)
    }

    fn abort(&self, mut round: Round, reason: AbortReason, commit: bool) -> SyncError {
        let api_error = round.last_api_error.take();
        let storage_error = round.storage_error.take();

        if commit {
            // Keep what the round did achieve: the merged delta and acked pushes
            match self.commit(round) {
                Ok(outcome) => info!(
                    applied = outcome.applied_count,
                    pushed = outcome.pushed_count,
                    "Committed partial round before failing"
                ),
                Err(e) => return e,
            }
        }

        let error = match (reason, api_error, storage_error) {
            (AbortReason::Cancelled, _, _) => SyncError::Cancelled,
            (_, _, Some(e)) => SyncError::Storage(e),
            (AbortReason::Exhausted { attempts }, Some(last), _) => {
                SyncError::RetriesExhausted { attempts, last }
            }
            (_, Some(e), _) => SyncError::Api(e),
            (_, None, None) => SyncError::Stalled("aborted without a cause".to_string()),
        };

        self.set_state(&SyncState::Idle);
        warn!(error = %error, "Sync round failed");
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventSubscription;
    use crate::domain::Payload;
    use crate::sync::MockRemote;
    use serde_json::json;
    use std::time::Duration;

    fn fields(pairs: &[(&str, serde_json::Value)]) -> Payload {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn setup() -> (SyncEngine, MockRemote, EventSubscription) {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let remote = MockRemote::new();
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe();
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
        let engine = SyncEngine::new(store, Arc::new(remote.clone()), bus, policy);
        (engine, remote, sub)
    }

    #[tokio::test]
    async fn initial_sync_mirrors_remote() {
        let (engine, remote, mut sub) = setup();
        remote
            .upsert(EntityKind::Project, "1", fields(&[("name", json!("Inbox"))]))
            .unwrap();
        remote
            .upsert(EntityKind::Item, "2", fields(&[("content", json!("Call mom"))]))
            .unwrap();

        let outcome = engine.sync_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.applied_count, 2);
        assert_eq!(outcome.pushed_count, 0);
        assert!(outcome.cursor.committed_at.is_some());
        assert_eq!(engine.store().list(None, false).unwrap().len(), 2);
        assert!(engine.state().is_idle());
        assert!(engine.last_synced_at().unwrap().is_some());

        let events = sub.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind == EventKind::EntityCreated));
    }

    #[tokio::test]
    async fn second_sync_with_no_changes_applies_nothing() {
        let (engine, remote, mut sub) = setup();
        remote
            .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
            .unwrap();
        let cancel = CancellationToken::new();

        engine.sync_once(&cancel).await.unwrap();
        sub.drain();
        let outcome = engine.sync_once(&cancel).await.unwrap();

        assert_eq!(outcome.applied_count, 0);
        assert!(sub.drain().is_empty());
    }

    #[tokio::test]
    async fn remote_update_and_removal_emit_events() {
        let (engine, remote, mut sub) = setup();
        let cancel = CancellationToken::new();
        remote
            .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
            .unwrap();
        remote
            .upsert(EntityKind::Item, "2", fields(&[("content", json!("b"))]))
            .unwrap();
        engine.sync_once(&cancel).await.unwrap();
        sub.drain();

        remote
            .upsert(EntityKind::Item, "1", fields(&[("content", json!("a2"))]))
            .unwrap();
        remote.remove("2");
        engine.sync_once(&cancel).await.unwrap();

        let events = sub.drain();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::EntityUpdated, EventKind::EntityDeleted]);

        let removed = engine.store().get(&"2".parse().unwrap()).unwrap().unwrap();
        assert!(removed.deleted);
        assert_eq!(engine.store().list(None, false).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_is_pushed_and_temp_id_replaced() {
        let (engine, remote, _sub) = setup();
        let cancel = CancellationToken::new();

        let parent = engine
            .enqueue(MutationRequest::create(
                EntityKind::Item,
                fields(&[("content", json!("parent"))]),
            ))
            .unwrap();
        engine
            .enqueue(MutationRequest::create(
                EntityKind::Item,
                fields(&[
                    ("content", json!("child")),
                    ("parent_id", json!(parent.entity_id.as_str())),
                ]),
            ))
            .unwrap();

        let outcome = engine.sync_once(&cancel).await.unwrap();
        assert_eq!(outcome.pushed_count, 2);
        assert_eq!(engine.store().pending_count().unwrap(), 0);

        // The pushed entities come back on the next pull with permanent IDs
        engine.sync_once(&cancel).await.unwrap();
        let items = engine.store().list(Some(EntityKind::Item), false).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|e| !e.id.is_temporary()));

        let child = items.iter().find(|e| e.title() == "child").unwrap();
        let parent = items.iter().find(|e| e.title() == "parent").unwrap();
        assert_eq!(child.parent_id(), Some(parent.id.clone()));
    }

    #[tokio::test]
    async fn fatal_push_failure_commits_pull_and_keeps_mutation() {
        let (engine, remote, _sub) = setup();
        remote
            .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
            .unwrap();
        remote.fail_next_push(ApiError::Unauthorized("expired".into()));

        engine
            .enqueue(MutationRequest::create(
                EntityKind::Label,
                fields(&[("name", json!("urgent"))]),
            ))
            .unwrap();

        let err = engine.sync_once(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Api(ApiError::Unauthorized(_))));
        assert_eq!(err.class(), ErrorClass::Fatal);

        // Pulled delta still committed; mutation still pending
        assert!(!engine.store().cursor().unwrap().is_initial());
        assert_eq!(engine.store().list(None, false).unwrap().len(), 1);
        assert_eq!(engine.store().pending_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_round_commits_nothing() {
        let (engine, remote, _sub) = setup();
        remote
            .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = engine.sync_once(&cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
        assert!(engine.store().cursor().unwrap().is_initial());
        assert!(engine.store().list(None, true).unwrap().is_empty());
        assert!(engine.state().is_idle());
    }

    #[tokio::test]
    async fn enqueue_validates_target() {
        let (engine, _remote, _sub) = setup();
        let request = MutationRequest {
            entity_id: None,
            kind: EntityKind::Item,
            op: MutationOp::Delete,
            fields: Payload::new(),
        };
        assert!(matches!(
            engine.enqueue(request),
            Err(SyncError::InvalidMutation(_))
        ));
        assert!(engine
            .enqueue(MutationRequest::create(EntityKind::Item, Payload::new()))
            .is_err());
    }

    #[tokio::test]
    async fn remote_removal_discards_pending_edit() {
        let (engine, remote, _sub) = setup();
        let cancel = CancellationToken::new();
        remote
            .upsert(EntityKind::Item, "1", fields(&[("content", json!("a"))]))
            .unwrap();
        engine.sync_once(&cancel).await.unwrap();

        engine
            .enqueue(MutationRequest::update(
                "1".parse().unwrap(),
                EntityKind::Item,
                fields(&[("content", json!("mine"))]),
            ))
            .unwrap();
        remote.remove("1");

        let outcome = engine.sync_once(&cancel).await.unwrap();
        assert_eq!(outcome.discarded_count, 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.pushed_count, 0);
        assert_eq!(engine.store().pending_count().unwrap(), 0);
        assert!(remote.received_pushes().is_empty());
    }

    #[tokio::test]
    async fn remote_version_without_update_time_can_field_merge() {
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
                fields(&[("content", json!("renamed"))]),
                Entity::unknown_update_time(),
            )
            .unwrap();

        let outcome = engine.sync_once(&cancel).await.unwrap();

        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.pushed_count, 1);
        let local = engine.store().get(&"1".parse().unwrap()).unwrap().unwrap();
        assert_eq!(local.payload["content"], json!("renamed"));
        assert_eq!(local.payload["priority"], json!(4));
        assert!(local.has_known_update_time());
        assert!(local.updated_at < Utc::now() - chrono::Duration::minutes(30));
    }

    #[tokio::test]
    async fn refused_push_is_dropped_from_queue() {
        let (engine, remote, _sub) = setup();
        engine
            .enqueue(MutationRequest::delete("404".parse().unwrap(), EntityKind::Item))
            .unwrap();

        let outcome = engine.sync_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.dead_letters.len(), 1);
        assert_eq!(outcome.dead_letters[0].op, MutationOp::Delete);
        assert_eq!(engine.store().pending_count().unwrap(), 0);
        assert_eq!(remote.received_pushes().len(), 1);
        assert!(engine.state().is_idle());
    }

    #[test]
    fn error_labels() {
        assert_eq!(SyncError::Cancelled.label(), "cancelled");
        assert_eq!(
            SyncError::Api(ApiError::Unauthorized("x".into())).label(),
            "unauthorized"
        );
        let exhausted = SyncError::RetriesExhausted {
            attempts: 5,
            last: ApiError::Network("down".into()),
        };
        assert_eq!(exhausted.class(), ErrorClass::Fatal);
        assert!(exhausted.to_string().contains("5 attempts"));
    }
}
