//! In-memory remote for testing
//!
//! Behaves like a small hosted service: it keeps its own entity set, assigns
//! revisions from a global change counter, maps temporary IDs to permanent
//! ones, and deduplicates pushes by mutation token. Failures can be scripted
//! per call.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::api::{ApiError, RemoteApi};
use crate::domain::{
    Ack, Change, Delta, Entity, EntityId, EntityKind, Mutation, MutationOp, MutationToken, Payload,
    SyncCursor,
};

/// Mock remote service
///
/// Clones share state, so a test can keep a handle while the engine owns another.
#[derive(Debug, Clone, Default)]
pub struct MockRemote {
    inner: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    /// Global change counter; also the cursor token
    version: u64,
    /// Current entities with the version of their last change
    entities: BTreeMap<EntityId, (Entity, u64)>,
    acks: HashMap<MutationToken, Ack>,
    temp_ids: HashMap<EntityId, EntityId>,
    next_id: u64,
    received_pushes: Vec<Mutation>,
    received_pulls: Vec<SyncCursor>,
    pull_failures: VecDeque<ApiError>,
    push_failures: VecDeque<ApiError>,
    lost_acks: VecDeque<ApiError>,
    now: Option<DateTime<Utc>>,
}

impl MockState {
    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn resolve(&self, id: &EntityId) -> EntityId {
        self.temp_ids.get(id).cloned().unwrap_or_else(|| id.clone())
    }

    fn resolve_fields(&self, fields: &Payload) -> Payload {
        fields
            .iter()
            .map(|(k, v)| {
                let mapped = v
                    .as_str()
                    .and_then(|s| s.parse::<EntityId>().ok())
                    .and_then(|id| self.temp_ids.get(&id))
                    .map(|id| serde_json::Value::String(id.to_string()))
                    .unwrap_or_else(|| v.clone());
                (k.clone(), mapped)
            })
            .collect()
    }

    fn apply(&mut self, mutation: &Mutation) -> Result<Ack, ApiError> {
        let fields = self.resolve_fields(&mutation.fields);
        let now = self.now();

        match mutation.op {
            MutationOp::Create => {
                let id = if mutation.entity_id.is_temporary() {
                    self.next_id += 1;
                    let assigned: EntityId = format!("{}", 1000 + self.next_id)
                        .parse()
                        .map_err(|e| ApiError::Rejected(format!("{}", e)))?;
                    self.temp_ids
                        .insert(mutation.entity_id.clone(), assigned.clone());
                    assigned
                } else {
                    mutation.entity_id.clone()
                };

                let version = self.bump();
                let mut entity = Entity::new(id.clone(), mutation.kind, version, now);
                entity.payload = fields;
                self.entities.insert(id.clone(), (entity, version));

                Ok(Ack {
                    token: mutation.token.clone(),
                    assigned_id: mutation.entity_id.is_temporary().then_some(id),
                    revision: version,
                })
            }
            MutationOp::Update | MutationOp::Delete => {
                let id = self.resolve(&mutation.entity_id);
                let exists = self
                    .entities
                    .get(&id)
                    .is_some_and(|(entity, _)| !entity.deleted);
                if !exists {
                    return Err(ApiError::CommandRejected(format!("entity {} not found", id)));
                }

                let version = self.bump();
                if let Some((entity, changed)) = self.entities.get_mut(&id) {
                    if mutation.op == MutationOp::Delete {
                        entity.deleted = true;
                    } else {
                        entity.payload.extend(fields);
                    }
                    entity.revision = version;
                    entity.updated_at = now;
                    *changed = version;
                }

                Ok(Ack {
                    token: mutation.token.clone(),
                    assigned_id: None,
                    revision: version,
                })
            }
        }
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fixes the clock used for `updated_at` (defaults to the wall clock)
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state().now = Some(now);
    }

    /// Simulates another client creating or editing an entity
    ///
    /// Fields are merged into the existing remote version.
    pub fn upsert(&self, kind: EntityKind, id: &str, fields: Payload) -> Result<Entity, ApiError> {
        let mut state = self.state();
        let now = state.now();
        Self::upsert_locked(&mut state, kind, id, fields, now)
    }

    /// Like [`Self::upsert`] with an explicit `updated_at`
    pub fn upsert_at(
        &self,
        kind: EntityKind,
        id: &str,
        fields: Payload,
        updated_at: DateTime<Utc>,
    ) -> Result<Entity, ApiError> {
        let mut state = self.state();
        Self::upsert_locked(&mut state, kind, id, fields, updated_at)
    }

    fn upsert_locked(
        state: &mut MockState,
        kind: EntityKind,
        id: &str,
        fields: Payload,
        updated_at: DateTime<Utc>,
    ) -> Result<Entity, ApiError> {
        let id: EntityId = id
            .parse()
            .map_err(|e| ApiError::Rejected(format!("{}", e)))?;
        let version = state.bump();

        let entry = state
            .entities
            .entry(id.clone())
            .or_insert_with(|| (Entity::new(id, kind, version, updated_at), version));
        entry.0.payload.extend(fields);
        entry.0.revision = version;
        entry.0.updated_at = updated_at;
        entry.0.deleted = false;
        entry.1 = version;

        Ok(entry.0.clone())
    }

    /// Simulates another client deleting an entity
    pub fn remove(&self, id: &str) {
        let mut state = self.state();
        let now = state.now();
        let version = state.bump();
        if let Some((entity, changed)) = state.entities.get_mut(id) {
            entity.deleted = true;
            entity.revision = version;
            entity.updated_at = now;
            *changed = version;
        }
    }

    /// Current remote version of an entity
    pub fn entity(&self, id: &str) -> Option<Entity> {
        self.state().entities.get(id).map(|(e, _)| e.clone())
    }

    /// Number of live entities on the remote
    pub fn live_count(&self) -> usize {
        self.state()
            .entities
            .values()
            .filter(|(e, _)| !e.deleted)
            .count()
    }

    /// Makes the next `times` pulls fail with `error`
    pub fn fail_pulls(&self, error: ApiError, times: usize) {
        let mut state = self.state();
        for _ in 0..times {
            state.pull_failures.push_back(error.clone());
        }
    }

    /// Makes the next push fail before it is applied
    pub fn fail_next_push(&self, error: ApiError) {
        self.state().push_failures.push_back(error);
    }

    /// Makes the next push apply on the remote but report `error` to the caller
    pub fn lose_next_ack(&self, error: ApiError) {
        self.state().lost_acks.push_back(error);
    }

    /// Every push call received, including retries and failures
    pub fn received_pushes(&self) -> Vec<Mutation> {
        self.state().received_pushes.clone()
    }

    /// Every cursor a pull was called with
    pub fn received_pulls(&self) -> Vec<SyncCursor> {
        self.state().received_pulls.clone()
    }

    /// Number of distinct mutations applied
    pub fn applied_count(&self) -> usize {
        self.state().acks.len()
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn pull(&self, cursor: &SyncCursor) -> Result<Delta, ApiError> {
        let mut state = self.state();
        state.received_pulls.push(cursor.clone());

        if let Some(error) = state.pull_failures.pop_front() {
            return Err(error);
        }

        let since = if cursor.is_initial() {
            None
        } else {
            Some(
                cursor
                    .token
                    .parse::<u64>()
                    .map_err(|_| ApiError::Rejected(format!("unknown sync token '{}'", cursor.token)))?,
            )
        };

        let mut changed: Vec<&(Entity, u64)> = state
            .entities
            .values()
            .filter(|(entity, version)| match since {
                None => !entity.deleted,
                Some(since) => *version > since,
            })
            .collect();
        changed.sort_by_key(|(_, version)| *version);

        let changes = changed
            .into_iter()
            .map(|(entity, _)| {
                if entity.deleted {
                    Change::Remove {
                        id: entity.id.clone(),
                        kind: entity.kind,
                        revision: entity.revision,
                    }
                } else {
                    Change::Upsert(entity.clone())
                }
            })
            .collect();

        let mut delta = Delta::new(changes, state.version.to_string());
        delta.full_sync = since.is_none();
        Ok(delta)
    }

    async fn push(&self, mutation: &Mutation) -> Result<Ack, ApiError> {
        let mut state = self.state();
        state.received_pushes.push(mutation.clone());

        if let Some(error) = state.push_failures.pop_front() {
            return Err(error);
        }

        if let Some(ack) = state.acks.get(&mutation.token) {
            return Ok(ack.clone());
        }

        let ack = state.apply(mutation)?;
        state.acks.insert(mutation.token.clone(), ack.clone());

        if let Some(error) = state.lost_acks.pop_front() {
            return Err(error);
        }

        Ok(ack)
    }
}
