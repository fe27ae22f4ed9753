//! SQLite local store
//!
//! The store sits in `.tandem/store.db` and holds the mirrored entities, the
//! single sync cursor record, and the queue of pending local mutations.
//! Every multi-record change goes through one SQLite transaction, so a batch
//! is either fully applied or not at all.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::domain::{
    Entity, EntityId, EntityKind, Mutation, MutationOp, MutationRequest, MutationToken, Payload,
    SyncCursor,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode or decode stored data: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt store record: {0}")]
    Corrupt(String),

    #[error("Store schema version {found} is newer than this client supports ({supported})")]
    UnsupportedSchema { found: i32, supported: i32 },

    #[error("Store lock poisoned by a panicked writer")]
    Poisoned,
}

/// One atomic batch of store changes
#[derive(Debug, Clone)]
pub struct Commit {
    /// Entities to write (insert or replace by ID)
    pub entities: Vec<Entity>,

    /// Cursor that accompanies the entity writes
    pub cursor: SyncCursor,

    /// Pending mutations to remove (acknowledged or superseded)
    pub cleared: Vec<MutationToken>,

    /// Temporary IDs replaced by permanent ones (old, new)
    pub rekeys: Vec<(EntityId, EntityId)>,
}

impl Commit {
    pub fn new(entities: Vec<Entity>, cursor: SyncCursor) -> Self {
        Self {
            entities,
            cursor,
            cleared: Vec::new(),
            rekeys: Vec::new(),
        }
    }
}

/// Immutable point-in-time view of the store
///
/// Cheap to clone; handed to plugins so they never touch the store itself.
#[derive(Debug, Clone)]
pub struct Snapshot {
    entities: Arc<BTreeMap<EntityId, Entity>>,
    cursor: SyncCursor,
}

impl Snapshot {
    pub fn new(entities: impl IntoIterator<Item = Entity>, cursor: SyncCursor) -> Self {
        let entities = entities.into_iter().map(|e| (e.id.clone(), e)).collect();
        Self {
            entities: Arc::new(entities),
            cursor,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), SyncCursor::initial())
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    /// Live (non-deleted) entities
    pub fn live(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().filter(|e| !e.deleted)
    }

    /// Live entities of one kind
    pub fn of_kind(&self, kind: EntityKind) -> impl Iterator<Item = &Entity> {
        self.live().filter(move |e| e.kind == kind)
    }

    /// Live entities whose `parent_id` points at `parent`
    pub fn children_of<'a>(&'a self, parent: &'a EntityId) -> impl Iterator<Item = &'a Entity> + 'a {
        self.live()
            .filter(move |e| e.parent_id().as_ref() == Some(parent))
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Durable store for entities, cursor and pending mutations
pub struct LocalStore {
    /// Path to the SQLite database (`None` for in-memory stores)
    path: Option<PathBuf>,

    /// Single connection; holding the lock for a whole transaction keeps
    /// readers from seeing a half-applied batch
    conn: Mutex<Connection>,
}

impl LocalStore {
    /// Schema version stored in `PRAGMA user_version`
    const SCHEMA_VERSION: i32 = 1;

    const CURSOR_TOKEN_KEY: &'static str = "cursor_token";
    const CURSOR_COMMITTED_KEY: &'static str = "cursor_committed_at";
    const NEXT_SEQ_KEY: &'static str = "next_mutation_seq";

    /// Opens or creates the store at the given path
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL keeps readers in other processes off the writer's back
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let store = Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        debug!(path = %path.display(), "Opened local store");

        Ok(store)
    }

    /// Opens a throwaway in-memory store
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            path: None,
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }

    fn ensure_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version > Self::SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchema {
                found: version,
                supported: Self::SCHEMA_VERSION,
            });
        }

        if version < Self::SCHEMA_VERSION {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS entities (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    revision INTEGER NOT NULL,
                    deleted INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL,
                    payload TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_state (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pending (
                    seq INTEGER PRIMARY KEY,
                    token TEXT NOT NULL UNIQUE,
                    entity_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    op TEXT NOT NULL,
                    fields TEXT NOT NULL,
                    queued_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);
                CREATE INDEX IF NOT EXISTS idx_pending_entity ON pending(entity_id);
                ",
            )?;
            conn.execute(
                &format!("PRAGMA user_version = {}", Self::SCHEMA_VERSION),
                [],
            )?;
        }

        Ok(())
    }

    /// Gets the current version of an entity
    pub fn get(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, kind, revision, deleted, updated_at, payload FROM entities WHERE id = ?1",
                params![id.as_str()],
                EntityRow::from_row,
            )
            .optional()?;

        row.map(EntityRow::into_entity).transpose()
    }

    /// Lists entities, optionally filtered by kind, ordered by ID
    pub fn list(&self, kind: Option<EntityKind>, include_deleted: bool) -> Result<Vec<Entity>, StorageError> {
        let conn = self.lock()?;
        query_entities(&conn, kind, include_deleted)
    }

    /// Gets the sync cursor
    pub fn cursor(&self) -> Result<SyncCursor, StorageError> {
        let conn = self.lock()?;
        read_cursor(&conn)
    }

    /// Writes a batch of entities and advances the cursor, atomically
    pub fn put_batch(&self, entities: &[Entity], cursor: &SyncCursor) -> Result<(), StorageError> {
        self.commit(&Commit::new(entities.to_vec(), cursor.clone()))
    }

    /// Applies a batch in one transaction
    ///
    /// On error the transaction is rolled back and the store is unchanged.
    pub fn commit(&self, batch: &Commit) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO entities (id, kind, revision, deleted, updated_at, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    revision = excluded.revision,
                    deleted = excluded.deleted,
                    updated_at = excluded.updated_at,
                    payload = excluded.payload",
            )?;

            for entity in &batch.entities {
                stmt.execute(params![
                    entity.id.as_str(),
                    entity.kind.as_str(),
                    to_sql_int(entity.revision)?,
                    entity.deleted,
                    entity.updated_at.to_rfc3339(),
                    serde_json::to_string(&entity.payload)?,
                ])?;
            }
        }

        for token in &batch.cleared {
            tx.execute("DELETE FROM pending WHERE token = ?1", params![token.as_str()])?;
        }

        if !batch.rekeys.is_empty() {
            rekey_pending(&tx, &batch.rekeys)?;
        }

        write_cursor(&tx, &batch.cursor)?;

        tx.commit()?;

        debug!(
            entities = batch.entities.len(),
            cleared = batch.cleared.len(),
            cursor = %batch.cursor.token,
            "Committed batch"
        );

        Ok(())
    }

    /// Queues a local mutation
    ///
    /// Creates without a target get a temporary ID.
    pub fn enqueue(&self, request: MutationRequest) -> Result<Mutation, StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let next: Option<String> = tx
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![Self::NEXT_SEQ_KEY],
                |row| row.get(0),
            )
            .optional()?;
        let seq: u64 = match next {
            Some(s) => s
                .parse()
                .map_err(|_| StorageError::Corrupt(format!("mutation sequence '{}'", s)))?,
            None => 1,
        };

        let queued_at = Utc::now();
        let entity_id = request
            .entity_id
            .unwrap_or_else(|| EntityId::temporary(&format!("{}:{}", request.kind, seq), queued_at));
        let token = MutationToken::new(&entity_id, request.op.as_str(), seq, queued_at);

        let mutation = Mutation {
            seq,
            token,
            entity_id,
            kind: request.kind,
            op: request.op,
            fields: request.fields,
            queued_at,
        };

        tx.execute(
            "INSERT INTO pending (seq, token, entity_id, kind, op, fields, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                to_sql_int(mutation.seq)?,
                mutation.token.as_str(),
                mutation.entity_id.as_str(),
                mutation.kind.as_str(),
                mutation.op.as_str(),
                serde_json::to_string(&mutation.fields)?,
                mutation.queued_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
            params![Self::NEXT_SEQ_KEY, (seq + 1).to_string()],
        )?;
        tx.commit()?;

        debug!(token = %mutation.token, entity = %mutation.entity_id, op = %mutation.op, "Queued mutation");

        Ok(mutation)
    }

    /// Pending mutations in queue order
    pub fn pending(&self) -> Result<Vec<Mutation>, StorageError> {
        let conn = self.lock()?;
        read_pending(&conn)
    }

    /// Number of pending mutations
    pub fn pending_count(&self) -> Result<usize, StorageError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Takes an immutable snapshot of all entities and the cursor
    pub fn snapshot(&self) -> Result<Snapshot, StorageError> {
        let mut conn = self.lock()?;
        // One read transaction so entities and cursor come from the same commit
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
        let entities = query_entities(&tx, None, true)?;
        let cursor = read_cursor(&tx)?;
        tx.commit()?;
        Ok(Snapshot::new(entities, cursor))
    }
}

/// Raw entity row before decoding
struct EntityRow {
    id: String,
    kind: String,
    revision: i64,
    deleted: bool,
    updated_at: String,
    payload: String,
}

impl EntityRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            revision: row.get(2)?,
            deleted: row.get(3)?,
            updated_at: row.get(4)?,
            payload: row.get(5)?,
        })
    }

    fn into_entity(self) -> Result<Entity, StorageError> {
        Ok(Entity {
            id: parse_id(&self.id)?,
            kind: EntityKind::from_str(&self.kind).map_err(StorageError::Corrupt)?,
            revision: u64::try_from(self.revision)
                .map_err(|_| StorageError::Corrupt(format!("negative revision for {}", self.id)))?,
            payload: serde_json::from_str(&self.payload)?,
            deleted: self.deleted,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn query_entities(
    conn: &Connection,
    kind: Option<EntityKind>,
    include_deleted: bool,
) -> Result<Vec<Entity>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, revision, deleted, updated_at, payload FROM entities
         WHERE (?1 IS NULL OR kind = ?1) AND (?2 OR deleted = 0)
         ORDER BY id",
    )?;

    let rows = stmt
        .query_map(
            params![kind.map(|k| k.as_str()), include_deleted],
            EntityRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter().map(EntityRow::into_entity).collect()
}

fn read_cursor(conn: &Connection) -> Result<SyncCursor, StorageError> {
    let token: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![LocalStore::CURSOR_TOKEN_KEY],
            |row| row.get(0),
        )
        .optional()?;

    let Some(token) = token else {
        return Ok(SyncCursor::initial());
    };

    let committed: Option<String> = conn
        .query_row(
            "SELECT value FROM sync_state WHERE key = ?1",
            params![LocalStore::CURSOR_COMMITTED_KEY],
            |row| row.get(0),
        )
        .optional()?;

    Ok(SyncCursor {
        token,
        committed_at: committed.as_deref().map(parse_time).transpose()?,
    })
}

fn write_cursor(tx: &Transaction<'_>, cursor: &SyncCursor) -> Result<(), StorageError> {
    tx.execute(
        "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
        params![LocalStore::CURSOR_TOKEN_KEY, cursor.token],
    )?;

    match cursor.committed_at {
        Some(at) => {
            tx.execute(
                "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
                params![LocalStore::CURSOR_COMMITTED_KEY, at.to_rfc3339()],
            )?;
        }
        None => {
            tx.execute(
                "DELETE FROM sync_state WHERE key = ?1",
                params![LocalStore::CURSOR_COMMITTED_KEY],
            )?;
        }
    }

    Ok(())
}

fn read_pending(conn: &Connection) -> Result<Vec<Mutation>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT seq, token, entity_id, kind, op, fields, queued_at FROM pending ORDER BY seq",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(seq, token, entity_id, kind, op, fields, queued_at)| {
            Ok(Mutation {
                seq: u64::try_from(seq)
                    .map_err(|_| StorageError::Corrupt(format!("negative sequence {}", seq)))?,
                token: token
                    .parse()
                    .map_err(|e| StorageError::Corrupt(format!("{}", e)))?,
                entity_id: parse_id(&entity_id)?,
                kind: EntityKind::from_str(&kind).map_err(StorageError::Corrupt)?,
                op: decode_enum::<MutationOp>(&op)?,
                fields: serde_json::from_str::<Payload>(&fields)?,
                queued_at: parse_time(&queued_at)?,
            })
        })
        .collect()
}

/// Rewrites pending mutations that reference replaced temporary IDs
fn rekey_pending(tx: &Transaction<'_>, rekeys: &[(EntityId, EntityId)]) -> Result<(), StorageError> {
    let mut pending = read_pending(tx)?;

    for mutation in &mut pending {
        let mut changed = false;
        for (old, new) in rekeys {
            changed |= mutation.rekey(old, new);
        }

        if changed {
            tx.execute(
                "UPDATE pending SET entity_id = ?1, fields = ?2 WHERE seq = ?3",
                params![
                    mutation.entity_id.as_str(),
                    serde_json::to_string(&mutation.fields)?,
                    to_sql_int(mutation.seq)?,
                ],
            )?;
        }
    }

    Ok(())
}

fn parse_id(raw: &str) -> Result<EntityId, StorageError> {
    raw.parse()
        .map_err(|e| StorageError::Corrupt(format!("entity id '{}': {}", raw, e)))
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp '{}': {}", raw, e)))
}

fn decode_enum<T: DeserializeOwned>(raw: &str) -> Result<T, StorageError> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| StorageError::Corrupt(format!("unknown value '{}'", raw)))
}

fn to_sql_int(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::Corrupt(format!("value {} out of range", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(id: &str, revision: u64, content: &str) -> Entity {
        Entity::new(id.parse().unwrap(), EntityKind::Item, revision, Utc::now())
            .with_field("content", content)
    }

    fn cursor(token: &str) -> SyncCursor {
        SyncCursor::from_token(token).committed(Utc::now())
    }

    #[test]
    fn new_store_has_initial_cursor() {
        let store = LocalStore::open_in_memory().unwrap();
        assert!(store.cursor().unwrap().is_initial());
        assert!(store.list(None, true).unwrap().is_empty());
    }

    #[test]
    fn put_batch_writes_entities_and_cursor() {
        let store = LocalStore::open_in_memory().unwrap();
        let c = cursor("c1");

        store
            .put_batch(&[item("1", 1, "a"), item("2", 1, "b")], &c)
            .unwrap();

        assert_eq!(store.get(&"1".parse().unwrap()).unwrap().unwrap().title(), "a");
        assert_eq!(store.list(None, false).unwrap().len(), 2);

        let stored = store.cursor().unwrap();
        assert_eq!(stored.token, "c1");
        assert!(stored.committed_at.is_some());
    }

    #[test]
    fn snapshot_never_mixes_two_commits() {
        let store = Arc::new(LocalStore::open_in_memory().unwrap());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for n in 1..=40u32 {
                    let entity = item(&n.to_string(), 1, "x");
                    store.put_batch(&[entity], &cursor(&n.to_string())).unwrap();
                }
            })
        };

        for _ in 0..200 {
            let snapshot = store.snapshot().unwrap();
            let expected = if snapshot.cursor().is_initial() {
                0
            } else {
                snapshot.cursor().token.parse::<usize>().unwrap()
            };
            assert_eq!(snapshot.len(), expected);
        }
        writer.join().unwrap();

        let last = store.snapshot().unwrap();
        assert_eq!(last.len(), 40);
        assert_eq!(last.cursor().token, "40");
    }

    #[test]
    fn put_batch_replaces_existing_version() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put_batch(&[item("1", 1, "a")], &cursor("c1")).unwrap();
        store.put_batch(&[item("1", 2, "b")], &cursor("c2")).unwrap();

        let all = store.list(None, true).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].revision, 2);
        assert_eq!(all[0].title(), "b");
    }

    #[test]
    fn interrupted_batch_leaves_store_unchanged() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put_batch(&[item("1", 1, "before")], &cursor("c1")).unwrap();

        // Fail the write of one entity in the middle of the batch
        store
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fault BEFORE INSERT ON entities WHEN NEW.id = 'poison'
                 BEGIN SELECT RAISE(ABORT, 'simulated fault'); END;",
            )
            .unwrap();

        let batch = [item("1", 2, "after"), item("poison", 1, "x"), item("3", 1, "c")];
        let result = store.put_batch(&batch, &cursor("c2"));
        assert!(result.is_err());

        assert_eq!(store.cursor().unwrap().token, "c1");
        let all = store.list(None, true).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title(), "before");
        assert_eq!(all[0].revision, 1);
    }

    #[test]
    fn list_filters_kind_and_deleted() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut gone = item("2", 1, "gone");
        gone.deleted = true;
        let label = Entity::new("3".parse().unwrap(), EntityKind::Label, 1, Utc::now());

        store
            .put_batch(&[item("1", 1, "a"), gone, label], &cursor("c1"))
            .unwrap();

        assert_eq!(store.list(Some(EntityKind::Item), false).unwrap().len(), 1);
        assert_eq!(store.list(Some(EntityKind::Item), true).unwrap().len(), 2);
        assert_eq!(store.list(Some(EntityKind::Label), false).unwrap().len(), 1);
    }

    #[test]
    fn enqueue_assigns_sequence_and_temp_id() {
        let store = LocalStore::open_in_memory().unwrap();

        let mut fields = Payload::new();
        fields.insert("content".to_string(), json!("new task"));
        let created = store
            .enqueue(MutationRequest::create(EntityKind::Item, fields))
            .unwrap();
        let updated = store
            .enqueue(MutationRequest::update("9".parse().unwrap(), EntityKind::Item, Payload::new()))
            .unwrap();

        assert!(created.entity_id.is_temporary());
        assert_eq!(created.seq, 1);
        assert_eq!(updated.seq, 2);

        let pending = store.pending().unwrap();
        assert_eq!(pending, vec![created, updated]);
    }

    #[test]
    fn sequence_is_not_reused_after_clear() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = store
            .enqueue(MutationRequest::delete("1".parse().unwrap(), EntityKind::Item))
            .unwrap();

        let mut batch = Commit::new(Vec::new(), cursor("c1"));
        batch.cleared.push(first.token.clone());
        store.commit(&batch).unwrap();
        assert_eq!(store.pending_count().unwrap(), 0);

        let second = store
            .enqueue(MutationRequest::delete("1".parse().unwrap(), EntityKind::Item))
            .unwrap();
        assert_eq!(second.seq, 2);
        assert_ne!(second.token, first.token);
    }

    #[test]
    fn commit_rekeys_pending_references() {
        let store = LocalStore::open_in_memory().unwrap();
        let parent = store
            .enqueue(MutationRequest::create(EntityKind::Item, Payload::new()))
            .unwrap();

        let mut fields = Payload::new();
        fields.insert("parent_id".to_string(), json!(parent.entity_id.as_str()));
        store
            .enqueue(MutationRequest::create(EntityKind::Item, fields))
            .unwrap();

        let real: EntityId = "1001".parse().unwrap();
        let mut batch = Commit::new(Vec::new(), cursor("c1"));
        batch.cleared.push(parent.token.clone());
        batch.rekeys.push((parent.entity_id.clone(), real.clone()));
        store.commit(&batch).unwrap();

        let pending = store.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].fields["parent_id"], json!("1001"));
    }

    #[test]
    fn snapshot_is_isolated_from_later_writes() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put_batch(&[item("1", 1, "a")], &cursor("c1")).unwrap();

        let snapshot = store.snapshot().unwrap();
        store.put_batch(&[item("1", 2, "b")], &cursor("c2")).unwrap();

        assert_eq!(snapshot.get(&"1".parse().unwrap()).unwrap().title(), "a");
        assert_eq!(snapshot.cursor().token, "c1");
    }

    #[test]
    fn snapshot_resolves_children_by_id() {
        let parent = item("1", 1, "parent");
        let child = item("2", 1, "child").with_field("parent_id", "1");
        let other = item("3", 1, "other");
        let snapshot = Snapshot::new(vec![parent, child, other], SyncCursor::initial());

        let parent_id: EntityId = "1".parse().unwrap();
        let children: Vec<_> = snapshot.children_of(&parent_id).collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].title(), "child");
    }

    #[test]
    fn store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = LocalStore::open(&path).unwrap();
            store.put_batch(&[item("1", 4, "kept")], &cursor("c9")).unwrap();
            store
                .enqueue(MutationRequest::delete("1".parse().unwrap(), EntityKind::Item))
                .unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(store.cursor().unwrap().token, "c9");
        assert_eq!(store.get(&"1".parse().unwrap()).unwrap().unwrap().revision, 4);
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn rejects_newer_schema() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute("PRAGMA user_version = 99", []).unwrap();
        }

        match LocalStore::open(&path) {
            Err(StorageError::UnsupportedSchema { found, .. }) => assert_eq!(found, 99),
            other => panic!("expected schema error, got {:?}", other.map(|_| ())),
        }
    }
}
