//! Sync cursor and deltas
//!
//! A delta is everything the remote reports as changed since a cursor. The
//! cursor that comes back with it is only stored together with the entity
//! writes it accompanies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{Entity, EntityKind, Revision};
use super::id::EntityId;

/// Continuation token marking replication progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    /// Opaque token from the remote
    pub token: String,

    /// When this cursor was committed locally (`None` until the first sync)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Token asking the remote for a full sync
    pub const INITIAL_TOKEN: &'static str = "*";

    /// The cursor of a store that has never synced
    pub fn initial() -> Self {
        Self {
            token: Self::INITIAL_TOKEN.to_string(),
            committed_at: None,
        }
    }

    /// A cursor received from the remote but not committed yet
    pub fn from_token(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            committed_at: None,
        }
    }

    pub fn is_initial(&self) -> bool {
        self.token == Self::INITIAL_TOKEN
    }

    /// Stamps the cursor with its commit time
    pub fn committed(mut self, at: DateTime<Utc>) -> Self {
        self.committed_at = Some(at);
        self
    }
}

impl Default for SyncCursor {
    fn default() -> Self {
        Self::initial()
    }
}

/// One change reported by the remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Change {
    /// Entity added or updated
    Upsert(Entity),

    /// Entity removed
    Remove {
        id: EntityId,
        kind: EntityKind,
        revision: Revision,
    },
}

impl Change {
    pub fn id(&self) -> &EntityId {
        match self {
            Change::Upsert(entity) => &entity.id,
            Change::Remove { id, .. } => id,
        }
    }

    pub fn revision(&self) -> Revision {
        match self {
            Change::Upsert(entity) => entity.revision,
            Change::Remove { revision, .. } => *revision,
        }
    }
}

/// Ordered batch of remote changes from one pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Changes in the order the remote produced them
    #[serde(default)]
    pub changes: Vec<Change>,

    /// Cursor to store once the changes are applied
    pub next_cursor: SyncCursor,

    /// Whether the remote sent its full state rather than an increment
    #[serde(default)]
    pub full_sync: bool,
}

impl Delta {
    pub fn new(changes: Vec<Change>, next_token: impl Into<String>) -> Self {
        Self {
            changes,
            next_cursor: SyncCursor::from_token(next_token),
            full_sync: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_cursor() {
        let cursor = SyncCursor::initial();
        assert!(cursor.is_initial());
        assert!(cursor.committed_at.is_none());
    }

    #[test]
    fn committed_stamps_time() {
        let now = Utc::now();
        let cursor = SyncCursor::from_token("abc").committed(now);
        assert_eq!(cursor.committed_at, Some(now));
        assert!(!cursor.is_initial());
    }

    #[test]
    fn change_accessors() {
        let entity = Entity::new("1".parse().unwrap(), EntityKind::Label, 3, Utc::now());
        let upsert = Change::Upsert(entity);
        assert_eq!(upsert.id().as_str(), "1");
        assert_eq!(upsert.revision(), 3);

        let remove = Change::Remove {
            id: "2".parse().unwrap(),
            kind: EntityKind::Item,
            revision: 9,
        };
        assert_eq!(remove.id().as_str(), "2");
        assert_eq!(remove.revision(), 9);
    }

    #[test]
    fn change_serialization_is_tagged() {
        let remove = Change::Remove {
            id: "2".parse().unwrap(),
            kind: EntityKind::Item,
            revision: 9,
        };
        let json = serde_json::to_value(&remove).unwrap();
        assert_eq!(json["action"], "remove");
        assert_eq!(json["kind"], "item");
    }
}
