//! Entity domain model
//!
//! An entity is one remote object (item, project, label, ...) as last seen
//! from the service. The payload is kept as a field map so the client does
//! not need to know every field the service sends; typed accessors cover the
//! fields the CLI and built-in plugins use.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fields::{Color, DueDate, Priority};
use super::id::EntityId;

/// Field name to value mapping
pub type Payload = BTreeMap<String, serde_json::Value>;

/// Revision token assigned by the remote
///
/// Strictly increasing per entity. Zero means the remote has never
/// acknowledged this version.
pub type Revision = u64;

/// Kind of remote object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A task
    Item,
    Project,
    Section,
    Label,
    Filter,
    /// A comment attached to an item or project
    Note,
}

impl EntityKind {
    pub const ALL: [EntityKind; 6] = [
        EntityKind::Item,
        EntityKind::Project,
        EntityKind::Section,
        EntityKind::Label,
        EntityKind::Filter,
        EntityKind::Note,
    ];

    /// Fields a create must carry for the service to accept it
    ///
    /// The service fills in the rest, including an item's project (the inbox).
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Item | EntityKind::Note => &["content"],
            EntityKind::Project | EntityKind::Label => &["name"],
            EntityKind::Section => &["name", "project_id"],
            EntityKind::Filter => &["name", "query"],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Item => "item",
            EntityKind::Project => "project",
            EntityKind::Section => "section",
            EntityKind::Label => "label",
            EntityKind::Filter => "filter",
            EntityKind::Note => "note",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "item" | "task" => Ok(EntityKind::Item),
            "project" => Ok(EntityKind::Project),
            "section" => Ok(EntityKind::Section),
            "label" => Ok(EntityKind::Label),
            "filter" => Ok(EntityKind::Filter),
            "note" | "comment" => Ok(EntityKind::Note),
            other => Err(format!("Unknown entity kind '{}'", other)),
        }
    }
}

/// A remote object mirrored locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Remote identifier
    pub id: EntityId,

    /// Kind of object
    pub kind: EntityKind,

    /// Revision token from the remote
    #[serde(default)]
    pub revision: Revision,

    /// Field values
    #[serde(default)]
    pub payload: Payload,

    /// Soft-delete flag
    #[serde(default)]
    pub deleted: bool,

    /// When the remote last changed this entity
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Creates a new, non-deleted entity
    pub fn new(id: EntityId, kind: EntityKind, revision: Revision, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            revision,
            payload: Payload::new(),
            deleted: false,
            updated_at,
        }
    }

    /// Builder-style field setter
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(name.into(), value.into());
        self
    }

    /// Placeholder `updated_at` for remote versions sent without one
    pub fn unknown_update_time() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    pub fn has_known_update_time(&self) -> bool {
        self.updated_at != Self::unknown_update_time()
    }

    /// Gets a raw field value
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.payload.get(name)
    }

    /// Display title (`content` for items and notes, `name` for everything else)
    pub fn title(&self) -> &str {
        let key = match self.kind {
            EntityKind::Item | EntityKind::Note => "content",
            _ => "name",
        };
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    /// Item priority, if the payload carries a known value
    pub fn priority(&self) -> Option<Priority> {
        self.field("priority")
            .and_then(|v| v.as_u64())
            .and_then(Priority::from_wire)
    }

    pub fn color(&self) -> Option<Color> {
        self.field("color")
            .and_then(|v| v.as_u64())
            .and_then(Color::from_wire)
    }

    /// Parent of the same kind (sub-task, sub-project), by ID
    pub fn parent_id(&self) -> Option<EntityId> {
        self.id_field("parent_id")
    }

    pub fn project_id(&self) -> Option<EntityId> {
        self.id_field("project_id")
    }

    pub fn section_id(&self) -> Option<EntityId> {
        self.id_field("section_id")
    }

    /// Due date, if the payload carries a valid one
    pub fn due(&self) -> Option<DueDate> {
        self.field("due")
            .filter(|v| !v.is_null())
            .and_then(|v| DueDate::parse(v).ok())
    }

    /// Whether an item is checked off
    pub fn is_completed(&self) -> bool {
        self.field("checked")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Names of all fields whose value differs between `self` and `other`
    ///
    /// Fields present on only one side count as changed.
    pub fn changed_fields(&self, other: &Entity) -> BTreeSet<String> {
        let keys: BTreeSet<&String> = self.payload.keys().chain(other.payload.keys()).collect();
        keys.into_iter()
            .filter(|k| self.payload.get(*k) != other.payload.get(*k))
            .cloned()
            .collect()
    }

    fn id_field(&self, name: &str) -> Option<EntityId> {
        match self.field(name)? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.to_string().parse().ok(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(id: &str) -> Entity {
        Entity::new(id.parse().unwrap(), EntityKind::Item, 1, Utc::now())
    }

    #[test]
    fn title_depends_on_kind() {
        let task = item("1").with_field("content", "Buy milk");
        assert_eq!(task.title(), "Buy milk");

        let project = Entity::new("2".parse().unwrap(), EntityKind::Project, 1, Utc::now())
            .with_field("name", "Groceries");
        assert_eq!(project.title(), "Groceries");
    }

    #[test]
    fn typed_accessors() {
        let task = item("1")
            .with_field("priority", 4)
            .with_field("checked", true)
            .with_field("parent_id", 99)
            .with_field("project_id", "p-1");

        assert_eq!(task.priority(), Some(Priority::P1));
        assert!(task.is_completed());
        assert_eq!(task.parent_id(), Some("99".parse().unwrap()));
        assert_eq!(task.project_id(), Some("p-1".parse().unwrap()));
        assert_eq!(task.section_id(), None);
    }

    #[test]
    fn due_accessor_ignores_invalid_values() {
        let due = item("1").with_field("due", json!({"date": "2026-05-04", "string": "May 4"}));
        assert_eq!(due.due().unwrap().date.as_deref(), Some("2026-05-04"));

        assert!(item("2").with_field("due", json!(null)).due().is_none());
        assert!(item("3").with_field("due", json!({"date": "someday"})).due().is_none());
        assert!(item("4").due().is_none());
    }

    #[test]
    fn changed_fields_includes_added_and_removed() {
        let a = item("1").with_field("content", "a").with_field("priority", 1);
        let b = item("1").with_field("content", "b").with_field("due", json!({"date": "2024-01-01"}));

        let changed = a.changed_fields(&b);
        let expected: BTreeSet<String> = ["content", "due", "priority"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(changed, expected);
    }

    #[test]
    fn kind_parse_accepts_aliases() {
        assert_eq!("task".parse::<EntityKind>(), Ok(EntityKind::Item));
        assert_eq!("Comment".parse::<EntityKind>(), Ok(EntityKind::Note));
        assert!("widget".parse::<EntityKind>().is_err());
    }

    #[test]
    fn entity_serialization() {
        let task = item("7").with_field("content", "x");
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Entity = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, task);
    }
}
