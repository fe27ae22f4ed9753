//! Locally originated mutations
//!
//! Every local change (from the CLI or from a plugin) becomes a pending
//! mutation. It stays pending until the remote acknowledges its token.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entity::{EntityKind, Payload, Revision};
use super::fields::{DueDate, FieldError, Priority};
use super::id::{EntityId, MutationToken};

/// What a mutation does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to change remote state, before it has been queued
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Target entity (`None` for creates, which get a temporary ID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,

    pub kind: EntityKind,

    pub op: MutationOp,

    /// Fields to set
    #[serde(default)]
    pub fields: Payload,
}

impl MutationRequest {
    pub fn create(kind: EntityKind, fields: Payload) -> Self {
        Self {
            entity_id: None,
            kind,
            op: MutationOp::Create,
            fields,
        }
    }

    pub fn update(id: EntityId, kind: EntityKind, fields: Payload) -> Self {
        Self {
            entity_id: Some(id),
            kind,
            op: MutationOp::Update,
            fields,
        }
    }

    pub fn delete(id: EntityId, kind: EntityKind) -> Self {
        Self {
            entity_id: Some(id),
            kind,
            op: MutationOp::Delete,
            fields: Payload::new(),
        }
    }

    /// Checks the fields against what the service accepts for this kind
    ///
    /// Creates need every required field; updates may not blank one out.
    pub fn validate(&self) -> Result<(), FieldError> {
        let blank = |field: &str| match self.fields.get(field) {
            None | Some(serde_json::Value::Null) => true,
            Some(serde_json::Value::String(s)) => s.trim().is_empty(),
            Some(_) => false,
        };

        for &field in self.kind.required_fields() {
            match self.op {
                MutationOp::Create if blank(field) => {
                    return Err(FieldError::Missing {
                        kind: self.kind,
                        field,
                    });
                }
                MutationOp::Update if self.fields.contains_key(field) && blank(field) => {
                    return Err(FieldError::Cleared {
                        kind: self.kind,
                        field,
                    });
                }
                _ => {}
            }
        }

        if let Some(priority) = self.fields.get("priority") {
            if priority.as_u64().and_then(Priority::from_wire).is_none() {
                return Err(FieldError::Invalid {
                    field: "priority",
                    reason: format!("expected 1 to 4, got {}", priority),
                });
            }
        }

        if let Some(due) = self.fields.get("due").filter(|v| !v.is_null()) {
            DueDate::parse(due)?;
        }

        Ok(())
    }
}

/// A queued mutation waiting for remote acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Position in the local queue
    pub seq: u64,

    /// Idempotency token sent with every push attempt
    pub token: MutationToken,

    pub entity_id: EntityId,

    pub kind: EntityKind,

    pub op: MutationOp,

    #[serde(default)]
    pub fields: Payload,

    /// When the mutation was made locally
    pub queued_at: DateTime<Utc>,
}

impl Mutation {
    /// Names of the fields this mutation touches
    ///
    /// Returns `None` for deletes, which touch every field.
    pub fn field_set(&self) -> Option<BTreeSet<String>> {
        match self.op {
            MutationOp::Delete => None,
            _ => Some(self.fields.keys().cloned().collect()),
        }
    }

    /// Replaces a temporary ID with its permanent one, as target and in field values
    ///
    /// Returns true if anything changed.
    pub fn rekey(&mut self, old: &EntityId, new: &EntityId) -> bool {
        let mut changed = false;
        if &self.entity_id == old {
            self.entity_id = new.clone();
            changed = true;
        }
        for value in self.fields.values_mut() {
            if value.as_str() == Some(old.as_str()) {
                *value = serde_json::Value::String(new.to_string());
                changed = true;
            }
        }
        changed
    }
}

/// Remote acknowledgement of one pushed mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Token of the acknowledged mutation
    pub token: MutationToken,

    /// Permanent ID, when the mutation targeted a temporary one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_id: Option<EntityId>,

    /// Revision the remote assigned to the result
    #[serde(default)]
    pub revision: Revision,
}
