//! Conflict resolution between remote changes and pending local mutations
//!
//! Implements "last-writer-wins with field merge". When an incoming remote
//! version meets pending local mutations for the same entity:
//!
//! - the local side wins field-by-field only if its newest mutation is
//!   strictly newer than the remote `updated_at` AND the fields it touches do
//!   not overlap the fields the remote changed;
//! - otherwise the remote version wins and the local mutations are superseded.
//!
//! Ties and any overlap go to the remote.

use std::collections::BTreeSet;

use super::entity::Entity;
use super::mutation::Mutation;

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// No pending local mutations; the remote version is taken as-is
    Clean,

    /// Local fields overlaid on the remote version; mutations stay pending
    FieldMerge,

    /// Remote version taken; pending mutations for the entity are superseded
    RemoteWins,
}

/// Result of merging a remote version with local pending mutations
#[derive(Debug)]
pub struct MergeResult {
    /// The merged entity
    pub entity: Entity,

    pub resolution: Resolution,

    /// Which fields came from the local mutations
    pub local_fields: Vec<String>,

    /// Which fields the remote changed relative to the stored base
    pub remote_fields: Vec<String>,
}

impl MergeResult {
    /// Whether local work was thrown away
    pub fn had_conflicts(&self) -> bool {
        self.resolution == Resolution::RemoteWins
    }
}

/// Merges an incoming remote version with pending local mutations
///
/// # Arguments
///
/// * `base` - The stored version before this pull, if any
/// * `remote` - The incoming remote version
/// * `pending` - Pending mutations for the same entity, in queue order
pub fn merge_remote(base: Option<&Entity>, remote: &Entity, pending: &[&Mutation]) -> MergeResult {
    let remote_changed: BTreeSet<String> = match base {
        Some(base) => base.changed_fields(remote),
        None => remote.payload.keys().cloned().collect(),
    };
    let remote_fields: Vec<String> = remote_changed.iter().cloned().collect();

    if pending.is_empty() {
        return MergeResult {
            entity: remote.clone(),
            resolution: Resolution::Clean,
            local_fields: Vec::new(),
            remote_fields,
        };
    }

    // A delete touches every field, so it always overlaps
    let mut local_changed = BTreeSet::new();
    let mut touches_all = false;
    for mutation in pending {
        match mutation.field_set() {
            Some(fields) => local_changed.extend(fields),
            None => touches_all = true,
        }
    }

    let overlaps = touches_all || !local_changed.is_disjoint(&remote_changed);
    let local_newest = pending.iter().map(|m| m.queued_at).max();
    let local_is_newer = local_newest.is_some_and(|t| t > remote.updated_at);

    if local_is_newer && !overlaps && !remote.deleted {
        let mut merged = remote.clone();
        for mutation in pending {
            for (key, value) in &mutation.fields {
                merged.payload.insert(key.clone(), value.clone());
            }
        }

        return MergeResult {
            entity: merged,
            resolution: Resolution::FieldMerge,
            local_fields: local_changed.into_iter().collect(),
            remote_fields,
        };
    }

    MergeResult {
        entity: remote.clone(),
        resolution: Resolution::RemoteWins,
        local_fields: Vec::new(),
        remote_fields,
    }
}
