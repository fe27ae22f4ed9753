//! Domain models for tandem
//!
//! Contains the replicated data model and the merge policy, without any I/O
//! concerns.

mod delta;
mod entity;
mod fields;
mod id;
mod merge;
mod mutation;

pub use delta::{Change, Delta, SyncCursor};
pub use entity::{Entity, EntityKind, Payload, Revision};
pub use fields::{Color, DueDate, FieldError, Priority, DUE_LANGS};
pub use id::{EntityId, IdError, MutationToken};
pub use merge::{merge_remote, MergeResult, Resolution};
pub use mutation::{Ack, Mutation, MutationOp, MutationRequest};
