//! tandem - a command-line client for a hosted task service
//!
//! tandem mirrors remote state into a local SQLite store through an
//! incremental sync protocol and lets plugins add commands or react to the
//! changes each sync applies.
//!
//! - [`sync`] - pull/merge/push rounds against the service
//! - [`plugin`] and [`dispatch`] - plugin loading and concurrent invocation
//! - [`session`] - wires both together for one command

pub mod bus;
pub mod cli;
pub mod dispatch;
pub mod domain;
pub mod plugin;
pub mod session;
pub mod storage;
pub mod sync;

pub use domain::{Entity, EntityId, EntityKind, Mutation, MutationRequest, SyncCursor};
pub use session::{Session, SyncReport};
