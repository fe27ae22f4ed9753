//! # Sync
//!
//! Incremental replication between the hosted service and the local store.
//!
//! - [`RemoteApi`] - the request/response boundary ([`HttpRemote`], [`MockRemote`])
//! - [`SyncState`] - pure state machine deciding retries and sequencing
//! - [`SyncEngine`] - performs pull, merge, push and commit rounds

mod api;
mod engine;
mod http;
mod mock;
mod state;

pub use api::{ApiError, ErrorClass, OfflineRemote, RemoteApi};
pub use engine::{Conflict, DeadLetter, SyncEngine, SyncError, SyncOutcome};
pub use http::HttpRemote;
pub use mock::MockRemote;
pub use state::{AbortReason, Action, Failure, RetryPolicy, Stage, SyncEvent, SyncState};
