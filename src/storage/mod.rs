//! # Storage Layer
//!
//! Persistence for tandem: the SQLite local store, configuration, and the
//! on-disk workspace layout.
//!
//! ## Workspace Structure
//!
//! ```text
//! .tandem/
//! ├── store.db              # Entities, sync cursor, pending mutations
//! ├── config.toml           # Workspace configuration
//! ├── plugins/              # tandem-plugin-* executables
//! ├── sync.lock             # Held while a sync is running
//! └── .gitignore            # Ignores the store and the lock
//! ```
//!
//! ## Concurrency Safety
//!
//! - [`LocalStore`] applies every batch in one SQLite transaction behind a
//!   single guarded connection
//! - [`Workspace::lock_sync`] uses file locking (`fs2`) so only one process
//!   syncs a workspace at a time
//!
//! ## Key Types
//!
//! - [`Workspace`] - Entry point for accessing a tandem workspace
//! - [`LocalStore`] - Durable entity/cursor/mutation store
//! - [`Snapshot`] - Immutable view handed to plugins
//! - [`Config`] - Workspace and global configuration

mod config;
mod local;
mod workspace;

pub use config::{
    Config, ConfigError, DispatchConfig, GlobalConfig, OutputFormat, PluginsConfig, ProjectConfig,
    RemoteConfig, SyncConfig,
};
pub use local::{Commit, LocalStore, Snapshot, StorageError};
pub use workspace::{SyncLock, Workspace, WorkspaceError};
