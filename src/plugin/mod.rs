//! # Plugin System
//!
//! Extensibility layer: plugins add commands and react to synced changes.
//!
//! ## Overview
//!
//! Every plugin implements the [`Plugin`] trait. Built-in plugins are
//! compiled in; external plugins are separate binaries that communicate via
//! JSON over stdin/stdout, so any language can implement one.
//!
//! ## Capabilities
//!
//! | Capability | Declared as | Dispatched |
//! |------------|-------------|------------|
//! | Event subscription | `events: ["entity_created", ...]` | after each sync, per change |
//! | Command | `commands: ["name"]` | `tandem run <name> [args...]` |
//!
//! Command names are unique across all loaded plugins.
//!
//! ## Plugin Discovery
//!
//! External plugins (`tandem-plugin-{name}`) are discovered in:
//! 1. `.tandem/plugins/` and any `[plugins] dirs` - Project-local plugins
//! 2. `$PATH` - System-wide plugins
//!
//! ## Protocol
//!
//! ```text
//! CLI                          Plugin Binary
//!  │                               │
//!  ├── Spawn: tandem-plugin-due    │
//!  │                               │
//!  ├── Stdin: {"operation": "command", "params": {...}}
//!  │                               │
//!  └── Stdout: {"success": true, "data": {...}, "mutations": [...]}
//! ```
//!
//! Every plugin must support `--manifest` to declare its capabilities.
//!
//! ## Key Types
//!
//! - [`PluginRegistry`] - Loads, validates and indexes plugins
//! - [`PluginLoader`] - Discovers plugin executables
//! - [`PluginManifest`] - Declares external plugin capabilities
//! - [`Plugin`] - The capability interface

mod builtin;
mod capability;
mod loader;
mod protocol;
mod registry;

pub use builtin::{builtins, ChangelogPlugin, SummaryPlugin};
pub use capability::{
    Capability, CommandInvocation, HandlerError, HandlerOutput, Plugin, PluginDescriptor,
    PluginInitError,
};
pub use loader::{load_manifest, ExternalPlugin, PluginInfo, PluginLoader, PLUGIN_PREFIX};
pub use protocol::{PluginManifest, PluginRequest, PluginResponse};
pub use registry::{LoadOptions, LoadWarning, PluginRegistry, RegistryError};
