//! Plugin registry
//!
//! Holds the plugins that survived loading and indexes their capabilities:
//! command name to owning plugin, and event kind to subscribers. The registry
//! is built once per run and is read-only afterwards, so it is shared behind
//! an `Arc` without locking.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::EventKind;
use crate::dispatch::panic_message;
use crate::storage::DispatchConfig;

use super::capability::{Capability, Plugin, PluginInitError};
use super::loader::{ExternalPlugin, PluginLoader};

/// The registry could not be built
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("command '{command}' is provided by both '{first}' and '{second}'")]
    DuplicateCommand {
        command: String,
        first: String,
        second: String,
    },

    #[error("more than one plugin is named '{0}'")]
    DuplicatePlugin(String),

    #[error("plugin discovery failed in {path}: {source}")]
    Discovery {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A plugin left out of the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadWarning {
    /// Plugin name, or the executable path if the manifest was unreadable
    pub plugin: String,

    pub reason: String,
}

impl LoadWarning {
    fn from_init(plugin: &str, error: &PluginInitError) -> Self {
        Self {
            plugin: plugin.to_string(),
            reason: error.to_string(),
        }
    }
}

/// How `load_all` finds and initializes plugins
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub dirs: Vec<PathBuf>,

    /// Plugin names to skip
    pub disabled: Vec<String>,

    /// Also discover plugins on PATH
    pub search_path: bool,

    /// Bound on each manifest read and each `init()`
    pub init_timeout: Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

impl From<&DispatchConfig> for LoadOptions {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            dirs: Vec::new(),
            disabled: Vec::new(),
            search_path: false,
            init_timeout: config.init_timeout(),
        }
    }
}

/// Loaded plugins and their capability index
#[derive(Default)]
pub struct PluginRegistry {
    /// Plugins in load order
    plugins: Vec<Arc<dyn Plugin>>,

    /// Command name to index into `plugins`
    commands: HashMap<String, usize>,

    /// Event kind to indices into `plugins`, in load order
    subscribers: HashMap<EventKind, Vec<usize>>,

    warnings: Vec<LoadWarning>,
}

impl PluginRegistry {
    /// A registry with no plugins
    pub fn empty() -> Self {
        Self::default()
    }

    /// Discovers external plugins and loads them after the built-ins
    pub async fn load_all(
        builtins: Vec<Arc<dyn Plugin>>,
        options: &LoadOptions,
    ) -> Result<Self, RegistryError> {
        let mut loader = PluginLoader::new().with_path_search(options.search_path);
        for dir in &options.dirs {
            loader.add_plugin_dir(dir);
        }

        let discovered = loader.discover().map_err(|source| RegistryError::Discovery {
            path: options
                .dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", "),
            source,
        })?;

        let disabled: HashSet<&str> = options.disabled.iter().map(String::as_str).collect();
        let mut warnings = Vec::new();
        let mut plugins = builtins
            .into_iter()
            .filter(|p| !disabled.contains(p.name()))
            .collect::<Vec<_>>();

        let candidates = discovered
            .into_iter()
            .filter(|info| !disabled.contains(info.name.as_str()))
            .collect::<Vec<_>>();
        let manifests = join_all(
            candidates
                .iter()
                .map(|info| ExternalPlugin::load(&info.path, options.init_timeout)),
        )
        .await;

        for (info, loaded) in candidates.iter().zip(manifests) {
            match loaded {
                Ok(plugin) if disabled.contains(plugin.name()) => {
                    info!(plugin = %plugin.name(), "Skipping disabled plugin");
                }
                Ok(plugin) => plugins.push(Arc::new(plugin)),
                Err(e) => {
                    warn!(path = %info.path.display(), error = %e, "Failed to read plugin manifest");
                    warnings.push(LoadWarning::from_init(&info.path.display().to_string(), &e));
                }
            }
        }

        let mut registry = Self::load_with_timeout(plugins, options.init_timeout).await?;
        warnings.append(&mut registry.warnings);
        registry.warnings = warnings;
        Ok(registry)
    }

    /// Validates and indexes in-process plugins
    pub async fn load(plugins: Vec<Arc<dyn Plugin>>) -> Result<Self, RegistryError> {
        Self::load_with_timeout(plugins, DispatchConfig::default().init_timeout()).await
    }

    /// Runs every `init()` concurrently, drops failures, then builds the index
    pub async fn load_with_timeout(
        plugins: Vec<Arc<dyn Plugin>>,
        init_timeout: Duration,
    ) -> Result<Self, RegistryError> {
        let mut names = HashSet::new();
        for plugin in &plugins {
            if !names.insert(plugin.name().to_string()) {
                return Err(RegistryError::DuplicatePlugin(plugin.name().to_string()));
            }
        }

        let results = join_all(plugins.iter().map(|plugin| {
            let plugin = Arc::clone(plugin);
            async move {
                let name = plugin.name().to_string();
                let mut handle = tokio::spawn(async move { plugin.init().await });
                match tokio::time::timeout(init_timeout, &mut handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) if join_error.is_panic() => Err(PluginInitError::Panicked {
                        plugin: name,
                        message: panic_message(join_error.into_panic()),
                    }),
                    Ok(Err(_)) => Err(PluginInitError::Failed {
                        plugin: name,
                        reason: "init task aborted".to_string(),
                    }),
                    Err(_) => {
                        handle.abort();
                        Err(PluginInitError::Timeout { plugin: name })
                    }
                }
            }
        }))
        .await;

        let mut registry = Self::default();
        for (plugin, result) in plugins.into_iter().zip(results) {
            match result {
                Ok(()) => registry.register(plugin)?,
                Err(e) => {
                    warn!(plugin = %plugin.name(), error = %e, "Plugin failed to initialize");
                    registry.warnings.push(LoadWarning::from_init(plugin.name(), &e));
                }
            }
        }

        Ok(registry)
    }

    fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        let index = self.plugins.len();
        let descriptor = plugin.descriptor();

        for command in descriptor.commands() {
            match self.commands.get(command) {
                // Declared twice by this plugin
                Some(&owner) if owner == index => continue,
                Some(&owner) => {
                    return Err(RegistryError::DuplicateCommand {
                        command: command.to_string(),
                        first: self.plugins[owner].name().to_string(),
                        second: descriptor.name.clone(),
                    });
                }
                None => {
                    self.commands.insert(command.to_string(), index);
                }
            }
        }

        let mut kinds = HashSet::new();
        for capability in &descriptor.capabilities {
            if let Capability::Event(kind) = capability {
                if kinds.insert(*kind) {
                    self.subscribers.entry(*kind).or_default().push(index);
                }
            }
        }

        info!(
            plugin = %descriptor.name,
            version = %descriptor.version,
            capabilities = descriptor.capabilities.len(),
            "Registered plugin"
        );

        self.plugins.push(plugin);
        Ok(())
    }

    /// Every `(plugin name, capability)` pair, in load order
    pub fn capabilities(&self) -> Vec<(&str, &Capability)> {
        self.plugins
            .iter()
            .flat_map(|p| {
                let name = p.name();
                p.descriptor().capabilities.iter().map(move |c| (name, c))
            })
            .collect()
    }

    /// Plugins subscribed to an event kind, in load order
    pub fn subscribers(&self, kind: EventKind) -> Vec<Arc<dyn Plugin>> {
        self.subscribers
            .get(&kind)
            .map(|indices| indices.iter().map(|&i| Arc::clone(&self.plugins[i])).collect())
            .unwrap_or_default()
    }

    pub fn command_owner(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.commands.get(name).map(|&i| Arc::clone(&self.plugins[i]))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.iter().find(|p| p.name() == name).cloned()
    }

    pub fn warnings(&self) -> &[LoadWarning] {
        &self.warnings
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field(
                "plugins",
                &self.plugins.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("warnings", &self.warnings)
            .finish()
    }
}
