//! Per-command wiring
//!
//! A [`Session`] owns one local store with its engine, bus, plugin registry
//! and dispatch coordinator for the lifetime of one CLI command. Nothing is
//! process-wide, so tests can run several sessions side by side.

use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventSubscription};
use crate::dispatch::{DispatchCoordinator, DispatchError, DispatchReport, InvocationResult};
use crate::domain::{Mutation, MutationRequest};
use crate::plugin::{builtins, LoadOptions, PluginRegistry};
use crate::storage::{DispatchConfig, LocalStore, StorageError, SyncConfig, Workspace};
use crate::sync::{RemoteApi, RetryPolicy, SyncEngine, SyncError, SyncOutcome};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// A plugin mutation request the engine refused to queue
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedMutation {
    pub plugin: String,
    pub request: MutationRequest,
    pub reason: String,
}

/// Everything one `sync` produced
#[derive(Debug)]
pub struct SyncReport {
    /// The round itself; plugin results are still reported when it failed
    pub outcome: Result<SyncOutcome, SyncError>,

    pub plugin_results: DispatchReport,

    /// Mutations queued from plugin results, pushed next round
    pub queued: Vec<Mutation>,

    pub rejected: Vec<RejectedMutation>,
}

/// One command invocation and what it queued
#[derive(Debug)]
pub struct CommandReport {
    pub result: InvocationResult,
    pub queued: Vec<Mutation>,
    pub rejected: Vec<RejectedMutation>,
}

pub struct Session {
    engine: SyncEngine,
    coordinator: DispatchCoordinator,
    subscription: Mutex<EventSubscription>,
}

impl Session {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteApi>,
        registry: Arc<PluginRegistry>,
        sync: &SyncConfig,
        dispatch: &DispatchConfig,
    ) -> Self {
        let bus = Arc::new(EventBus::new());
        let subscription = bus.subscribe();
        let engine = SyncEngine::new(store, remote, bus, RetryPolicy::from(sync));
        let coordinator = DispatchCoordinator::new(registry, dispatch);

        Self {
            engine,
            coordinator,
            subscription: Mutex::new(subscription),
        }
    }

    /// Opens the workspace store and loads built-in and discovered plugins
    pub async fn open(workspace: &Workspace, remote: Arc<dyn RemoteApi>) -> Result<Self> {
        let config = &workspace.config().project;
        let store = Arc::new(workspace.open_store()?);

        let options = LoadOptions {
            dirs: workspace.plugin_dirs(),
            disabled: config.plugins.disabled.clone(),
            search_path: config.plugins.search_path,
            ..LoadOptions::from(&config.dispatch)
        };
        let registry = PluginRegistry::load_all(builtins(), &options)
            .await
            .context("Failed to load plugins")?;
        for warning in registry.warnings() {
            warn!(plugin = %warning.plugin, reason = %warning.reason, "Plugin not loaded");
        }

        Ok(Self::new(
            store,
            remote,
            Arc::new(registry),
            &config.sync,
            &config.dispatch,
        ))
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        self.engine.store()
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        self.coordinator.registry()
    }

    /// Runs one sync round, then lets subscribed plugins react to it
    ///
    /// Events are dispatched only when the round committed; a round that
    /// committed nothing will deliver the same changes again next time.
    pub async fn sync(&self, cancel: &CancellationToken) -> Result<SyncReport, SessionError> {
        let before = self.store().cursor()?;
        let outcome = self.engine.sync_once(cancel).await;

        let mut subscription = self.subscription.lock().await;
        let committed = match &outcome {
            Ok(_) => true,
            Err(_) => self.store().cursor()? != before,
        };

        if !committed {
            let dropped = subscription.drain().len();
            debug!(dropped, "Round committed nothing; dropping its events");
            return Ok(SyncReport {
                outcome,
                plugin_results: DispatchReport::default(),
                queued: Vec::new(),
                rejected: Vec::new(),
            });
        }

        let snapshot = self.store().snapshot()?;
        let plugin_results = self
            .coordinator
            .drain(&mut subscription, &snapshot, cancel)
            .await;
        drop(subscription);

        info!(
            results = plugin_results.len(),
            failures = plugin_results.failures().count(),
            "Dispatched sync events"
        );

        let (queued, rejected) = self.queue(plugin_results.results())?;

        Ok(SyncReport {
            outcome,
            plugin_results,
            queued,
            rejected,
        })
    }

    /// Runs a plugin command against the current store contents
    pub async fn run_command(
        &self,
        name: &str,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<CommandReport, SessionError> {
        let snapshot = self.store().snapshot()?;
        let result = self
            .coordinator
            .dispatch_command(name, args, &snapshot, cancel)
            .await?;

        let (queued, rejected) = self.queue(std::slice::from_ref(&result))?;

        Ok(CommandReport {
            result,
            queued,
            rejected,
        })
    }

    /// Queues the mutation requests of successful results
    ///
    /// Invalid requests are rejected individually; storage failures abort.
    fn queue(
        &self,
        results: &[InvocationResult],
    ) -> Result<(Vec<Mutation>, Vec<RejectedMutation>), StorageError> {
        let mut queued = Vec::new();
        let mut rejected = Vec::new();

        for result in results {
            for request in result.mutations() {
                match self.engine.enqueue(request.clone()) {
                    Ok(mutation) => queued.push(mutation),
                    Err(SyncError::Storage(e)) => return Err(e),
                    Err(e) => {
                        warn!(plugin = %result.plugin, error = %e, "Rejected plugin mutation");
                        rejected.push(RejectedMutation {
                            plugin: result.plugin.clone(),
                            request: request.clone(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        if !queued.is_empty() {
            info!(count = queued.len(), "Queued plugin mutations");
        }

        Ok((queued, rejected))
    }
}
