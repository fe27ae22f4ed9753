//! # Dispatch
//!
//! Fans change events and commands out to plugins.
//!
//! - Every handler runs on its own task, bounded by the handler timeout. An
//!   error, panic or timeout becomes a failure result for that plugin only.
//! - Events are grouped into lanes by entity id. A lane handles its events
//!   one at a time, in publish order; all subscribers of one event run
//!   concurrently and the lane waits for them. Lanes run in parallel.
//! - A semaphore of `workers` permits bounds the handlers running at once.
//! - Once the cancellation token fires, handlers that have not started yet
//!   produce `cancelled` results; started handlers run to completion or
//!   timeout.

mod result;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{ChangeEvent, EventSubscription};
use crate::domain::EntityId;
use crate::plugin::{CommandInvocation, HandlerError, HandlerOutput, Plugin, PluginRegistry};
use crate::storage::{DispatchConfig, Snapshot};

pub use result::{DispatchReport, FailureClass, InvocationResult, InvocationTarget, Outcome};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}

/// Runs plugin handlers with isolation, ordering and a worker bound
#[derive(Debug, Clone)]
pub struct DispatchCoordinator {
    registry: Arc<PluginRegistry>,
    handler_timeout: Duration,
    workers: Arc<Semaphore>,
}

impl DispatchCoordinator {
    pub fn new(registry: Arc<PluginRegistry>, config: &DispatchConfig) -> Self {
        Self::with_limits(registry, config.handler_timeout(), config.workers)
    }

    pub fn with_limits(registry: Arc<PluginRegistry>, handler_timeout: Duration, workers: usize) -> Self {
        Self {
            registry,
            handler_timeout,
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Runs a command on the plugin that owns it
    pub async fn dispatch_command(
        &self,
        name: &str,
        args: Vec<String>,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<InvocationResult, DispatchError> {
        let plugin = self
            .registry
            .command_owner(name)
            .ok_or_else(|| DispatchError::UnknownCommand(name.to_string()))?;

        let invocation = CommandInvocation::new(name, args);
        let target = InvocationTarget::Command {
            name: name.to_string(),
        };
        let snapshot = snapshot.clone();
        let handler_plugin = Arc::clone(&plugin);
        let handler = async move { handler_plugin.on_command(&invocation, &snapshot).await };

        Ok(self.run(plugin.name(), target, cancel, handler).await)
    }

    /// Delivers events to their subscribers and collects every result
    ///
    /// Never fails; handler problems are failure results in the report.
    pub async fn dispatch_events(
        &self,
        events: Vec<ChangeEvent>,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let lanes = lanes(events);
        debug!(lanes = lanes.len(), "Dispatching events");

        let lane_results = join_all(
            lanes
                .into_iter()
                .map(|lane| self.run_lane(lane, snapshot, cancel)),
        )
        .await;

        let mut results: Vec<InvocationResult> = lane_results.into_iter().flatten().collect();
        // Stable: subscribers of one event keep load order
        results.sort_by_key(|r| match r.target {
            InvocationTarget::Event { seq, .. } => seq,
            InvocationTarget::Command { .. } => 0,
        });

        DispatchReport::new(results)
    }

    /// Dispatches everything queued on a bus subscription so far
    pub async fn drain(
        &self,
        subscription: &mut EventSubscription,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> DispatchReport {
        let events = subscription.drain();
        if events.is_empty() {
            return DispatchReport::default();
        }
        self.dispatch_events(events, snapshot, cancel).await
    }

    async fn run_lane(
        &self,
        lane: Vec<ChangeEvent>,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Vec<InvocationResult> {
        let mut results = Vec::new();

        for event in lane {
            let subscribers = self.registry.subscribers(event.kind);
            let calls = subscribers.into_iter().map(|plugin| {
                let target = InvocationTarget::Event {
                    seq: event.seq,
                    kind: event.kind,
                    entity_id: event.entity_id().clone(),
                };
                let event = event.clone();
                let snapshot = snapshot.clone();
                let handler_plugin = Arc::clone(&plugin);
                let handler = async move { handler_plugin.on_event(&event, &snapshot).await };
                async move { self.run(plugin.name(), target, cancel, handler).await }
            });
            results.extend(join_all(calls).await);
        }

        results
    }

    /// Runs one handler on its own task under the worker bound and timeout
    async fn run<F>(
        &self,
        plugin: &str,
        target: InvocationTarget,
        cancel: &CancellationToken,
        handler: F,
    ) -> InvocationResult
    where
        F: Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'static,
    {
        let result = |outcome: Outcome, elapsed: Duration| InvocationResult {
            plugin: plugin.to_string(),
            target: target.clone(),
            outcome,
            elapsed,
        };

        if cancel.is_cancelled() {
            return result(
                Outcome::failure(FailureClass::Cancelled, "cancelled before start"),
                Duration::ZERO,
            );
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
        };
        let Some(_permit) = permit else {
            return result(
                Outcome::failure(FailureClass::Cancelled, "cancelled before start"),
                Duration::ZERO,
            );
        };

        let started = Instant::now();
        let mut handle = tokio::spawn(handler);

        let outcome = match tokio::time::timeout(self.handler_timeout, &mut handle).await {
            Ok(Ok(Ok(output))) => {
                debug!(plugin, target = %target, "Handler succeeded");
                Outcome::from(output)
            }
            Ok(Ok(Err(e))) => {
                warn!(plugin, target = %target, error = %e, "Handler failed");
                Outcome::failure(FailureClass::Handler, e.to_string())
            }
            Ok(Err(join_error)) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                warn!(plugin, target = %target, panic = %message, "Handler panicked");
                Outcome::failure(FailureClass::Panicked, message)
            }
            Ok(Err(_)) => Outcome::failure(FailureClass::Cancelled, "handler task aborted"),
            Err(_) => {
                handle.abort();
                warn!(
                    plugin,
                    target = %target,
                    timeout_ms = self.handler_timeout.as_millis() as u64,
                    "Handler timed out"
                );
                Outcome::failure(
                    FailureClass::Timeout,
                    format!("no result within {}ms", self.handler_timeout.as_millis()),
                )
            }
        };

        result(outcome, started.elapsed())
    }
}

/// Groups events by entity id, keeping publish order inside each lane
fn lanes(events: Vec<ChangeEvent>) -> Vec<Vec<ChangeEvent>> {
    let mut index: HashMap<EntityId, usize> = HashMap::new();
    let mut lanes: Vec<Vec<ChangeEvent>> = Vec::new();

    for event in events {
        match index.get(event.entity_id()) {
            Some(&i) => lanes[i].push(event),
            None => {
                index.insert(event.entity_id().clone(), lanes.len());
                lanes.push(vec![event]);
            }
        }
    }

    lanes
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked".to_string()
    }
}
