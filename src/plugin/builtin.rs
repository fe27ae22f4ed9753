//! Built-in plugins
//!
//! Compiled-in plugins that go through the same registry and dispatch path
//! as external ones:
//!
//! - `summary` - command: entity counts by kind and open items by priority
//! - `changelog` - subscriber: one line per synced change

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::bus::{ChangeEvent, EventKind};
use crate::domain::{EntityId, EntityKind, Priority};
use crate::storage::Snapshot;

use super::capability::{CommandInvocation, HandlerError, HandlerOutput, Plugin, PluginDescriptor};

/// Every built-in plugin, in load order
pub fn builtins() -> Vec<Arc<dyn Plugin>> {
    vec![
        Arc::new(SummaryPlugin::new()),
        Arc::new(ChangelogPlugin::new()),
    ]
}

/// `summary [project-id]`
pub struct SummaryPlugin {
    descriptor: PluginDescriptor,
}

impl SummaryPlugin {
    pub const COMMAND: &'static str = "summary";

    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new("summary", env!("CARGO_PKG_VERSION"))
                .with_description("Counts entities by kind and open items by priority")
                .with_command(Self::COMMAND),
        }
    }
}

impl Default for SummaryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for SummaryPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn on_command(
        &self,
        invocation: &CommandInvocation,
        snapshot: &Snapshot,
    ) -> Result<HandlerOutput, HandlerError> {
        let project = match invocation.args.first() {
            Some(raw) => {
                let id: EntityId = raw
                    .parse()
                    .map_err(|e| HandlerError::Failed(format!("invalid project id: {}", e)))?;
                match snapshot.get(&id) {
                    Some(p) if p.kind == EntityKind::Project && !p.deleted => Some(id),
                    _ => return Err(HandlerError::Failed(format!("unknown project: {}", raw))),
                }
            }
            None => None,
        };

        let mut counts: BTreeMap<&str, usize> =
            EntityKind::ALL.iter().map(|k| (k.as_str(), 0)).collect();
        let mut open_by_priority: BTreeMap<&str, usize> =
            Priority::ALL.iter().map(|p| (p.as_str(), 0)).collect();
        let mut completed = 0;

        for entity in snapshot.live() {
            if entity.kind == EntityKind::Item {
                if project.is_some() && entity.project_id() != project {
                    continue;
                }
                if entity.is_completed() {
                    completed += 1;
                } else {
                    let priority = entity.priority().unwrap_or_default();
                    *open_by_priority.entry(priority.as_str()).or_default() += 1;
                }
            } else if project.is_some() {
                continue;
            }
            *counts.entry(entity.kind.as_str()).or_default() += 1;
        }

        let open: usize = open_by_priority.values().sum();
        let kinds = counts
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(kind, n)| format!("{} {}", n, kind))
            .collect::<Vec<_>>();
        let priorities = open_by_priority
            .iter()
            .map(|(p, n)| format!("{} {}", p, n))
            .collect::<Vec<_>>();

        let message = format!(
            "{}\n{} open, {} completed ({})",
            if kinds.is_empty() {
                "no entities".to_string()
            } else {
                kinds.join(", ")
            },
            open,
            completed,
            priorities.join(", ")
        );

        Ok(HandlerOutput {
            message: Some(message),
            output: json!({
                "counts": counts,
                "open_items": open_by_priority,
                "completed_items": completed,
                "cursor": snapshot.cursor().token,
            }),
            mutations: Vec::new(),
        })
    }
}

/// Reports every change the sync applied
pub struct ChangelogPlugin {
    descriptor: PluginDescriptor,
}

impl ChangelogPlugin {
    pub fn new() -> Self {
        let mut descriptor = PluginDescriptor::new("changelog", env!("CARGO_PKG_VERSION"))
            .with_description("Lists changes applied by sync");
        for kind in EventKind::ALL {
            descriptor = descriptor.with_event(kind);
        }
        Self { descriptor }
    }
}

impl Default for ChangelogPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for ChangelogPlugin {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    async fn on_event(
        &self,
        event: &ChangeEvent,
        _snapshot: &Snapshot,
    ) -> Result<HandlerOutput, HandlerError> {
        let action = match event.kind {
            EventKind::EntityCreated => "created",
            EventKind::EntityUpdated => "updated",
            EventKind::EntityDeleted => "deleted",
        };
        let entity = &event.entity;

        let mut line = format!("{} {} {}", action, entity.kind, entity.id);
        if !entity.title().is_empty() {
            line.push_str(&format!(" \"{}\"", entity.title()));
        }

        Ok(HandlerOutput {
            message: Some(line),
            output: json!({
                "seq": event.seq,
                "action": action,
                "kind": entity.kind,
                "id": entity.id,
                "title": entity.title(),
            }),
            mutations: Vec::new(),
        })
    }
}
