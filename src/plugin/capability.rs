//! Plugin capability interface
//!
//! Every plugin, in-process or external, is a [`Plugin`] trait object. A
//! plugin declares what it handles in its [`PluginDescriptor`]; the registry
//! indexes those capabilities and the dispatch coordinator only calls the
//! handlers a plugin declared.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bus::{ChangeEvent, EventKind};
use crate::domain::MutationRequest;
use crate::storage::Snapshot;

/// Something a plugin can handle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "name", rename_all = "snake_case")]
pub enum Capability {
    /// Subscribes to a change event kind
    Event(EventKind),

    /// Provides a named command (globally unique)
    Command(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Event(kind) => write!(f, "event:{}", kind),
            Capability::Command(name) => write!(f, "command:{}", name),
        }
    }
}

/// Identity and capabilities of a loaded plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Unique name within a run
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub description: String,

    pub capabilities: Vec<Capability>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_event(mut self, kind: EventKind) -> Self {
        self.capabilities.push(Capability::Event(kind));
        self
    }

    pub fn with_command(mut self, name: impl Into<String>) -> Self {
        self.capabilities.push(Capability::Command(name.into()));
        self
    }

    /// Command names this plugin provides
    pub fn commands(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().filter_map(|c| match c {
            Capability::Command(name) => Some(name.as_str()),
            Capability::Event(_) => None,
        })
    }

    pub fn subscribes_to(&self, kind: EventKind) -> bool {
        self.capabilities.contains(&Capability::Event(kind))
    }
}

/// A command call from the CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandInvocation {
    pub name: String,

    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandInvocation {
    pub fn new(name: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// What a successful handler returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    /// Human-readable summary line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Structured result
    #[serde(default)]
    pub output: serde_json::Value,

    /// Changes the plugin wants queued for the next push
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<MutationRequest>,
}

impl HandlerOutput {
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            message: Some(text.into()),
            ..Self::default()
        }
    }

    pub fn json(output: serde_json::Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    pub fn with_mutation(mut self, request: MutationRequest) -> Self {
        self.mutations.push(request);
        self
    }
}

/// A handler failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    /// An external plugin broke the wire protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The plugin does not implement this handler
    #[error("plugin does not handle {0}")]
    Unsupported(String),
}

/// A plugin could not be initialized
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PluginInitError {
    #[error("plugin '{plugin}' failed to initialize: {reason}")]
    Failed { plugin: String, reason: String },

    #[error("plugin '{plugin}' did not initialize in time")]
    Timeout { plugin: String },

    #[error("plugin '{plugin}' panicked during init: {message}")]
    Panicked { plugin: String, message: String },

    #[error("unreadable manifest from {path}: {reason}")]
    Manifest { path: String, reason: String },
}

/// The fixed capability interface every plugin implements
#[async_trait]
pub trait Plugin: Send + Sync {
    fn descriptor(&self) -> &PluginDescriptor;

    fn name(&self) -> &str {
        &self.descriptor().name
    }

    /// Runs once at registry load; an error excludes the plugin
    async fn init(&self) -> Result<(), PluginInitError> {
        Ok(())
    }

    async fn on_event(
        &self,
        event: &ChangeEvent,
        _snapshot: &Snapshot,
    ) -> Result<HandlerOutput, HandlerError> {
        Err(HandlerError::Unsupported(event.kind.to_string()))
    }

    async fn on_command(
        &self,
        invocation: &CommandInvocation,
        _snapshot: &Snapshot,
    ) -> Result<HandlerOutput, HandlerError> {
        Err(HandlerError::Unsupported(format!(
            "command '{}'",
            invocation.name
        )))
    }
}
