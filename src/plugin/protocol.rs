//! External plugin protocol types
//!
//! External plugins communicate via JSON messages over stdin/stdout, one
//! request line in and one response line out per process. Each plugin must
//! support the `--manifest` flag to declare its capabilities.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::bus::{ChangeEvent, EventKind};
use crate::domain::{Entity, MutationRequest};
use crate::storage::Snapshot;

use super::capability::{CommandInvocation, HandlerError, HandlerOutput, PluginDescriptor};

/// Plugin manifest declaring capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Plugin name (e.g., "due-reminders")
    pub name: String,

    pub version: String,

    #[serde(default)]
    pub description: String,

    /// Event kinds the plugin subscribes to
    #[serde(default)]
    pub events: Vec<EventKind>,

    /// Commands the plugin provides
    #[serde(default)]
    pub commands: Vec<String>,
}

impl PluginManifest {
    pub fn into_descriptor(self) -> PluginDescriptor {
        let mut descriptor =
            PluginDescriptor::new(self.name, self.version).with_description(self.description);
        for kind in self.events {
            descriptor = descriptor.with_event(kind);
        }
        for command in self.commands {
            descriptor = descriptor.with_command(command);
        }
        descriptor
    }
}

/// A message sent to a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    /// The operation to perform: `init`, `event` or `command`
    pub operation: String,

    /// Operation-specific parameters
    pub params: serde_json::Value,
}

impl PluginRequest {
    pub fn new(operation: impl Into<String>, params: impl Into<serde_json::Value>) -> Self {
        Self {
            operation: operation.into(),
            params: params.into(),
        }
    }

    pub fn init() -> Self {
        Self::new("init", json!({}))
    }

    /// Carries the event and the entity it is about
    pub fn event(event: &ChangeEvent) -> Self {
        Self::new(
            "event",
            json!({
                "seq": event.seq,
                "kind": event.kind,
                "entity": &*event.entity,
            }),
        )
    }

    /// Carries the invocation and every live entity
    pub fn command(invocation: &CommandInvocation, snapshot: &Snapshot) -> Self {
        let entities: Vec<&Entity> = snapshot.live().collect();
        Self::new(
            "command",
            json!({
                "name": invocation.name,
                "args": invocation.args,
                "entities": entities,
            }),
        )
    }
}

/// A response from a plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Whether the operation succeeded
    pub success: bool,

    /// Result data (if success)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Human-readable result line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Mutations to queue (if success)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutations: Vec<MutationRequest>,

    /// Error message (if failure)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PluginResponse {
    pub fn success(data: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            message: None,
            mutations: Vec::new(),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            mutations: Vec::new(),
            error: Some(message.into()),
        }
    }

    pub fn into_output(self) -> Result<HandlerOutput, HandlerError> {
        if !self.success {
            return Err(HandlerError::Failed(
                self.error
                    .unwrap_or_else(|| "plugin reported failure".to_string()),
            ));
        }

        Ok(HandlerOutput {
            message: self.message,
            output: self.data.unwrap_or(serde_json::Value::Null),
            mutations: self.mutations,
        })
    }
}
